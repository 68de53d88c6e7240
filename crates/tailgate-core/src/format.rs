//! Chunk transforms applied per channel format.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Serialize, Serializer};
use serde_json::Value;

pub const FORMAT_RAW: &str = "raw";
pub const FORMAT_JSON: &str = "json";

/// What a subscriber receives for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The chunk exactly as the backend produced it.
    Raw(Bytes),
    /// Records decoded from the chunk's lines, in line order.
    Records(Arc<[Value]>),
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Raw(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
            Payload::Records(records) => records.serialize(serializer),
        }
    }
}

pub type Transform = fn(&Bytes) -> Payload;

pub fn raw(chunk: &Bytes) -> Payload {
    Payload::Raw(chunk.clone())
}

pub fn json(chunk: &Bytes) -> Payload {
    Payload::Records(decode_lines(chunk).into())
}

/// Split on runs of newlines and decode each line as JSON. Lines that fail to
/// decode are dropped.
pub fn decode_lines(chunk: &[u8]) -> Vec<Value> {
    chunk
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_slice(line).ok())
        .collect()
}

/// Fixed table of format name to transform.
#[derive(Clone)]
pub struct FormatRegistry {
    formats: Vec<(&'static str, Transform)>,
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.formats.iter().map(|(n, _)| n)).finish()
    }
}

impl FormatRegistry {
    pub fn standard() -> Self {
        Self {
            formats: vec![(FORMAT_RAW, raw as Transform), (FORMAT_JSON, json as Transform)],
        }
    }

    pub fn get(&self, name: &str) -> Option<Transform> {
        self.formats
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| *t)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Transform)> + '_ {
        self.formats.iter().copied()
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_skips_bad_lines() {
        let chunk = Bytes::from_static(b"{\"a\":1}\n{bad json}\n{\"a\":2}\n");
        match json(&chunk) {
            Payload::Records(records) => {
                assert_eq!(&*records, &[json!({"a": 1}), json!({"a": 2})]);
            }
            other => panic!("expected records, got {:?}", other),
        }
    }

    #[test]
    fn test_json_collapses_blank_lines() {
        let records = decode_lines(b"\n\n[1,2]\r\n\n\n\"x\"");
        assert_eq!(records, vec![json!([1, 2]), json!("x")]);
    }

    #[test]
    fn test_json_with_nothing_decodable_is_empty() {
        assert!(decode_lines(b"plain text\nmore text\n").is_empty());
        assert_eq!(json(&Bytes::new()), Payload::Records(Vec::<Value>::new().into()));
    }

    #[test]
    fn test_raw_is_identity() {
        let chunk = Bytes::from_static(b"\xff\x00not utf8\n{\"a\":1}");
        assert_eq!(raw(&chunk), Payload::Raw(chunk.clone()));
    }

    #[test]
    fn test_registry_lookup() {
        let formats = FormatRegistry::standard();
        assert!(formats.contains("raw"));
        assert!(formats.contains("json"));
        assert!(!formats.contains("xml"));
        let names: Vec<_> = formats.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["raw", "json"]);
    }

    #[test]
    fn test_payload_serialization() {
        let raw = Payload::Raw(Bytes::from_static(b"line\n"));
        assert_eq!(serde_json::to_string(&raw).unwrap(), r#""line\n""#);

        let records = Payload::Records(vec![json!({"a": 1})].into());
        assert_eq!(serde_json::to_string(&records).unwrap(), r#"[{"a":1}]"#);
    }
}
