//! Source and channel identifiers
//!
//! A channel is the pair of a source directory and a format name, written
//! `"<source>:<format>"` on the wire. Internally it is always a [`ChannelKey`],
//! never a concatenated string.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ChannelError;

/// Name of one log-bearing directory under the data root.
///
/// Rejects anything that could escape the data root when joined onto it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        if raw.is_empty() {
            return Err(ChannelError::Malformed(raw.to_string()));
        }
        if raw == "." || raw == ".." || raw.contains(['/', '\\', '\0']) {
            return Err(ChannelError::InvalidSource(raw.to_string()));
        }
        Ok(Self(Arc::from(raw)))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceId {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A (source, format) pair identifying one deliverable stream variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    source: SourceId,
    format: Arc<str>,
}

impl ChannelKey {
    pub fn new(source: SourceId, format: impl Into<Arc<str>>) -> Self {
        Self {
            source,
            format: format.into(),
        }
    }

    /// Parse `"<source>:<format>"`. The split happens at the first colon, so
    /// `"a:b:c"` names format `"b:c"` (which no transform will ever match).
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let (source, format) = raw
            .split_once(':')
            .ok_or_else(|| ChannelError::Malformed(raw.to_string()))?;
        if source.is_empty() || format.is_empty() {
            return Err(ChannelError::Malformed(raw.to_string()));
        }
        Ok(Self::new(SourceId::parse(source)?, format))
    }

    #[inline]
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    #[inline]
    pub fn format(&self) -> &str {
        &self.format
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.format)
    }
}

impl FromStr for ChannelKey {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel() {
        let key = ChannelKey::parse("logs1:json").unwrap();
        assert_eq!(key.source().as_str(), "logs1");
        assert_eq!(key.format(), "json");
        assert_eq!(key.to_string(), "logs1:json");
    }

    #[test]
    fn test_parse_rejects_missing_parts() {
        assert!(matches!(ChannelKey::parse("logs1"), Err(ChannelError::Malformed(_))));
        assert!(matches!(ChannelKey::parse(":json"), Err(ChannelError::Malformed(_))));
        assert!(matches!(ChannelKey::parse("logs1:"), Err(ChannelError::Malformed(_))));
        assert!(matches!(ChannelKey::parse(""), Err(ChannelError::Malformed(_))));
    }

    #[test]
    fn test_parse_extra_colon_goes_to_format() {
        let key = ChannelKey::parse("logs1:json:extra").unwrap();
        assert_eq!(key.source().as_str(), "logs1");
        assert_eq!(key.format(), "json:extra");
    }

    #[test]
    fn test_source_rejects_path_escape() {
        assert!(matches!(SourceId::parse(".."), Err(ChannelError::InvalidSource(_))));
        assert!(matches!(SourceId::parse("a/b"), Err(ChannelError::InvalidSource(_))));
        assert!(matches!(
            ChannelKey::parse("../etc:raw"),
            Err(ChannelError::InvalidSource(_))
        ));
    }

    #[test]
    fn test_keys_with_different_formats_differ() {
        let a = ChannelKey::parse("logs1:json").unwrap();
        let b = ChannelKey::parse("logs1:raw").unwrap();
        assert_ne!(a, b);
        assert_eq!(a.source(), b.source());
    }
}
