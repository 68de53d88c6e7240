//! Where sources live on disk.
//!
//! Each source is a directory under the data root holding one log file whose
//! name comes from a pattern, `%s` standing for the source id
//! (`"%s.log"` -> `<root>/web1/web1.log`).

use std::io;
use std::path::{Path, PathBuf};

use crate::channel::SourceId;
use crate::error::RegistryError;

pub const SOURCE_PLACEHOLDER: &str = "%s";

#[derive(Debug, Clone)]
pub struct SourceLayout {
    root: PathBuf,
    file_pattern: String,
}

impl SourceLayout {
    pub fn new(root: impl Into<PathBuf>, file_pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            file_pattern: file_pattern.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source: &SourceId) -> PathBuf {
        self.root.join(source.as_str())
    }

    pub fn log_file(&self, source: &SourceId) -> PathBuf {
        self.source_dir(source)
            .join(self.file_pattern.replace(SOURCE_PLACEHOLDER, source.as_str()))
    }

    /// Confirm the source directory and its log file exist and have the
    /// expected types. Returns the log file path.
    pub async fn preflight(&self, source: &SourceId) -> Result<PathBuf, RegistryError> {
        let dir = self.source_dir(source);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(RegistryError::unavailable(
                    source.as_str(),
                    format!("{} is not a directory", dir.display()),
                ))
            }
            Err(e) => {
                return Err(RegistryError::unavailable(
                    source.as_str(),
                    format!("{}: {}", dir.display(), e),
                ))
            }
        }

        let file = self.log_file(source);
        match tokio::fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => Ok(file),
            Ok(_) => Err(RegistryError::unavailable(
                source.as_str(),
                format!("{} is not a regular file", file.display()),
            )),
            Err(e) => Err(RegistryError::unavailable(
                source.as_str(),
                format!("{}: {}", file.display(), e),
            )),
        }
    }

    /// Sorted names of the source directories under the root.
    pub async fn list_sources(&self) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if SourceId::parse(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn source(name: &str) -> SourceId {
        SourceId::parse(name).unwrap()
    }

    #[test]
    fn test_log_file_pattern() {
        let layout = SourceLayout::new("/var/log/apps", "%s.log");
        assert_eq!(
            layout.log_file(&source("web1")),
            PathBuf::from("/var/log/apps/web1/web1.log")
        );

        let fixed = SourceLayout::new("/var/log/apps", "current");
        assert_eq!(
            fixed.log_file(&source("web1")),
            PathBuf::from("/var/log/apps/web1/current")
        );
    }

    #[tokio::test]
    async fn test_preflight_ok() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("web1")).unwrap();
        fs::write(tmp.path().join("web1/web1.log"), b"").unwrap();

        let layout = SourceLayout::new(tmp.path(), "%s.log");
        let file = layout.preflight(&source("web1")).await.unwrap();
        assert_eq!(file, tmp.path().join("web1/web1.log"));
    }

    #[tokio::test]
    async fn test_preflight_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let layout = SourceLayout::new(tmp.path(), "%s.log");
        let err = layout.preflight(&source("nope")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_preflight_missing_file() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("web1")).unwrap();
        let layout = SourceLayout::new(tmp.path(), "%s.log");
        assert!(layout.preflight(&source("web1")).await.is_err());
    }

    #[tokio::test]
    async fn test_preflight_source_is_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("web1"), b"").unwrap();
        let layout = SourceLayout::new(tmp.path(), "%s.log");
        assert!(layout.preflight(&source("web1")).await.is_err());
    }

    #[tokio::test]
    async fn test_preflight_log_is_dir() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("web1/web1.log")).unwrap();
        let layout = SourceLayout::new(tmp.path(), "%s.log");
        assert!(layout.preflight(&source("web1")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_sources_sorted_dirs_only() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("zeta")).unwrap();
        fs::create_dir(tmp.path().join("alpha")).unwrap();
        fs::write(tmp.path().join("stray.txt"), b"").unwrap();

        let layout = SourceLayout::new(tmp.path(), "%s.log");
        assert_eq!(layout.list_sources().await.unwrap(), vec!["alpha", "zeta"]);
    }
}
