use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("malformed channel: {0:?}")]
    Malformed(String),
    #[error("invalid source id: {0:?}")]
    InvalidSource(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("source unavailable: {source_id}: {reason}")]
    Unavailable { source_id: String, reason: String },
}

impl RegistryError {
    pub fn unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("unknown backend: {0}")]
    UnknownKind(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
