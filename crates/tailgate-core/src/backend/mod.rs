//! Backend strategies producing raw chunks for one source.
//!
//! All variants share one contract: [`Backend::start`] begins producing chunks
//! into the given channel and returns a [`BackendHandle`]; stopping the handle
//! is idempotent and never fails loudly.

mod native;
mod synthetic;
mod tail;

pub use native::{FileCursor, NativeWatchBackend};
pub use synthetic::SyntheticBackend;
pub use tail::TailBackend;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::channel::SourceId;
use crate::error::BackendError;

/// What a backend is asked to tail.
#[derive(Debug, Clone)]
pub struct SourceTarget {
    pub source: SourceId,
    /// Log file that passed pre-flight. `None` for backends that read nothing.
    pub log_file: Option<PathBuf>,
}

impl SourceTarget {
    pub fn file(source: SourceId, log_file: PathBuf) -> Self {
        Self {
            source,
            log_file: Some(log_file),
        }
    }

    pub fn synthetic(source: SourceId) -> Self {
        Self {
            source,
            log_file: None,
        }
    }
}

/// Backend trait for chunk producers (tail process, file watch, generator)
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start producing chunks for `target`. Failures to spawn or watch are
    /// logged and yield a handle that never produces anything.
    async fn start(&self, target: &SourceTarget, chunks: mpsc::Sender<Bytes>) -> BackendHandle;
}

/// Running producer for one source.
#[derive(Debug)]
pub struct BackendHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BackendHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Handle for a backend that failed to come up; stopping it does nothing.
    pub fn inert() -> Self {
        Self {
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the producer and wait for it to finish. No chunk is sent once
    /// this returns. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "backend task panicked");
                }
            }
        }
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Send one chunk unless the backend is being cancelled. Returns false when the
/// producer should exit.
pub(crate) async fn forward(
    chunks: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
    chunk: Bytes,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = chunks.send(chunk) => sent.is_ok(),
    }
}

/// Backend strategy, chosen once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// External `tail -F` process
    Tail,
    /// In-process watch with incremental reads
    Native,
    /// Pseudo-random generator for development
    Synthetic,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Tail => "tail",
            BackendKind::Native => "native",
            BackendKind::Synthetic => "dev",
        }
    }

    /// Whether sources must pass pre-flight against the data directory.
    pub fn reads_files(self) -> bool {
        !matches!(self, BackendKind::Synthetic)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tail" => Ok(BackendKind::Tail),
            "native" => Ok(BackendKind::Native),
            "dev" | "synthetic" => Ok(BackendKind::Synthetic),
            other => Err(BackendError::UnknownKind(other.to_string())),
        }
    }
}

/// Tunables shared by the backend variants.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub tail_program: String,
    pub poll_interval: Duration,
    pub synthetic_interval: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            tail_program: "tail".to_string(),
            poll_interval: Duration::from_millis(250),
            synthetic_interval: Duration::from_secs(2),
        }
    }
}

/// Factory for creating the configured backend
pub struct BackendFactory;

impl BackendFactory {
    pub fn create(kind: BackendKind, settings: &BackendSettings) -> Arc<dyn Backend> {
        match kind {
            BackendKind::Tail => Arc::new(TailBackend::new(settings.tail_program.clone())),
            BackendKind::Native => Arc::new(NativeWatchBackend::new(settings.poll_interval)),
            BackendKind::Synthetic => Arc::new(SyntheticBackend::new(settings.synthetic_interval)),
        }
    }
}
