use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use tailgate_core::{BackendError, BackendKind, BackendSettings, HubSettings, SourceLayout};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid tailer: {0}")]
    Tailer(#[from] BackendError),

    #[error("tailer '{0}' reads log files and needs --data-dir")]
    MissingDataDir(BackendKind),

    #[error("data directory {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// tailgate: live log streaming over WebSocket
#[derive(Parser, Debug, Clone)]
#[command(name = "tailgate", version)]
pub struct Config {
    /// Root directory holding one subdirectory per source
    #[arg(long, env = "TAILGATE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log file name inside each source directory; %s is replaced by the source id
    #[arg(long, env = "TAILGATE_DATA_LOG", default_value = "%s.log")]
    pub log_pattern: String,

    /// Backend: tail, native or dev. Defaults to tail with a data dir, dev without
    #[arg(long, env = "TAILER")]
    pub tailer: Option<String>,

    /// Program used by the tail backend
    #[arg(long, env = "TAILGATE_TAIL_PROGRAM", default_value = "tail")]
    pub tail_program: String,

    /// HTTP/WebSocket listen address
    #[arg(long, env = "TAILGATE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Native watch rescan interval in milliseconds, backing up change notifications
    #[arg(long, env = "TAILGATE_POLL_INTERVAL_MS", default_value = "250")]
    pub poll_interval_ms: u64,

    /// Synthetic burst interval in milliseconds
    #[arg(long, env = "TAILGATE_DEV_INTERVAL_MS", default_value = "2000")]
    pub dev_interval_ms: u64,

    /// Messages queued per connection before deliveries are dropped
    #[arg(long, env = "TAILGATE_OUTBOX_CAPACITY", default_value = "256")]
    pub outbox_capacity: usize,

    /// Chunks queued per source between backend and fanout
    #[arg(long, env = "TAILGATE_CHUNK_BUFFER", default_value = "64")]
    pub chunk_buffer: usize,

    /// Delay before the startup refresh broadcast, in seconds
    #[arg(long, env = "TAILGATE_REFRESH_DELAY_SECS", default_value = "5")]
    pub refresh_delay_secs: u64,

    /// Per-connection refresh period, in seconds
    #[arg(long, env = "TAILGATE_REFRESH_INTERVAL_SECS", default_value = "43200")]
    pub refresh_interval_secs: u64,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    /// Check the configuration and resolve the backend to run.
    pub fn validate(&self) -> Result<BackendKind, ConfigError> {
        let kind = self.backend_kind()?;

        if kind.reads_files() {
            let Some(dir) = &self.data_dir else {
                return Err(ConfigError::MissingDataDir(kind));
            };
            if !dir.is_dir() {
                return Err(ConfigError::NotADirectory(dir.clone()));
            }
        }

        for (name, value) in [
            ("poll-interval-ms", self.poll_interval_ms),
            ("dev-interval-ms", self.dev_interval_ms),
            ("outbox-capacity", self.outbox_capacity as u64),
            ("chunk-buffer", self.chunk_buffer as u64),
            ("refresh-interval-secs", self.refresh_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        Ok(kind)
    }

    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        match (&self.tailer, &self.data_dir) {
            (Some(tailer), _) => Ok(tailer.parse()?),
            (None, Some(_)) => Ok(BackendKind::Tail),
            (None, None) => Ok(BackendKind::Synthetic),
        }
    }

    pub fn layout(&self) -> Option<SourceLayout> {
        self.data_dir
            .as_ref()
            .map(|dir| SourceLayout::new(dir, self.log_pattern.clone()))
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            tail_program: self.tail_program.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            synthetic_interval: Duration::from_millis(self.dev_interval_ms),
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            outbox_capacity: self.outbox_capacity,
            chunk_buffer: self.chunk_buffer,
        }
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_secs(self.refresh_delay_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Tracing filter directive: `--log-level`, then RUST_LOG, then the default.
    pub fn log_filter(&self) -> String {
        self.log_level
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "tailgate=info,tailgate_core=info".to_string())
    }
}
