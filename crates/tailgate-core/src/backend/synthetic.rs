use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{forward, Backend, BackendHandle, BackendKind, SourceTarget};
use crate::channel::SourceId;
use crate::metrics;

/// Markup a viewer must render as text, never as HTML.
const HOSTILE_TEXT: &str = "<b style=\"color:red !important\">alert(1)</b>&<&>";

/// Probability of stopping after each line; bursts average four lines.
const STOP_PROBABILITY: f64 = 0.2;

/// Emits bursts of pseudo-random JSON lines on a fixed interval. Reads nothing
/// from disk.
pub struct SyntheticBackend {
    interval: Duration,
}

impl SyntheticBackend {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }
}

#[async_trait]
impl Backend for SyntheticBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Synthetic
    }

    async fn start(&self, target: &SourceTarget, chunks: mpsc::Sender<Bytes>) -> BackendHandle {
        info!(source = %target.source, interval_ms = self.interval.as_millis() as u64, "synthetic generator started");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_generator(
            target.source.clone(),
            self.interval,
            chunks,
            cancel.clone(),
        ));
        BackendHandle::new(cancel, task)
    }
}

async fn run_generator(
    source: SourceId,
    interval: Duration,
    chunks: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let chunk = burst();
        if chunk.is_empty() {
            continue;
        }
        metrics::chunk_produced(BackendKind::Synthetic.as_str());
        if !forward(&chunks, &cancel, chunk).await {
            break;
        }
    }

    debug!(source = %source, "synthetic generator stopped");
}

/// One burst of newline-terminated JSON array lines. May be empty.
pub fn burst() -> Bytes {
    let mut rng = rand::rng();
    let mut out = String::new();

    while rng.random::<f64>() > STOP_PROBABILITY {
        let mut noise = [0u8; 15];
        rng.fill(&mut noise);
        let line = serde_json::json!([
            chrono::Utc::now().timestamp_millis(),
            HOSTILE_TEXT,
            rng.random::<f64>(),
            "data data data",
            BASE64.encode(noise),
        ]);
        out.push_str(&line.to_string());
        out.push('\n');
    }

    Bytes::from(out)
}
