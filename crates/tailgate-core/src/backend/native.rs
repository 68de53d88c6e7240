use std::ffi::OsStr;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{forward, Backend, BackendHandle, BackendKind, SourceTarget};
use crate::channel::SourceId;
use crate::metrics;

const MAX_PREALLOC: u64 = 1 << 20;

/// Byte offset already emitted for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCursor {
    offset: u64,
}

impl FileCursor {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Observe the file's current length. Growth yields the unread range and
    /// moves the cursor to its end; shrinkage (truncation, rotation) moves the
    /// cursor back to the new length without yielding anything.
    pub fn advance(&mut self, len: u64) -> Option<Range<u64>> {
        if len > self.offset {
            let range = self.offset..len;
            self.offset = len;
            Some(range)
        } else {
            if len < self.offset {
                self.offset = len;
            }
            None
        }
    }

    /// Pull the cursor back after a short read.
    pub fn rewind_to(&mut self, offset: u64) {
        self.offset = self.offset.min(offset);
    }
}

/// Read at most `range` from `path`. A file that shrank since it was measured
/// yields fewer bytes.
pub async fn read_range(path: &Path, range: Range<u64>) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let len = range.end.saturating_sub(range.start);
    let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
    file.take(len).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Whether a filesystem event touches the watched file. Events without
/// paths are kept; access events (including our own reads) are not.
fn concerns(event: &Event, file_name: &OsStr) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.paths.is_empty() || event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

/// Subscribe to change notifications for `path`. The parent directory is
/// watched so a rotated file is picked up again once it is recreated.
fn watch_changes(path: &Path, wake: Arc<Notify>) -> notify::Result<RecommendedWatcher> {
    let file_name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if concerns(&event, &file_name) => wake.notify_one(),
        Ok(_) => {}
        Err(e) => debug!(error = %e, "file watch error"),
    })?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Reads exactly the bytes appended to the log file since the last
/// observation, woken by filesystem change notifications. A slow rescan on
/// `poll_interval` covers platforms and filesystems where notifications are
/// missing or lossy.
pub struct NativeWatchBackend {
    poll_interval: Duration,
}

impl NativeWatchBackend {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }
}

#[async_trait]
impl Backend for NativeWatchBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn start(&self, target: &SourceTarget, chunks: mpsc::Sender<Bytes>) -> BackendHandle {
        let Some(path) = target.log_file.clone() else {
            warn!(source = %target.source, "native watch started without a log file");
            return BackendHandle::inert();
        };

        let baseline = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!(source = %target.source, file = %path.display(), error = %e, "failed to watch log file");
                metrics::backend_failed(BackendKind::Native.as_str(), "watch");
                return BackendHandle::inert();
            }
        };

        let wake = Arc::new(Notify::new());
        let watcher = match watch_changes(&path, Arc::clone(&wake)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(source = %target.source, file = %path.display(), error = %e, "change notifications unavailable, rescanning only");
                None
            }
        };

        info!(
            source = %target.source,
            file = %path.display(),
            baseline,
            notify = watcher.is_some(),
            "native watch started"
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_watch(
            target.source.clone(),
            path,
            FileCursor::new(baseline),
            Watch {
                wake,
                _watcher: watcher,
                rescan: self.poll_interval,
            },
            chunks,
            cancel.clone(),
        ));
        BackendHandle::new(cancel, task)
    }
}

/// Wake-up sources for one watch task. Dropping it ends the notifications.
struct Watch {
    wake: Arc<Notify>,
    _watcher: Option<RecommendedWatcher>,
    rescan: Duration,
}

async fn run_watch(
    source: SourceId,
    path: PathBuf,
    mut cursor: FileCursor,
    watch: Watch,
    chunks: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(watch.rescan);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = watch.wake.notified() => {}
            _ = ticker.tick() => {}
        }

        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                // Mid-rotation the file can be briefly absent.
                trace!(source = %source, error = %e, "log file not readable");
                continue;
            }
        };

        let before = cursor.offset();
        let Some(range) = cursor.advance(len) else {
            if len < before {
                debug!(source = %source, from = before, to = len, "log file shrank, resetting baseline");
            }
            continue;
        };

        match read_range(&path, range.clone()).await {
            Ok(chunk) => {
                if (chunk.len() as u64) < range.end - range.start {
                    cursor.rewind_to(range.start + chunk.len() as u64);
                }
                if chunk.is_empty() {
                    continue;
                }
                metrics::chunk_produced(BackendKind::Native.as_str());
                if !forward(&chunks, &cancel, chunk).await {
                    break;
                }
            }
            Err(e) => {
                warn!(source = %source, error = %e, "incremental read failed");
                cursor.rewind_to(range.start);
            }
        }
    }

    debug!(source = %source, "native watch closed");
}
