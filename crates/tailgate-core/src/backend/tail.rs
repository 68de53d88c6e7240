use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{forward, Backend, BackendHandle, BackendKind, SourceTarget};
use crate::channel::SourceId;
use crate::metrics;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Follows the log file with an external `tail -F` child process. Each read
/// from its stdout becomes one chunk.
pub struct TailBackend {
    program: String,
}

impl TailBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn spawn(&self, path: &Path) -> std::io::Result<Child> {
        Command::new(&self.program)
            .arg("-F")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

#[async_trait]
impl Backend for TailBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tail
    }

    async fn start(&self, target: &SourceTarget, chunks: mpsc::Sender<Bytes>) -> BackendHandle {
        let Some(path) = target.log_file.as_deref() else {
            warn!(source = %target.source, "tail backend started without a log file");
            return BackendHandle::inert();
        };

        let child = match self.spawn(path) {
            Ok(child) => child,
            Err(e) => {
                error!(source = %target.source, program = %self.program, error = %e, "failed to spawn tail");
                metrics::backend_failed(BackendKind::Tail.as_str(), "spawn");
                return BackendHandle::inert();
            }
        };

        info!(source = %target.source, pid = ?child.id(), file = %path.display(), "tail started");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_tail(
            target.source.clone(),
            child,
            chunks,
            cancel.clone(),
        ));
        BackendHandle::new(cancel, task)
    }
}

async fn run_tail(
    source: SourceId,
    mut child: Child,
    chunks: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    if let Some(mut stdout) = stdout {
        let mut stderr = stderr.map(|s| BufReader::new(s).lines());
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = stdout.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        warn!(source = %source, "tail exited, no more chunks");
                        break;
                    }
                    Ok(_) => {
                        metrics::chunk_produced(BackendKind::Tail.as_str());
                        let chunk = buf.split().freeze();
                        if !forward(&chunks, &cancel, chunk).await {
                            break;
                        }
                        buf.reserve(READ_BUF_SIZE);
                    }
                    Err(e) => {
                        warn!(source = %source, error = %e, "tail stdout read failed");
                        break;
                    }
                },
                line = next_stderr_line(&mut stderr) => match line {
                    Some(line) => warn!(source = %source, stderr = %line, "tail reported"),
                    None => stderr = None,
                },
            }
        }
    }

    reap(&source, &mut child).await;
}

/// Resolves to the next stderr line; pends forever once stderr is closed.
async fn next_stderr_line(
    stderr: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStderr>>>,
) -> Option<String> {
    match stderr {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn reap(source: &SourceId, child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(source = %source, status = %status, "tail already exited");
        }
        _ => {
            if let Err(e) = child.kill().await {
                error!(source = %source, error = %e, "failed to kill tail");
                metrics::backend_failed(BackendKind::Tail.as_str(), "stop");
            } else {
                debug!(source = %source, "tail killed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn target(path: std::path::PathBuf) -> SourceTarget {
        SourceTarget::file(SourceId::parse("web1").unwrap(), path)
    }

    #[tokio::test]
    async fn test_spawn_failure_is_inert() {
        let backend = TailBackend::new("/nonexistent/tail-binary");
        let (tx, mut rx) = mpsc::channel(4);
        let mut handle = backend.start(&target("/tmp/whatever.log".into()), tx).await;
        assert!(!handle.is_running());
        handle.stop().await;
        handle.stop().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_log_file_is_inert() {
        let backend = TailBackend::new("tail");
        let (tx, _rx) = mpsc::channel(4);
        let target = SourceTarget::synthetic(SourceId::parse("web1").unwrap());
        assert!(!backend.start(&target, tx).await.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tail_follows_appends() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("web1.log");
        std::fs::write(&path, b"").unwrap();

        let backend = TailBackend::new("tail");
        let (tx, mut rx) = mpsc::channel(16);
        let mut handle = backend.start(&target(path.clone()), tx).await;
        assert!(handle.is_running());

        // Give tail a moment to open the file before appending.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"hello tail\n").unwrap();
        file.flush().unwrap();

        let mut seen = Vec::new();
        while !seen.ends_with(b"hello tail\n") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for tail output")
                .expect("tail channel closed");
            seen.extend_from_slice(&chunk);
        }

        handle.stop().await;
        assert!(!handle.is_running());
    }
}
