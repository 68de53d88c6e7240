//! Source registry: one backend per source, alive while interest > 0.
//!
//! Every source has a slot guarded by its own async mutex, so start/stop and
//! count changes for one source are linearized while different sources never
//! contend. A slot is only ever touched through a [`Claim`]; when a claim is
//! dropped with zero interest (finished, failed or cancelled), the slot is
//! retired and removed from the map while its lock is still held. Anyone who
//! grabbed the slot just before removal sees the mark and retries against a
//! fresh slot.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backend, BackendHandle, BackendKind, SourceTarget};
use crate::channel::SourceId;
use crate::error::RegistryError;
use crate::fanout::ChannelFanout;
use crate::layout::SourceLayout;
use crate::metrics;

/// Chunks buffered between a backend and its pump.
pub const DEFAULT_CHUNK_BUFFER: usize = 64;

type Slots = DashMap<SourceId, Arc<Mutex<Slot>>>;

#[derive(Default)]
struct Slot {
    interest: usize,
    running: Option<Running>,
    retired: bool,
}

/// A started backend plus the pump forwarding its chunks into the fanout.
struct Running {
    kind: BackendKind,
    backend: BackendHandle,
    pump: JoinHandle<()>,
    pump_cancel: CancellationToken,
}

impl Running {
    /// Stop the producer first, then the pump. Nothing reaches the fanout for
    /// this source after this returns.
    async fn shutdown(mut self, source: &SourceId) {
        self.backend.stop().await;
        self.pump_cancel.cancel();
        if let Err(e) = self.pump.await {
            error!(source = %source, error = %e, "pump task failed");
        }
        metrics::backend_stopped(self.kind.as_str());
    }
}

/// Exclusive, owned access to one source's slot.
struct Claim {
    source: SourceId,
    slot: Arc<Mutex<Slot>>,
    guard: OwnedMutexGuard<Slot>,
    slots: Arc<Slots>,
}

impl Claim {
    async fn lock(slots: Arc<Slots>, source: SourceId, slot: Arc<Mutex<Slot>>) -> Self {
        let guard = Arc::clone(&slot).lock_owned().await;
        Self {
            source,
            slot,
            guard,
            slots,
        }
    }
}

impl Deref for Claim {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        &self.guard
    }
}

impl DerefMut for Claim {
    fn deref_mut(&mut self) -> &mut Slot {
        &mut self.guard
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.guard.interest == 0 {
            self.guard.retired = true;
            if self.guard.running.take().is_some() {
                // Only reachable if a stop was abandoned; the handle's drop
                // cancels the producer and the pump ends with its channel.
                warn!(source = %self.source, "backend abandoned without a clean stop");
            }
        }
        if self.guard.retired {
            self.slots
                .remove_if(&self.source, |_, current| Arc::ptr_eq(current, &self.slot));
        }
    }
}

pub struct SourceRegistry {
    backend: Arc<dyn Backend>,
    layout: Option<SourceLayout>,
    fanout: Arc<ChannelFanout>,
    chunk_buffer: usize,
    slots: Arc<Slots>,
}

impl SourceRegistry {
    pub fn new(
        backend: Arc<dyn Backend>,
        layout: Option<SourceLayout>,
        fanout: Arc<ChannelFanout>,
    ) -> Self {
        Self {
            backend,
            layout,
            fanout,
            chunk_buffer: DEFAULT_CHUNK_BUFFER,
            slots: Arc::new(DashMap::new()),
        }
    }

    pub fn with_chunk_buffer(mut self, chunk_buffer: usize) -> Self {
        self.chunk_buffer = chunk_buffer.max(1);
        self
    }

    /// Register one unit of interest in `source`, starting its backend if this
    /// is the first. On pre-flight failure, or if the caller is cancelled
    /// before this returns, nothing is recorded.
    pub async fn acquire(&self, source: &SourceId) -> Result<(), RegistryError> {
        loop {
            let mut claim = self.claim(source).await;
            if claim.retired {
                continue;
            }

            if claim.interest == 0 {
                match self.start(source).await {
                    Ok(running) => claim.running = Some(running),
                    Err(e) => {
                        metrics::request_rejected("unavailable");
                        warn!(source = %source, error = %e, "source unavailable");
                        return Err(e);
                    }
                }
            }

            claim.interest += 1;
            debug!(source = %source, interest = claim.interest, "source acquired");
            return Ok(());
        }
    }

    /// Drop one unit of interest. At zero the backend is stopped and the entry
    /// removed. Releasing an idle source is a no-op.
    ///
    /// The release is committed on the first poll: it runs to completion in its
    /// own task even if the caller is cancelled while waiting.
    pub async fn release(&self, source: &SourceId) {
        let Some(slot) = self.existing(source) else {
            trace!(source = %source, "release of idle source ignored");
            return;
        };
        let slots = Arc::clone(&self.slots);
        let id = source.clone();
        let task = tokio::spawn(async move {
            let mut claim = Claim::lock(slots, id.clone(), slot).await;
            if claim.retired || claim.interest == 0 {
                return;
            }

            claim.interest -= 1;
            debug!(source = %id, interest = claim.interest, "source released");
            if claim.interest > 0 {
                return;
            }

            if let Some(running) = claim.running.take() {
                running.shutdown(&id).await;
            }
            drop(claim);
            info!(source = %id, "backend stopped, no remaining interest");
        });
        if let Err(e) = task.await {
            error!(source = %source, error = %e, "release task failed");
        }
    }

    /// Stop every backend regardless of interest.
    pub async fn shutdown(&self) {
        let slots: Vec<(SourceId, Arc<Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (source, slot) in slots {
            let mut claim = Claim::lock(Arc::clone(&self.slots), source.clone(), slot).await;
            if claim.retired {
                continue;
            }
            claim.interest = 0;
            if let Some(running) = claim.running.take() {
                running.shutdown(&source).await;
            }
            drop(claim);
            info!(source = %source, "backend stopped for shutdown");
        }
    }

    pub async fn interest_count(&self, source: &SourceId) -> usize {
        match self.existing(source) {
            Some(slot) => {
                let guard = slot.lock().await;
                if guard.retired {
                    0
                } else {
                    guard.interest
                }
            }
            None => 0,
        }
    }

    /// Whether `source` has a registry entry (a started or starting backend).
    pub fn contains(&self, source: &SourceId) -> bool {
        self.slots.contains_key(source)
    }

    /// Number of sources with an entry.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Claim the slot for `source`, creating it if absent. A new slot is
    /// locked before it becomes visible, so it is never left unowned.
    async fn claim(&self, source: &SourceId) -> Claim {
        let slot = match self.slots.entry(source.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let slot = Arc::new(Mutex::new(Slot::default()));
                match Arc::clone(&slot).try_lock_owned() {
                    Ok(guard) => {
                        entry.insert(Arc::clone(&slot));
                        return Claim {
                            source: source.clone(),
                            slot,
                            guard,
                            slots: Arc::clone(&self.slots),
                        };
                    }
                    Err(_) => {
                        entry.insert(Arc::clone(&slot));
                        slot
                    }
                }
            }
        };
        Claim::lock(Arc::clone(&self.slots), source.clone(), slot).await
    }

    fn existing(&self, source: &SourceId) -> Option<Arc<Mutex<Slot>>> {
        self.slots.get(source).map(|s| Arc::clone(s.value()))
    }

    async fn resolve(&self, source: &SourceId) -> Result<SourceTarget, RegistryError> {
        if !self.backend.kind().reads_files() {
            return Ok(SourceTarget::synthetic(source.clone()));
        }
        match &self.layout {
            Some(layout) => Ok(SourceTarget::file(
                source.clone(),
                layout.preflight(source).await?,
            )),
            None => Err(RegistryError::unavailable(
                source.as_str(),
                "no data directory configured",
            )),
        }
    }

    async fn start(&self, source: &SourceId) -> Result<Running, RegistryError> {
        let target = self.resolve(source).await?;
        let (tx, rx) = mpsc::channel(self.chunk_buffer);
        let backend = self.backend.start(&target, tx).await;

        let pump_cancel = CancellationToken::new();
        let pump = tokio::spawn(pump(
            source.clone(),
            rx,
            Arc::clone(&self.fanout),
            pump_cancel.clone(),
        ));

        metrics::backend_started(self.backend.kind().as_str());
        info!(source = %source, backend = %self.backend.kind(), "backend started");
        Ok(Running {
            kind: self.backend.kind(),
            backend,
            pump,
            pump_cancel,
        })
    }
}

/// Forward chunks from one backend into the fanout, in production order.
async fn pump(
    source: SourceId,
    mut rx: mpsc::Receiver<Bytes>,
    fanout: Arc<ChannelFanout>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    let queued = fanout.dispatch(&source, &chunk);
                    trace!(source = %source, bytes = chunk.len(), queued, "chunk dispatched");
                }
                None => {
                    debug!(source = %source, "backend produced its last chunk");
                    break;
                }
            },
        }
    }
}
