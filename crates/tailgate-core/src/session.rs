//! Per-connection subscription bookkeeping.
//!
//! A [`Session`] records each channel it successfully subscribed to (an edge)
//! so that every registry acquire is matched by exactly one release, whether
//! the edge ends by unsubscribe, disconnect, or the session being dropped.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::channel::ChannelKey;
use crate::connection::{ConnectionId, EmitResult, Outbound, Outbox};
use crate::fanout::ChannelFanout;
use crate::format::FormatRegistry;
use crate::layout::SourceLayout;
use crate::metrics;
use crate::registry::{SourceRegistry, DEFAULT_CHUNK_BUFFER};

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Messages a connection may have queued before deliveries are dropped.
    pub outbox_capacity: usize,
    /// Chunks a backend may have queued before it waits on the fanout.
    pub chunk_buffer: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            chunk_buffer: DEFAULT_CHUNK_BUFFER,
        }
    }
}

/// Shared engine state: registry, fanout and the set of live connections.
pub struct Hub {
    registry: SourceRegistry,
    fanout: Arc<ChannelFanout>,
    connections: DashMap<ConnectionId, Outbox>,
    settings: HubSettings,
}

impl Hub {
    pub fn new(
        backend: Arc<dyn Backend>,
        layout: Option<SourceLayout>,
        settings: HubSettings,
    ) -> Arc<Self> {
        let fanout = Arc::new(ChannelFanout::new(FormatRegistry::standard()));
        let registry = SourceRegistry::new(backend, layout, Arc::clone(&fanout))
            .with_chunk_buffer(settings.chunk_buffer);
        Arc::new(Self {
            registry,
            fanout,
            connections: DashMap::new(),
            settings,
        })
    }

    /// Open a session for a new connection. The receiver yields everything
    /// queued for it.
    pub fn connect(self: &Arc<Self>) -> (Session, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = Outbox::new(self.settings.outbox_capacity);
        self.connections.insert(outbox.id(), outbox.clone());
        metrics::connection_opened();
        info!(conn = %outbox.id(), "connection opened");
        (
            Session {
                hub: Arc::clone(self),
                outbox,
                edges: HashSet::new(),
            },
            rx,
        )
    }

    /// Ask every connected client to reload. Returns how many were reached.
    pub fn broadcast_refresh(&self) -> usize {
        let mut sent = 0;
        for entry in self.connections.iter() {
            if entry.value().emit(Outbound::Refresh) == EmitResult::Sent {
                sent += 1;
            }
        }
        info!(connections = sent, "refresh broadcast");
        sent
    }

    /// Stop every backend regardless of outstanding sessions.
    pub async fn shutdown(&self) {
        info!(sources = self.registry.len(), "stopping all backends");
        self.registry.shutdown().await;
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn fanout(&self) -> &ChannelFanout {
        &self.fanout
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn forget(&self, conn: ConnectionId) {
        if self.connections.remove(&conn).is_some() {
            metrics::connection_closed();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
    /// Pre-flight failed; nothing was recorded.
    Unavailable,
    /// Unparsable channel; ignored.
    Malformed,
}

/// Subscription state of one connection.
pub struct Session {
    hub: Arc<Hub>,
    outbox: Outbox,
    edges: HashSet<ChannelKey>,
}

impl Session {
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.outbox.id()
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelKey> {
        self.edges.iter()
    }

    pub async fn subscribe(&mut self, channel: &str) -> SubscribeOutcome {
        let key = match ChannelKey::parse(channel) {
            Ok(key) => key,
            Err(e) => {
                warn!(conn = %self.id(), error = %e, "ignoring subscribe");
                metrics::request_rejected("malformed");
                return SubscribeOutcome::Malformed;
            }
        };

        if self.edges.contains(&key) {
            debug!(conn = %self.id(), channel = %key, "already subscribed");
            return SubscribeOutcome::AlreadySubscribed;
        }

        if self.hub.registry.acquire(key.source()).await.is_err() {
            return SubscribeOutcome::Unavailable;
        }

        if !self.hub.fanout.formats().contains(key.format()) {
            debug!(conn = %self.id(), channel = %key, "unknown format, channel will stay silent");
        }
        self.hub.fanout.subscribe(&self.outbox, &key);
        info!(conn = %self.id(), channel = %key, "subscribed");
        self.edges.insert(key);
        SubscribeOutcome::Subscribed
    }

    /// Returns false if this connection held no such subscription.
    pub async fn unsubscribe(&mut self, channel: &str) -> bool {
        let Ok(key) = ChannelKey::parse(channel) else {
            warn!(conn = %self.id(), channel, "ignoring malformed unsubscribe");
            metrics::request_rejected("malformed");
            return false;
        };
        if !self.edges.remove(&key) {
            return false;
        }
        self.hub.fanout.unsubscribe(self.id(), &key);
        self.hub.registry.release(key.source()).await;
        info!(conn = %self.id(), channel = %key, "unsubscribed");
        true
    }

    /// Release every edge and retire the connection. Edges not yet released
    /// when this is cancelled are left to the drop path.
    pub async fn disconnect(mut self) {
        let count = self.edges.len();
        while let Some(key) = self.edges.iter().next().cloned() {
            self.edges.remove(&key);
            self.hub.fanout.unsubscribe(self.id(), &key);
            self.hub.registry.release(key.source()).await;
        }
        self.hub.forget(self.id());
        info!(conn = %self.id(), released = count, "connection closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let conn = self.id();
        self.hub.forget(conn);
        if self.edges.is_empty() {
            return;
        }

        // Dropped without disconnect (task aborted or panicked): release the
        // edges in the background.
        let edges = std::mem::take(&mut self.edges);
        let hub = Arc::clone(&self.hub);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(conn = %conn, edges = edges.len(), "session dropped without disconnect");
                handle.spawn(async move {
                    for key in edges {
                        hub.fanout.unsubscribe(conn, &key);
                        hub.registry.release(key.source()).await;
                    }
                });
            }
            Err(_) => {
                warn!(conn = %conn, edges = edges.len(), "session dropped outside runtime, edges leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendHandle, BackendKind, SourceTarget};
    use crate::channel::SourceId;
    use crate::format::Payload;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct MockBackend {
        starts: AtomicUsize,
        stops: Arc<AtomicUsize>,
        senders: StdMutex<Vec<(SourceId, mpsc::Sender<Bytes>)>>,
        stop_delay: Duration,
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Synthetic
        }

        async fn start(&self, target: &SourceTarget, chunks: mpsc::Sender<Bytes>) -> BackendHandle {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.senders
                .lock()
                .unwrap()
                .push((target.source.clone(), chunks));
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let stops = Arc::clone(&self.stops);
            let stop_delay = self.stop_delay;
            BackendHandle::new(
                cancel,
                tokio::spawn(async move {
                    token.cancelled().await;
                    tokio::time::sleep(stop_delay).await;
                    stops.fetch_add(1, Ordering::SeqCst);
                }),
            )
        }
    }

    fn hub() -> (Arc<MockBackend>, Arc<Hub>) {
        let backend = Arc::new(MockBackend::default());
        let hub = Hub::new(
            backend.clone() as Arc<dyn Backend>,
            None,
            HubSettings::default(),
        );
        (backend, hub)
    }

    fn source(raw: &str) -> SourceId {
        SourceId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_double_subscribe_acquires_once() {
        let (backend, hub) = hub();
        let (mut session, _rx) = hub.connect();

        assert_eq!(session.subscribe("logs1:json").await, SubscribeOutcome::Subscribed);
        assert_eq!(
            session.subscribe("logs1:json").await,
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(hub.registry().interest_count(&source("logs1")).await, 1);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);

        assert!(session.unsubscribe("logs1:json").await);
        assert!(!session.unsubscribe("logs1:json").await);
        assert!(hub.registry().is_empty());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_requests_change_nothing() {
        let (backend, hub) = hub();
        let (mut session, _rx) = hub.connect();

        assert_eq!(session.subscribe("nocolon").await, SubscribeOutcome::Malformed);
        assert_eq!(session.subscribe(":json").await, SubscribeOutcome::Malformed);
        assert_eq!(session.subscribe("../x:raw").await, SubscribeOutcome::Malformed);
        assert!(!session.unsubscribe("garbage").await);
        assert!(hub.registry().is_empty());
        assert_eq!(backend.starts.load(Ordering::SeqCst), 0);
        assert_eq!(session.channels().count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_without_edge_does_not_release() {
        let (_backend, hub) = hub();
        let (mut a, _rx_a) = hub.connect();
        let (mut b, _rx_b) = hub.connect();

        a.subscribe("logs1:raw").await;
        // b never subscribed; its unsubscribe must not steal a's interest.
        assert!(!b.unsubscribe("logs1:raw").await);
        assert_eq!(hub.registry().interest_count(&source("logs1")).await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_releases_each_edge_once() {
        let (backend, hub) = hub();
        let (mut session, _rx) = hub.connect();
        let (mut other, _other_rx) = hub.connect();

        session.subscribe("logs1:json").await;
        session.subscribe("logs1:raw").await;
        session.subscribe("logs2:json").await;
        other.subscribe("logs2:raw").await;

        assert_eq!(hub.registry().interest_count(&source("logs1")).await, 2);
        assert_eq!(hub.registry().interest_count(&source("logs2")).await, 2);
        assert_eq!(hub.connection_count(), 2);

        session.disconnect().await;

        assert!(!hub.registry().contains(&source("logs1")));
        assert_eq!(hub.registry().interest_count(&source("logs2")).await, 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(hub.connection_count(), 1);

        other.disconnect().await;
        assert!(hub.registry().is_empty());
        assert_eq!(hub.fanout().channel_count(), 0);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_format_holds_interest_but_stays_silent() {
        let (backend, hub) = hub();
        let (mut session, mut rx) = hub.connect();

        assert_eq!(session.subscribe("logs1:xml").await, SubscribeOutcome::Subscribed);
        assert_eq!(hub.registry().interest_count(&source("logs1")).await, 1);

        let tx = backend.senders.lock().unwrap()[0].1.clone();
        tx.send(Bytes::from_static(b"{\"a\":1}\n")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        session.disconnect().await;
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let (backend, hub) = hub();
        let (mut session, mut rx) = hub.connect();
        session.subscribe("logs1:json").await;

        let tx = backend.senders.lock().unwrap()[0].1.clone();
        tx.send(Bytes::from_static(b"{\"a\":1}\n{bad json}\n{\"a\":2}\n"))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            Outbound::Chunk { channel, payload: Payload::Records(records) } => {
                assert_eq!(&*channel, "logs1:json");
                assert_eq!(
                    &*records,
                    &[serde_json::json!({"a": 1}), serde_json::json!({"a": 2})]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_dropped_session_still_releases() {
        let (backend, hub) = hub();
        {
            let (mut session, _rx) = hub.connect();
            session.subscribe("logs1:raw").await;
        }

        for _ in 0..100 {
            if hub.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.registry().is_empty());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_disconnect_releases_everything() {
        let backend = Arc::new(MockBackend {
            stop_delay: Duration::from_millis(100),
            ..MockBackend::default()
        });
        let hub = Hub::new(
            backend.clone() as Arc<dyn Backend>,
            None,
            HubSettings::default(),
        );
        let (mut session, _rx) = hub.connect();
        for channel in ["logs1:raw", "logs2:raw", "logs3:json"] {
            session.subscribe(channel).await;
        }

        // Gives up while the first backend is still stopping.
        let finished =
            tokio::time::timeout(Duration::from_millis(20), session.disconnect()).await;
        assert!(finished.is_err());

        for _ in 0..200 {
            if hub.registry().is_empty() && backend.stops.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.registry().is_empty());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 3);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.fanout().channel_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_broadcast() {
        let (_backend, hub) = hub();
        let (_a, mut rx_a) = hub.connect();
        let (_b, mut rx_b) = hub.connect();

        assert_eq!(hub.broadcast_refresh(), 2);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Refresh);
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Refresh);
    }

    #[tokio::test]
    async fn test_shutdown_stops_backends_with_live_sessions() {
        let (backend, hub) = hub();
        let (mut session, _rx) = hub.connect();
        session.subscribe("logs1:raw").await;
        session.subscribe("logs2:raw").await;

        hub.shutdown().await;
        assert!(hub.registry().is_empty());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 2);

        // The session's own teardown afterwards is a harmless no-op.
        session.disconnect().await;
        assert_eq!(backend.stops.load(Ordering::SeqCst), 2);
    }
}
