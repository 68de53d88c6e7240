//! Channel fanout: (source, format) -> subscribed connections.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::channel::{ChannelKey, SourceId};
use crate::connection::{ConnectionId, EmitResult, Outbound, Outbox};
use crate::format::FormatRegistry;
use crate::metrics;

struct Subscribers {
    /// Wire name, built once per channel.
    name: Arc<str>,
    members: HashMap<ConnectionId, Outbox>,
}

pub struct ChannelFanout {
    formats: FormatRegistry,
    channels: DashMap<ChannelKey, Subscribers>,
}

impl ChannelFanout {
    pub fn new(formats: FormatRegistry) -> Self {
        Self {
            formats,
            channels: DashMap::new(),
        }
    }

    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    /// Add `outbox` to the channel. Returns false if it was already a member.
    pub fn subscribe(&self, outbox: &Outbox, key: &ChannelKey) -> bool {
        let mut entry = self
            .channels
            .entry(key.clone())
            .or_insert_with(|| Subscribers {
                name: Arc::from(key.to_string()),
                members: HashMap::new(),
            });
        if entry.members.contains_key(&outbox.id()) {
            return false;
        }
        entry.members.insert(outbox.id(), outbox.clone());
        true
    }

    /// Remove the connection from the channel; empty channels are pruned.
    /// Returns false if it was not a member.
    pub fn unsubscribe(&self, conn: ConnectionId, key: &ChannelKey) -> bool {
        let removed = match self.channels.get_mut(key) {
            Some(mut entry) => entry.members.remove(&conn).is_some(),
            None => false,
        };
        self.channels.remove_if(key, |_, subs| subs.members.is_empty());
        removed
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.channels.get(key).map(|s| s.members.len()).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver one raw chunk from `source` to every channel on it that has
    /// subscribers. Each format is transformed at most once per chunk and
    /// formats without subscribers cost nothing. Returns messages queued.
    pub fn dispatch(&self, source: &SourceId, chunk: &Bytes) -> usize {
        let mut queued = 0;

        for (format, transform) in self.formats.iter() {
            let key = ChannelKey::new(source.clone(), format);
            let Some(subs) = self.channels.get(&key) else {
                continue;
            };
            if subs.members.is_empty() {
                continue;
            }

            let payload = transform(chunk);
            let mut sent = 0;
            for outbox in subs.members.values() {
                let msg = Outbound::Chunk {
                    channel: Arc::clone(&subs.name),
                    payload: payload.clone(),
                };
                match outbox.emit(msg) {
                    EmitResult::Sent => sent += 1,
                    EmitResult::Dropped => {
                        debug!(channel = %subs.name, conn = %outbox.id(), "outbox full, dropping chunk");
                        metrics::dropped(format);
                    }
                    EmitResult::Closed => {
                        trace!(channel = %subs.name, conn = %outbox.id(), "outbox closed");
                    }
                }
            }
            metrics::delivered(format, sent);
            queued += sent;
        }

        queued
    }
}

impl Default for ChannelFanout {
    fn default() -> Self {
        Self::new(FormatRegistry::standard())
    }
}
