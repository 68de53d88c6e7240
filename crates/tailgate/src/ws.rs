//! WebSocket control protocol.
//!
//! Inbound frames are `{"event":"subscribe"|"unsubscribe","data":"<source>:<format>"}`.
//! Outbound frames are `{"event":"refresh"}` and `{"event":"<channel>","data":<payload>}`.
//! Each connection gets a reader (control path, this task) and a writer task
//! draining its outbox.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use tailgate_core::{metrics, ConnectionId, Hub, Outbound, Payload, Session};

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientEvent {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Serialize)]
struct SignalFrame {
    event: &'static str,
}

#[derive(Serialize)]
struct ChunkFrame<'a> {
    event: &'a str,
    data: &'a Payload,
}

/// Serialize an outbound message as a text frame.
pub fn encode(msg: &Outbound) -> serde_json::Result<String> {
    match msg {
        Outbound::Refresh => serde_json::to_string(&SignalFrame { event: "refresh" }),
        Outbound::Chunk { channel, payload } => serde_json::to_string(&ChunkFrame {
            event: channel,
            data: payload,
        }),
    }
}

/// Run one client connection to completion.
pub async fn serve_socket(socket: WebSocket, hub: Arc<Hub>, refresh_interval: Duration) {
    let (mut session, rx) = hub.connect();
    let conn = session.id();
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, rx, refresh_interval, conn));

    tokio::select! {
        _ = read_loop(&mut stream, &mut session) => {}
        _ = &mut writer => debug!(conn = %conn, "writer finished"),
    }

    session.disconnect().await;
    writer.abort();
}

async fn read_loop(stream: &mut SplitStream<WebSocket>, session: &mut Session) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(session, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %session.id(), error = %e, "websocket read failed");
                break;
            }
        }
    }
}

/// Apply one inbound control frame to the session. Anything unparsable is
/// logged and ignored.
pub async fn handle_text(session: &mut Session, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::Subscribe(channel)) => {
            session.subscribe(&channel).await;
        }
        Ok(ClientEvent::Unsubscribe(channel)) => {
            session.unsubscribe(&channel).await;
        }
        Err(e) => {
            warn!(conn = %session.id(), error = %e, "ignoring malformed request");
            metrics::request_rejected("malformed");
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    refresh_interval: Duration,
    conn: ConnectionId,
) {
    let mut refresh = tokio::time::interval_at(Instant::now() + refresh_interval, refresh_interval);

    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = refresh.tick() => Outbound::Refresh,
        };

        let text = match encode(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = %conn, error = %e, "failed to encode frame");
                continue;
            }
        };
        trace!(conn = %conn, bytes = text.len(), "sending frame");
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(conn = %conn, error = %e, "websocket send failed");
            break;
        }
    }

    let _ = sink.close().await;
}

/// Broadcast one refresh to every connection after `delay`.
pub fn schedule_refresh(hub: Arc<Hub>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let reached = hub.broadcast_refresh();
        info!(connections = reached, "startup refresh sent");
    })
}
