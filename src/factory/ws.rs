use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use anvil_common::SnapshotId;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::api::AppState;
use super::models::*;
use crate::escalation::EscalationNotice;
use crate::repair::BuildEvent;

/// Interval between keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A client silent for longer than this after a ping is dropped.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    FactoryCreated {
        factory: Factory,
    },
    FactoryUpdated {
        factory: Factory,
    },
    SetupTaskUpdated {
        task: SetupTask,
    },
    AttemptQueued {
        attempt_id: Uuid,
        factory_id: i64,
        feature_request_id: Uuid,
        description: String,
    },
    Build(BuildEvent),
    Escalated(EscalationNotice),
    WorkspaceReverted {
        factory_id: i64,
        snapshot_id: SnapshotId,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let events = state.ws_tx.subscribe();
    let (outbound, inbound) = socket.split();
    stream_events(outbound, inbound, events).await;
}

/// Ping bookkeeping for one connection.
struct Liveness {
    last_pong: Instant,
    awaiting_pong: bool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            awaiting_pong: false,
        }
    }

    fn is_dead(&self) -> bool {
        self.awaiting_pong && self.last_pong.elapsed() > PONG_TIMEOUT
    }

    fn pinged(&mut self) {
        self.awaiting_pong = true;
    }

    fn ponged(&mut self) {
        self.last_pong = Instant::now();
        self.awaiting_pong = false;
    }
}

/// Forward broadcast events to the client until either side goes away.
async fn stream_events(
    mut outbound: SplitSink<WebSocket, Message>,
    mut inbound: SplitStream<WebSocket>,
    mut events: broadcast::Receiver<String>,
) {
    let mut keepalive = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut liveness = Liveness::new();

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if liveness.is_dead() {
                    tracing::debug!("websocket client stopped answering pings");
                    break;
                }
                if outbound.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                liveness.pinged();
            }

            event = events.recv() => match event {
                Ok(json) => {
                    if outbound.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "websocket client lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            frame = inbound.next() => match frame {
                Some(Ok(Message::Pong(_))) => liveness.ponged(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = outbound.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Publish `msg` to every connected client. Having no clients is not an error.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize websocket message");
        }
    }
}
