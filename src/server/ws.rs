//! Live event stream: `GET /ws[?project=<id>]`.
//!
//! Without `project` a subscriber sees every event; with it, only events of
//! that project.

use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::api::SharedState;
use crate::events::StudioEvent;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A client that has not answered a ping for this long is dropped.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeParams {
    #[serde(default)]
    pub project: Option<String>,
}

/// Which broadcast events one subscriber receives.
#[derive(Debug, Clone, Default)]
struct EventFilter {
    project_id: Option<String>,
}

impl EventFilter {
    /// The frame to forward, or `None` if the event is for another project.
    /// Events that do not decode are forwarded only to unscoped subscribers.
    fn admit(&self, raw: String) -> Option<String> {
        let Some(wanted) = &self.project_id else {
            return Some(raw);
        };
        match serde_json::from_str::<StudioEvent>(&raw) {
            Ok(event) if event.project_id() == wanted => Some(raw),
            _ => None,
        }
    }
}

/// Ping bookkeeping for one connection.
struct Keepalive {
    last_pong: Instant,
    awaiting_pong: bool,
}

impl Keepalive {
    fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            awaiting_pong: false,
        }
    }

    fn is_dead(&self) -> bool {
        self.awaiting_pong && self.last_pong.elapsed() > PONG_TIMEOUT
    }

    fn ping_sent(&mut self) {
        self.awaiting_pong = true;
    }

    fn pong_received(&mut self) {
        self.last_pong = Instant::now();
        self.awaiting_pong = false;
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let filter = EventFilter {
        project_id: params.project,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, rx, filter))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<String>, filter: EventFilter) {
    let (sender, receiver) = socket.split();
    debug!(project_id = ?filter.project_id, "event subscriber connected");
    stream_events(sender, receiver, rx, &filter).await;
    debug!(project_id = ?filter.project_id, "event subscriber disconnected");
}

async fn stream_events(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    filter: &EventFilter,
) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;
    let mut keepalive = Keepalive::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if keepalive.is_dead() {
                    debug!("subscriber missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                keepalive.ping_sent();
            }

            event = rx.recv() => match event {
                Ok(raw) => {
                    if let Some(frame) = filter.admit(raw)
                        && sender.send(Message::Text(frame.into())).await.is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Pong(_))) => keepalive.pong_received(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
