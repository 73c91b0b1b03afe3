//! WebSocket Control Channel
//!
//! `/ws` clients subscribe to event-bus topics by pattern and issue
//! `strategy.*` commands mirroring the REST surface. Outbound frames carry a
//! `type` discriminator: `event`, `response`, or `error`.

use crate::api::AppState;
use crate::bus::Subscription;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe {
        pattern: String,
    },
    #[serde(rename = "strategy.list")]
    StrategyList,
    #[serde(rename = "strategy.pause")]
    StrategyPause {
        id: String,
    },
    #[serde(rename = "strategy.resume")]
    StrategyResume {
        id: String,
    },
    #[serde(rename = "strategy.stop")]
    StrategyStop {
        id: String,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    // All outbound frames funnel through one channel so bus forwarders and
    // command responses cannot interleave partial writes.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(1024);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
    });

    let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let command: ClientCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(e) => {
                let _ = out_tx
                    .send(json!({"type": "error", "message": e.to_string()}).to_string())
                    .await;
                continue;
            }
        };

        match command {
            ClientCommand::Subscribe { pattern } => {
                debug!(pattern = %pattern, "ws client subscribed");
                let subscription = state.bus.subscribe(pattern.clone());
                forwarders.push(spawn_forwarder(subscription, out_tx.clone()));
                let _ = out_tx
                    .send(
                        json!({"type": "response", "op": "subscribe", "pattern": pattern})
                            .to_string(),
                    )
                    .await;
            }
            ClientCommand::StrategyList => {
                let runners = state.manager.list_runners();
                let _ = out_tx
                    .send(
                        json!({"type": "response", "op": "strategy.list", "data": runners})
                            .to_string(),
                    )
                    .await;
            }
            ClientCommand::StrategyPause { id } => {
                respond(&state, &out_tx, "strategy.pause", &id, |state, id| {
                    let state = state.clone();
                    let id = id.to_string();
                    async move { state.manager.pause_runner(&id).await }
                })
                .await;
            }
            ClientCommand::StrategyResume { id } => {
                respond(&state, &out_tx, "strategy.resume", &id, |state, id| {
                    let state = state.clone();
                    let id = id.to_string();
                    async move { state.manager.resume_runner(&id).await }
                })
                .await;
            }
            ClientCommand::StrategyStop { id } => {
                respond(&state, &out_tx, "strategy.stop", &id, |state, id| {
                    let state = state.clone();
                    let id = id.to_string();
                    async move { state.manager.stop_runner(&id).await }
                })
                .await;
            }
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    writer.abort();
}

fn spawn_forwarder(
    mut subscription: Subscription,
    out_tx: mpsc::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((topic, event)) = subscription.recv().await {
            let frame = json!({"type": "event", "topic": topic, "event": event}).to_string();
            if out_tx.send(frame).await.is_err() {
                return;
            }
        }
    })
}

async fn respond<F, Fut>(
    state: &AppState,
    out_tx: &mpsc::Sender<String>,
    op: &str,
    id: &str,
    action: F,
) where
    F: FnOnce(&AppState, &str) -> Fut,
    Fut: std::future::Future<Output = crate::error::CoreResult<()>>,
{
    let frame = match action(state, id).await {
        Ok(()) => json!({"type": "response", "op": op, "id": id}),
        Err(e) => {
            warn!(op, id, error = %e, "ws command failed");
            json!({"type": "error", "op": op, "id": id, "message": e.to_string()})
        }
    };
    let _ = out_tx.send(frame.to_string()).await;
}
