//! WebSocket handler for real-time updates

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use ifemgr_core::{CtxMiniDump, IspEvent};
use ifemgr_hwmgr::{ContextSummary, ManagerEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::{AppState, ContextEvent};

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "contexts")]
    Contexts(Vec<ContextSummary>),
    #[serde(rename = "manager")]
    Manager(ManagerEvent),
    #[serde(rename = "context_event")]
    ContextEvent { ctx: usize, event: IspEvent },
    #[serde(rename = "mini_dump")]
    MiniDump { ctx: usize, dump: CtxMiniDump },
    #[serde(rename = "lagged")]
    Lagged { skipped: u64 },
    #[serde(rename = "pong")]
    Pong,
}

impl From<ContextEvent> for WsMessage {
    fn from(event: ContextEvent) -> Self {
        match event {
            ContextEvent::Event { ctx, event } => WsMessage::ContextEvent { ctx, event },
            ContextEvent::MiniDump { ctx, dump } => WsMessage::MiniDump { ctx, dump },
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send<S>(sender: &mut S, msg: &WsMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode WebSocket message");
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut ctx_events = state.subscribe();
    let mut manager_events = state.subscribe_manager();

    info!("WebSocket client connected");

    // Send current contexts on connect
    if !send(&mut sender, &WsMessage::Contexts(state.manager.contexts())).await {
        return;
    }

    loop {
        tokio::select! {
            event = manager_events.recv() => {
                let msg = match event {
                    Ok(event) => WsMessage::Manager(event),
                    Err(RecvError::Lagged(n)) => WsMessage::Lagged { skipped: n },
                    Err(e) => {
                        debug!(error = %e, "Manager event channel closed");
                        break;
                    }
                };
                if !send(&mut sender, &msg).await {
                    break;
                }
            }

            event = ctx_events.recv() => {
                let msg = match event {
                    Ok(event) => WsMessage::from(event),
                    Err(RecvError::Lagged(n)) => {
                        // Per-frame events can outpace slow clients
                        debug!(skipped = n, "Context event channel lagged");
                        WsMessage::Lagged { skipped: n }
                    }
                    Err(e) => {
                        debug!(error = %e, "Context event channel closed");
                        break;
                    }
                };
                if !send(&mut sender, &msg).await {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" && !send(&mut sender, &WsMessage::Pong).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_shape() {
        let msg = WsMessage::Manager(ManagerEvent::ContextReleased { ctx: 2 });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "manager");
        assert_eq!(json["data"]["type"], "context_released");
        assert_eq!(json["data"]["ctx"], 2);

        let json = serde_json::to_value(WsMessage::Pong).unwrap();
        assert_eq!(json["type"], "pong");
    }
}
