//! Operator event stream: host status, queue activity, and orchestration
//! progress forwarded from the event bus to dashboard WebSocket clients.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    debug!("Operator WebSocket client connected");

    let mut host_rx = state.events.host_status.subscribe();
    let mut queue_rx = state.events.queue_activity.subscribe();
    let mut orch_rx = state.events.orchestration.subscribe();

    loop {
        tokio::select! {
            result = host_rx.recv() => {
                match result {
                    Ok(event) => {
                        let msg = json!({"type": "hosts:status", "data": event});
                        if socket.send(Message::Text(msg.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Operator WebSocket host_status lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            result = queue_rx.recv() => {
                match result {
                    Ok(event) => {
                        let msg = json!({"type": "queue:activity", "data": event});
                        if socket.send(Message::Text(msg.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Operator WebSocket queue_activity lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            result = orch_rx.recv() => {
                match result {
                    Ok(event) => {
                        let msg = json!({"type": "orchestration:progress", "data": event});
                        if socket.send(Message::Text(msg.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Operator WebSocket orchestration lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    debug!("Operator WebSocket client disconnected");
}
