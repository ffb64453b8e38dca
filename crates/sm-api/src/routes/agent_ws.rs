//! Agent WebSocket endpoint.
//!
//! TLS (including mutual TLS) terminates in front of the server; the
//! terminator forwards the agent's client certificate in the
//! `x-client-certificate` header (base64 or raw PEM). A presented
//! certificate must validate against the CA, match the serial stored on
//! the host row, and belong to an approved host. Agents without a
//! certificate may still connect to register and await approval.
//!
//! One task per socket: inbound frames are routed sequentially (no two
//! handlers for the same session run concurrently) and outbound envelopes
//! drain from the session's channel.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use sm_registry::handlers::{route_message, HandlerContext};
use sm_registry::protocol::Envelope;
use sm_store::hosts;

use crate::state::ApiState;

/// Sessions idle in both directions for this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub fn router() -> Router<ApiState> {
    Router::new().route("/agent/connect", get(agent_connect))
}

fn forwarded_client_cert(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-client-certificate")?.to_str().ok()?;
    if raw.contains("BEGIN CERTIFICATE") {
        return Some(raw.replace("\\n", "\n"));
    }
    let decoded = BASE64.decode(raw.trim()).ok()?;
    String::from_utf8(decoded).ok()
}

async fn agent_connect(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Authorization gate for certificate-bearing agents. The crypto check
    // is necessary but not sufficient: the host must still be approved and
    // the serial must match the one on record (revocation).
    if let Some(cert_pem) = forwarded_client_cert(&headers) {
        let Some((fqdn, host_id)) = state.ca.validate_client_cert(&cert_pem) else {
            warn!("Agent presented an invalid client certificate");
            return StatusCode::FORBIDDEN.into_response();
        };

        let authorized = state
            .store
            .with_conn(|conn| hosts::get_by_id(conn, &host_id))
            .ok()
            .flatten()
            .map(|host| {
                let serial_matches = match (&host.certificate_serial, sm_ca::ca::client_cert_serial(&cert_pem)) {
                    (Some(stored), Some(presented)) => stored == &presented,
                    _ => false,
                };
                host.is_approved() && serial_matches && host.fqdn == fqdn
            })
            .unwrap_or(false);

        if !authorized {
            warn!(fqdn, host_id, "Client certificate rejected at authorization layer");
            return StatusCode::FORBIDDEN.into_response();
        }
        info!(fqdn, host_id, "Agent client certificate accepted");
    }

    ws.on_upgrade(move |socket| handle_agent_socket(state, socket))
}

async fn handle_agent_socket(state: ApiState, mut socket: WebSocket) {
    let (agent_id, mut outbound) = state.connections.open_session(false).await;
    let ctx = HandlerContext {
        store: state.store.clone(),
        queue: state.queue.clone(),
        connections: state.connections.clone(),
        events: state.events.clone(),
    };

    loop {
        tokio::select! {
            // Server → agent (dispatch loop and handler replies)
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                if socket
                    .send(Message::Text(envelope.to_json().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }

            // Agent → server
            ws_msg = socket.recv() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!(agent_id, "Unparseable agent message: {e}");
                                let reply = Envelope::error("Malformed envelope");
                                if socket
                                    .send(Message::Text(reply.to_json().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };
                        if let Some(reply) = route_message(&ctx, &agent_id, &envelope).await {
                            if socket
                                .send(Message::Text(reply.to_json().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(agent_id, "WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Idle in both directions
            _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                info!(agent_id, "Agent session idle timeout");
                break;
            }
        }
    }

    state.connections.disconnect(&agent_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_cert_decoding() {
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n";

        let mut headers = HeaderMap::new();
        headers.insert("x-client-certificate", BASE64.encode(pem).parse().unwrap());
        assert_eq!(forwarded_client_cert(&headers).as_deref(), Some(pem));

        // Escaped-newline raw PEM form
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-client-certificate",
            pem.replace('\n', "\\n").parse().unwrap(),
        );
        assert_eq!(forwarded_client_cert(&headers).as_deref(), Some(pem));

        let headers = HeaderMap::new();
        assert!(forwarded_client_cert(&headers).is_none());
    }
}
