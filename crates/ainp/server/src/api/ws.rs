//! Long-lived agent sessions over WebSocket.
//!
//! The URL carries `?did=…`; a missing or malformed DID closes with 1008.
//! On connect the broker attaches the session to the registry and starts
//! (or reuses) the recipient's durable consumer. Frames are JSON; the
//! client confirms envelope deliveries with `{"type":"ack","delivery_id"}`,
//! and unconfirmed deliveries replay after the stream's ack window.

use crate::api::rest::state::AppState;
use ainp_delivery::SessionFrame;
use ainp_types::Did;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    #[serde(default)]
    pub did: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Ack { delivery_id: String },
}

/// `GET /ws?did=…`
pub async fn session_handler(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let did = params.did.as_deref().and_then(|raw| Did::parse(raw).ok());
    upgrade.on_upgrade(move |socket| handle_session(socket, state, did))
}

async fn handle_session(mut socket: WebSocket, state: AppState, did: Option<Did>) {
    let Some(did) = did else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "did query parameter is required".into(),
            })))
            .await;
        return;
    };

    let mut frames = state.sessions.subscribe(&did);
    state.bridge.ensure_consumer(&did);
    tracing::info!(%did, "session connected");

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if !forward_frame(&mut socket, &frame).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(dropped)) => {
                    // Bounded channel overflowed: the oldest frames are gone.
                    tracing::warn!(%did, dropped, "session lagged; dropped oldest notifications");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&state, &did, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%did, error = %e, "session read error");
                    break;
                }
            },
        }
    }

    tracing::info!(%did, "session disconnected");
}

async fn forward_frame(socket: &mut WebSocket, frame: &SessionFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(encoded) => socket.send(Message::Text(encoded)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode session frame");
            true
        }
    }
}

async fn handle_client_frame(state: &AppState, did: &Did, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Ack { delivery_id }) => {
            if let Err(e) = state.bridge.ack(did, &delivery_id).await {
                tracing::debug!(%did, delivery_id, error = %e, "ack failed");
            }
        }
        Err(e) => {
            tracing::debug!(%did, error = %e, "ignoring malformed client frame");
        }
    }
}
