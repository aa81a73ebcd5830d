//! Peer-facing RPC surface -- `POST /rpc` and its WebSocket upgrade.
//!
//! Inbound envelopes are token-checked, stamped with ingest time, converted
//! to actions, and queued to the RIB task. The reply carries the plan
//! outcome: `{success: false}` means that envelope was rejected, never that
//! the session broke. Over the socket the first frame must be `authorize`;
//! afterwards frames are dispatched in arrival order and every frame gets
//! exactly one id-correlated reply.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;

use pylon_protocol::{PeerRequest, PeerResponse, SocketFrame, SocketReply, DEFAULTS, RPC_PATH};

use crate::{AppState, SubmitError};

/// Build the peer-facing router.
pub fn rpc_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(RPC_PATH, get(rpc_socket).post(rpc_post))
        .layer(DefaultBodyLimit::max(DEFAULTS.max_envelope_bytes))
        .with_state(state)
}

/// Apply one inbound envelope. Shared by both transports.
async fn dispatch(state: &AppState, request: PeerRequest) -> PeerResponse {
    if let PeerRequest::Authorize { token } = &request {
        return if *token == state.peer_token {
            PeerResponse::ok()
        } else {
            PeerResponse::err("invalid token")
        };
    }

    let kind = request.kind();
    let Some(action) = request.into_action(Utc::now()) else {
        return PeerResponse::err("envelope carries no action");
    };
    match state.handle.submit(action).await {
        Ok(_) => PeerResponse::ok(),
        Err(SubmitError::Plan(e)) => {
            tracing::debug!(request = kind, error = %e, "peer envelope rejected");
            PeerResponse::err(e.to_string())
        }
        Err(SubmitError::Unavailable) => PeerResponse::err("node is shutting down"),
    }
}

async fn rpc_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PeerRequest>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if auth != format!("Bearer {}", state.peer_token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(PeerResponse::err("invalid bearer token")),
        )
            .into_response();
    }
    Json(dispatch(&state, request).await).into_response()
}

async fn rpc_socket(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(DEFAULTS.max_envelope_bytes)
        .on_upgrade(move |socket| socket_session(socket, state))
}

/// Drive one inbound socket session to completion.
async fn socket_session(mut socket: WebSocket, state: Arc<AppState>) {
    let Some(first) = next_text(&mut socket).await else {
        return;
    };
    let (id, verdict) = match serde_json::from_str::<SocketFrame>(&first) {
        Ok(frame) => {
            let verdict = match &frame.request {
                PeerRequest::Authorize { token } if *token == state.peer_token => Ok(()),
                PeerRequest::Authorize { .. } => Err("invalid token"),
                _ => Err("authorize must be the first frame"),
            };
            (frame.id, verdict)
        }
        Err(_) => (0, Err("malformed frame")),
    };
    let reply = match verdict {
        Ok(()) => SocketReply::from_response(id, PeerResponse::ok()),
        Err(reason) => {
            tracing::debug!(reason, "socket session refused");
            SocketReply::from_response(id, PeerResponse::err(reason))
        }
    };
    let authorized = reply.success;
    if send_reply(&mut socket, &reply).await.is_err() || !authorized {
        return;
    }
    tracing::debug!("peer socket session authorized");

    loop {
        let Some(text) = next_text(&mut socket).await else {
            break;
        };
        let reply = match serde_json::from_str::<SocketFrame>(&text) {
            Ok(frame) => {
                let response = dispatch(&state, frame.request).await;
                SocketReply::from_response(frame.id, response)
            }
            Err(e) => SocketReply::from_response(0, PeerResponse::err(format!("malformed frame: {e}"))),
        };
        if send_reply(&mut socket, &reply).await.is_err() {
            break;
        }
    }
    tracing::debug!("peer socket session ended");
}

/// Next text frame, or `None` once the session is over. Ping/pong is
/// handled by the upgrade layer.
async fn next_text(socket: &mut WebSocket) -> Option<String> {
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "socket read failed");
                return None;
            }
        }
    }
    None
}

async fn send_reply(socket: &mut WebSocket, reply: &SocketReply) -> Result<(), axum::Error> {
    let text = serde_json::to_string(reply)
        .unwrap_or_else(|_| r#"{"id":0,"success":false,"error":"encode failed"}"#.into());
    socket.send(Message::Text(text)).await
}
