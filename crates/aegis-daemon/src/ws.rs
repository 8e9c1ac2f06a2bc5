//! WebSocket sessions.
//!
//! Handshake authenticates with the bearer token (header or `?token=`),
//! registers the session in the directory, and runs a send-loop draining
//! the session channel. Incoming frames are ignored except close; clients
//! reconcile via REST, not by talking back on the socket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use aegis_auth::service::verify_access;

use crate::extract::{bearer_token, ApiFailure};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

pub(crate) async fn ws_handler(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiFailure> {
    let token = bearer_token(&headers)
        .map(str::to_string)
        .or(q.token)
        .ok_or_else(|| {
            ApiFailure(aegis_types::ApiError::new(
                aegis_types::ErrorCode::AuthInvalidCredentials,
                "missing bearer token",
            ))
        })?;
    let claims = verify_access(&st.pool, &st.signer, &token).await?;

    Ok(upgrade.on_upgrade(move |socket| session_loop(st, claims.sub, socket)))
}

async fn session_loop(st: Arc<AppState>, participant_id: uuid::Uuid, socket: WebSocket) {
    let (handle, mut rx) = st.directory.register(participant_id);
    let session_id = handle.session_id;
    debug!(%participant_id, %session_id, "ws session open");

    let (mut sink, mut stream) = socket.split();
    let mut keepalive = tokio::time::interval(std::time::Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                let ping = aegis_types::RealtimeEnvelope::server_ping();
                let Ok(text) = serde_json::to_string(&ping) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            maybe_env = rx.recv() => {
                let Some(envelope) = maybe_env else { break };
                let Ok(text) = serde_json::to_string(&envelope) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {} // inbound frames carry nothing we act on
                }
            }
        }
    }

    st.directory.unregister(participant_id, session_id);
    debug!(%participant_id, %session_id, "ws session closed");
}
