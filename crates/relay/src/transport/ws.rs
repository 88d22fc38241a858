// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-facing WebSocket endpoint.
//!
//! Each browser agent holds one socket per instance. Outbound requests are
//! queued by the broker on the connection's channel; inbound replies are
//! matched back to their callers by request id.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::channel::ChannelHandle;
use crate::error::ErrorCode;
use crate::protocol::{into_resolution, AgentReply, AgentRequest};
use crate::state::RelayState;
use crate::transport::auth;

/// Outbound frames buffered per connection before senders wait.
const OUTBOUND_BUFFER: usize = 64;

/// Instance name used when the agent does not send one.
const DEFAULT_INSTANCE: &str = "default";

/// Query parameters for the agent WS upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentWsQuery {
    pub owner: String,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws/agent?owner=&instance=&token=`: agent duplex channel.
pub async fn agent_ws_handler(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<AgentWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let expected = state.config.auth_token.as_deref();
    if auth::validate_ws_token(query.token.as_deref(), expected).is_err() {
        return ErrorCode::Unauthorized.to_http_response("unauthorized").into_response();
    }
    if query.owner.is_empty() {
        return ErrorCode::BadRequest.to_http_response("owner is required").into_response();
    }

    let owner_id = query.owner;
    let instance_id = query
        .instance
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| DEFAULT_INSTANCE.to_owned());
    ws.on_upgrade(move |socket| handle_agent(socket, state, owner_id, instance_id))
        .into_response()
}

/// Per-connection loop: pump queued requests out, route replies in.
async fn handle_agent(
    socket: WebSocket,
    state: Arc<RelayState>,
    owner_id: String,
    instance_id: String,
) {
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let handle = state.registry.connect(&owner_id, &instance_id, tx);
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            _ = handle.cancelled() => {
                tracing::debug!(
                    owner_id = %owner_id,
                    instance_id = %instance_id,
                    "connection superseded"
                );
                break;
            }

            outbound = rx.recv() => {
                let Some(text) = outbound else { break };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if handle_inbound(&state, &handle, text.as_str(), &mut ws_tx).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(
                            owner_id = %owner_id,
                            instance_id = %instance_id,
                            err = %e,
                            "agent socket error"
                        );
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    state.broker.disconnect(&handle);
}

/// Handle one text frame from the agent. `Err` means the socket is gone.
async fn handle_inbound(
    state: &RelayState,
    handle: &ChannelHandle,
    text: &str,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let reply = match serde_json::from_str::<AgentReply>(text) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(
                owner_id = handle.owner_id(),
                instance_id = handle.instance_id(),
                err = %e,
                "ignoring unparseable agent message"
            );
            return Ok(());
        }
    };

    match reply {
        AgentReply::Ping => {
            let pong = serde_json::to_string(&AgentRequest::Pong).unwrap_or_default();
            ws_tx.send(Message::Text(pong.into())).await
        }
        AgentReply::Hello { version } => {
            tracing::info!(
                owner_id = handle.owner_id(),
                instance_id = handle.instance_id(),
                version = version.as_deref().unwrap_or("unknown"),
                "agent hello"
            );
            Ok(())
        }
        other => {
            if let Some((request_id, outcome)) = into_resolution(other) {
                state.broker.resolve(handle.owner_id(), &request_id, outcome);
            }
            Ok(())
        }
    }
}
