// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent WebSocket tests using real connections against an in-process
//! axum server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tether::error::RelayError;
use tether::protocol::ProxyCall;
use tether::state::RelayState;
use tether::test_support::{spawn_http_server, wait_for, StateBuilder};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsTx = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsRx = futures_util::stream::SplitStream<WsStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn ws_send(stream: &mut WsTx, value: &serde_json::Value) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    stream.send(WsMessage::Text(text.into())).await.map_err(|e| anyhow::anyhow!("ws send: {e}"))?;
    Ok(())
}

/// Receive the next text frame as JSON, skipping control frames.
async fn ws_recv(stream: &mut WsRx) -> anyhow::Result<serde_json::Value> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, stream.next())
            .await
            .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("ws stream closed"))?
            .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
        match msg {
            WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => anyhow::bail!("expected Text message, got {other:?}"),
        }
    }
}

async fn ws_connect(addr: &std::net::SocketAddr, query: &str) -> anyhow::Result<(WsTx, WsRx)> {
    let url = format!("ws://{addr}/ws/agent?{query}");
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| anyhow::anyhow!("ws connect: {e}"))?;
    Ok(stream.split())
}

/// Connect as `owner`/`instance` and wait until the registry sees it.
async fn connect_agent(
    state: &Arc<RelayState>,
    addr: &std::net::SocketAddr,
    owner: &str,
    instance: &str,
    connections: usize,
) -> anyhow::Result<(WsTx, WsRx)> {
    let pair = ws_connect(addr, &format!("owner={owner}&instance={instance}")).await?;
    let registered = wait_for(RECV_TIMEOUT, || {
        state.registry.instances(owner).iter().any(|i| i.instance_id == instance)
            && state.registry.counts().1 == connections
    })
    .await;
    anyhow::ensure!(registered, "agent {owner}/{instance} never registered");
    Ok(pair)
}

fn spawn_call(
    state: &Arc<RelayState>,
    owner: &'static str,
    url: &'static str,
) -> tokio::task::JoinHandle<Result<tether::protocol::ProxyResponse, RelayError>> {
    let state = Arc::clone(state);
    tokio::spawn(async move { state.proxy.proxy_call(owner, &ProxyCall::get(url), None).await })
}

#[tokio::test]
async fn agent_ping_gets_pong() -> anyhow::Result<()> {
    let state = StateBuilder::new().build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;
    let (mut tx, mut rx) = connect_agent(&state, &addr, "alice", "tab-1", 1).await?;

    ws_send(&mut tx, &serde_json::json!({ "type": "hello", "version": "1.4.0" })).await?;
    ws_send(&mut tx, &serde_json::json!({ "type": "ping" })).await?;

    let resp = ws_recv(&mut rx).await?;
    assert_eq!(resp.get("type").and_then(|t| t.as_str()), Some("pong"), "response: {resp}");
    Ok(())
}

#[tokio::test]
async fn proxy_call_round_trips_through_socket() -> anyhow::Result<()> {
    let state = StateBuilder::new().build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;
    let (mut tx, mut rx) = connect_agent(&state, &addr, "alice", "tab-1", 1).await?;

    let call = spawn_call(&state, "alice", "https://example.test/api/me");

    let request = ws_recv(&mut rx).await?;
    assert_eq!(request["type"], "proxy_request");
    assert_eq!(request["url"], "https://example.test/api/me");
    assert_eq!(request["method"], "GET");
    let request_id = request["request_id"].as_str().unwrap_or_default().to_owned();
    assert!(request_id.starts_with("alice_"));

    // Garbage is ignored; the socket stays up.
    tx.send(WsMessage::Text("not json".into())).await?;
    ws_send(
        &mut tx,
        &serde_json::json!({
            "type": "proxy_response",
            "request_id": request_id,
            "status": "success",
            "status_code": 404,
            "body": { "message": "gone" }
        }),
    )
    .await?;

    let response = tokio::time::timeout(RECV_TIMEOUT, call).await???;
    assert_eq!(response.status_code, 404);
    assert_eq!(response.body["message"], "gone");
    assert_eq!(state.broker.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn upgrade_without_token_is_rejected() -> anyhow::Result<()> {
    let state = StateBuilder::new().auth_token("s3cret").build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;

    assert!(ws_connect(&addr, "owner=alice").await.is_err());
    assert!(ws_connect(&addr, "owner=alice&token=wrong").await.is_err());
    let _ok = ws_connect(&addr, "owner=alice&token=s3cret").await?;
    Ok(())
}

#[tokio::test]
async fn closing_socket_fails_pending_requests() -> anyhow::Result<()> {
    let state = StateBuilder::new().dispatch_timeout_secs(30).build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;
    let (mut tx, mut rx) = connect_agent(&state, &addr, "alice", "tab-1", 1).await?;

    let call = spawn_call(&state, "alice", "https://example.test/slow");
    ws_recv(&mut rx).await?;
    assert_eq!(state.broker.pending_count(), 1);

    tx.close().await?;
    drop(rx);

    let result = tokio::time::timeout(RECV_TIMEOUT, call).await??;
    assert_eq!(result, Err(RelayError::Disconnected { owner_id: "alice".into() }));
    assert_eq!(state.registry.counts(), (0, 0));
    Ok(())
}

#[tokio::test]
async fn reconnect_supersedes_previous_socket() -> anyhow::Result<()> {
    let state = StateBuilder::new().build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;
    let (_old_tx, mut old_rx) = connect_agent(&state, &addr, "alice", "tab-1", 1).await?;
    let first_id = state.registry.instances("alice").first().map(|i| i.connection_id);

    let (mut tx, mut rx) = ws_connect(&addr, "owner=alice&instance=tab-1").await?;
    let replaced = wait_for(RECV_TIMEOUT, || {
        state.registry.instances("alice").first().map(|i| i.connection_id) != first_id
    })
    .await;
    assert!(replaced);
    assert_eq!(state.registry.counts(), (1, 1));

    // The superseded socket is closed by the relay.
    let closed = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match old_rx.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let call = spawn_call(&state, "alice", "https://example.test/");
    let request = ws_recv(&mut rx).await?;
    ws_send(
        &mut tx,
        &serde_json::json!({
            "type": "proxy_response",
            "request_id": request["request_id"],
            "status": "success",
            "status_code": 200,
            "body": {}
        }),
    )
    .await?;
    let response = tokio::time::timeout(RECV_TIMEOUT, call).await???;
    assert_eq!(response.status_code, 200);
    // The old socket's teardown left the replacement registered.
    assert_eq!(state.registry.counts(), (1, 1));
    Ok(())
}

#[tokio::test]
async fn reply_on_another_owners_socket_does_not_complete_request() -> anyhow::Result<()> {
    let state = StateBuilder::new().build();
    let (addr, _server) = spawn_http_server(Arc::clone(&state)).await?;
    let (mut alice_tx, mut alice_rx) = connect_agent(&state, &addr, "alice", "tab-1", 1).await?;
    let (mut bob_tx, mut bob_rx) = connect_agent(&state, &addr, "bob", "tab-1", 2).await?;

    let call = spawn_call(&state, "alice", "https://example.test/private");
    let request = ws_recv(&mut alice_rx).await?;
    let reply = |body: &str| {
        serde_json::json!({
            "type": "proxy_response",
            "request_id": request["request_id"],
            "status": "success",
            "status_code": 200,
            "body": body
        })
    };

    ws_send(&mut bob_tx, &reply("forged")).await?;
    // Frames on one socket are handled in order, so the pong means the forged
    // reply has already been processed.
    ws_send(&mut bob_tx, &serde_json::json!({ "type": "ping" })).await?;
    assert_eq!(ws_recv(&mut bob_rx).await?["type"], "pong");
    assert_eq!(state.broker.pending_count(), 1);

    ws_send(&mut alice_tx, &reply("genuine")).await?;
    let response = tokio::time::timeout(RECV_TIMEOUT, call).await???;
    assert_eq!(response.body, "genuine");
    Ok(())
}
