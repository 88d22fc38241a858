// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: state builder, in-process agents, and
//! assertion helpers.

use std::sync::{Arc, Once};
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::CorrelationBroker;
use crate::channel::ChannelHandle;
use crate::config::RelayConfig;
use crate::credential::{CredentialStore, MemoryCredentialStore};
use crate::protocol::{into_resolution, AgentReply, AgentRequest};
use crate::state::RelayState;

static INIT: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn ensure_crypto_provider() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Builder for constructing `RelayState` in tests with fast defaults.
pub struct StateBuilder {
    config: RelayConfig,
    credentials: Arc<dyn CredentialStore>,
}

impl Default for StateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBuilder {
    pub fn new() -> Self {
        let mut config = RelayConfig::parse_from(["tether"]);
        config.dispatch_timeout_secs = 5;
        config.refresh_timeout_secs = 5;
        config.page_delay_min_ms = 0;
        config.page_delay_max_ms = 0;
        Self { config, credentials: Arc::new(MemoryCredentialStore::new()) }
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn instance_fallback(mut self, on: bool) -> Self {
        self.config.instance_fallback = on;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n;
        self
    }

    pub fn dispatch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.dispatch_timeout_secs = secs;
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = store;
        self
    }

    pub fn build(self) -> Arc<RelayState> {
        ensure_crypto_provider();
        Arc::new(RelayState::new(self.config, self.credentials, CancellationToken::new()))
    }
}

/// In-process stand-in for a browser agent.
///
/// Registers directly with the broker's registry and answers each request
/// with whatever `respond` returns; `None` leaves the request unanswered.
pub struct FakeAgent {
    pub handle: ChannelHandle,
    task: tokio::task::JoinHandle<()>,
}

impl FakeAgent {
    pub fn attach<F>(
        broker: &Arc<CorrelationBroker>,
        owner_id: &str,
        instance_id: &str,
        respond: F,
    ) -> Self
    where
        F: Fn(&AgentRequest) -> Option<serde_json::Value> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        let handle = broker.registry().connect(owner_id, instance_id, tx);
        let broker = Arc::clone(broker);
        let owner_id = owner_id.to_owned();
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let Ok(request) = serde_json::from_str::<AgentRequest>(&text) else {
                    continue;
                };
                let Some(mut reply) = respond(&request) else {
                    continue;
                };
                if let Some(id) = request.request_id() {
                    reply["request_id"] = serde_json::Value::String(id.to_owned());
                }
                let Ok(reply) = serde_json::from_value::<AgentReply>(reply) else {
                    continue;
                };
                if let Some((id, outcome)) = into_resolution(reply) {
                    broker.resolve(&owner_id, &id, outcome);
                }
            }
        });
        Self { handle, task }
    }

    /// Drop the connection the way a closed socket would.
    pub fn disconnect(self, broker: &CorrelationBroker) {
        broker.disconnect(&self.handle);
        self.task.abort();
    }
}

/// Reply body for a successful proxied call.
pub fn proxy_ok(status_code: u16, body: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "proxy_response",
        "status": "success",
        "status_code": status_code,
        "body": body,
    })
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Assert that an expression evaluates to `Err` whose Display output
/// contains the given substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}

/// Spawn an HTTP server on a random port for integration testing.
///
/// Returns the bound address and a join handle for the server task.
pub async fn spawn_http_server(
    state: Arc<RelayState>,
) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let router = crate::transport::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, handle))
}
