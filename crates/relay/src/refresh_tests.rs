// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::channel::ChannelRegistry;
use crate::credential::{Credentials, MemoryCredentialStore};
use crate::protocol::into_resolution;

fn response(status_code: u16, body: serde_json::Value) -> ProxyResponse {
    ProxyResponse { status_code, headers: BTreeMap::new(), body }
}

#[yare::parameterized(
    ok            = { 200, json!({ "items": [] }), false },
    unauthorized  = { 401, json!(null), true },
    forbidden     = { 403, json!("denied"), true },
    rate_limited  = { 429, json!(null), false },
    business_str  = { 200, json!({ "code": "SESSION_EXPIRED" }), true },
    business_num  = { 200, json!({ "code": 40101 }), true },
    text_body     = { 200, json!(r#"{"code":"SESSION_EXPIRED"}"#), true },
    other_code    = { 200, json!({ "code": "OK" }), false },
)]
fn stale_policy_classifies(status: u16, body: serde_json::Value, stale: bool) {
    let policy =
        StaleSessionPolicy::new(vec![401, 403], vec!["SESSION_EXPIRED".into(), "40101".into()]);
    assert_eq!(policy.is_stale(&response(status, body)), stale);
}

#[test]
fn stale_check_reports_status_and_code() {
    let policy = StaleSessionPolicy::new(vec![], vec!["SESSION_EXPIRED".into()]);
    let err = policy.check(&response(200, json!({ "code": "SESSION_EXPIRED" })));
    assert_eq!(
        err,
        Err(FetchError::StaleSession { status: 200, code: Some("SESSION_EXPIRED".into()) })
    );
}

/// Refresher that counts calls and succeeds or fails as told.
struct CountingRefresher {
    calls: AtomicUsize,
    succeed: bool,
}

impl CountingRefresher {
    fn new(succeed: bool) -> Self {
        Self { calls: AtomicUsize::new(0), succeed }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SessionRefresher for CountingRefresher {
    async fn refresh(
        &self,
        owner_id: &str,
        _instance_id: Option<&str>,
    ) -> Result<Credentials, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(Credentials::new())
        } else {
            Err(RelayError::ChannelUnavailable { owner_id: owner_id.into(), instance_id: None })
        }
    }
}

fn stale() -> FetchError {
    FetchError::StaleSession { status: 401, code: None }
}

fn ctx(refresher: &CountingRefresher) -> Option<RefreshContext<'_>> {
    Some(RefreshContext { refresher, owner_id: "alice", instance_id: None })
}

#[tokio::test]
async fn stale_then_success_refreshes_once() {
    let refresher = CountingRefresher::new(true);
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let result = retry_once_after_refresh(ctx(&refresher), move || async move {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Err(stale()),
            _ => Ok("page"),
        }
    })
    .await;

    assert_eq!(result, Ok("page"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn second_stale_failure_propagates_without_another_refresh() {
    let refresher = CountingRefresher::new(true);
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let result: Result<(), _> = retry_once_after_refresh(ctx(&refresher), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(FetchError::StaleSession { status: 403, code: None })
    })
    .await;

    assert_eq!(result, Err(FetchError::StaleSession { status: 403, code: None }));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn failed_refresh_surfaces_original_error() {
    let refresher = CountingRefresher::new(false);
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let result: Result<(), _> = retry_once_after_refresh(ctx(&refresher), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(stale())
    })
    .await;

    assert_eq!(result, Err(stale()));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn other_errors_skip_refresh() {
    let refresher = CountingRefresher::new(true);
    let result: Result<(), _> = retry_once_after_refresh(ctx(&refresher), || async {
        Err(FetchError::Upstream { status: 500, body: String::new() })
    })
    .await;

    assert!(matches!(result, Err(FetchError::Upstream { status: 500, .. })));
    assert_eq!(refresher.calls(), 0);
}

#[tokio::test]
async fn no_context_means_no_retry() {
    let attempts = AtomicUsize::new(0);
    let counter = &attempts;
    let result: Result<(), _> = retry_once_after_refresh(None, move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(stale())
    })
    .await;
    assert_eq!(result, Err(stale()));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

fn spawn_refresh_agent(
    broker: Arc<CorrelationBroker>,
    mut rx: mpsc::Receiver<String>,
    reply: serde_json::Value,
) {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            let Ok(AgentRequest::RefreshRequest { request_id }) =
                serde_json::from_str::<AgentRequest>(&text)
            else {
                continue;
            };
            let mut inbound = reply.clone();
            inbound["request_id"] = json!(request_id);
            if let Ok(parsed) = serde_json::from_value::<AgentReply>(inbound) {
                if let Some((id, outcome)) = into_resolution(parsed) {
                    broker.resolve("alice", &id, outcome);
                }
            }
        }
    });
}

fn coordinator(
    store: Arc<dyn CredentialStore>,
) -> (SessionRefreshCoordinator, Arc<CorrelationBroker>) {
    let broker = Arc::new(CorrelationBroker::new(
        Arc::new(ChannelRegistry::new()),
        Duration::from_secs(5),
    ));
    let coordinator = SessionRefreshCoordinator::new(
        Arc::clone(&broker),
        store,
        InstancePolicy::Exact,
        Duration::from_secs(5),
    );
    (coordinator, broker)
}

#[tokio::test]
async fn coordinator_persists_agent_snapshot() -> anyhow::Result<()> {
    let store = Arc::new(MemoryCredentialStore::new());
    let (coordinator, broker) = coordinator(store.clone());
    let (tx, rx) = mpsc::channel(8);
    broker.registry().connect("alice", "tab-1", tx);
    spawn_refresh_agent(
        Arc::clone(&broker),
        rx,
        json!({
            "type": "refresh_response",
            "status": "success",
            "credentials": { "cookie": "sid=fresh", "user_agent": "Mozilla/5.0" }
        }),
    );

    let credentials = coordinator.refresh("alice", None).await?;
    assert_eq!(credentials.get("cookie").map(String::as_str), Some("sid=fresh"));
    assert_eq!(store.get("alice").await?, Some(credentials));
    Ok(())
}

#[tokio::test]
async fn coordinator_reports_agent_refusal() -> anyhow::Result<()> {
    let store = Arc::new(MemoryCredentialStore::new());
    let (coordinator, broker) = coordinator(store.clone());
    let (tx, rx) = mpsc::channel(8);
    broker.registry().connect("alice", "tab-1", tx);
    spawn_refresh_agent(
        Arc::clone(&broker),
        rx,
        json!({ "type": "refresh_response", "status": "error", "error_message": "logged out" }),
    );

    let result = coordinator.refresh("alice", None).await;
    assert_eq!(result, Err(RelayError::RemoteReported("logged out".into())));
    assert_eq!(store.get("alice").await?, None);
    Ok(())
}

#[tokio::test]
async fn coordinator_without_agent_is_unavailable() {
    let (coordinator, _broker) = coordinator(Arc::new(MemoryCredentialStore::new()));
    let result = coordinator.refresh("nobody", None).await;
    assert!(matches!(result, Err(RelayError::ChannelUnavailable { .. })));
}

/// Store whose writes always fail.
struct ReadOnlyStore;

#[async_trait::async_trait]
impl CredentialStore for ReadOnlyStore {
    async fn get(&self, _owner_id: &str) -> anyhow::Result<Option<Credentials>> {
        Ok(None)
    }

    async fn set(&self, _owner_id: &str, _credentials: Credentials) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn coordinator_fails_when_snapshot_cannot_be_stored() {
    let (coordinator, broker) = coordinator(Arc::new(ReadOnlyStore));
    let (tx, rx) = mpsc::channel(8);
    broker.registry().connect("alice", "tab-1", tx);
    spawn_refresh_agent(
        Arc::clone(&broker),
        rx,
        json!({
            "type": "refresh_response",
            "status": "success",
            "credentials": { "cookie": "sid=fresh" }
        }),
    );

    let result = coordinator.refresh("alice", None).await;
    assert_eq!(result, Err(RelayError::CredentialStore("disk full".into())));
}
