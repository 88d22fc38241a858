// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session refresh: pull fresh credentials from the agent and retry once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{CorrelationBroker, DispatchTarget};
use crate::channel::InstancePolicy;
use crate::credential::{CredentialStore, Credentials};
use crate::error::{FetchError, RelayError};
use crate::protocol::{kind, AgentReply, AgentRequest, ProxyResponse};

/// Decides whether an upstream response means the browser session went stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleSessionPolicy {
    statuses: Vec<u16>,
    codes: Vec<String>,
}

impl Default for StaleSessionPolicy {
    fn default() -> Self {
        Self::new(vec![401, 403], Vec::new())
    }
}

impl StaleSessionPolicy {
    pub fn new(statuses: Vec<u16>, codes: Vec<String>) -> Self {
        Self { statuses, codes }
    }

    pub fn is_stale(&self, response: &ProxyResponse) -> bool {
        self.check(response).is_err()
    }

    /// Map a stale response to [`FetchError::StaleSession`].
    ///
    /// Matches on the status code, or on a top-level `code` field of a JSON
    /// body (string or number), which some APIs use while answering 200.
    pub fn check(&self, response: &ProxyResponse) -> Result<(), FetchError> {
        let code = business_code(response);
        let status_hit = self.statuses.contains(&response.status_code);
        let code_hit = code.as_ref().is_some_and(|c| self.codes.iter().any(|s| s == c));
        if status_hit || code_hit {
            return Err(FetchError::StaleSession { status: response.status_code, code });
        }
        Ok(())
    }
}

fn business_code(response: &ProxyResponse) -> Option<String> {
    match response.json_body()?.get("code")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Something that can renew an owner's browser session.
#[async_trait::async_trait]
pub trait SessionRefresher: Send + Sync {
    async fn refresh(
        &self,
        owner_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Credentials, RelayError>;
}

/// Asks the owner's agent for its current credentials and stores them.
pub struct SessionRefreshCoordinator {
    broker: Arc<CorrelationBroker>,
    store: Arc<dyn CredentialStore>,
    policy: InstancePolicy,
    timeout: Duration,
}

impl SessionRefreshCoordinator {
    pub fn new(
        broker: Arc<CorrelationBroker>,
        store: Arc<dyn CredentialStore>,
        policy: InstancePolicy,
        timeout: Duration,
    ) -> Self {
        Self { broker, store, policy, timeout }
    }
}

#[async_trait::async_trait]
impl SessionRefresher for SessionRefreshCoordinator {
    async fn refresh(
        &self,
        owner_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Credentials, RelayError> {
        let target = DispatchTarget::owner(owner_id).instance(instance_id).policy(self.policy);
        let reply = self
            .broker
            .dispatch(target, Some(self.timeout), |id| AgentRequest::RefreshRequest {
                request_id: id.to_owned(),
            })
            .await?;

        let credentials = match reply {
            AgentReply::RefreshResponse(env) => env.credentials.ok_or_else(|| {
                RelayError::Protocol(format!(
                    "refresh_response {} carried no credentials",
                    env.request_id
                ))
            })?,
            other => {
                return Err(RelayError::Protocol(format!(
                    "expected refresh_response, got {}",
                    kind(&other)
                )))
            }
        };

        if let Err(e) = self.store.set(owner_id, credentials.clone()).await {
            tracing::error!(owner_id, err = %e, "failed to persist refreshed credentials");
            return Err(RelayError::CredentialStore(format!("{e:#}")));
        }
        tracing::info!(owner_id, keys = credentials.len(), "session refreshed");
        Ok(credentials)
    }
}

/// Who to refresh when an operation hits a stale session.
#[derive(Clone, Copy)]
pub struct RefreshContext<'a> {
    pub refresher: &'a dyn SessionRefresher,
    pub owner_id: &'a str,
    pub instance_id: Option<&'a str>,
}

/// Run `op`; on a stale-session failure refresh and run it exactly once more.
///
/// A failed refresh surfaces the original error unchanged, as does any
/// failure of the second attempt. Without a context no refresh is attempted.
pub async fn retry_once_after_refresh<T, F, Fut>(
    ctx: Option<RefreshContext<'_>>,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let original = match op().await {
        Ok(value) => return Ok(value),
        Err(e) if e.is_stale_session() => e,
        Err(e) => return Err(e),
    };
    let Some(ctx) = ctx else {
        return Err(original);
    };

    match ctx.refresher.refresh(ctx.owner_id, ctx.instance_id).await {
        Ok(_) => {
            tracing::debug!(owner_id = ctx.owner_id, "retrying after session refresh");
            op().await
        }
        Err(refresh_err) => {
            tracing::warn!(
                owner_id = ctx.owner_id,
                err = %refresh_err,
                "session refresh failed, keeping original error"
            );
            Err(original)
        }
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
