// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Correlation broker: pairs outbound agent requests with their replies.
//!
//! Each dispatch registers a pending entry under a fresh correlation id,
//! sends the envelope, and parks the calling task on a oneshot receiver until
//! the matching reply, a timeout, or a disconnect. Entries are removed by
//! whichever of those happens first; a drop guard removes them if the caller
//! stops waiting for any other reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::channel::{ChannelHandle, ChannelRegistry, Departure, InstancePolicy};
use crate::error::RelayError;
use crate::protocol::{AgentReply, AgentRequest};

/// What a pending request eventually receives.
pub type Resolution = Result<AgentReply, RelayError>;

/// Where a dispatch should go.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTarget<'a> {
    pub owner_id: &'a str,
    pub instance_id: Option<&'a str>,
    pub policy: InstancePolicy,
}

impl<'a> DispatchTarget<'a> {
    pub fn owner(owner_id: &'a str) -> Self {
        Self { owner_id, instance_id: None, policy: InstancePolicy::Exact }
    }

    pub fn instance(mut self, instance_id: Option<&'a str>) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn policy(mut self, policy: InstancePolicy) -> Self {
        self.policy = policy;
        self
    }
}

struct PendingRequest {
    owner_id: String,
    connection_id: u64,
    tx: oneshot::Sender<Resolution>,
    created_at: Instant,
}

/// In-flight request table shared by every handler in the process.
pub struct CorrelationBroker {
    registry: Arc<ChannelRegistry>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    default_timeout: Duration,
}

impl CorrelationBroker {
    pub fn new(registry: Arc<ChannelRegistry>, default_timeout: Duration) -> Self {
        Self { registry, pending: Mutex::new(HashMap::new()), default_timeout }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a request built around a fresh correlation id and wait for its reply.
    ///
    /// Fails immediately with [`RelayError::ChannelUnavailable`] when no
    /// connection is eligible. An agent-reported failure arrives as
    /// [`RelayError::RemoteReported`]; silence past the budget as
    /// [`RelayError::Timeout`].
    pub async fn dispatch(
        &self,
        target: DispatchTarget<'_>,
        timeout: Option<Duration>,
        build: impl FnOnce(&str) -> AgentRequest,
    ) -> Result<AgentReply, RelayError> {
        let handle = self.registry.select(target.owner_id, target.instance_id, target.policy)?;

        let request_id = new_request_id(target.owner_id);
        let message = build(&request_id);
        let text = serde_json::to_string(&message)
            .map_err(|e| RelayError::Protocol(format!("failed to encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                owner_id: target.owner_id.to_owned(),
                connection_id: handle.id(),
                tx,
                created_at: Instant::now(),
            },
        );
        let _guard = PendingGuard { broker: self, request_id: request_id.clone() };

        tracing::debug!(
            request_id = %request_id,
            owner_id = target.owner_id,
            instance_id = handle.instance_id(),
            "dispatching request"
        );
        // The enqueue shares the budget: a stalled writer with a full queue
        // still ends in a timeout.
        let budget = timeout.unwrap_or(self.default_timeout);
        let exchange = deliver(&handle, text, rx);
        let outcome = tokio::time::timeout(budget, exchange).await;
        match outcome {
            Ok(resolution) => resolution,
            Err(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    budget_ms = budget.as_millis() as u64,
                    "request timed out"
                );
                Err(RelayError::Timeout { request_id, after: budget })
            }
        }
    }

    /// Complete the pending request `request_id` on behalf of `owner_id`.
    ///
    /// Unknown, late, and duplicate ids are ignored, as are replies from an
    /// agent of a different owner. Returns whether a waiter was still
    /// registered under the id and received the resolution.
    pub fn resolve(&self, owner_id: &str, request_id: &str, resolution: Resolution) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let foreign = pending
                .get(request_id)
                .map(|p| p.owner_id.clone())
                .filter(|expected| expected != owner_id);
            if let Some(expected) = foreign {
                drop(pending);
                tracing::warn!(
                    request_id,
                    owner_id,
                    expected = %expected,
                    "dropping reply from another owner's agent"
                );
                return false;
            }
            pending.remove(request_id)
        };
        let Some(entry) = entry else {
            tracing::debug!(request_id, "dropping reply with no pending request");
            return false;
        };
        tracing::debug!(
            request_id,
            owner_id = %entry.owner_id,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            ok = resolution.is_ok(),
            "resolved request"
        );
        // The receiver may already be gone if the caller was cancelled.
        let _ = entry.tx.send(resolution);
        true
    }

    /// Deregister `handle` and fail the requests that can no longer be answered.
    ///
    /// When the owner has no connections left every one of its pending
    /// requests fails; otherwise only those routed through `handle`.
    pub fn disconnect(&self, handle: &ChannelHandle) {
        self.registry.disconnect(handle, |departure| self.fail_departed(departure));
    }

    fn fail_departed(&self, departure: &Departure) {
        let failed: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| {
                    p.owner_id == departure.owner_id
                        && (departure.owner_empty || p.connection_id == departure.connection_id)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        if !failed.is_empty() {
            tracing::info!(
                owner_id = %departure.owner_id,
                instance_id = %departure.instance_id,
                count = failed.len(),
                "failing pending requests after disconnect"
            );
        }
        for entry in failed {
            let _ = entry
                .tx
                .send(Err(RelayError::Disconnected { owner_id: departure.owner_id.clone() }));
        }
    }

    /// Fail every pending request. Used at shutdown.
    pub fn drain(&self) {
        let drained: Vec<PendingRequest> =
            self.pending.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            let owner_id = entry.owner_id.clone();
            let _ = entry.tx.send(Err(RelayError::Disconnected { owner_id }));
        }
    }
}

/// Queue `text` on the connection and wait for its resolution.
async fn deliver(
    handle: &ChannelHandle,
    text: String,
    rx: oneshot::Receiver<Resolution>,
) -> Resolution {
    handle.send(text).await?;
    match rx.await {
        Ok(resolution) => resolution,
        // Sender dropped without a value: the table was torn down.
        Err(_) => Err(RelayError::Disconnected { owner_id: handle.owner_id().to_owned() }),
    }
}

/// Removes the pending entry on every exit path of a dispatch.
struct PendingGuard<'a> {
    broker: &'a CorrelationBroker,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.broker.pending.lock().remove(&self.request_id);
    }
}

/// `{owner}_{uuid}`; only uniqueness matters.
pub fn new_request_id(owner_id: &str) -> String {
    format!("{owner_id}_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
