// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote HTTP execution through a connected agent.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::{CorrelationBroker, DispatchTarget};
use crate::channel::InstancePolicy;
use crate::error::RelayError;

use super::{decode, encode, ProxyCall, ProxyResponse};

/// Executes HTTP calls from an owner's browser.
#[derive(Clone)]
pub struct ProxyClient {
    broker: Arc<CorrelationBroker>,
    policy: InstancePolicy,
}

impl ProxyClient {
    pub fn new(broker: Arc<CorrelationBroker>, policy: InstancePolicy) -> Self {
        Self { broker, policy }
    }

    /// Run `call` in the owner's browser and return what the upstream answered.
    ///
    /// Any upstream status, including 4xx/5xx, is returned as data. Only a
    /// missing connection, a timeout, a disconnect, or an agent-side failure
    /// is an error.
    pub async fn proxy_call(
        &self,
        owner_id: &str,
        call: &ProxyCall,
        timeout: Option<Duration>,
    ) -> Result<ProxyResponse, RelayError> {
        let target = DispatchTarget::owner(owner_id)
            .instance(call.instance_id.as_deref())
            .policy(self.policy);
        let reply = self.broker.dispatch(target, timeout, |id| encode(id, call)).await?;
        let response = decode(reply)?;
        tracing::debug!(
            owner_id,
            url = %call.url,
            status_code = response.status_code,
            "proxied call completed"
        );
        Ok(response)
    }
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
