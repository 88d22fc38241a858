// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broker::CorrelationBroker;
use crate::channel::{ChannelRegistry, InstancePolicy};
use crate::config::RelayConfig;
use crate::credential::CredentialStore;
use crate::paginate::PaginationOrchestrator;
use crate::protocol::proxy::ProxyClient;
use crate::refresh::{SessionRefreshCoordinator, StaleSessionPolicy};

/// Shared relay state, built once at startup and handed to every handler.
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: Arc<ChannelRegistry>,
    pub broker: Arc<CorrelationBroker>,
    pub proxy: ProxyClient,
    pub refresher: SessionRefreshCoordinator,
    pub credentials: Arc<dyn CredentialStore>,
    pub stale: StaleSessionPolicy,
    /// Client for feeds fetched without an agent.
    pub http: reqwest::Client,
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        credentials: Arc<dyn CredentialStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let policy = config.instance_policy();
        let registry = Arc::new(ChannelRegistry::new());
        let broker =
            Arc::new(CorrelationBroker::new(Arc::clone(&registry), config.dispatch_timeout()));
        let proxy = ProxyClient::new(Arc::clone(&broker), policy);
        let refresher = SessionRefreshCoordinator::new(
            Arc::clone(&broker),
            Arc::clone(&credentials),
            policy,
            config.refresh_timeout(),
        );
        let http = reqwest::Client::builder()
            .timeout(config.dispatch_timeout())
            .build()
            .unwrap_or_default();
        let stale = config.stale_policy();
        Self {
            config,
            registry,
            broker,
            proxy,
            refresher,
            credentials,
            stale,
            http,
            shutdown,
        }
    }

    pub fn instance_policy(&self) -> InstancePolicy {
        self.config.instance_policy()
    }

    /// Orchestrator using the configured batch size and page delay.
    pub fn paginator(&self, batch_size: Option<usize>) -> PaginationOrchestrator {
        PaginationOrchestrator::new(
            batch_size.unwrap_or(self.config.batch_size),
            self.config.page_delay(),
        )
    }
}
