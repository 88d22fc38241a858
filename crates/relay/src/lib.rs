// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tether: runs HTTP calls inside users' browsers on behalf of a backend.
//!
//! Browser agents hold a WebSocket to the relay. Backend handlers dispatch
//! requests through the [`broker::CorrelationBroker`], which suspends the
//! caller until the agent's reply with the same request id comes back.

pub mod broker;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod feed;
pub mod paginate;
pub mod protocol;
pub mod refresh;
pub mod state;
pub mod test_support;
pub mod thread;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RelayConfig;
use crate::credential::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
use crate::state::RelayState;
use crate::transport::build_router;

/// Run the relay until SIGINT/SIGTERM.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    // reqwest is built without a default TLS provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let state_dir = config.state_dir();
    let credentials: Arc<dyn CredentialStore> = match FileCredentialStore::open(&state_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                dir = %state_dir.display(),
                err = %e,
                "credential file unusable, keeping credentials in memory"
            );
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let state = Arc::new(RelayState::new(config, credentials, shutdown.clone()));
    spawn_signal_handler(shutdown.clone());

    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    info!("tether listening on {addr}");
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    let pending = state.broker.pending_count();
    if pending > 0 {
        info!(pending, "failing in-flight requests on shutdown");
    }
    state.broker.drain();
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();
    });
}
