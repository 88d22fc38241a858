// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the relay.

pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::RelayState;

/// Build the axum `Router` with all relay routes.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Per-owner operations
        .route("/api/v1/owners/{owner}/instances", get(http::instances))
        .route("/api/v1/owners/{owner}/proxy", post(http::proxy))
        .route("/api/v1/owners/{owner}/refresh", post(http::refresh))
        .route("/api/v1/owners/{owner}/threads", post(http::threads))
        // Agent duplex channel (query-token auth)
        .route("/ws/agent", get(ws::agent_ws_handler))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
