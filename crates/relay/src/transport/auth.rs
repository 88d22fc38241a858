// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared-secret authentication for the relay API and the agent socket.
//!
//! Backends present the secret as a bearer token; browser agents cannot set
//! headers on a WebSocket upgrade and pass it as a `token` query parameter
//! instead. With no secret configured every request is allowed.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ErrorCode;
use crate::state::RelayState;

/// Paths reachable without the bearer token.
fn is_public(path: &str) -> bool {
    // The agent socket authenticates in its own handler.
    path == "/api/v1/health" || path.starts_with("/ws/")
}

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented.bytes().zip(expected.bytes()).fold(0u8, |diff, (a, b)| diff | (a ^ b)) == 0
}

fn check_token(presented: Option<&str>, expected: Option<&str>) -> Result<(), ErrorCode> {
    match (expected, presented) {
        (None, _) => Ok(()),
        (Some(expected), Some(presented)) if secrets_match(presented, expected) => Ok(()),
        (Some(_), _) => Err(ErrorCode::Unauthorized),
    }
}

/// The token of an `Authorization: Bearer <token>` header; the scheme is
/// case-insensitive.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token)
}

/// Validate the bearer token of an API request.
pub fn validate_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ErrorCode> {
    check_token(bearer_token(headers), expected)
}

/// Validate the `token` query parameter of an agent WebSocket upgrade.
pub fn validate_ws_token(token: Option<&str>, expected: Option<&str>) -> Result<(), ErrorCode> {
    check_token(token, expected)
}

/// Middleware rejecting API calls without the configured bearer token.
pub async fn auth_layer(
    State(state): State<Arc<RelayState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !is_public(req.uri().path()) {
        if let Err(code) = validate_bearer(req.headers(), state.config.auth_token.as_deref()) {
            tracing::debug!(path = req.uri().path(), "rejecting unauthenticated request");
            return code.to_http_response("unauthorized").into_response();
        }
    }
    next.run(req).await
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
