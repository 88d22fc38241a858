// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Transport-level failures of a dispatched request.
///
/// Upstream HTTP errors are not represented here: a proxied 4xx/5xx is
/// ordinary data in a [`crate::protocol::ProxyResponse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// No eligible live connection for the target.
    #[error("no live agent connection for owner {owner_id}{}", fmt_instance(.instance_id))]
    ChannelUnavailable { owner_id: String, instance_id: Option<String> },

    /// No matching response arrived within the budget.
    #[error("agent did not answer request {request_id} within {}ms", .after.as_millis())]
    Timeout { request_id: String, after: Duration },

    /// The agent explicitly reported failure.
    #[error("agent reported an error: {0}")]
    RemoteReported(String),

    /// The connection carrying the request went away before an answer.
    #[error("agent for owner {owner_id} disconnected before answering")]
    Disconnected { owner_id: String },

    /// The agent answered with a message that does not fit the request.
    #[error("unexpected agent reply: {0}")]
    Protocol(String),

    /// Refreshed credentials could not be written to the credential store.
    #[error("failed to persist credentials: {0}")]
    CredentialStore(String),
}

fn fmt_instance(instance_id: &Option<String>) -> String {
    match instance_id {
        Some(id) => format!(" (instance {id})"),
        None => String::new(),
    }
}

impl RelayError {
    /// Outward error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ChannelUnavailable { .. } | Self::Disconnected { .. } => ErrorCode::NotConnected,
            Self::Timeout { .. } => ErrorCode::TimedOut,
            Self::RemoteReported(_) | Self::Protocol(_) => ErrorCode::RemoteError,
            Self::CredentialStore(_) => ErrorCode::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failures of a single page fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The upstream rejected the browser's session; a refresh may help.
    #[error("upstream session is stale (status {status}{})", fmt_code(.code))]
    StaleSession { status: u16, code: Option<String> },

    /// Any other non-2xx upstream answer.
    #[error("upstream returned status {status}")]
    Upstream { status: u16, body: String },

    #[error(transparent)]
    Relay(#[from] RelayError),

    /// A direct (non-proxied) request failed before producing a response.
    #[error("direct fetch failed: {0}")]
    Direct(String),

    /// The page body could not be interpreted.
    #[error("malformed page: {0}")]
    Malformed(String),
}

fn fmt_code(code: &Option<String>) -> String {
    match code {
        Some(code) => format!(", code {code}"),
        None => String::new(),
    }
}

impl FetchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Relay(e) => e.code(),
            Self::StaleSession { .. } | Self::Upstream { .. } | Self::Direct(_) => {
                ErrorCode::UpstreamError
            }
            Self::Malformed(_) => ErrorCode::RemoteError,
        }
    }

    pub fn is_stale_session(&self) -> bool {
        matches!(self, Self::StaleSession { .. })
    }

    /// Upstream status carried by the failure, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::StaleSession { status, .. } | Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        let (status, Json(mut body)) = self.code().to_http_response(self.to_string());
        body.error.upstream_status = self.upstream_status();
        (status, Json(body))
    }
}

/// Error codes for the relay API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthorized,
    BadRequest,
    NotConnected,
    TimedOut,
    RemoteError,
    UpstreamError,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::BadRequest => 400,
            Self::NotConnected => 503,
            Self::TimedOut => 504,
            Self::RemoteError => 502,
            Self::UpstreamError => 502,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotConnected => "NOT_CONNECTED",
            Self::TimedOut => "TIMED_OUT",
            Self::RemoteError => "REMOTE_ERROR",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into(), upstream_status: None }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    /// Upstream HTTP status, when the failure was an upstream response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
