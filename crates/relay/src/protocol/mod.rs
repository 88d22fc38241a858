// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire envelopes exchanged with browser agents over the duplex channel.
//!
//! Every request the relay sends carries a `request_id`; the agent echoes it
//! on the matching reply. Replies may arrive in any order.

pub mod proxy;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::credential::Credentials;
use crate::error::RelayError;

/// Messages sent from the relay to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Execute an HTTP call from the browser context.
    ProxyRequest(ProxyRequestEnvelope),
    /// Report the browser's current credential material.
    RefreshRequest { request_id: String },
    /// Keepalive answer.
    Pong,
}

impl AgentRequest {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::ProxyRequest(env) => Some(&env.request_id),
            Self::RefreshRequest { request_id } => Some(request_id),
            Self::Pong => None,
        }
    }
}

/// Messages sent from an agent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
    ProxyResponse(ProxyResponseEnvelope),
    RefreshResponse(RefreshResponseEnvelope),
    /// Keepalive sent by the agent.
    Ping,
    /// Sent once after connecting.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
}

/// How the agent should hand back the upstream response body.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Parse the body as JSON.
    #[default]
    Json,
    /// Return the body as a string.
    Text,
    /// Return the body base64-encoded.
    Base64,
}

/// Success or failure as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequestEnvelope {
    pub request_id: String,
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default)]
    pub include_credentials: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponseEnvelope {
    pub request_id: String,
    pub status: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshResponseEnvelope {
    pub request_id: String,
    pub status: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// An HTTP call to execute from the browser.
///
/// The agent may drop or override some of `headers` (for instance an explicit
/// cookie header, since it attaches the browser's own).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCall {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default = "default_true")]
    pub include_credentials: bool,
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_method() -> String {
    "GET".to_owned()
}

fn default_true() -> bool {
    true
}

impl ProxyCall {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            response_type: ResponseType::Json,
            include_credentials: true,
            instance_id: None,
        }
    }
}

/// Upstream response as observed by the agent.
///
/// 4xx/5xx responses are ordinary values of this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl ProxyResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Body as JSON, parsing it when the agent returned text.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        match &self.body {
            serde_json::Value::String(text) => serde_json::from_str(text).ok(),
            serde_json::Value::Null => None,
            other => Some(other.clone()),
        }
    }
}

/// Build the outbound envelope for a proxied call.
pub fn encode(request_id: &str, call: &ProxyCall) -> AgentRequest {
    AgentRequest::ProxyRequest(ProxyRequestEnvelope {
        request_id: request_id.to_owned(),
        url: call.url.clone(),
        method: call.method.to_uppercase(),
        headers: call.headers.clone(),
        body: call.body.clone(),
        response_type: call.response_type,
        include_credentials: call.include_credentials,
        instance_id: call.instance_id.clone(),
    })
}

/// Extract the upstream response from a resolved reply.
pub fn decode(reply: AgentReply) -> Result<ProxyResponse, RelayError> {
    match reply {
        AgentReply::ProxyResponse(env) => match env.status {
            Outcome::Error => Err(RelayError::RemoteReported(
                env.error_message.unwrap_or_else(|| "unspecified agent error".to_owned()),
            )),
            Outcome::Success => {
                let status_code = env.status_code.ok_or_else(|| {
                    RelayError::Protocol(format!(
                        "proxy_response {} is missing status_code",
                        env.request_id
                    ))
                })?;
                Ok(ProxyResponse {
                    status_code,
                    headers: env.headers.unwrap_or_default(),
                    body: env.body.unwrap_or(serde_json::Value::Null),
                })
            }
        },
        other => Err(RelayError::Protocol(format!("expected proxy_response, got {}", kind(&other)))),
    }
}

/// Split an inbound reply into the correlation id it answers and its outcome.
///
/// Returns `None` for messages that are not answers (ping, hello).
pub fn into_resolution(reply: AgentReply) -> Option<(String, Result<AgentReply, RelayError>)> {
    let (request_id, failure) = match &reply {
        AgentReply::ProxyResponse(env) => {
            (env.request_id.clone(), failure_of(env.status, &env.error_message))
        }
        AgentReply::RefreshResponse(env) => {
            (env.request_id.clone(), failure_of(env.status, &env.error_message))
        }
        AgentReply::Ping | AgentReply::Hello { .. } => return None,
    };
    match failure {
        Some(err) => Some((request_id, Err(err))),
        None => Some((request_id, Ok(reply))),
    }
}

fn failure_of(status: Outcome, message: &Option<String>) -> Option<RelayError> {
    match status {
        Outcome::Success => None,
        Outcome::Error => Some(RelayError::RemoteReported(
            message.clone().unwrap_or_else(|| "unspecified agent error".to_owned()),
        )),
    }
}

pub(crate) fn kind(reply: &AgentReply) -> &'static str {
    match reply {
        AgentReply::ProxyResponse(_) => "proxy_response",
        AgentReply::RefreshResponse(_) => "refresh_response",
        AgentReply::Ping => "ping",
        AgentReply::Hello { .. } => "hello",
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
