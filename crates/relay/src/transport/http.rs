// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the relay API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::channel::InstanceInfo;
use crate::error::{ErrorCode, RelayError};
use crate::feed::{Comment, FeedTransport, JsonFeed};
use crate::paginate::{StopReason, Target};
use crate::protocol::{ProxyCall, ProxyResponse};
use crate::refresh::{RefreshContext, SessionRefresher};
use crate::state::RelayState;
use crate::thread::{reconstruct, roots, RelationshipMap};

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub owner_count: usize,
    pub connection_count: usize,
    pub pending_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub owner_id: String,
    pub instances: Vec<InstanceInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    #[serde(flatten)]
    pub call: ProxyCall,
    /// Overrides the default dispatch timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub owner_id: String,
    pub refreshed: bool,
    /// Names of the refreshed credential fields; values are never echoed.
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ThreadsRequest {
    /// Page URL with `{id}`, `{offset}`, `{count}`, `{cursor}`, `{page}` placeholders.
    pub url_template: String,
    pub identifier: String,
    /// Stop after this many items; omitted means the whole feed.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Fetch from the relay itself instead of through the agent.
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ThreadsResponse {
    pub identifier: String,
    pub items: Vec<Comment>,
    pub relationships: RelationshipMap,
    pub roots: Vec<String>,
    pub pages: usize,
    pub stop: StopReason,
    pub incomplete: bool,
}

fn relay_error(err: &RelayError) -> Response {
    err.code().to_http_response(err.to_string()).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    ErrorCode::BadRequest.to_http_response(message).into_response()
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<RelayState>>) -> impl IntoResponse {
    let (owner_count, connection_count) = s.registry.counts();
    Json(HealthResponse {
        status: "running".to_owned(),
        owner_count,
        connection_count,
        pending_count: s.broker.pending_count(),
    })
}

/// `GET /api/v1/owners/{owner}/instances`
pub async fn instances(
    State(s): State<Arc<RelayState>>,
    Path(owner): Path<String>,
) -> impl IntoResponse {
    let instances = s.registry.instances(&owner);
    Json(InstancesResponse { owner_id: owner, instances })
}

/// `POST /api/v1/owners/{owner}/proxy`: run one HTTP call in the owner's browser.
///
/// Upstream 4xx/5xx come back as a 200 carrying the upstream status.
pub async fn proxy(
    State(s): State<Arc<RelayState>>,
    Path(owner): Path<String>,
    Json(req): Json<ProxyRequest>,
) -> Response {
    if req.call.url.is_empty() {
        return bad_request("url is required");
    }
    let timeout = req.timeout_ms.map(Duration::from_millis);
    match s.proxy.proxy_call(&owner, &req.call, timeout).await {
        Ok(response) => Json::<ProxyResponse>(response).into_response(),
        Err(e) => {
            tracing::debug!(owner_id = %owner, err = %e, "proxy call failed");
            relay_error(&e)
        }
    }
}

/// `POST /api/v1/owners/{owner}/refresh`: pull fresh credentials from the agent.
pub async fn refresh(
    State(s): State<Arc<RelayState>>,
    Path(owner): Path<String>,
    Json(req): Json<RefreshRequest>,
) -> Response {
    match s.refresher.refresh(&owner, req.instance_id.as_deref()).await {
        Ok(credentials) => Json(RefreshResponse {
            owner_id: owner,
            refreshed: true,
            keys: credentials.into_keys().collect(),
        })
        .into_response(),
        Err(e) => relay_error(&e),
    }
}

/// `POST /api/v1/owners/{owner}/threads`: page through a comment feed and
/// rebuild its reply tree.
pub async fn threads(
    State(s): State<Arc<RelayState>>,
    Path(owner): Path<String>,
    Json(req): Json<ThreadsRequest>,
) -> Response {
    if !(req.url_template.starts_with("http://") || req.url_template.starts_with("https://")) {
        return bad_request("url_template must be an http(s) URL");
    }
    if req.identifier.is_empty() {
        return bad_request("identifier is required");
    }
    if req.batch_size == Some(0) {
        return bad_request("batch_size must be at least 1");
    }

    let transport = if req.direct {
        FeedTransport::Direct { http: s.http.clone() }
    } else {
        FeedTransport::Proxied {
            client: s.proxy.clone(),
            owner_id: owner.clone(),
            instance_id: req.instance_id.clone(),
        }
    };
    let feed = JsonFeed::new(req.url_template, transport)
        .headers(req.headers)
        .stale_policy(s.stale.clone())
        .timeout(req.timeout_ms.map(Duration::from_millis));
    let target = req.limit.map_or(Target::All, Target::Count);
    // A direct fetch has no browser session to refresh.
    let refresh = (!req.direct).then(|| RefreshContext {
        refresher: &s.refresher,
        owner_id: &owner,
        instance_id: req.instance_id.as_deref(),
    });

    let accumulated = match s
        .paginator(req.batch_size)
        .accumulate(&feed, &req.identifier, target, refresh)
        .await
    {
        Ok(accumulated) => accumulated,
        Err(e) => {
            tracing::warn!(
                owner_id = %owner,
                identifier = %req.identifier,
                err = %e,
                "thread fetch failed"
            );
            return e.to_http_response().into_response();
        }
    };

    let relationships = reconstruct(&accumulated.items, &accumulated.signals);
    let roots = roots(&relationships).into_iter().map(str::to_owned).collect();
    Json(ThreadsResponse {
        identifier: accumulated.identifier,
        items: accumulated.items,
        relationships,
        roots,
        pages: accumulated.pages,
        stop: accumulated.stop,
        incomplete: accumulated.incomplete,
    })
    .into_response()
}
