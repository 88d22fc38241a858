// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSON comment feed fetched page by page, either through an agent or directly.
//!
//! Expected page body:
//!
//! ```json
//! {
//!   "items": [{ "id": "c1", "parent_id": "c0", "...": "..." }],
//!   "threads": [{ "parent_id": "c0", "child_ids": ["c1"] }],
//!   "canonical_id": "post-42",
//!   "next_cursor": "abc",
//!   "has_more": true
//! }
//! ```
//!
//! An item's own `parent_id` is a permalink signal; `threads` entries are
//! canonical signals.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::paginate::{Page, PageFetcher, PageRequest};
use crate::protocol::proxy::ProxyClient;
use crate::protocol::{ProxyCall, ProxyResponse, ResponseType};
use crate::refresh::StaleSessionPolicy;
use crate::thread::{Identified, ThreadSignal};

/// Longest upstream body kept in an error.
const ERROR_BODY_LIMIT: usize = 512;

/// One feed item. Fields other than the ids are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Identified for Comment {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    items: Vec<Comment>,
    #[serde(default)]
    threads: Vec<CanonicalThread>,
    #[serde(default)]
    canonical_id: Option<String>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CanonicalThread {
    parent_id: String,
    #[serde(default)]
    child_ids: Vec<String>,
}

impl From<FeedPage> for Page<Comment, ThreadSignal> {
    fn from(page: FeedPage) -> Self {
        let mut signals: Vec<ThreadSignal> = page
            .items
            .iter()
            .filter_map(|c| {
                c.parent_id.as_ref().map(|parent_id| ThreadSignal::Permalink {
                    item_id: c.id.clone(),
                    parent_id: parent_id.clone(),
                })
            })
            .collect();
        signals.extend(page.threads.into_iter().map(|t| ThreadSignal::Canonical {
            parent_id: t.parent_id,
            child_ids: t.child_ids,
        }));
        Page {
            items: page.items,
            signals,
            canonical_id: page.canonical_id,
            next_cursor: page.next_cursor,
            exhausted: page.has_more == Some(false),
        }
    }
}

/// How pages reach the relay.
#[derive(Clone)]
pub enum FeedTransport {
    /// Through the owner's browser agent.
    Proxied { client: ProxyClient, owner_id: String, instance_id: Option<String> },
    /// Straight from the relay, for feeds that need no browser session.
    Direct { http: reqwest::Client },
}

/// Paged JSON feed addressed by a URL template.
///
/// The template may use `{id}`, `{offset}`, `{count}`, `{cursor}` and
/// `{page}`; `{id}` and `{cursor}` are percent-encoded.
#[derive(Clone)]
pub struct JsonFeed {
    url_template: String,
    headers: BTreeMap<String, String>,
    transport: FeedTransport,
    stale: StaleSessionPolicy,
    timeout: Option<Duration>,
}

impl JsonFeed {
    pub fn new(url_template: impl Into<String>, transport: FeedTransport) -> Self {
        Self {
            url_template: url_template.into(),
            headers: BTreeMap::new(),
            transport,
            stale: StaleSessionPolicy::default(),
            timeout: None,
        }
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn stale_policy(mut self, stale: StaleSessionPolicy) -> Self {
        self.stale = stale;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn render_url(&self, request: &PageRequest) -> String {
        self.url_template
            .replace("{id}", &urlencoding::encode(&request.identifier))
            .replace("{offset}", &request.offset.to_string())
            .replace("{count}", &request.count.to_string())
            .replace("{page}", &request.page_index.to_string())
            .replace("{cursor}", &urlencoding::encode(request.cursor.as_deref().unwrap_or("")))
    }

    async fn get(&self, url: String) -> Result<ProxyResponse, FetchError> {
        match &self.transport {
            FeedTransport::Proxied { client, owner_id, instance_id } => {
                let call = ProxyCall {
                    url,
                    method: "GET".to_owned(),
                    headers: self.headers.clone(),
                    body: None,
                    response_type: ResponseType::Json,
                    include_credentials: true,
                    instance_id: instance_id.clone(),
                };
                Ok(client.proxy_call(owner_id, &call, self.timeout).await?)
            }
            FeedTransport::Direct { http } => self.get_direct(http, &url).await,
        }
    }

    async fn get_direct(
        &self,
        http: &reqwest::Client,
        url: &str,
    ) -> Result<ProxyResponse, FetchError> {
        let mut req = http.get(url);
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let resp = req.send().await.map_err(|e| FetchError::Direct(e.to_string()))?;

        let status_code = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
            .collect();
        let text = resp.text().await.map_err(|e| FetchError::Direct(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(ProxyResponse { status_code, headers, body })
    }
}

fn error_body(response: &ProxyResponse) -> String {
    let text = match &response.body {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match text.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => text[..cut].to_owned(),
        None => text,
    }
}

#[async_trait::async_trait]
impl PageFetcher for JsonFeed {
    type Item = Comment;
    type Signal = ThreadSignal;

    async fn fetch(&self, request: &PageRequest) -> Result<Page<Comment, ThreadSignal>, FetchError> {
        let url = self.render_url(request);
        tracing::debug!(url = %url, page = request.page_index, "fetching feed page");
        let response = self.get(url).await?;

        self.stale.check(&response)?;
        if !response.is_success() {
            return Err(FetchError::Upstream {
                status: response.status_code,
                body: error_body(&response),
            });
        }

        let body = response
            .json_body()
            .ok_or_else(|| FetchError::Malformed("page body is not JSON".to_owned()))?;
        let page: FeedPage =
            serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        Ok(page.into())
    }
}

#[cfg(test)]
#[path = "feed_tests.rs"]
mod tests;
