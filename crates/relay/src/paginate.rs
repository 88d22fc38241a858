// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Page-by-page accumulation of a feed.
//!
//! The orchestrator walks `Init -> Fetching -> Accumulating -> (Fetching ...)*`
//! and ends in `Done` or `Aborted`. Pages are fetched strictly one after
//! another with a randomized pause in between.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::error::FetchError;
use crate::refresh::{retry_once_after_refresh, RefreshContext};

/// Bounds of the pause between two page fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self::from_millis(1500, 4000)
    }
}

impl DelayRange {
    pub fn from_millis(min: u64, max: u64) -> Self {
        Self { min: Duration::from_millis(min), max: Duration::from_millis(max) }
    }

    pub fn zero() -> Self {
        Self { min: Duration::ZERO, max: Duration::ZERO }
    }

    /// Uniform pick in `[min, max]`, millisecond resolution.
    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// How many items to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Count(usize),
    All,
}

impl Target {
    fn remaining(&self, have: usize) -> Option<usize> {
        match self {
            Self::Count(n) => Some(n.saturating_sub(have)),
            Self::All => None,
        }
    }
}

/// Parameters of one page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Feed identifier, possibly replaced by the first page's canonical id.
    pub identifier: String,
    /// Items received so far.
    pub offset: usize,
    /// Continuation token from the previous page, if the feed uses one.
    pub cursor: Option<String>,
    /// Items wanted from this page.
    pub count: usize,
    /// Zero-based page number.
    pub page_index: usize,
}

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T, S> {
    pub items: Vec<T>,
    /// Side-channel data carried next to the items.
    pub signals: Vec<S>,
    /// Authoritative identifier reported by the feed.
    pub canonical_id: Option<String>,
    pub next_cursor: Option<String>,
    /// The feed says there is nothing after this page.
    pub exhausted: bool,
}

impl<T, S> Page<T, S> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, signals: Vec::new(), canonical_id: None, next_cursor: None, exhausted: false }
    }
}

/// Source of pages.
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    type Item: Send;
    type Signal: Send;

    async fn fetch(
        &self,
        request: &PageRequest,
    ) -> Result<Page<Self::Item, Self::Signal>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum StopReason {
    TargetReached,
    EmptyPage,
    Exhausted,
    Failed(String),
}

/// Result of an accumulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulated<T, S> {
    /// Items in page-arrival order.
    pub items: Vec<T>,
    pub signals: Vec<S>,
    /// Identifier in effect after the first page.
    pub identifier: String,
    pub pages: usize,
    pub stop: StopReason,
    /// A page failed after some items were collected.
    pub incomplete: bool,
}

struct PaginationState<T, S> {
    identifier: String,
    identifier_resolved: bool,
    offset: usize,
    cursor: Option<String>,
    items: Vec<T>,
    signals: Vec<S>,
    pages: usize,
}

impl<T, S> PaginationState<T, S> {
    fn finish(self, stop: StopReason, incomplete: bool) -> Accumulated<T, S> {
        Accumulated {
            items: self.items,
            signals: self.signals,
            identifier: self.identifier,
            pages: self.pages,
            stop,
            incomplete,
        }
    }
}

enum Phase<T, S> {
    Init,
    Fetching,
    Accumulating(Page<T, S>),
    Done(StopReason),
    Aborted(FetchError),
}

/// Drives a [`PageFetcher`] until a stop condition holds.
#[derive(Debug, Clone)]
pub struct PaginationOrchestrator {
    batch_size: usize,
    delay: DelayRange,
}

impl PaginationOrchestrator {
    pub fn new(batch_size: usize, delay: DelayRange) -> Self {
        Self { batch_size: batch_size.max(1), delay }
    }

    /// Collect items from `fetcher` starting at `seed_identifier`.
    ///
    /// Stops when the target is reached, a page comes back empty, the feed
    /// reports exhaustion, or a page fails. Stale-session failures go through
    /// one refresh and retry when `refresh` is given. A failure after at least
    /// one item returns the partial result flagged `incomplete`; a failure
    /// before any item is returned as the error.
    pub async fn accumulate<F>(
        &self,
        fetcher: &F,
        seed_identifier: &str,
        target: Target,
        refresh: Option<RefreshContext<'_>>,
    ) -> Result<Accumulated<F::Item, F::Signal>, FetchError>
    where
        F: PageFetcher + ?Sized,
    {
        let mut state = PaginationState {
            identifier: seed_identifier.to_owned(),
            identifier_resolved: false,
            offset: 0,
            cursor: None,
            items: Vec::new(),
            signals: Vec::new(),
            pages: 0,
        };
        let mut phase = Phase::Init;

        loop {
            phase = match phase {
                Phase::Init => {
                    tracing::debug!(
                        identifier = seed_identifier,
                        ?target,
                        batch_size = self.batch_size,
                        "starting pagination"
                    );
                    Phase::Fetching
                }

                Phase::Fetching => {
                    let count = match target.remaining(state.items.len()) {
                        Some(0) => {
                            phase = Phase::Done(StopReason::TargetReached);
                            continue;
                        }
                        Some(n) => n.min(self.batch_size),
                        None => self.batch_size,
                    };
                    if state.pages > 0 {
                        tokio::time::sleep(self.delay.sample()).await;
                    }

                    let request = PageRequest {
                        identifier: state.identifier.clone(),
                        offset: state.offset,
                        cursor: state.cursor.clone(),
                        count,
                        page_index: state.pages,
                    };
                    let request = &request;
                    match retry_once_after_refresh(refresh, move || fetcher.fetch(request)).await {
                        Ok(page) => Phase::Accumulating(page),
                        Err(e) => Phase::Aborted(e),
                    }
                }

                Phase::Accumulating(page) => {
                    state.pages += 1;
                    if !state.identifier_resolved {
                        state.identifier_resolved = true;
                        if let Some(id) = page.canonical_id.filter(|id| *id != state.identifier) {
                            tracing::debug!(from = %state.identifier, to = %id, "resolved identifier");
                            state.identifier = id;
                        }
                    }

                    tracing::debug!(
                        page = state.pages,
                        received = page.items.len(),
                        total = state.items.len() + page.items.len(),
                        "page fetched"
                    );
                    if page.items.is_empty() {
                        Phase::Done(StopReason::EmptyPage)
                    } else {
                        state.offset += page.items.len();
                        state.cursor = page.next_cursor;
                        state.items.extend(page.items);
                        state.signals.extend(page.signals);
                        if let Target::Count(n) = target {
                            state.items.truncate(n);
                        }

                        if target.remaining(state.items.len()) == Some(0) {
                            Phase::Done(StopReason::TargetReached)
                        } else if page.exhausted {
                            Phase::Done(StopReason::Exhausted)
                        } else {
                            Phase::Fetching
                        }
                    }
                }

                Phase::Done(stop) => {
                    tracing::info!(
                        identifier = %state.identifier,
                        items = state.items.len(),
                        pages = state.pages,
                        ?stop,
                        "pagination finished"
                    );
                    return Ok(state.finish(stop, false));
                }

                Phase::Aborted(err) => {
                    if state.items.is_empty() {
                        return Err(err);
                    }
                    tracing::warn!(
                        identifier = %state.identifier,
                        items = state.items.len(),
                        pages = state.pages,
                        err = %err,
                        "page failed, returning partial result"
                    );
                    return Ok(state.finish(StopReason::Failed(err.to_string()), true));
                }
            };
        }
    }
}

#[cfg(test)]
#[path = "paginate_tests.rs"]
mod tests;
