// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registry of live agent connections keyed by (owner, instance).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Whether a request pinned to an instance may land on a sibling instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstancePolicy {
    /// A named instance must be connected, otherwise the send fails.
    #[default]
    Exact,
    /// Fall back to any connection of the owner when the named instance is gone.
    AllowFallback,
}

/// Sending half of one agent connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: u64,
    owner_id: String,
    instance_id: String,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl ChannelHandle {
    /// Unique per socket; a reconnect of the same instance gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Fires when the registry drops this connection in favour of a newer one.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Queue a text frame for the socket writer.
    pub async fn send(&self, text: String) -> Result<(), RelayError> {
        self.tx.send(text).await.map_err(|_| RelayError::ChannelUnavailable {
            owner_id: self.owner_id.clone(),
            instance_id: Some(self.instance_id.clone()),
        })
    }
}

/// Outcome of looking up a connection.
#[derive(Debug, Clone)]
pub enum Route {
    /// The requested instance is connected.
    Exact(ChannelHandle),
    /// No instance was requested, or it is gone; this is another connection of the owner.
    Fallback(ChannelHandle),
    NoConnection,
}

/// Passed to the disconnect cleanup callback.
#[derive(Debug, Clone)]
pub struct Departure {
    pub owner_id: String,
    pub instance_id: String,
    pub connection_id: u64,
    /// True when the owner has no connections left.
    pub owner_empty: bool,
}

/// Connected instance as reported by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub connection_id: u64,
    pub connected_secs: u64,
}

/// Live duplex connections, possibly several per owner.
#[derive(Default)]
pub struct ChannelRegistry {
    /// owner -> instance -> handle, in connection order.
    owners: RwLock<HashMap<String, IndexMap<String, ChannelHandle>>>,
    next_id: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Instances of the same owner accumulate; a second
    /// connection for the same instance replaces (and cancels) the first.
    pub fn connect(
        &self,
        owner_id: &str,
        instance_id: &str,
        tx: mpsc::Sender<String>,
    ) -> ChannelHandle {
        let handle = ChannelHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            owner_id: owner_id.to_owned(),
            instance_id: instance_id.to_owned(),
            tx,
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
        };

        let replaced = {
            let mut owners = self.owners.write();
            let instances = owners.entry(owner_id.to_owned()).or_default();
            // Re-insert at the end so fallback prefers the freshest connection.
            let replaced = instances.shift_remove(instance_id);
            instances.insert(instance_id.to_owned(), handle.clone());
            replaced
        };

        if let Some(old) = replaced {
            tracing::info!(
                owner_id,
                instance_id,
                old_connection = old.id,
                new_connection = handle.id,
                "instance reconnected, replacing previous connection"
            );
            old.cancel.cancel();
        } else {
            tracing::info!(owner_id, instance_id, connection = handle.id, "agent connected");
        }
        handle
    }

    pub fn is_instance_connected(&self, instance_id: &str) -> bool {
        self.owners.read().values().any(|instances| instances.contains_key(instance_id))
    }

    /// Look up a connection without applying any policy.
    pub fn route(&self, owner_id: &str, instance_id: Option<&str>) -> Route {
        let owners = self.owners.read();
        let Some(instances) = owners.get(owner_id) else {
            return Route::NoConnection;
        };
        if let Some(handle) = instance_id.and_then(|id| instances.get(id)) {
            return Route::Exact(handle.clone());
        }
        match instances.last() {
            Some((_, handle)) => Route::Fallback(handle.clone()),
            None => Route::NoConnection,
        }
    }

    /// Pick the connection a request should use under `policy`.
    ///
    /// Omitting `instance_id` always accepts any connection of the owner.
    pub fn select(
        &self,
        owner_id: &str,
        instance_id: Option<&str>,
        policy: InstancePolicy,
    ) -> Result<ChannelHandle, RelayError> {
        let unavailable = || RelayError::ChannelUnavailable {
            owner_id: owner_id.to_owned(),
            instance_id: instance_id.map(str::to_owned),
        };
        match self.route(owner_id, instance_id) {
            Route::Exact(handle) => Ok(handle),
            Route::Fallback(handle) => match (instance_id, policy) {
                (None, _) => Ok(handle),
                (Some(requested), InstancePolicy::AllowFallback) => {
                    tracing::debug!(
                        owner_id,
                        requested,
                        using = %handle.instance_id,
                        "requested instance not connected, falling back"
                    );
                    Ok(handle)
                }
                (Some(_), InstancePolicy::Exact) => Err(unavailable()),
            },
            Route::NoConnection => Err(unavailable()),
        }
    }

    /// Send a frame to the selected connection and return the handle used.
    pub async fn send(
        &self,
        owner_id: &str,
        message: String,
        instance_id: Option<&str>,
        policy: InstancePolicy,
    ) -> Result<ChannelHandle, RelayError> {
        let handle = self.select(owner_id, instance_id, policy)?;
        handle.send(message).await?;
        Ok(handle)
    }

    /// Deregister `handle` and run `cleanup` once it is gone.
    ///
    /// A handle that was already replaced by a reconnect leaves the newer
    /// connection untouched; `cleanup` still runs for the departed socket.
    pub fn disconnect(&self, handle: &ChannelHandle, cleanup: impl FnOnce(&Departure)) {
        let owner_empty = {
            let mut owners = self.owners.write();
            let Some(instances) = owners.get_mut(&handle.owner_id) else {
                drop(owners);
                cleanup(&departure(handle, true));
                return;
            };
            if instances.get(&handle.instance_id).is_some_and(|current| current.id == handle.id) {
                instances.shift_remove(&handle.instance_id);
            }
            let empty = instances.is_empty();
            if empty {
                owners.remove(&handle.owner_id);
            }
            empty
        };

        tracing::info!(
            owner_id = %handle.owner_id,
            instance_id = %handle.instance_id,
            connection = handle.id,
            owner_empty,
            "agent disconnected"
        );
        cleanup(&departure(handle, owner_empty));
    }

    /// Connected instances of one owner, oldest first.
    pub fn instances(&self, owner_id: &str) -> Vec<InstanceInfo> {
        let owners = self.owners.read();
        owners
            .get(owner_id)
            .map(|instances| {
                instances
                    .values()
                    .map(|h| InstanceInfo {
                        instance_id: h.instance_id.clone(),
                        connection_id: h.id,
                        connected_secs: h.connected_at.elapsed().as_secs(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// (owners, connections) currently registered.
    pub fn counts(&self) -> (usize, usize) {
        let owners = self.owners.read();
        (owners.len(), owners.values().map(IndexMap::len).sum())
    }
}

fn departure(handle: &ChannelHandle, owner_empty: bool) -> Departure {
    Departure {
        owner_id: handle.owner_id.clone(),
        instance_id: handle.instance_id.clone(),
        connection_id: handle.id,
        owner_empty,
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
