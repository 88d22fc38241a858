// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential material reported by browser agents.
//!
//! The relay only stores what an agent hands back on refresh; it never
//! performs a login itself.

pub mod persist;

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

pub use persist::FileCredentialStore;

/// Opaque key/value credential snapshot (cookie jar, tokens, user agent).
pub type Credentials = BTreeMap<String, String>;

/// Per-owner credential storage.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, owner_id: &str) -> anyhow::Result<Option<Credentials>>;

    async fn set(&self, owner_id: &str, credentials: Credentials) -> anyhow::Result<()>;
}

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    owners: RwLock<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, owner_id: &str) -> anyhow::Result<Option<Credentials>> {
        Ok(self.owners.read().get(owner_id).cloned())
    }

    async fn set(&self, owner_id: &str, credentials: Credentials) -> anyhow::Result<()> {
        self.owners.write().insert(owner_id.to_owned(), credentials);
        Ok(())
    }
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
