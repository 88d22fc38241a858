// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential persistence: one JSON file per relay, written atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{CredentialStore, Credentials};

/// On-disk layout of the credential file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PersistedCredentials {
    pub owners: HashMap<String, PersistedOwner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedOwner {
    pub credentials: Credentials,
    /// Epoch seconds of the last refresh.
    #[serde(default)]
    pub updated_at: u64,
}

/// Load persisted credentials from a JSON file.
pub fn load(path: &Path) -> anyhow::Result<PersistedCredentials> {
    let contents = std::fs::read_to_string(path)?;
    let creds: PersistedCredentials = serde_json::from_str(&contents)?;
    Ok(creds)
}

/// Save persisted credentials to a JSON file atomically (write tmp + rename).
///
/// The temp name carries PID and a counter so concurrent saves never share
/// a temp file.
pub fn save(path: &Path, creds: &PersistedCredentials) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(creds)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Credential store backed by `<state_dir>/credentials.json`.
///
/// The whole file is cached in memory; every `set` rewrites it.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cache: Mutex<PersistedCredentials>,
}

impl FileCredentialStore {
    /// Open the store, starting empty when the file does not exist yet.
    pub fn open(state_dir: &Path) -> anyhow::Result<Self> {
        let path = state_dir.join("credentials.json");
        let cache = if path.exists() {
            load(&path)?
        } else {
            PersistedCredentials::default()
        };
        tracing::debug!(
            path = %path.display(),
            owners = cache.owners.len(),
            "opened credential store"
        );
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, owner_id: &str) -> anyhow::Result<Option<Credentials>> {
        Ok(self.cache.lock().owners.get(owner_id).map(|o| o.credentials.clone()))
    }

    async fn set(&self, owner_id: &str, credentials: Credentials) -> anyhow::Result<()> {
        let updated_at =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let mut cache = self.cache.lock();
        cache.owners.insert(owner_id.to_owned(), PersistedOwner { credentials, updated_at });
        save(&self.path, &cache)
    }
}
