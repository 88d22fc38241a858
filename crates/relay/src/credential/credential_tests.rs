// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn creds(pairs: &[(&str, &str)]) -> Credentials {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
}

#[tokio::test]
async fn memory_store_keeps_latest_snapshot_per_owner() -> anyhow::Result<()> {
    let store = MemoryCredentialStore::new();
    assert_eq!(store.get("alice").await?, None);

    store.set("alice", creds(&[("cookie", "a=1")])).await?;
    store.set("alice", creds(&[("cookie", "a=2")])).await?;
    store.set("bob", creds(&[("cookie", "b=1")])).await?;

    assert_eq!(store.get("alice").await?, Some(creds(&[("cookie", "a=2")])));
    assert_eq!(store.get("bob").await?, Some(creds(&[("cookie", "b=1")])));
    Ok(())
}

#[tokio::test]
async fn file_store_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FileCredentialStore::open(dir.path())?;
    store.set("alice", creds(&[("cookie", "sid=abc"), ("user_agent", "Mozilla/5.0")])).await?;

    let reopened = FileCredentialStore::open(dir.path())?;
    let loaded = reopened.get("alice").await?;
    assert_eq!(loaded.as_ref().and_then(|c| c.get("cookie")).map(String::as_str), Some("sid=abc"));
    assert_eq!(reopened.get("bob").await?, None);
    Ok(())
}

#[tokio::test]
async fn file_store_creates_missing_state_dir() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let nested = dir.path().join("state").join("tether");
    let store = FileCredentialStore::open(&nested)?;
    store.set("carol", creds(&[("token", "t")])).await?;

    assert!(store.path().exists());
    let leftovers: Vec<_> = std::fs::read_dir(&nested)?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[test]
fn open_rejects_corrupt_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("credentials.json"), "{not json")?;
    assert!(FileCredentialStore::open(dir.path()).is_err());
    Ok(())
}
