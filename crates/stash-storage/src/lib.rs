//! Fingerprint store: durable "already seen" keys and per-platform scrape state,
//! plus atomic file writes shared by the rest of the workspace.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use stash_core::{Fingerprint, NormalizedItem, PlatformState};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub use memory::MemoryFingerprintStore;
pub use sqlite::SqliteFingerprintStore;

pub const CRATE_NAME: &str = "stash-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record for {platform}: {detail}")]
    Corrupt { platform: String, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// What an administrative reset clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Re-enable the platform and clear its failure counters; keep the seen-set.
    StateOnly,
    /// Drop the platform state and every seen fingerprint for it.
    Everything,
}

/// Descriptive columns recorded alongside a seen fingerprint.
#[derive(Debug, Clone, Copy)]
pub struct SeenDetails<'a> {
    pub url: Option<&'a str>,
    pub title: Option<&'a str>,
    pub author: Option<&'a str>,
    pub seen_at: DateTime<Utc>,
}

impl<'a> SeenDetails<'a> {
    pub fn from_item(item: &'a NormalizedItem, seen_at: DateTime<Utc>) -> Self {
        Self {
            url: item.canonical_url(),
            title: item.title.as_deref(),
            author: item.author.as_deref(),
            seen_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ScrapeStats {
    pub total_seen: u64,
    pub seen_by_platform: BTreeMap<String, u64>,
    pub platforms: Vec<PlatformState>,
}

/// Single source of truth for dedup identity and platform state.
///
/// Every method is atomic on its own; callers never need a transaction spanning
/// several calls. Platforms use disjoint key prefixes, so concurrent readers of one
/// platform never observe half-written data from another.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn has_seen(&self, platform: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    /// Secondary identity check on the canonical url.
    async fn has_seen_url(&self, platform: &str, url: &str) -> Result<bool, StoreError>;

    /// Idempotent upsert; re-marking an existing fingerprint is a no-op.
    async fn mark_seen(
        &self,
        platform: &str,
        fingerprint: &Fingerprint,
        details: SeenDetails<'_>,
    ) -> Result<(), StoreError>;

    async fn count_seen(&self, platform: &str) -> Result<u64, StoreError>;

    async fn seen_counts(&self) -> Result<BTreeMap<String, u64>, StoreError>;

    /// Returns the stored state, creating and persisting the default when absent.
    async fn load_platform_state(
        &self,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<PlatformState, StoreError>;

    async fn save_platform_state(&self, state: &PlatformState) -> Result<(), StoreError>;

    async fn list_platform_states(&self) -> Result<Vec<PlatformState>, StoreError>;

    async fn reset_platform(&self, platform: &str, scope: ResetScope) -> Result<(), StoreError>;

    /// Deletes seen records older than `cutoff`, returning how many were removed.
    async fn prune_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn scrape_stats(&self) -> Result<ScrapeStats, StoreError> {
        let seen_by_platform = self.seen_counts().await?;
        Ok(ScrapeStats {
            total_seen: seen_by_platform.values().sum(),
            seen_by_platform,
            platforms: self.list_platform_states().await?,
        })
    }
}

/// Write bytes through a sibling temp file and rename it into place, so readers
/// only ever see the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}
