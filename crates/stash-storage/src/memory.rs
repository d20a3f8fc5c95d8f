//! In-memory [`FingerprintStore`] for tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stash_core::{normalize_platform, Fingerprint, PlatformState};
use tokio::sync::RwLock;

use crate::{FingerprintStore, ResetScope, SeenDetails, StoreError};

#[derive(Debug, Clone)]
struct SeenEntry {
    url: Option<String>,
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    seen: HashMap<String, HashMap<Fingerprint, SeenEntry>>,
    states: BTreeMap<String, PlatformState>,
}

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    inner: RwLock<Inner>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn has_seen(&self, platform: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .seen
            .get(&normalize_platform(platform))
            .is_some_and(|m| m.contains_key(fingerprint)))
    }

    async fn has_seen_url(&self, platform: &str, url: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .seen
            .get(&normalize_platform(platform))
            .is_some_and(|m| m.values().any(|e| e.url.as_deref() == Some(url))))
    }

    async fn mark_seen(
        &self,
        platform: &str,
        fingerprint: &Fingerprint,
        details: SeenDetails<'_>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .seen
            .entry(normalize_platform(platform))
            .or_default()
            .entry(fingerprint.clone())
            .or_insert_with(|| SeenEntry {
                url: details.url.map(ToString::to_string),
                seen_at: details.seen_at,
            });
        Ok(())
    }

    async fn count_seen(&self, platform: &str) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .seen
            .get(&normalize_platform(platform))
            .map_or(0, |m| m.len() as u64))
    }

    async fn seen_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .seen
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(platform, m)| (platform.clone(), m.len() as u64))
            .collect())
    }

    async fn load_platform_state(
        &self,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<PlatformState, StoreError> {
        let key = normalize_platform(platform);
        let mut inner = self.inner.write().await;
        Ok(inner
            .states
            .entry(key.clone())
            .or_insert_with(|| PlatformState::new(&key, now))
            .clone())
    }

    async fn save_platform_state(&self, state: &PlatformState) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .states
            .insert(normalize_platform(&state.platform), state.clone());
        Ok(())
    }

    async fn list_platform_states(&self) -> Result<Vec<PlatformState>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.states.values().cloned().collect())
    }

    async fn reset_platform(&self, platform: &str, scope: ResetScope) -> Result<(), StoreError> {
        let key = normalize_platform(platform);
        let mut inner = self.inner.write().await;
        inner.states.remove(&key);
        if scope == ResetScope::Everything {
            inner.seen.remove(&key);
        }
        Ok(())
    }

    async fn prune_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut removed = 0u64;
        for entries in inner.seen.values_mut() {
            let before = entries.len();
            entries.retain(|_, e| e.seen_at >= cutoff);
            removed += (before - entries.len()) as u64;
        }
        Ok(removed)
    }
}
