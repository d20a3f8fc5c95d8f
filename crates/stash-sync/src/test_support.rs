//! Store wrapper whose writes start failing after a set number of marks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stash_core::{Fingerprint, PlatformState};
use stash_storage::{
    FingerprintStore, MemoryFingerprintStore, ResetScope, SeenDetails, StoreError,
};

pub(crate) struct FailingMarkStore {
    inner: MemoryFingerprintStore,
    marks_allowed: usize,
    marks: AtomicUsize,
}

impl FailingMarkStore {
    pub(crate) fn new(marks_allowed: usize) -> Self {
        Self {
            inner: MemoryFingerprintStore::new(),
            marks_allowed,
            marks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FingerprintStore for FailingMarkStore {
    async fn has_seen(&self, platform: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        self.inner.has_seen(platform, fingerprint).await
    }

    async fn has_seen_url(&self, platform: &str, url: &str) -> Result<bool, StoreError> {
        self.inner.has_seen_url(platform, url).await
    }

    async fn mark_seen(
        &self,
        platform: &str,
        fingerprint: &Fingerprint,
        details: SeenDetails<'_>,
    ) -> Result<(), StoreError> {
        if self.marks.fetch_add(1, Ordering::SeqCst) >= self.marks_allowed {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.mark_seen(platform, fingerprint, details).await
    }

    async fn count_seen(&self, platform: &str) -> Result<u64, StoreError> {
        self.inner.count_seen(platform).await
    }

    async fn seen_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        self.inner.seen_counts().await
    }

    async fn load_platform_state(
        &self,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<PlatformState, StoreError> {
        self.inner.load_platform_state(platform, now).await
    }

    async fn save_platform_state(&self, state: &PlatformState) -> Result<(), StoreError> {
        self.inner.save_platform_state(state).await
    }

    async fn list_platform_states(&self) -> Result<Vec<PlatformState>, StoreError> {
        self.inner.list_platform_states().await
    }

    async fn reset_platform(&self, platform: &str, scope: ResetScope) -> Result<(), StoreError> {
        self.inner.reset_platform(platform, scope).await
    }

    async fn prune_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.prune_seen_before(cutoff).await
    }
}
