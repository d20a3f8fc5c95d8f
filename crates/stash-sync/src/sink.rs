//! Downstream hand-off of newly seen items.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use stash_core::{NormalizedItem, RunOutcome};
use stash_storage::write_json_atomic;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait ItemSink: Send + Sync {
    /// Receives one run's new items, in fetch order. Only called when non-empty.
    async fn deliver(&self, outcome: &RunOutcome, items: &[NormalizedItem]) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl ItemSink for NoopSink {
    async fn deliver(&self, _outcome: &RunOutcome, _items: &[NormalizedItem]) -> Result<()> {
        Ok(())
    }
}

/// Keeps every delivery in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<(String, Vec<NormalizedItem>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(String, Vec<NormalizedItem>)> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn items_for(&self, platform: &str) -> Vec<NormalizedItem> {
        self.deliveries()
            .into_iter()
            .filter(|(p, _)| p == platform)
            .flat_map(|(_, items)| items)
            .collect()
    }
}

#[async_trait]
impl ItemSink for MemorySink {
    async fn deliver(&self, outcome: &RunOutcome, items: &[NormalizedItem]) -> Result<()> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((outcome.platform.clone(), items.to_vec()));
        Ok(())
    }
}

#[derive(Serialize)]
struct DeltaFile<'a> {
    run_id: Uuid,
    platform: &'a str,
    collected_at: String,
    items: &'a [NormalizedItem],
}

/// Writes `<root>/deltas/<platform>/<timestamp>.json` per delivery.
#[derive(Debug, Clone)]
pub struct JsonDeltaSink {
    root: PathBuf,
}

impl JsonDeltaSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, outcome: &RunOutcome) -> PathBuf {
        self.root
            .join("deltas")
            .join(&outcome.platform)
            .join(format!("{}.json", outcome.finished_at.format("%Y%m%dT%H%M%S%.3fZ")))
    }
}

#[async_trait]
impl ItemSink for JsonDeltaSink {
    async fn deliver(&self, outcome: &RunOutcome, items: &[NormalizedItem]) -> Result<()> {
        let path = self.path_for(outcome);
        write_json_atomic(
            &path,
            &DeltaFile {
                run_id: outcome.run_id,
                platform: &outcome.platform,
                collected_at: outcome.finished_at.to_rfc3339(),
                items,
            },
        )
        .await?;
        debug!(path = %path.display(), items = items.len(), "delta written");
        Ok(())
    }
}
