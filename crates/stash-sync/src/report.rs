//! Cycle and status reports plus their on-disk form.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use stash_core::{Eligibility, PlatformHealth, PlatformState, RunOutcome};
use stash_storage::{write_atomic, write_json_atomic};
use uuid::Uuid;

use crate::scheduler::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformRunStatus {
    Succeeded,
    Failed,
    CoolingDown,
    /// Circuit breaker open; needs an operator reset.
    Disabled,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformReport {
    pub platform: String,
    pub status: PlatformRunStatus,
    pub outcome: Option<RunOutcome>,
    pub transition: Option<Transition>,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_failure_reason: String,
    /// Orchestration problems outside the run itself (state persistence, delivery).
    pub errors: Vec<String>,
}

impl PlatformReport {
    pub fn from_state(status: PlatformRunStatus, state: &PlatformState) -> Self {
        Self {
            platform: state.platform.clone(),
            status,
            outcome: None,
            transition: None,
            enabled: state.enabled,
            consecutive_failures: state.consecutive_failures,
            success_rate: state.success_rate,
            next_eligible_at: Some(state.next_eligible_at),
            last_failure_reason: state.last_failure_reason.clone(),
            errors: Vec::new(),
        }
    }

    pub fn unavailable(platform: &str, status: PlatformRunStatus, error: String) -> Self {
        Self {
            platform: platform.to_string(),
            status,
            outcome: None,
            transition: None,
            enabled: true,
            consecutive_failures: 0,
            success_rate: 0.0,
            next_eligible_at: None,
            last_failure_reason: String::new(),
            errors: vec![error],
        }
    }

    pub fn new_items(&self) -> usize {
        self.outcome.as_ref().map_or(0, |o| o.new_item_count)
    }

    pub fn needs_operator(&self) -> bool {
        !self.enabled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platforms: Vec<PlatformReport>,
}

impl CycleReport {
    pub fn new(cycle_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            platforms: Vec::new(),
        }
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformReport> {
        self.platforms.iter().find(|p| p.platform == name)
    }

    pub fn count(&self, status: PlatformRunStatus) -> usize {
        self.platforms.iter().filter(|p| p.status == status).count()
    }

    pub fn new_items(&self) -> usize {
        self.platforms.iter().map(PlatformReport::new_items).sum()
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Collection Cycle Brief".to_string(),
            String::new(),
            format!("- Cycle ID: `{}`", self.cycle_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- New items: {}", self.new_items()),
            format!(
                "- Succeeded: {} / Failed: {} / Cooling down: {} / Disabled: {}",
                self.count(PlatformRunStatus::Succeeded),
                self.count(PlatformRunStatus::Failed),
                self.count(PlatformRunStatus::CoolingDown),
                self.count(PlatformRunStatus::Disabled),
            ),
            String::new(),
            "## Platforms".to_string(),
        ];
        for p in &self.platforms {
            let mut line = format!("- {}: {}", p.platform, status_label(p.status));
            if let Some(outcome) = &p.outcome {
                line.push_str(&format!(
                    " ({} new of {} fetched, {} duplicates, {} malformed)",
                    outcome.new_item_count, outcome.attempted, outcome.duplicates, outcome.malformed
                ));
            }
            if !p.last_failure_reason.is_empty() && p.status != PlatformRunStatus::Succeeded {
                line.push_str(&format!(" last failure: {}", p.last_failure_reason));
            }
            if p.needs_operator() {
                line.push_str(" **manual reset required**");
            }
            lines.push(line);
            for err in &p.errors {
                lines.push(format!("  - error: {err}"));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

fn status_label(status: PlatformRunStatus) -> &'static str {
    match status {
        PlatformRunStatus::Succeeded => "succeeded",
        PlatformRunStatus::Failed => "failed",
        PlatformRunStatus::CoolingDown => "cooling down",
        PlatformRunStatus::Disabled => "disabled",
        PlatformRunStatus::Cancelled => "cancelled",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

impl OverallHealth {
    /// Critical when nothing is healthy, degraded when fewer than half are.
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if total == 0 {
            OverallHealth::Healthy
        } else if healthy == 0 {
            OverallHealth::Critical
        } else if healthy * 2 < total {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformStatus {
    pub platform: String,
    pub health: PlatformHealth,
    pub eligibility: Eligibility,
    pub needs_operator: bool,
    pub seen_items: u64,
    pub state: PlatformState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub overall: OverallHealth,
    pub healthy: usize,
    pub total: usize,
    pub platforms: Vec<PlatformStatus>,
}

impl StatusReport {
    pub fn new(generated_at: DateTime<Utc>, platforms: Vec<PlatformStatus>) -> Self {
        let healthy = platforms
            .iter()
            .filter(|p| p.health == PlatformHealth::Healthy)
            .count();
        Self {
            generated_at,
            overall: OverallHealth::from_counts(healthy, platforms.len()),
            healthy,
            total: platforms.len(),
            platforms,
        }
    }
}

/// Writes cycle reports and the rolling status file under one root.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `<root>/<cycle_id>/cycle_report.json` and `cycle_brief.md`.
    pub async fn write_cycle(&self, report: &CycleReport) -> Result<PathBuf> {
        let dir = self.root.join(report.cycle_id.to_string());
        write_json_atomic(&dir.join("cycle_report.json"), report).await?;
        write_atomic(&dir.join("cycle_brief.md"), report.to_markdown().as_bytes()).await?;
        Ok(dir)
    }

    pub async fn write_status(&self, status: &StatusReport) -> Result<PathBuf> {
        let path = self.root.join("status.json");
        write_json_atomic(&path, status).await?;
        Ok(path)
    }
}
