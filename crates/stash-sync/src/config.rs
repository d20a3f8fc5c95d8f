//! Environment and `platforms.yaml` configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use stash_core::normalize_platform;
use stash_sources::{SourceRegistry, SourceSpec};
use tokio::fs;

use crate::run::RetryPolicy;
use crate::scheduler::SchedulerPolicy;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub db_path: PathBuf,
    pub platforms_file: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_cron: String,
    pub fetch_limit: usize,
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("STASH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("var/scrape_state.db")),
            platforms_file: std::env::var("STASH_PLATFORMS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("platforms.yaml")),
            reports_dir: std::env::var("STASH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            scheduler_cron: std::env::var("STASH_SCHEDULER_CRON")
                .unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            fetch_limit: std::env::var("STASH_FETCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_consecutive_failures: u32,
    pub disable_threshold: f64,
    pub smoothing_weight: f64,
    pub backoff_step_minutes: u64,
    pub max_interval_minutes: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            disable_threshold: 0.3,
            smoothing_weight: 0.1,
            backoff_step_minutes: 120,
            max_interval_minutes: 24 * 60,
        }
    }
}

impl SchedulerSettings {
    pub fn policy(&self) -> SchedulerPolicy {
        SchedulerPolicy {
            max_consecutive_failures: self.max_consecutive_failures,
            disable_threshold: self.disable_threshold,
            smoothing_weight: self.smoothing_weight,
            backoff_step: minutes(self.backoff_step_minutes),
            max_interval: minutes(self.max_interval_minutes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Overrides `STASH_FETCH_LIMIT` for every platform.
    pub fetch_limit: Option<usize>,
    pub max_fetch_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_multiplier: f64,
    pub source_timeout_secs: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            fetch_limit: None,
            max_fetch_attempts: 3,
            retry_delay_ms: 2_000,
            retry_multiplier: 1.5,
            source_timeout_secs: 120,
        }
    }
}

impl RunSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        let base_delay = StdDuration::from_millis(self.retry_delay_ms);
        RetryPolicy {
            max_attempts: self.max_fetch_attempts.max(1),
            base_delay,
            multiplier: self.retry_multiplier,
            max_delay: base_delay.saturating_mul(10),
        }
    }

    pub fn source_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.source_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    pub base_interval_minutes: u64,
    #[serde(default)]
    pub fetch_limit: Option<usize>,
    /// Absent for platforms whose source the embedding application registers
    /// itself (session drivers).
    #[serde(default)]
    pub source: Option<SourceSpec>,
}

fn default_inter_platform_delay_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformsFile {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default = "default_inter_platform_delay_secs")]
    pub inter_platform_delay_secs: u64,
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
}

impl Default for PlatformsFile {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            run: RunSettings::default(),
            inter_platform_delay_secs: default_inter_platform_delay_secs(),
            platforms: Vec::new(),
        }
    }
}

impl PlatformsFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut file: PlatformsFile = serde_yaml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    /// Normalizes platform names and rejects settings the scheduler cannot honour.
    pub fn validate(&mut self) -> Result<()> {
        let mut names = BTreeSet::new();
        for platform in &mut self.platforms {
            platform.name = normalize_platform(&platform.name);
            if platform.name.is_empty() {
                bail!("platform name must not be empty");
            }
            if !names.insert(platform.name.clone()) {
                bail!("platform {} is configured more than once", platform.name);
            }
            if platform.base_interval_minutes == 0 {
                bail!("platform {} needs a base_interval_minutes above zero", platform.name);
            }
        }

        let scheduler = &self.scheduler;
        if !(scheduler.smoothing_weight > 0.0 && scheduler.smoothing_weight <= 1.0) {
            bail!("scheduler.smoothing_weight must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&scheduler.disable_threshold) {
            bail!("scheduler.disable_threshold must be in [0, 1]");
        }
        if scheduler.max_consecutive_failures == 0 {
            bail!("scheduler.max_consecutive_failures must be at least 1");
        }
        if self.run.retry_multiplier < 1.0 {
            bail!("run.retry_multiplier must be at least 1.0");
        }
        Ok(())
    }

    /// Registry with a builder for every platform that names its source here.
    pub fn source_registry(&self) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        self.register_sources(&mut registry);
        registry
    }

    pub fn register_sources(&self, registry: &mut SourceRegistry) {
        for platform in &self.platforms {
            if let Some(spec) = &platform.source {
                registry.register_spec(&platform.name, spec.clone());
            }
        }
    }

    pub fn inter_platform_delay(&self) -> StdDuration {
        StdDuration::from_secs(self.inter_platform_delay_secs)
    }
}

pub(crate) fn minutes(value: u64) -> chrono::Duration {
    let bounded = i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 60_000);
    chrono::Duration::minutes(bounded)
}
