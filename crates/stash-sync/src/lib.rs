//! Collection orchestration: cycles over configured platforms, runs each eligible
//! source once, hands new items downstream and keeps per-platform state current.

pub mod config;
pub mod daemon;
pub mod report;
pub mod run;
pub mod scheduler;
pub mod sink;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use stash_core::{
    normalize_platform, Clock, Eligibility, RunFailure, RunOutcome, SystemClock,
};
use stash_sources::{SourceFactory, SourceRegistry};
use stash_storage::{FingerprintStore, ResetScope, ScrapeStats, SqliteFingerprintStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{CollectorConfig, PlatformConfig, PlatformsFile, RunSettings, SchedulerSettings};
pub use daemon::Daemon;
pub use report::{
    CycleReport, OverallHealth, PlatformReport, PlatformRunStatus, PlatformStatus, ReportWriter,
    StatusReport,
};
pub use run::{CollectionRun, RetryPolicy, RunOptions, RunReport};
pub use scheduler::{AdaptiveScheduler, SchedulerPolicy, Transition};
pub use sink::{ItemSink, JsonDeltaSink, MemorySink, NoopSink};

pub const CRATE_NAME: &str = "stash-sync";

/// Static per-platform inputs to a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformPlan {
    pub name: String,
    pub base_interval: Duration,
    pub fetch_limit: usize,
}

impl PlatformPlan {
    pub fn new(name: &str, base_interval: Duration, fetch_limit: usize) -> Self {
        Self {
            name: normalize_platform(name),
            base_interval,
            fetch_limit,
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn FingerprintStore>,
    sources: Arc<dyn SourceFactory>,
    sink: Arc<dyn ItemSink>,
    clock: Arc<dyn Clock>,
    scheduler: AdaptiveScheduler,
    platforms: Vec<PlatformPlan>,
    retry: RetryPolicy,
    source_timeout: StdDuration,
    inter_platform_delay: StdDuration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn FingerprintStore>,
        sources: Arc<dyn SourceFactory>,
        platforms: Vec<PlatformPlan>,
    ) -> Self {
        Self {
            store,
            sources,
            sink: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            scheduler: AdaptiveScheduler::default(),
            platforms,
            retry: RetryPolicy::default(),
            source_timeout: StdDuration::from_secs(120),
            inter_platform_delay: StdDuration::from_secs(60),
        }
    }

    /// Orchestrator for every platform in `file`, in file order.
    pub fn from_config(
        file: &PlatformsFile,
        default_fetch_limit: usize,
        store: Arc<dyn FingerprintStore>,
        sources: Arc<dyn SourceFactory>,
    ) -> Self {
        let fallback_limit = file.run.fetch_limit.unwrap_or(default_fetch_limit);
        let platforms = file
            .platforms
            .iter()
            .map(|p| {
                PlatformPlan::new(
                    &p.name,
                    config::minutes(p.base_interval_minutes),
                    p.fetch_limit.unwrap_or(fallback_limit),
                )
            })
            .collect();
        Self::new(store, sources, platforms)
            .with_scheduler(AdaptiveScheduler::new(file.scheduler.policy()))
            .with_retry_policy(file.run.retry_policy())
            .with_source_timeout(file.run.source_timeout())
            .with_inter_platform_delay(file.inter_platform_delay())
    }

    pub fn with_sink(mut self, sink: Arc<dyn ItemSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler(mut self, scheduler: AdaptiveScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_source_timeout(mut self, timeout: StdDuration) -> Self {
        self.source_timeout = timeout;
        self
    }

    pub fn with_inter_platform_delay(mut self, delay: StdDuration) -> Self {
        self.inter_platform_delay = delay;
        self
    }

    pub fn platforms(&self) -> &[PlatformPlan] {
        &self.platforms
    }

    pub fn store(&self) -> &Arc<dyn FingerprintStore> {
        &self.store
    }

    /// One pass over every configured platform, in order. A failing platform never
    /// stops the others; its problems are recorded in the report instead.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id);
        async move {
            let mut report = CycleReport::new(cycle_id, self.clock.now());
            let mut ran_any = false;

            for plan in &self.platforms {
                if cancel.is_cancelled() {
                    report.platforms.push(PlatformReport::unavailable(
                        &plan.name,
                        PlatformRunStatus::Cancelled,
                        "cycle cancelled".to_string(),
                    ));
                    continue;
                }

                let now = self.clock.now();
                let state = match self.store.load_platform_state(&plan.name, now).await {
                    Ok(state) => state,
                    Err(err) => {
                        error!(platform = %plan.name, error = %err, "could not load platform state");
                        report.platforms.push(PlatformReport::unavailable(
                            &plan.name,
                            PlatformRunStatus::Failed,
                            format!("loading state: {err}"),
                        ));
                        continue;
                    }
                };

                match self.scheduler.eligibility(&state, now) {
                    Eligibility::Disabled => {
                        info!(platform = %plan.name, "platform disabled; skipping");
                        report
                            .platforms
                            .push(PlatformReport::from_state(PlatformRunStatus::Disabled, &state));
                        continue;
                    }
                    Eligibility::CoolingDown { until } => {
                        info!(platform = %plan.name, %until, "platform cooling down; skipping");
                        report.platforms.push(PlatformReport::from_state(
                            PlatformRunStatus::CoolingDown,
                            &state,
                        ));
                        continue;
                    }
                    Eligibility::Eligible => {}
                }

                if ran_any && !self.inter_platform_delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            report.platforms.push(PlatformReport::from_state(
                                PlatformRunStatus::Cancelled,
                                &state,
                            ));
                            continue;
                        }
                        _ = tokio::time::sleep(self.inter_platform_delay) => {}
                    }
                }
                ran_any = true;

                let entry = self.run_platform(plan, state, cancel).await;
                report.platforms.push(entry);
            }

            report.finished_at = self.clock.now();
            info!(
                new_items = report.new_items(),
                succeeded = report.count(PlatformRunStatus::Succeeded),
                failed = report.count(PlatformRunStatus::Failed),
                disabled = report.count(PlatformRunStatus::Disabled),
                "cycle finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn run_platform(
        &self,
        plan: &PlatformPlan,
        mut state: stash_core::PlatformState,
        cancel: &CancellationToken,
    ) -> PlatformReport {
        let options = RunOptions {
            limit: plan.fetch_limit,
            retry: self.retry,
            source_timeout: self.source_timeout,
        };

        let run = match self.sources.build(&plan.name) {
            Ok(mut source) => {
                CollectionRun::new(self.store.as_ref(), self.clock.as_ref(), &options)
                    .run(source.as_mut(), cancel)
                    .await
            }
            Err(err) => {
                let now = self.clock.now();
                warn!(platform = %plan.name, error = %err, "no source available");
                RunReport {
                    outcome: RunOutcome::begin(Uuid::new_v4(), &plan.name, now).fail(
                        RunFailure::Unavailable,
                        err.to_string(),
                        now,
                    ),
                    items: Vec::new(),
                }
            }
        };

        let mut errors = Vec::new();
        if !run.items.is_empty() {
            if let Err(err) = self.sink.deliver(&run.outcome, &run.items).await {
                error!(platform = %plan.name, error = %err, "delivering new items failed");
                errors.push(format!("delivery: {err:#}"));
            }
        }

        if run.outcome.failure == Some(RunFailure::Cancelled) {
            let mut entry = PlatformReport::from_state(PlatformRunStatus::Cancelled, &state);
            entry.outcome = Some(run.outcome);
            entry.errors = errors;
            return entry;
        }

        let transition = self.scheduler.record_outcome(
            &mut state,
            &run.outcome,
            plan.base_interval,
            self.clock.now(),
        );
        if let Err(err) = self.store.save_platform_state(&state).await {
            error!(platform = %plan.name, error = %err, "could not persist platform state");
            errors.push(format!("saving state: {err}"));
        }

        let status = if run.outcome.succeeded {
            PlatformRunStatus::Succeeded
        } else {
            PlatformRunStatus::Failed
        };
        let mut entry = PlatformReport::from_state(status, &state);
        entry.outcome = Some(run.outcome);
        entry.transition = Some(transition);
        entry.errors = errors;
        entry
    }

    /// Administrative reset; `StateOnly` re-enables the platform and keeps its seen-set.
    pub async fn reset_platform(&self, platform: &str, scope: ResetScope) -> Result<()> {
        let platform = normalize_platform(platform);
        self.store
            .reset_platform(&platform, scope)
            .await
            .with_context(|| format!("resetting {platform}"))?;
        info!(%platform, ?scope, "platform reset");
        Ok(())
    }

    pub async fn status_report(&self) -> Result<StatusReport> {
        let now = self.clock.now();
        let counts = self.store.seen_counts().await.context("counting seen items")?;
        let mut platforms = Vec::with_capacity(self.platforms.len());
        for plan in &self.platforms {
            let state = self
                .store
                .load_platform_state(&plan.name, now)
                .await
                .with_context(|| format!("loading state for {}", plan.name))?;
            platforms.push(PlatformStatus {
                platform: plan.name.clone(),
                health: state.health(),
                eligibility: state.eligibility(now),
                needs_operator: !state.enabled,
                seen_items: counts.get(&plan.name).copied().unwrap_or(0),
                state,
            });
        }
        Ok(StatusReport::new(now, platforms))
    }
}

/// Token cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            trigger.cancel();
        }
    });
    token
}

/// Everything the `stash` binary needs, wired from the environment.
pub struct Collector {
    pub config: CollectorConfig,
    pub store: Arc<SqliteFingerprintStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub reports: ReportWriter,
}

impl Collector {
    pub async fn from_env() -> Result<Self> {
        Self::open(CollectorConfig::from_env(), SourceRegistry::new()).await
    }

    /// `registry` carries application-registered sources (session drivers); config
    /// sources are added on top.
    pub async fn open(config: CollectorConfig, mut registry: SourceRegistry) -> Result<Self> {
        let file = PlatformsFile::load(&config.platforms_file).await?;
        file.register_sources(&mut registry);
        for platform in &file.platforms {
            if !registry.contains(&platform.name) {
                warn!(platform = %platform.name, "no source configured or registered");
            }
        }

        let store = Arc::new(
            SqliteFingerprintStore::open(&config.db_path)
                .await
                .with_context(|| format!("opening {}", config.db_path.display()))?,
        );
        let orchestrator = Orchestrator::from_config(
            &file,
            config.fetch_limit,
            store.clone(),
            Arc::new(registry),
        )
        .with_sink(Arc::new(JsonDeltaSink::new(config.reports_dir.clone())));

        Ok(Self {
            reports: ReportWriter::new(config.reports_dir.clone()),
            orchestrator: Arc::new(orchestrator),
            store,
            config,
        })
    }

    /// One cycle plus its reports and a refreshed status file.
    pub async fn sync_once(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        run_and_report(&self.orchestrator, &self.reports, cancel).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.orchestrator.status_report().await
    }

    pub async fn reset(&self, platform: &str, scope: ResetScope) -> Result<()> {
        self.orchestrator.reset_platform(platform, scope).await
    }

    pub async fn stats(&self) -> Result<ScrapeStats> {
        Ok(self.store.scrape_stats().await?)
    }

    /// Drops seen records older than `days`.
    pub async fn prune(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let removed = self.store.prune_seen_before(cutoff).await?;
        info!(removed, days, "pruned seen records");
        Ok(removed)
    }

    pub fn daemon(&self) -> Daemon {
        Daemon::new(
            self.orchestrator.clone(),
            self.reports.clone(),
            self.config.scheduler_cron.clone(),
        )
    }
}

pub(crate) async fn run_and_report(
    orchestrator: &Orchestrator,
    reports: &ReportWriter,
    cancel: &CancellationToken,
) -> Result<CycleReport> {
    let report = orchestrator.run_cycle(cancel).await?;
    let dir = reports.write_cycle(&report).await?;
    let status = orchestrator.status_report().await?;
    reports.write_status(&status).await?;
    info!(reports = %dir.display(), overall = ?status.overall, "reports written");
    Ok(report)
}
