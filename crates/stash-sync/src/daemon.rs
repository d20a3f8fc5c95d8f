//! Long-running mode: cron-triggered cycles until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::report::ReportWriter;
use crate::{run_and_report, Orchestrator};

pub struct Daemon {
    orchestrator: Arc<Orchestrator>,
    reports: ReportWriter,
    cron: String,
    in_flight: Arc<Mutex<()>>,
}

impl Daemon {
    pub fn new(orchestrator: Arc<Orchestrator>, reports: ReportWriter, cron: String) -> Self {
        Self {
            orchestrator,
            reports,
            cron,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Runs one cycle unless another is still in flight. Returns whether it ran.
    pub async fn trigger(&self, cancel: &CancellationToken) -> bool {
        run_guarded(&self.orchestrator, &self.reports, &self.in_flight, cancel).await
    }

    /// Runs a cycle immediately, then on every cron tick, until Ctrl-C.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let mut scheduler = JobScheduler::new().await.context("creating scheduler")?;

        let orchestrator = self.orchestrator.clone();
        let reports = self.reports.clone();
        let in_flight = self.in_flight.clone();
        let job_cancel = cancel.clone();
        let job = Job::new_async(self.cron.as_str(), move |_uuid, _lock| {
            let orchestrator = orchestrator.clone();
            let reports = reports.clone();
            let in_flight = in_flight.clone();
            let cancel = job_cancel.clone();
            Box::pin(async move {
                run_guarded(&orchestrator, &reports, &in_flight, &cancel).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.cron))?;
        scheduler.add(job).await.context("adding scheduler job")?;
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %self.cron, "scheduler started");

        let startup = {
            let orchestrator = self.orchestrator.clone();
            let reports = self.reports.clone();
            let in_flight = self.in_flight.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_guarded(&orchestrator, &reports, &in_flight, &cancel).await;
            })
        };

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown requested; cancelling in-flight cycle");
        cancel.cancel();
        scheduler.shutdown().await.context("stopping scheduler")?;
        if let Err(err) = startup.await {
            warn!(error = %err, "startup cycle task ended abnormally");
        }
        let _drained = self.in_flight.lock().await;
        info!("daemon stopped");
        Ok(())
    }
}

async fn run_guarded(
    orchestrator: &Orchestrator,
    reports: &ReportWriter,
    in_flight: &Mutex<()>,
    cancel: &CancellationToken,
) -> bool {
    let Ok(_guard) = in_flight.try_lock() else {
        warn!("previous cycle still running; skipping trigger");
        return false;
    };
    if cancel.is_cancelled() {
        return false;
    }
    match run_and_report(orchestrator, reports, cancel).await {
        Ok(report) => info!(
            cycle_id = %report.cycle_id,
            new_items = report.new_items(),
            "scheduled cycle complete"
        ),
        Err(err) => error!(error = %format!("{err:#}"), "scheduled cycle failed"),
    }
    true
}
