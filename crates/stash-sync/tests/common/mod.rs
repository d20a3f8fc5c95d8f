//! Scripted sources and orchestrator wiring shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use stash_core::{ManualClock, NormalizedItem};
use stash_sources::{
    AccessMethod, AuthError, AuthMode, FetchError, Source, SourceContext, SourceError,
    SourceFactory,
};
use stash_storage::MemoryFingerprintStore;
use stash_sync::{
    AdaptiveScheduler, MemorySink, Orchestrator, PlatformPlan, RetryPolicy, SchedulerPolicy,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
}

pub fn item(platform: &str, id: &str) -> NormalizedItem {
    NormalizedItem::new(platform).with_external_id(id)
}

/// What one source instance does when built for a run.
#[derive(Clone)]
pub enum Script {
    Items(Vec<NormalizedItem>),
    FetchFails(FetchError),
    AuthFails(AuthError),
}

#[derive(Default)]
pub struct Calls {
    pub builds: AtomicU32,
    pub authenticates: AtomicU32,
    pub fetches: AtomicU32,
    pub closes: AtomicU32,
}

impl Calls {
    pub fn builds(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

struct ScriptedSource {
    platform: String,
    script: Script,
    calls: Arc<Calls>,
}

#[async_trait]
impl Source for ScriptedSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn access_method(&self) -> AccessMethod {
        AccessMethod::Fixture
    }

    async fn authenticate(&mut self, _ctx: &SourceContext) -> Result<AuthMode, AuthError> {
        self.calls.authenticates.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::AuthFails(err) => Err(err.clone()),
            _ => Ok(AuthMode::Full),
        }
    }

    async fn fetch_saved_items(
        &mut self,
        _ctx: &SourceContext,
        limit: usize,
    ) -> Result<Vec<NormalizedItem>, FetchError> {
        self.calls.fetches.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Items(items) => Ok(items.iter().take(limit).cloned().collect()),
            Script::FetchFails(err) => Err(err.clone()),
            Script::AuthFails(_) => Err(FetchError::NotAuthenticated),
        }
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Per platform, a queue of scripts consumed one per build; the last one repeats.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<BTreeMap<String, VecDeque<Script>>>,
    calls: Mutex<BTreeMap<String, Arc<Calls>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, platform: &str, scripts: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(platform.to_string(), scripts.into());
    }

    pub fn calls(&self, platform: &str) -> Arc<Calls> {
        self.calls
            .lock()
            .unwrap()
            .entry(platform.to_string())
            .or_default()
            .clone()
    }
}

impl SourceFactory for ScriptedFactory {
    fn build(&self, platform: &str) -> Result<Box<dyn Source>, SourceError> {
        let calls = self.calls(platform);
        calls.builds.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts
            .get_mut(platform)
            .ok_or_else(|| SourceError::Message(format!("no script for {platform}")))?;
        let script = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
        .ok_or_else(|| SourceError::Message(format!("empty script for {platform}")))?;
        Ok(Box::new(ScriptedSource {
            platform: platform.to_string(),
            script,
            calls,
        }))
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryFingerprintStore>,
    pub factory: Arc<ScriptedFactory>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<MemorySink>,
}

pub fn harness(platforms: &[(&str, i64)], policy: SchedulerPolicy) -> Harness {
    let store = Arc::new(MemoryFingerprintStore::new());
    let factory = Arc::new(ScriptedFactory::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let sink = Arc::new(MemorySink::new());
    let plans = platforms
        .iter()
        .map(|(name, minutes)| PlatformPlan::new(name, Duration::minutes(*minutes), 100))
        .collect();
    let orchestrator = Orchestrator::new(store.clone(), factory.clone(), plans)
        .with_clock(clock.clone())
        .with_sink(sink.clone())
        .with_scheduler(AdaptiveScheduler::new(policy))
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay: StdDuration::from_millis(1),
            multiplier: 1.0,
            max_delay: StdDuration::from_millis(1),
        })
        .with_inter_platform_delay(StdDuration::ZERO);
    Harness {
        orchestrator,
        store,
        factory,
        clock,
        sink,
    }
}
