//! One authenticate + fetch + dedup pass against a single source.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use stash_core::{normalize_platform, Clock, Fingerprint, NormalizedItem, RunFailure, RunOutcome};
use stash_sources::{AuthError, AuthMode, FetchError, Source, SourceContext};
use stash_storage::{FingerprintStore, SeenDetails, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Bounded in-run retry with mildly increasing delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 1.5,
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_index + 1`.
    pub fn delay_for_retry(&self, retry_index: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(i32::try_from(retry_index).unwrap_or(i32::MAX));
        let scaled = (self.base_delay.as_nanos() as f64 * factor).round();
        if !scaled.is_finite() || scaled >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(scaled as u64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub limit: usize,
    pub retry: RetryPolicy,
    pub source_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: 200,
            retry: RetryPolicy::default(),
            source_timeout: Duration::from_secs(120),
        }
    }
}

/// Outcome plus the newly seen items, in fetch order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub items: Vec<NormalizedItem>,
}

struct Abort {
    failure: RunFailure,
    detail: String,
}

impl Abort {
    fn new(failure: RunFailure, detail: impl Into<String>) -> Self {
        Self {
            failure,
            detail: detail.into(),
        }
    }

    fn cancelled() -> Self {
        Self::new(RunFailure::Cancelled, "cancelled")
    }

    fn store(err: StoreError) -> Self {
        Self::new(RunFailure::Store, err.to_string())
    }
}

enum Guarded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

pub struct CollectionRun<'a> {
    store: &'a dyn FingerprintStore,
    clock: &'a dyn Clock,
    options: &'a RunOptions,
}

impl<'a> CollectionRun<'a> {
    pub fn new(store: &'a dyn FingerprintStore, clock: &'a dyn Clock, options: &'a RunOptions) -> Self {
        Self {
            store,
            clock,
            options,
        }
    }

    /// Runs the source to completion. Never returns early without closing it.
    pub async fn run(&self, source: &mut dyn Source, cancel: &CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let platform = normalize_platform(source.platform());
        let span = info_span!("collection_run", %run_id, platform = %platform);

        async move {
            let started_at = self.clock.now();
            let ctx = SourceContext {
                run_id,
                platform: platform.clone(),
                started_at,
            };
            let mut outcome = RunOutcome::begin(run_id, &platform, started_at);
            let mut items = Vec::new();

            let result = self
                .execute(source, &ctx, cancel, &mut outcome, &mut items)
                .await;

            match tokio::time::timeout(self.options.source_timeout, source.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "closing source failed"),
                Err(_) => warn!("closing source timed out"),
            }

            let finished_at = self.clock.now();
            let outcome = match result {
                Ok(()) => outcome.succeed(finished_at),
                Err(abort) => outcome.fail(abort.failure, abort.detail, finished_at),
            };

            if outcome.succeeded {
                info!(
                    new_items = outcome.new_item_count,
                    attempted = outcome.attempted,
                    duplicates = outcome.duplicates,
                    malformed = outcome.malformed,
                    "collection run finished"
                );
            } else {
                warn!(
                    reason = outcome.error_reason().unwrap_or_default(),
                    detail = outcome.error_detail.as_deref().unwrap_or_default(),
                    new_items = outcome.new_item_count,
                    "collection run failed"
                );
            }
            RunReport { outcome, items }
        }
        .instrument(span)
        .await
    }

    async fn guarded<F: Future>(&self, cancel: &CancellationToken, fut: F) -> Guarded<F::Output> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Guarded::Cancelled,
            result = tokio::time::timeout(self.options.source_timeout, fut) => match result {
                Ok(value) => Guarded::Done(value),
                Err(_) => Guarded::TimedOut,
            },
        }
    }

    async fn pause(&self, cancel: &CancellationToken, retry_index: u32) -> Result<(), Abort> {
        let delay = self.options.retry.delay_for_retry(retry_index);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Abort::cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn authenticate(
        &self,
        source: &mut dyn Source,
        ctx: &SourceContext,
        cancel: &CancellationToken,
    ) -> Result<AuthMode, Abort> {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.guarded(cancel, source.authenticate(ctx)).await {
                Guarded::Cancelled => return Err(Abort::cancelled()),
                Guarded::Done(Ok(mode)) => return Ok(mode),
                Guarded::Done(Err(err)) => err,
                Guarded::TimedOut => AuthError::Network(format!(
                    "authentication timed out after {}s",
                    self.options.source_timeout.as_secs()
                )),
            };

            if !err.is_network() {
                return Err(Abort::new(RunFailure::Auth, err.to_string()));
            }
            if attempt >= max_attempts {
                return Err(Abort::new(RunFailure::Network, err.to_string()));
            }
            warn!(attempt, error = %err, "network error during authentication, retrying");
            self.pause(cancel, attempt - 1).await?;
        }
    }

    async fn fetch(
        &self,
        source: &mut dyn Source,
        ctx: &SourceContext,
        cancel: &CancellationToken,
        outcome: &mut RunOutcome,
    ) -> Result<Vec<NormalizedItem>, Abort> {
        let max_attempts = self.options.retry.max_attempts.max(1);
        loop {
            outcome.fetch_attempts += 1;
            let attempt = outcome.fetch_attempts;
            let err = match self
                .guarded(cancel, source.fetch_saved_items(ctx, self.options.limit))
                .await
            {
                Guarded::Cancelled => return Err(Abort::cancelled()),
                Guarded::Done(Ok(items)) => return Ok(items),
                Guarded::Done(Err(err)) => err,
                Guarded::TimedOut => FetchError::Timeout(format!(
                    "fetch timed out after {}s",
                    self.options.source_timeout.as_secs()
                )),
            };

            if !err.is_transient() || attempt >= max_attempts {
                return Err(Abort::new(RunFailure::Fetch, err.to_string()));
            }
            warn!(attempt, error = %err, "transient fetch error, retrying");
            self.pause(cancel, attempt - 1).await?;
        }
    }

    async fn execute(
        &self,
        source: &mut dyn Source,
        ctx: &SourceContext,
        cancel: &CancellationToken,
        outcome: &mut RunOutcome,
        delivered: &mut Vec<NormalizedItem>,
    ) -> Result<(), Abort> {
        let platform = ctx.platform.as_str();
        let known = self.store.count_seen(platform).await.map_err(Abort::store)?;
        debug!(known, "starting collection run");

        if self.authenticate(source, ctx, cancel).await? == AuthMode::ReadOnly {
            info!("source is read-only; saved items are not reachable");
        }

        let fetched = self.fetch(source, ctx, cancel, outcome).await?;
        outcome.attempted = fetched.len();

        let mut batch: HashSet<Fingerprint> = HashSet::new();
        let mut batch_urls: HashSet<String> = HashSet::new();
        for mut item in fetched {
            if cancel.is_cancelled() {
                return Err(Abort::cancelled());
            }
            item.platform = platform.to_string();
            let fingerprint = match item.fingerprint() {
                Ok(fingerprint) => fingerprint,
                Err(err) => {
                    outcome.malformed += 1;
                    debug!(error = %err, "dropping malformed item");
                    continue;
                }
            };

            let url = item.canonical_url().map(ToString::to_string);
            // The url only identifies items that carry no id of their own.
            let url_key = url.as_deref().filter(|_| item.external_id().is_none());
            let repeated_url = url_key.is_some_and(|u| batch_urls.contains(u));
            if !batch.insert(fingerprint.clone()) || repeated_url {
                outcome.duplicates += 1;
                continue;
            }
            if let Some(url) = &url {
                batch_urls.insert(url.clone());
            }

            if self.already_seen(platform, &fingerprint, url_key).await? {
                outcome.duplicates += 1;
                continue;
            }

            self.store
                .mark_seen(platform, &fingerprint, SeenDetails::from_item(&item, self.clock.now()))
                .await
                .map_err(Abort::store)?;
            if outcome.last_item.is_none() {
                outcome.last_item = Some(item.cursor());
            }
            outcome.new_item_count += 1;
            delivered.push(item);
        }
        Ok(())
    }

    async fn already_seen(
        &self,
        platform: &str,
        fingerprint: &Fingerprint,
        url: Option<&str>,
    ) -> Result<bool, Abort> {
        if self
            .store
            .has_seen(platform, fingerprint)
            .await
            .map_err(Abort::store)?
        {
            return Ok(true);
        }
        match url {
            Some(url) => self.store.has_seen_url(platform, url).await.map_err(Abort::store),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use stash_core::ManualClock;
    use stash_sources::{AccessMethod, SourceError};
    use stash_storage::MemoryFingerprintStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Probe {
        auth_calls: AtomicU32,
        fetch_calls: AtomicU32,
        closes: AtomicU32,
    }

    struct ScriptedSource {
        auth: VecDeque<Result<AuthMode, AuthError>>,
        fetches: VecDeque<Result<Vec<NormalizedItem>, FetchError>>,
        hang_on_fetch: bool,
        probe: Arc<Probe>,
    }

    impl ScriptedSource {
        fn new(probe: Arc<Probe>) -> Self {
            Self {
                auth: VecDeque::new(),
                fetches: VecDeque::new(),
                hang_on_fetch: false,
                probe,
            }
        }
    }

    #[async_trait]
    impl Source for ScriptedSource {
        fn platform(&self) -> &str {
            "reddit"
        }

        fn access_method(&self) -> AccessMethod {
            AccessMethod::CredentialedApi
        }

        async fn authenticate(&mut self, _ctx: &SourceContext) -> Result<AuthMode, AuthError> {
            self.probe.auth_calls.fetch_add(1, Ordering::SeqCst);
            self.auth.pop_front().unwrap_or(Ok(AuthMode::Full))
        }

        async fn fetch_saved_items(
            &mut self,
            _ctx: &SourceContext,
            _limit: usize,
        ) -> Result<Vec<NormalizedItem>, FetchError> {
            self.probe.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_on_fetch {
                std::future::pending::<()>().await;
            }
            self.fetches.pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn close(&mut self) -> Result<(), SourceError> {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            limit: 50,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 1.5,
                max_delay: Duration::from_millis(5),
            },
            source_timeout: Duration::from_secs(5),
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap())
    }

    fn id(value: &str) -> NormalizedItem {
        NormalizedItem::new("reddit").with_external_id(value)
    }

    #[tokio::test]
    async fn repeated_items_in_one_fetch_count_once() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let probe = Arc::new(Probe::default());
        let mut source = ScriptedSource::new(probe.clone());
        source.fetches.push_back(Ok(vec![
            id("1"),
            id("1"),
            id("2").with_url("u2"),
        ]));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert!(report.outcome.succeeded);
        assert_eq!(report.outcome.new_item_count, 2);
        assert_eq!(report.outcome.malformed, 0);
        assert_eq!(report.outcome.duplicates, 1);
        assert_eq!(report.outcome.attempted, 3);
        assert_eq!(report.items.len(), 2);
        assert_eq!(store.count_seen("reddit").await.unwrap(), 2);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_items_never_reach_the_store() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let mut source = ScriptedSource::new(Arc::new(Probe::default()));
        source.fetches.push_back(Ok(vec![
            NormalizedItem::new("reddit").with_title("nothing to key on"),
            NormalizedItem::new("reddit").with_external_id(" ").with_url(""),
            id("3"),
        ]));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.malformed, 2);
        assert_eq!(report.outcome.new_item_count, 1);
        assert_eq!(store.count_seen("reddit").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn items_seen_by_url_are_duplicates() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let mut first = ScriptedSource::new(Arc::new(Probe::default()));
        first.fetches.push_back(Ok(vec![id("a").with_url("https://r.test/a")]));
        CollectionRun::new(&store, &clock, &options)
            .run(&mut first, &CancellationToken::new())
            .await;

        let mut second = ScriptedSource::new(Arc::new(Probe::default()));
        second
            .fetches
            .push_back(Ok(vec![NormalizedItem::new("reddit").with_url("https://r.test/a")]));
        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut second, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.new_item_count, 0);
        assert_eq!(report.outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn distinct_ids_sharing_a_url_are_separate_items() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let article = "https://news.test/story";
        let mut first = ScriptedSource::new(Arc::new(Probe::default()));
        first.fetches.push_back(Ok(vec![
            id("t3_a").with_url(article),
            id("t3_b").with_url(article),
        ]));
        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut first, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.new_item_count, 2);
        assert_eq!(report.outcome.duplicates, 0);

        let mut second = ScriptedSource::new(Arc::new(Probe::default()));
        second
            .fetches
            .push_back(Ok(vec![id("t3_c").with_url(article), id("t3_a").with_url(article)]));
        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut second, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.new_item_count, 1);
        assert_eq!(report.outcome.duplicates, 1);
        assert_eq!(report.items[0].external_id(), Some("t3_c"));
        assert_eq!(store.count_seen("reddit").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn url_only_item_repeating_an_earlier_url_is_a_duplicate() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let mut source = ScriptedSource::new(Arc::new(Probe::default()));
        source.fetches.push_back(Ok(vec![
            id("t3_a").with_url("https://r.test/a"),
            NormalizedItem::new("reddit").with_url("https://r.test/a"),
        ]));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.new_item_count, 1);
        assert_eq!(report.outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn store_error_ends_the_run_and_keeps_marked_items() {
        let store = crate::test_support::FailingMarkStore::new(2);
        let clock = clock();
        let options = options();
        let probe = Arc::new(Probe::default());
        let mut source = ScriptedSource::new(probe.clone());
        source
            .fetches
            .push_back(Ok(vec![id("1"), id("2"), id("3"), id("4")]));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert!(!report.outcome.succeeded);
        assert_eq!(report.outcome.failure, Some(RunFailure::Store));
        assert_eq!(report.outcome.new_item_count, 2);
        let ids: Vec<_> = report.items.iter().filter_map(|i| i.external_id()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(report
            .outcome
            .error_detail
            .as_deref()
            .unwrap_or_default()
            .contains("disk full"));
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_skips_fetch_and_still_closes() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let probe = Arc::new(Probe::default());
        let mut source = ScriptedSource::new(probe.clone());
        source
            .auth
            .push_back(Err(AuthError::Rejected("bad password".into())));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert!(!report.outcome.succeeded);
        assert_eq!(report.outcome.error_reason(), Some("auth"));
        assert_eq!(report.outcome.new_item_count, 0);
        assert_eq!(probe.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_auth_errors_are_retried_then_reported_as_network() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let probe = Arc::new(Probe::default());
        let mut source = ScriptedSource::new(probe.clone());
        for _ in 0..3 {
            source.auth.push_back(Err(AuthError::Network("dns".into())));
        }

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.failure, Some(RunFailure::Network));
        assert_eq!(probe.auth_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_fetch_errors_are_retried_within_the_run() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let probe = Arc::new(Probe::default());
        let mut source = ScriptedSource::new(probe.clone());
        source.fetches.push_back(Err(FetchError::RateLimited));
        source.fetches.push_back(Ok(vec![id("1")]));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert!(report.outcome.succeeded);
        assert_eq!(report.outcome.fetch_attempts, 2);
        assert_eq!(report.outcome.new_item_count, 1);
    }

    #[tokio::test]
    async fn exhausted_fetch_retries_fail_the_run() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let mut source = ScriptedSource::new(Arc::new(Probe::default()));
        for _ in 0..3 {
            source
                .fetches
                .push_back(Err(FetchError::Platform("503".into())));
        }

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.error_reason(), Some("fetch"));
        assert_eq!(report.outcome.fetch_attempts, 3);
    }

    #[tokio::test]
    async fn permanent_fetch_errors_are_not_retried() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let mut source = ScriptedSource::new(Arc::new(Probe::default()));
        source
            .fetches
            .push_back(Err(FetchError::Decode("unexpected token".into())));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.error_reason(), Some("fetch"));
        assert_eq!(report.outcome.fetch_attempts, 1);
    }

    #[tokio::test]
    async fn empty_fetch_is_a_success() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let mut source = ScriptedSource::new(Arc::new(Probe::default()));

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert!(report.outcome.succeeded);
        assert_eq!(report.outcome.new_item_count, 0);
    }

    #[tokio::test]
    async fn cancellation_mid_fetch_still_closes_the_source() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = options();
        let probe = Arc::new(Probe::default());
        let mut source = ScriptedSource::new(probe.clone());
        source.hang_on_fetch = true;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &cancel)
            .await;
        assert_eq!(report.outcome.failure, Some(RunFailure::Cancelled));
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_times_out_as_a_fetch_error() {
        let store = MemoryFingerprintStore::new();
        let clock = clock();
        let options = RunOptions {
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            ..options()
        };
        let mut source = ScriptedSource::new(Arc::new(Probe::default()));
        source.hang_on_fetch = true;

        let report = CollectionRun::new(&store, &clock, &options)
            .run(&mut source, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome.error_reason(), Some("fetch"));
        assert!(report
            .outcome
            .error_detail
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
    }

    #[test]
    fn retry_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_retry(30), Duration::from_millis(350));
    }
}
