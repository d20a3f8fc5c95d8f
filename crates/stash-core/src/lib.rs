//! Core domain model for the saved-item collector: normalized items, fingerprints,
//! per-platform scheduling state and run outcomes.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "stash-core";

/// Lowercase, trimmed platform identifier used as the key prefix everywhere.
pub fn normalize_platform(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Canonical saved item produced by any source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NormalizedItem {
    pub platform: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub post_type: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("item from {platform} has neither an external id nor a url")]
pub struct MalformedItem {
    pub platform: String,
}

impl NormalizedItem {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: normalize_platform(platform),
            ..Default::default()
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn external_id(&self) -> Option<&str> {
        non_empty(self.external_id.as_deref())
    }

    pub fn canonical_url(&self) -> Option<&str> {
        non_empty(self.url.as_deref())
    }

    /// Identity used for deduplication: the external id, falling back to the url.
    pub fn fingerprint(&self) -> Result<Fingerprint, MalformedItem> {
        let platform = normalize_platform(&self.platform);
        match self.external_id().or_else(|| self.canonical_url()) {
            Some(identity) => Ok(Fingerprint::new(&platform, identity)),
            None => Err(MalformedItem { platform }),
        }
    }

    pub fn cursor(&self) -> ItemCursor {
        ItemCursor {
            external_id: self.external_id().map(ToString::to_string),
            url: self.canonical_url().map(ToString::to_string),
        }
    }
}

/// `platform|identity` dedup key. Never persisted as an entity of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(platform: &str, identity: &str) -> Self {
        Self(format!("{}|{}", normalize_platform(platform), identity.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pointer to the most recent item handed downstream for a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ItemCursor {
    pub external_id: Option<String>,
    pub url: Option<String>,
}

/// Scheduler-owned health and cadence record for one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformState {
    pub platform: String,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    pub last_failure_reason: String,
    pub last_item: Option<ItemCursor>,
    pub total_new_items: u64,
}

impl PlatformState {
    pub fn new(platform: &str, now: DateTime<Utc>) -> Self {
        Self {
            platform: normalize_platform(platform),
            enabled: true,
            consecutive_failures: 0,
            success_rate: 1.0,
            last_attempt_at: None,
            last_success_at: None,
            next_eligible_at: now,
            last_failure_reason: String::new(),
            last_item: None,
            total_new_items: 0,
        }
    }

    pub fn eligibility(&self, now: DateTime<Utc>) -> Eligibility {
        if !self.enabled {
            Eligibility::Disabled
        } else if now < self.next_eligible_at {
            Eligibility::CoolingDown {
                until: self.next_eligible_at,
            }
        } else {
            Eligibility::Eligible
        }
    }

    pub fn health(&self) -> PlatformHealth {
        if self.enabled && self.success_rate > 0.7 {
            PlatformHealth::Healthy
        } else if self.enabled && self.success_rate > 0.3 {
            PlatformHealth::Degraded
        } else {
            PlatformHealth::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    CoolingDown { until: DateTime<Utc> },
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Why a collection run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunFailure {
    /// Credentials or session rejected.
    Auth,
    /// Network-class failure during authentication (DNS, connect, timeout).
    Network,
    /// Item retrieval failed after in-run retries.
    Fetch,
    /// Persistence failure; dedup guarantees could not be upheld.
    Store,
    Cancelled,
    /// No source could be built for the platform.
    Unavailable,
}

impl RunFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            RunFailure::Auth => "auth",
            RunFailure::Network => "network",
            RunFailure::Fetch => "fetch",
            RunFailure::Store => "store",
            RunFailure::Cancelled => "cancelled",
            RunFailure::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one collection run against a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub platform: String,
    pub attempted: usize,
    pub new_item_count: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub fetch_attempts: u32,
    pub succeeded: bool,
    pub failure: Option<RunFailure>,
    pub error_detail: Option<String>,
    pub last_item: Option<ItemCursor>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn begin(run_id: Uuid, platform: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            platform: normalize_platform(platform),
            attempted: 0,
            new_item_count: 0,
            duplicates: 0,
            malformed: 0,
            fetch_attempts: 0,
            succeeded: false,
            failure: None,
            error_detail: None,
            last_item: None,
            started_at,
            finished_at: started_at,
        }
    }

    pub fn succeed(mut self, finished_at: DateTime<Utc>) -> Self {
        self.succeeded = true;
        self.failure = None;
        self.error_detail = None;
        self.finished_at = finished_at;
        self
    }

    pub fn fail(
        mut self,
        failure: RunFailure,
        detail: impl Into<String>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        self.succeeded = false;
        self.failure = Some(failure);
        self.error_detail = Some(detail.into());
        self.finished_at = finished_at;
        self
    }

    /// Short machine-readable reason (`"auth"`, `"fetch"`, ...) for failed runs.
    pub fn error_reason(&self) -> Option<&'static str> {
        self.failure.map(RunFailure::as_str)
    }

    /// `reason: detail` text recorded as a platform's last failure reason.
    pub fn failure_summary(&self) -> String {
        match (self.error_reason(), self.error_detail.as_deref()) {
            (Some(reason), Some(detail)) if !detail.is_empty() => format!("{reason}: {detail}"),
            (Some(reason), _) => reason.to_string(),
            (None, _) => String::new(),
        }
    }
}

/// Time source, injectable so scheduling can be driven deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    #[test]
    fn fingerprint_prefers_external_id_over_url() {
        let item = NormalizedItem::new("Platform-A")
            .with_external_id("abc")
            .with_url("https://example.com/p/abc");
        assert_eq!(item.fingerprint().unwrap().as_str(), "platform-a|abc");
    }

    #[test]
    fn fingerprint_falls_back_to_url_when_id_blank() {
        let item = NormalizedItem::new("reddit")
            .with_external_id("   ")
            .with_url("https://example.com/r/1");
        assert_eq!(
            item.fingerprint().unwrap().as_str(),
            "reddit|https://example.com/r/1"
        );
    }

    #[test]
    fn item_without_identity_is_malformed() {
        let item = NormalizedItem::new("reddit").with_title("no identity");
        let err = item.fingerprint().unwrap_err();
        assert_eq!(err.platform, "reddit");
    }

    #[test]
    fn missing_optional_fields_deserialize() {
        let item: NormalizedItem =
            serde_json::from_str(r#"{"platform":"twitter","external_id":"9"}"#).unwrap();
        assert_eq!(item.external_id(), Some("9"));
        assert!(item.media_urls.is_empty());
    }

    #[test]
    fn new_state_is_immediately_eligible() {
        let state = PlatformState::new("Twitter", t0());
        assert_eq!(state.platform, "twitter");
        assert_eq!(state.eligibility(t0()), Eligibility::Eligible);
        assert_eq!(state.health(), PlatformHealth::Healthy);
    }

    #[test]
    fn eligibility_distinguishes_cooling_down_from_disabled() {
        let mut state = PlatformState::new("threads", t0());
        state.next_eligible_at = t0() + Duration::hours(2);
        assert_eq!(
            state.eligibility(t0()),
            Eligibility::CoolingDown {
                until: t0() + Duration::hours(2)
            }
        );
        state.enabled = false;
        assert_eq!(state.eligibility(t0() + Duration::hours(3)), Eligibility::Disabled);
        assert_eq!(state.health(), PlatformHealth::Unhealthy);
    }

    #[test]
    fn health_bands_follow_success_rate() {
        let mut state = PlatformState::new("reddit", t0());
        state.success_rate = 0.5;
        assert_eq!(state.health(), PlatformHealth::Degraded);
        state.success_rate = 0.2;
        assert_eq!(state.health(), PlatformHealth::Unhealthy);
    }

    #[test]
    fn failed_outcome_reports_reason_and_detail() {
        let outcome = RunOutcome::begin(Uuid::new_v4(), "twitter", t0()).fail(
            RunFailure::Auth,
            "cookie expired",
            t0(),
        );
        assert_eq!(outcome.error_reason(), Some("auth"));
        assert_eq!(outcome.failure_summary(), "auth: cookie expired");
        assert!(!outcome.succeeded);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), t0() + Duration::minutes(90));
    }
}
