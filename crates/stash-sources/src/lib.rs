//! Source contracts plus the two reference authentication shapes
//! (session automation, credentialed API), a fixture source, and the registry
//! that builds a fresh source for every collection run.

pub mod api;
pub mod fixture;
pub mod rest;
pub mod session;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stash_core::{normalize_platform, NormalizedItem};
use thiserror::Error;
use uuid::Uuid;

pub use api::{
    AccessToken, ApiAuthState, ApiClient, ApiCredentials, ClientKey, CredentialTier,
    CredentialedApiSource, SavedPage,
};
pub use fixture::FixtureSource;
pub use rest::{RestApiClient, RestApiSpec};
pub use session::{
    CookieJarFile, LoginCredentials, SessionAutomationSource, SessionDriver, SessionSettings,
    SessionState, StoredCookie,
};

pub const CRATE_NAME: &str = "stash-sources";

/// How a platform is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    SessionAutomation,
    CredentialedApi,
    Fixture,
}

/// Result of a successful `authenticate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Full,
    /// Connectivity validated, but account-scoped saved items are out of reach.
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub platform: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("authentication gave up after {attempts} attempts: {detail}")]
    Exhausted { attempts: u32, detail: String },
    #[error("network error during authentication: {0}")]
    Network(String),
}

impl AuthError {
    /// DNS/connect/timeout class failures, as opposed to bad credentials.
    pub fn is_network(&self) -> bool {
        matches!(self, AuthError::Network(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("source is not authenticated")]
    NotAuthenticated,
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("rate limited by platform")]
    RateLimited,
    #[error("platform error: {0}")]
    Platform(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_)
                | FetchError::Timeout(_)
                | FetchError::RateLimited
                | FetchError::Platform(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Per-platform adapter consumed by the collection run.
///
/// `close` must be safe to call whether or not `authenticate` ever succeeded.
#[async_trait]
pub trait Source: Send {
    fn platform(&self) -> &str;
    fn access_method(&self) -> AccessMethod;

    async fn authenticate(&mut self, ctx: &SourceContext) -> Result<AuthMode, AuthError>;

    async fn fetch_saved_items(
        &mut self,
        ctx: &SourceContext,
        limit: usize,
    ) -> Result<Vec<NormalizedItem>, FetchError>;

    async fn close(&mut self) -> Result<(), SourceError>;
}

/// Builds a fresh [`Source`] for one collection run.
pub trait SourceFactory: Send + Sync {
    fn build(&self, platform: &str) -> Result<Box<dyn Source>, SourceError>;
}

/// Config-level description of how to construct a platform's source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Fixture { path: PathBuf },
    RestApi(RestApiSpec),
}

impl SourceSpec {
    pub fn build(&self, platform: &str) -> Result<Box<dyn Source>, SourceError> {
        match self {
            SourceSpec::Fixture { path } => Ok(Box::new(FixtureSource::new(platform, path.clone()))),
            SourceSpec::RestApi(spec) => {
                let client = RestApiClient::new(spec)?;
                let credentials = ApiCredentials::from_env(spec);
                Ok(Box::new(
                    CredentialedApiSource::new(platform, client, credentials)
                        .with_page_size(spec.page_size),
                ))
            }
        }
    }
}

type SourceBuilder = Box<dyn Fn() -> Result<Box<dyn Source>, SourceError> + Send + Sync>;

/// Platform name -> builder. Session-automation platforms are registered by the
/// embedding application, which owns the driver.
#[derive(Default)]
pub struct SourceRegistry {
    builders: BTreeMap<String, SourceBuilder>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, platform: &str, builder: F)
    where
        F: Fn() -> Result<Box<dyn Source>, SourceError> + Send + Sync + 'static,
    {
        self.builders
            .insert(normalize_platform(platform), Box::new(builder));
    }

    pub fn register_spec(&mut self, platform: &str, spec: SourceSpec) {
        let key = normalize_platform(platform);
        let name = key.clone();
        self.register(&key, move || spec.build(&name));
    }

    pub fn from_specs<'a>(specs: impl IntoIterator<Item = (&'a str, &'a SourceSpec)>) -> Self {
        let mut registry = Self::new();
        for (platform, spec) in specs {
            registry.register_spec(platform, spec.clone());
        }
        registry
    }

    pub fn contains(&self, platform: &str) -> bool {
        self.builders.contains_key(&normalize_platform(platform))
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }
}

impl SourceFactory for SourceRegistry {
    fn build(&self, platform: &str) -> Result<Box<dyn Source>, SourceError> {
        let builder = self
            .builders
            .get(&normalize_platform(platform))
            .ok_or_else(|| SourceError::Message(format!("no source registered for platform {platform}")))?;
        builder()
    }
}
