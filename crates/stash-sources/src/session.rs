//! Session-automation source: one exclusive interactive session (typically a
//! browser context) restored from persisted cookies or re-established by an
//! interactive login.
//!
//! ```text
//! NoSession -> SessionFromCache -> Authenticated
//! NoSession -> InteractiveLogin -> Authenticated
//!                       \-> AuthFailed (bounded attempts spent)
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stash_core::{normalize_platform, NormalizedItem};
use stash_storage::write_json_atomic;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{AccessMethod, AuthError, AuthMode, FetchError, Source, SourceContext, SourceError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default, rename = "httpOnly")]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

/// Cookie jar persisted as a JSON array.
#[derive(Debug, Clone)]
pub struct CookieJarFile {
    path: PathBuf,
}

impl CookieJarFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A missing or unreadable jar just means there is no session to restore.
    pub async fn load(&self) -> Option<Vec<StoredCookie>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not read cookie jar");
                return None;
            }
        };
        match serde_json::from_str::<Vec<StoredCookie>>(&text) {
            Ok(cookies) if !cookies.is_empty() => Some(cookies),
            Ok(_) => None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not parse cookie jar");
                None
            }
        }
    }

    pub async fn save(&self, cookies: &[StoredCookie]) -> anyhow::Result<()> {
        write_json_atomic(&self.path, cookies).await
    }
}

#[derive(Clone)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Low-level interaction primitives of one session (browser page, socket, ...).
///
/// Implementations perform single steps; sequencing, attempt bounds and cookie
/// persistence live in [`SessionAutomationSource`].
#[async_trait]
pub trait SessionDriver: Send {
    async fn open(&mut self) -> Result<(), AuthError>;
    async fn restore(&mut self, cookies: &[StoredCookie]) -> Result<(), AuthError>;
    /// Cheap check that the session is logged in.
    async fn probe(&mut self) -> Result<bool, AuthError>;
    /// One full interactive login attempt (all steps).
    async fn login(&mut self, credentials: &LoginCredentials) -> Result<(), AuthError>;
    async fn export_cookies(&mut self) -> Result<Vec<StoredCookie>, AuthError>;
    /// Items currently rendered after one more scroll/page step. May repeat items.
    async fn next_batch(&mut self) -> Result<Vec<NormalizedItem>, FetchError>;
    async fn shutdown(&mut self) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NoSession,
    SessionFromCache,
    InteractiveLogin,
    Authenticated,
    AuthFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub max_login_attempts: u32,
    pub max_scrolls: u32,
    /// Stop scrolling after this many consecutive batches without a new item.
    pub max_idle_scrolls: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_login_attempts: 3,
            max_scrolls: 50,
            max_idle_scrolls: 3,
        }
    }
}

pub struct SessionAutomationSource<D> {
    platform: String,
    driver: D,
    jar: CookieJarFile,
    credentials: Option<LoginCredentials>,
    settings: SessionSettings,
    state: SessionState,
    opened: bool,
}

impl<D: SessionDriver> SessionAutomationSource<D> {
    pub fn new(
        platform: &str,
        driver: D,
        jar: CookieJarFile,
        credentials: Option<LoginCredentials>,
    ) -> Self {
        Self {
            platform: normalize_platform(platform),
            driver,
            jar,
            credentials,
            settings: SessionSettings::default(),
            state: SessionState::NoSession,
            opened: false,
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// `Ok(true)` when the cached cookies produced a live session.
    async fn try_cached_session(&mut self) -> Result<bool, AuthError> {
        let Some(cookies) = self.jar.load().await else {
            return Ok(false);
        };
        self.state = SessionState::SessionFromCache;
        debug!(platform = %self.platform, cookies = cookies.len(), "restoring cached session");

        if let Err(err) = self.driver.restore(&cookies).await {
            if err.is_network() {
                return Err(err);
            }
            warn!(platform = %self.platform, error = %err, "cached session could not be restored");
            return Ok(false);
        }
        match self.driver.probe().await {
            Ok(true) => Ok(true),
            Ok(false) => {
                info!(platform = %self.platform, "cached session expired");
                Ok(false)
            }
            Err(err) if err.is_network() => Err(err),
            Err(err) => {
                warn!(platform = %self.platform, error = %err, "session probe failed");
                Ok(false)
            }
        }
    }

    async fn persist_session(&mut self) {
        match self.driver.export_cookies().await {
            Ok(cookies) => {
                if let Err(err) = self.jar.save(&cookies).await {
                    warn!(platform = %self.platform, error = %err, "could not persist session cookies");
                }
            }
            Err(err) => {
                warn!(platform = %self.platform, error = %err, "could not export session cookies");
            }
        }
    }

    async fn interactive_login(&mut self) -> Result<(), AuthError> {
        let Some(credentials) = self.credentials.clone() else {
            return Err(AuthError::MissingCredentials(format!(
                "no live cached session and no login credentials for {}",
                self.platform
            )));
        };
        self.state = SessionState::InteractiveLogin;

        let attempts = self.settings.max_login_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            debug!(platform = %self.platform, attempt, attempts, "interactive login");
            match self.driver.login(&credentials).await {
                Ok(()) => match self.driver.probe().await {
                    Ok(true) => {
                        self.persist_session().await;
                        return Ok(());
                    }
                    Ok(false) => last_error = "login did not produce a live session".to_string(),
                    Err(err) if err.is_network() => return Err(err),
                    Err(err) => last_error = err.to_string(),
                },
                Err(err) if err.is_network() => return Err(err),
                Err(err) => last_error = err.to_string(),
            }
            warn!(platform = %self.platform, attempt, error = %last_error, "login attempt failed");
        }

        Err(AuthError::Exhausted {
            attempts,
            detail: last_error,
        })
    }
}

#[async_trait]
impl<D: SessionDriver> Source for SessionAutomationSource<D> {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn access_method(&self) -> AccessMethod {
        AccessMethod::SessionAutomation
    }

    async fn authenticate(&mut self, _ctx: &SourceContext) -> Result<AuthMode, AuthError> {
        self.state = SessionState::NoSession;
        if !self.opened {
            if let Err(err) = self.driver.open().await {
                self.state = SessionState::AuthFailed;
                return Err(err);
            }
            self.opened = true;
        }

        let result = match self.try_cached_session().await {
            Ok(true) => Ok(()),
            Ok(false) => self.interactive_login().await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.state = SessionState::Authenticated;
                info!(platform = %self.platform, "session authenticated");
                Ok(AuthMode::Full)
            }
            Err(err) => {
                self.state = SessionState::AuthFailed;
                Err(err)
            }
        }
    }

    async fn fetch_saved_items(
        &mut self,
        _ctx: &SourceContext,
        limit: usize,
    ) -> Result<Vec<NormalizedItem>, FetchError> {
        if self.state != SessionState::Authenticated {
            return Err(FetchError::NotAuthenticated);
        }

        let mut items = Vec::new();
        let mut identities: HashSet<String> = HashSet::new();
        let mut idle_scrolls = 0u32;

        for scroll in 0..self.settings.max_scrolls {
            if identities.len() >= limit {
                break;
            }
            let batch = self.driver.next_batch().await?;
            let mut fresh = 0usize;
            for mut item in batch {
                if identities.len() >= limit {
                    break;
                }
                item.platform = self.platform.clone();
                let identity = item.external_id().or_else(|| item.canonical_url());
                if let Some(identity) = identity {
                    if identities.insert(identity.to_string()) {
                        fresh += 1;
                    }
                }
                items.push(item);
            }

            if fresh == 0 {
                idle_scrolls += 1;
                if idle_scrolls >= self.settings.max_idle_scrolls {
                    debug!(platform = %self.platform, scroll, "no new content, stopping");
                    break;
                }
            } else {
                idle_scrolls = 0;
            }
        }

        Ok(items)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.state = SessionState::NoSession;
        if self.opened {
            self.opened = false;
            self.driver.shutdown().await?;
        }
        Ok(())
    }
}
