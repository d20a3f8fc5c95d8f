//! Credentialed-API source: an authenticated client object obtained from
//! client keys plus (optionally) account credentials.
//!
//! With account credentials the source verifies the account identity and can
//! page through saved items. With only client keys it validates connectivity
//! and runs in read-only mode, where saved items are out of reach.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stash_core::{normalize_platform, NormalizedItem};
use tracing::{debug, info, warn};

use crate::rest::RestApiSpec;
use crate::session::LoginCredentials;
use crate::{AccessMethod, AuthError, AuthMode, FetchError, Source, SourceContext, SourceError};

#[derive(Clone)]
pub struct ClientKey {
    pub id: String,
    pub secret: String,
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKey")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialTier {
    /// Client keys and account login.
    Full,
    ClientOnly,
    Missing,
}

#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub client: Option<ClientKey>,
    pub account: Option<LoginCredentials>,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ApiCredentials {
    /// Reads the variables named by `spec`. Blank values count as unset.
    pub fn from_env(spec: &RestApiSpec) -> Self {
        let client = match (env_value(&spec.client_id_env), env_value(&spec.client_secret_env)) {
            (Some(id), Some(secret)) => Some(ClientKey { id, secret }),
            _ => None,
        };
        let username = spec.username_env.as_deref().and_then(env_value);
        let password = spec.password_env.as_deref().and_then(env_value);
        let account = match (username, password) {
            (Some(username), Some(password)) => Some(LoginCredentials { username, password }),
            _ => None,
        };
        Self { client, account }
    }

    pub fn tier(&self) -> CredentialTier {
        match (&self.client, &self.account) {
            (Some(_), Some(_)) => CredentialTier::Full,
            (Some(_), None) => CredentialTier::ClientOnly,
            (None, _) => CredentialTier::Missing,
        }
    }
}

#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One page of saved items plus the cursor for the next page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedPage {
    #[serde(default)]
    pub items: Vec<NormalizedItem>,
    #[serde(default)]
    pub after: Option<String>,
}

/// Wire-level operations of a platform API.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn password_grant(
        &self,
        key: &ClientKey,
        account: &LoginCredentials,
    ) -> Result<AccessToken, AuthError>;

    async fn client_credentials_grant(&self, key: &ClientKey) -> Result<AccessToken, AuthError>;

    /// Returns the account name the token belongs to.
    async fn verify_identity(&self, token: &AccessToken) -> Result<String, AuthError>;

    async fn saved_page(
        &self,
        token: &AccessToken,
        account: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<SavedPage, FetchError>;

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiAuthState {
    Unauthenticated,
    /// Token issued, identity not yet verified.
    TokenAuth,
    Authenticated,
    ReadOnly,
    AuthFailed,
}

pub struct CredentialedApiSource<C> {
    platform: String,
    client: C,
    credentials: ApiCredentials,
    page_size: usize,
    state: ApiAuthState,
    token: Option<AccessToken>,
    account: Option<String>,
}

impl<C: ApiClient> CredentialedApiSource<C> {
    pub fn new(platform: &str, client: C, credentials: ApiCredentials) -> Self {
        Self {
            platform: normalize_platform(platform),
            client,
            credentials,
            page_size: 100,
            state: ApiAuthState::Unauthenticated,
            token: None,
            account: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn state(&self) -> ApiAuthState {
        self.state
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn establish(&mut self) -> Result<AuthMode, AuthError> {
        match (&self.credentials.client, &self.credentials.account) {
            (Some(key), Some(account)) => {
                let token = self.client.password_grant(key, account).await?;
                self.state = ApiAuthState::TokenAuth;
                let identity = self.client.verify_identity(&token).await?;
                info!(platform = %self.platform, account = %identity, "api session authenticated");
                self.token = Some(token);
                self.account = Some(identity);
                self.state = ApiAuthState::Authenticated;
                Ok(AuthMode::Full)
            }
            (Some(key), None) => {
                let token = self.client.client_credentials_grant(key).await?;
                warn!(
                    platform = %self.platform,
                    "no account credentials; running read-only, saved items unavailable"
                );
                self.token = Some(token);
                self.state = ApiAuthState::ReadOnly;
                Ok(AuthMode::ReadOnly)
            }
            (None, _) => Err(AuthError::MissingCredentials(format!(
                "client id and secret are required for {}",
                self.platform
            ))),
        }
    }
}

#[async_trait]
impl<C: ApiClient> Source for CredentialedApiSource<C> {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn access_method(&self) -> AccessMethod {
        AccessMethod::CredentialedApi
    }

    async fn authenticate(&mut self, _ctx: &SourceContext) -> Result<AuthMode, AuthError> {
        self.state = ApiAuthState::Unauthenticated;
        self.token = None;
        self.account = None;
        match self.establish().await {
            Ok(mode) => Ok(mode),
            Err(err) => {
                self.state = ApiAuthState::AuthFailed;
                self.token = None;
                Err(err)
            }
        }
    }

    async fn fetch_saved_items(
        &mut self,
        _ctx: &SourceContext,
        limit: usize,
    ) -> Result<Vec<NormalizedItem>, FetchError> {
        match self.state {
            ApiAuthState::Authenticated => {}
            ApiAuthState::ReadOnly => {
                debug!(platform = %self.platform, "read-only session, no saved items");
                return Ok(Vec::new());
            }
            _ => return Err(FetchError::NotAuthenticated),
        }
        let (Some(token), Some(account)) = (self.token.as_ref(), self.account.as_deref()) else {
            return Err(FetchError::NotAuthenticated);
        };

        let mut items = Vec::new();
        let mut after: Option<String> = None;
        while items.len() < limit {
            let want = (limit - items.len()).min(self.page_size);
            let page = self
                .client
                .saved_page(token, account, after.as_deref(), want)
                .await?;
            if page.items.is_empty() {
                break;
            }
            items.extend(page.items.into_iter().take(want).map(|mut item| {
                item.platform = self.platform.clone();
                item
            }));
            match page.after {
                Some(next) if !next.is_empty() => after = Some(next),
                _ => break,
            }
        }
        debug!(platform = %self.platform, items = items.len(), "saved items paged");
        Ok(items)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.token = None;
        self.account = None;
        self.state = ApiAuthState::Unauthenticated;
        self.client.close().await
    }
}
