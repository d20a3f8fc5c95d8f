//! OAuth-style REST client for [`CredentialedApiSource`](crate::CredentialedApiSource).
//!
//! Token endpoint takes form-encoded grants with HTTP basic client auth. The
//! saved-items endpoint returns `{"items": [...], "after": "..."}` and may contain
//! a `{user}` placeholder that is replaced with the verified account name.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::api::{AccessToken, ApiClient, ClientKey, SavedPage};
use crate::session::LoginCredentials;
use crate::{AuthError, FetchError, SourceError};

fn default_user_agent() -> String {
    format!("stash-collector/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestApiSpec {
    pub token_url: String,
    pub identity_url: String,
    pub saved_url: String,
    pub client_id_env: String,
    pub client_secret_env: String,
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for RestApiSpec {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            identity_url: String::new(),
            saved_url: String::new(),
            client_id_env: String::new(),
            client_secret_env: String::new(),
            username_env: None,
            password_env: None,
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    #[serde(alias = "username", alias = "login")]
    name: String,
}

pub struct RestApiClient {
    client: reqwest::Client,
    spec: RestApiSpec,
}

impl RestApiClient {
    pub fn new(spec: &RestApiSpec) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(spec.request_timeout_secs.max(1)))
            .user_agent(spec.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            spec: spec.clone(),
        })
    }

    async fn grant(
        &self,
        key: &ClientKey,
        form: &[(&str, &str)],
    ) -> Result<AccessToken, AuthError> {
        let response = self
            .client
            .post(&self.spec.token_url)
            .basic_auth(&key.id, Some(&key.secret))
            .form(form)
            .send()
            .await
            .map_err(|err| auth_error_from_reqwest(&err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(auth_error_for_status(status));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Rejected(format!("token response: {err}")))?;
        if body.access_token.trim().is_empty() {
            return Err(AuthError::Rejected("token endpoint returned an empty token".into()));
        }
        Ok(AccessToken {
            value: body.access_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}

pub(crate) fn auth_error_for_status(status: StatusCode) -> AuthError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AuthError::Network(format!("http status {}", status.as_u16()))
    } else {
        AuthError::Rejected(format!("http status {}", status.as_u16()))
    }
}

pub(crate) fn auth_error_from_reqwest(err: &reqwest::Error) -> AuthError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AuthError::Network(err.to_string())
    } else {
        AuthError::Rejected(err.to_string())
    }
}

pub(crate) fn fetch_error_for_status(status: StatusCode) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::NotAuthenticated,
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
        s if s.is_server_error() => FetchError::Platform(format!("http status {}", s.as_u16())),
        s => FetchError::Rejected(format!("http status {}", s.as_u16())),
    }
}

pub(crate) fn fetch_error_from_reqwest(err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(err.to_string())
    } else if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else if err.is_connect() || err.is_request() {
        FetchError::Network(err.to_string())
    } else {
        FetchError::Platform(err.to_string())
    }
}

#[async_trait]
impl ApiClient for RestApiClient {
    async fn password_grant(
        &self,
        key: &ClientKey,
        account: &LoginCredentials,
    ) -> Result<AccessToken, AuthError> {
        self.grant(
            key,
            &[
                ("grant_type", "password"),
                ("username", account.username.as_str()),
                ("password", account.password.as_str()),
            ],
        )
        .await
    }

    async fn client_credentials_grant(&self, key: &ClientKey) -> Result<AccessToken, AuthError> {
        self.grant(key, &[("grant_type", "client_credentials")]).await
    }

    async fn verify_identity(&self, token: &AccessToken) -> Result<String, AuthError> {
        let response = self
            .client
            .get(&self.spec.identity_url)
            .bearer_auth(&token.value)
            .send()
            .await
            .map_err(|err| auth_error_from_reqwest(&err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(auth_error_for_status(status));
        }
        let identity: IdentityResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Rejected(format!("identity response: {err}")))?;
        Ok(identity.name)
    }

    async fn saved_page(
        &self,
        token: &AccessToken,
        account: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<SavedPage, FetchError> {
        let url = self.spec.saved_url.replace("{user}", account);
        let limit = limit.to_string();
        let mut query: Vec<(&str, &str)> = vec![("limit", limit.as_str())];
        if let Some(after) = after {
            query.push(("after", after));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token.value)
            .query(&query)
            .send()
            .await
            .map_err(|err| fetch_error_from_reqwest(&err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error_for_status(status));
        }
        response
            .json::<SavedPage>()
            .await
            .map_err(|err| fetch_error_from_reqwest(&err))
    }
}
