//! Offline source backed by a JSON array of items on disk.

use std::path::PathBuf;

use async_trait::async_trait;
use stash_core::{normalize_platform, NormalizedItem};
use tokio::fs;
use tracing::debug;

use crate::{AccessMethod, AuthError, AuthMode, FetchError, Source, SourceContext, SourceError};

pub struct FixtureSource {
    platform: String,
    path: PathBuf,
    loaded: Option<Vec<NormalizedItem>>,
}

impl FixtureSource {
    pub fn new(platform: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            platform: normalize_platform(platform),
            path: path.into(),
            loaded: None,
        }
    }
}

#[async_trait]
impl Source for FixtureSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn access_method(&self) -> AccessMethod {
        AccessMethod::Fixture
    }

    async fn authenticate(&mut self, _ctx: &SourceContext) -> Result<AuthMode, AuthError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::MissingCredentials(format!(
                    "fixture {} not found",
                    self.path.display()
                )))
            }
            Err(err) => {
                return Err(AuthError::Rejected(format!(
                    "reading fixture {}: {err}",
                    self.path.display()
                )))
            }
        };
        let items: Vec<NormalizedItem> = serde_json::from_str(&text).map_err(|err| {
            AuthError::Rejected(format!("parsing fixture {}: {err}", self.path.display()))
        })?;
        debug!(platform = %self.platform, items = items.len(), "fixture loaded");
        self.loaded = Some(items);
        Ok(AuthMode::Full)
    }

    async fn fetch_saved_items(
        &mut self,
        _ctx: &SourceContext,
        limit: usize,
    ) -> Result<Vec<NormalizedItem>, FetchError> {
        let items = self.loaded.as_ref().ok_or(FetchError::NotAuthenticated)?;
        Ok(items
            .iter()
            .take(limit)
            .cloned()
            .map(|mut item| {
                item.platform = self.platform.clone();
                item
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.loaded = None;
        Ok(())
    }
}
