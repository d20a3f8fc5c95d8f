//! SQLite-backed [`FingerprintStore`].
//!
//! Two tables: `seen_items` keyed by `(platform, fingerprint)` with a secondary
//! `(platform, url)` index, and `platform_state` keyed by platform. Timestamps are
//! Unix milliseconds.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use stash_core::{normalize_platform, Fingerprint, ItemCursor, PlatformState};
use tracing::debug;

use crate::{FingerprintStore, ResetScope, SeenDetails, StoreError};

pub struct SqliteFingerprintStore {
    pool: SqlitePool,
}

impl SqliteFingerprintStore {
    /// Open (creating if missing) a WAL-mode database file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.display(), "opened fingerprint store");
        Ok(store)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_items (
                platform TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                url TEXT,
                title TEXT,
                author TEXT,
                seen_at INTEGER NOT NULL,
                PRIMARY KEY (platform, fingerprint)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_seen_items_url ON seen_items(platform, url)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_seen_items_seen_at ON seen_items(seen_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS platform_state (
                platform TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                consecutive_failures INTEGER NOT NULL,
                success_rate REAL NOT NULL,
                last_attempt_at INTEGER,
                last_success_at INTEGER,
                next_eligible_at INTEGER NOT NULL,
                last_failure_reason TEXT NOT NULL DEFAULT '',
                last_item_id TEXT,
                last_item_url TEXT,
                total_new_items INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn ts_from_millis(platform: &str, column: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        platform: platform.to_string(),
        detail: format!("{column} out of range: {ms}"),
    })
}

fn state_from_row(row: &SqliteRow) -> Result<PlatformState, StoreError> {
    let platform: String = row.try_get("platform")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    let consecutive_failures = u32::try_from(failures).map_err(|_| StoreError::Corrupt {
        platform: platform.clone(),
        detail: format!("consecutive_failures out of range: {failures}"),
    })?;
    let total: i64 = row.try_get("total_new_items")?;

    let last_attempt_at = row
        .try_get::<Option<i64>, _>("last_attempt_at")?
        .map(|ms| ts_from_millis(&platform, "last_attempt_at", ms))
        .transpose()?;
    let last_success_at = row
        .try_get::<Option<i64>, _>("last_success_at")?
        .map(|ms| ts_from_millis(&platform, "last_success_at", ms))
        .transpose()?;
    let next_eligible_at = ts_from_millis(
        &platform,
        "next_eligible_at",
        row.try_get("next_eligible_at")?,
    )?;

    let last_item_id: Option<String> = row.try_get("last_item_id")?;
    let last_item_url: Option<String> = row.try_get("last_item_url")?;
    let last_item = if last_item_id.is_some() || last_item_url.is_some() {
        Some(ItemCursor {
            external_id: last_item_id,
            url: last_item_url,
        })
    } else {
        None
    };

    Ok(PlatformState {
        enabled: row.try_get("enabled")?,
        consecutive_failures,
        success_rate: row.try_get("success_rate")?,
        last_attempt_at,
        last_success_at,
        next_eligible_at,
        last_failure_reason: row.try_get("last_failure_reason")?,
        last_item,
        total_new_items: total.max(0) as u64,
        platform,
    })
}

const STATE_COLUMNS: &str = "platform, enabled, consecutive_failures, success_rate, \
     last_attempt_at, last_success_at, next_eligible_at, last_failure_reason, \
     last_item_id, last_item_url, total_new_items";

#[async_trait]
impl FingerprintStore for SqliteFingerprintStore {
    async fn has_seen(&self, platform: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM seen_items WHERE platform = ? AND fingerprint = ?")
            .bind(normalize_platform(platform))
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn has_seen_url(&self, platform: &str, url: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM seen_items WHERE platform = ? AND url = ? LIMIT 1")
            .bind(normalize_platform(platform))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn mark_seen(
        &self,
        platform: &str,
        fingerprint: &Fingerprint,
        details: SeenDetails<'_>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO seen_items (platform, fingerprint, url, title, author, seen_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform, fingerprint) DO NOTHING
            "#,
        )
        .bind(normalize_platform(platform))
        .bind(fingerprint.as_str())
        .bind(details.url)
        .bind(details.title)
        .bind(details.author)
        .bind(details.seen_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_seen(&self, platform: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM seen_items WHERE platform = ?")
            .bind(normalize_platform(platform))
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(count.max(0) as u64)
    }

    async fn seen_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query("SELECT platform, COUNT(*) AS n FROM seen_items GROUP BY platform")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let platform: String = row.try_get("platform")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(platform, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn load_platform_state(
        &self,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<PlatformState, StoreError> {
        let key = normalize_platform(platform);
        let defaults = PlatformState::new(&key, now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO platform_state
                (platform, enabled, consecutive_failures, success_rate, next_eligible_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(platform) DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(defaults.enabled)
        .bind(defaults.consecutive_failures as i64)
        .bind(defaults.success_rate)
        .bind(defaults.next_eligible_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM platform_state WHERE platform = ?"
        ))
        .bind(&key)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        state_from_row(&row)
    }

    async fn save_platform_state(&self, state: &PlatformState) -> Result<(), StoreError> {
        let (last_item_id, last_item_url) = match &state.last_item {
            Some(cursor) => (cursor.external_id.as_deref(), cursor.url.as_deref()),
            None => (None, None),
        };
        sqlx::query(&format!(
            r#"
            INSERT INTO platform_state ({STATE_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform) DO UPDATE SET
                enabled = excluded.enabled,
                consecutive_failures = excluded.consecutive_failures,
                success_rate = excluded.success_rate,
                last_attempt_at = excluded.last_attempt_at,
                last_success_at = excluded.last_success_at,
                next_eligible_at = excluded.next_eligible_at,
                last_failure_reason = excluded.last_failure_reason,
                last_item_id = excluded.last_item_id,
                last_item_url = excluded.last_item_url,
                total_new_items = excluded.total_new_items
            "#
        ))
        .bind(normalize_platform(&state.platform))
        .bind(state.enabled)
        .bind(state.consecutive_failures as i64)
        .bind(state.success_rate)
        .bind(state.last_attempt_at.map(|t| t.timestamp_millis()))
        .bind(state.last_success_at.map(|t| t.timestamp_millis()))
        .bind(state.next_eligible_at.timestamp_millis())
        .bind(&state.last_failure_reason)
        .bind(last_item_id)
        .bind(last_item_url)
        .bind(i64::try_from(state.total_new_items).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_platform_states(&self) -> Result<Vec<PlatformState>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM platform_state ORDER BY platform"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn reset_platform(&self, platform: &str, scope: ResetScope) -> Result<(), StoreError> {
        let key = normalize_platform(platform);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM platform_state WHERE platform = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        if scope == ResetScope::Everything {
            sqlx::query("DELETE FROM seen_items WHERE platform = ?")
                .bind(&key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn prune_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM seen_items WHERE seen_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
