//! Persistence and diff store.
//!
//! Two tables: `urls` (one row per normalized URL, doubling as conditional-GET
//! state for polled resources) and `url_by_source` (one row per `(source_id,
//! url)` pair, the unit the diff queries operate over).

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    base TEXT,
    cfg_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS urls (
    url TEXT PRIMARY KEY,
    canonical TEXT,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    discovered_via TEXT,
    http_status INTEGER,
    lastmod TEXT,
    etag TEXT
);

CREATE INDEX IF NOT EXISTS idx_urls_last_seen ON urls(last_seen);

CREATE TABLE IF NOT EXISTS url_by_source (
    source_id TEXT NOT NULL,
    url TEXT NOT NULL,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    PRIMARY KEY (source_id, url)
);

CREATE INDEX IF NOT EXISTS idx_ubs_last_seen ON url_by_source(last_seen);
CREATE INDEX IF NOT EXISTS idx_ubs_first_seen ON url_by_source(first_seen);
"#;

pub struct NewUrlRow {
    pub source_id: String,
    pub url: String,
    pub first_seen: i64,
    pub lastmod: Option<String>,
}

pub struct LatestUrlRow {
    pub source_id: String,
    pub url: String,
    pub last_seen: i64,
    pub lastmod: Option<String>,
}

#[derive(Default, Clone, Copy)]
pub struct SiteCounts {
    pub new_count: i64,
    pub total_seen: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `db_path`.
    pub async fn open(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create store parent directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open store database")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to initialize store schema")?;

        Ok(Self { pool })
    }

    pub async fn upsert_source(&self, id: &str, kind: &str, base: Option<&str>, cfg_json: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, kind, base, cfg_json)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                base = excluded.base,
                cfg_json = excluded.cfg_json
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(base)
        .bind(cfg_json)
        .execute(&self.pool)
        .await
        .context("failed to upsert source")?;
        Ok(())
    }

    /// Whether `url` (already normalized) is already present in the store.
    pub async fn contains_url(&self, url: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM urls WHERE url = ? LIMIT 1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .context("failed to check url existence")?;
        Ok(row.is_some())
    }

    /// `last_seen` of `url`'s `urls` row, if any — used by the crawl adapter's
    /// recrawl-TTL skip.
    pub async fn url_last_seen(&self, url: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT last_seen FROM urls WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read url last_seen")?;
        Ok(row.map(|(v,)| v))
    }

    /// Upsert both the `urls` row and its `(source_id, url)` pair in one transaction.
    ///
    /// Returns `true` if this is the first time this source has yielded this URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_discovery(
        &self,
        source_id: &str,
        url: &str,
        canonical: Option<&str>,
        discovered_via: Option<&str>,
        http_status: Option<i64>,
        lastmod: Option<&str>,
    ) -> Result<bool> {
        let now = now_epoch();
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO urls (url, canonical, first_seen, last_seen, discovered_via, http_status, lastmod, etag)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(url) DO UPDATE SET
                last_seen = excluded.last_seen,
                canonical = COALESCE(excluded.canonical, urls.canonical),
                discovered_via = COALESCE(excluded.discovered_via, urls.discovered_via),
                http_status = COALESCE(excluded.http_status, urls.http_status),
                lastmod = COALESCE(excluded.lastmod, urls.lastmod)
            "#,
        )
        .bind(url)
        .bind(canonical)
        .bind(now)
        .bind(now)
        .bind(discovered_via)
        .bind(http_status)
        .bind(lastmod)
        .execute(&mut *tx)
        .await
        .context("failed to upsert url")?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT first_seen FROM url_by_source WHERE source_id = ? AND url = ?",
        )
        .bind(source_id)
        .bind(url)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to read url_by_source")?;

        let is_new_pair = existing.is_none();

        sqlx::query(
            r#"
            INSERT INTO url_by_source (source_id, url, first_seen, last_seen)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_id, url) DO UPDATE SET
                last_seen = excluded.last_seen
            "#,
        )
        .bind(source_id)
        .bind(url)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("failed to upsert url_by_source")?;

        tx.commit().await.context("failed to commit discovery")?;
        Ok(is_new_pair)
    }

    pub async fn set_resource_etag_lastmod(
        &self,
        url: &str,
        etag: Option<&str>,
        lastmod: Option<&str>,
    ) -> Result<()> {
        let now = now_epoch();
        sqlx::query(
            r#"
            INSERT INTO urls (url, first_seen, last_seen, etag, lastmod)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                last_seen = excluded.last_seen,
                etag = COALESCE(excluded.etag, urls.etag),
                lastmod = COALESCE(excluded.lastmod, urls.lastmod)
            "#,
        )
        .bind(url)
        .bind(now)
        .bind(now)
        .bind(etag)
        .bind(lastmod)
        .execute(&self.pool)
        .await
        .context("failed to set resource etag/lastmod")?;
        Ok(())
    }

    /// `canonical` column of `url`'s `urls` row, if any.
    pub async fn canonical_for(&self, url: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as("SELECT canonical FROM urls WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read canonical")?;
        Ok(row.and_then(|(c,)| c))
    }

    pub async fn get_resource_etag_lastmod(&self, url: &str) -> Result<(Option<String>, Option<String>)> {
        let row: Option<(Option<String>, Option<String>)> =
            sqlx::query_as("SELECT etag, lastmod FROM urls WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read resource etag/lastmod")?;
        Ok(row.unwrap_or((None, None)))
    }

    /// `(source_id, url, first_seen, lastmod)` rows whose `first_seen` falls in `[start, end]`.
    pub async fn query_new_urls(&self, start: i64, end: i64) -> Result<Vec<NewUrlRow>> {
        let rows = sqlx::query(
            r#"
            SELECT ubs.source_id, ubs.url, ubs.first_seen, u.lastmod
            FROM url_by_source ubs
            JOIN urls u ON u.url = ubs.url
            WHERE ubs.first_seen >= ? AND ubs.first_seen <= ?
            ORDER BY ubs.first_seen ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("failed to query new urls")?;

        Ok(rows
            .into_iter()
            .map(|r| NewUrlRow {
                source_id: r.get("source_id"),
                url: r.get("url"),
                first_seen: r.get("first_seen"),
                lastmod: r.get("lastmod"),
            })
            .collect())
    }

    /// `(source_id, url, last_seen, lastmod)` rows whose `last_seen` is at or after `since`.
    pub async fn query_latest_all(&self, since: i64) -> Result<Vec<LatestUrlRow>> {
        let rows = sqlx::query(
            r#"
            SELECT ubs.source_id, ubs.url, ubs.last_seen, u.lastmod
            FROM url_by_source ubs
            JOIN urls u ON u.url = ubs.url
            WHERE ubs.last_seen >= ?
            ORDER BY ubs.last_seen ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to query latest urls")?;

        Ok(rows
            .into_iter()
            .map(|r| LatestUrlRow {
                source_id: r.get("source_id"),
                url: r.get("url"),
                last_seen: r.get("last_seen"),
                lastmod: r.get("lastmod"),
            })
            .collect())
    }

    /// `new_count` = pairs where `first_seen == last_seen` (approximate "new" predicate,
    /// accepted as imperfect: a pair re-observed within the same second also counts).
    pub async fn counts_for_site(&self, source_id: &str) -> Result<SiteCounts> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE first_seen = last_seen),
                COUNT(*)
            FROM url_by_source
            WHERE source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count site totals")?;

        Ok(SiteCounts {
            new_count: row.0,
            total_seen: row.1,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn upsert_then_query_new_urls() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(&dir.path().join("urls.db")).await?;
        store.upsert_source("s1", "crawl", Some("https://example.com"), "{}").await?;

        let before = now_epoch();
        let is_new = store
            .record_discovery("s1", "https://example.com/a", None, Some("crawl"), Some(200), None)
            .await?;
        assert!(is_new);
        let after = now_epoch();

        let rows = store.query_new_urls(before, after).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].url, "https://example.com/a");

        let counts = store.counts_for_site("s1").await?;
        assert_eq!(counts.total_seen, 1);
        assert_eq!(counts.new_count, 1);

        store.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn reobservation_is_not_new() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(&dir.path().join("urls.db")).await?;
        store.upsert_source("s1", "crawl", None, "{}").await?;

        let is_new1 = store
            .record_discovery("s1", "https://example.com/a", None, None, None, None)
            .await?;
        assert!(is_new1);

        let is_new2 = store
            .record_discovery("s1", "https://example.com/a", None, None, None, None)
            .await?;
        assert!(!is_new2);

        store.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn coalesce_preserves_existing_lastmod_on_null_update() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(&dir.path().join("urls.db")).await?;
        store.upsert_source("s1", "rss", None, "{}").await?;

        store
            .record_discovery("s1", "https://example.com/a", None, None, None, Some("2024-01-01"))
            .await?;
        store
            .record_discovery("s1", "https://example.com/a", None, None, None, None)
            .await?;

        let rows = store.query_latest_all(0).await?;
        assert_eq!(rows[0].lastmod.as_deref(), Some("2024-01-01"));

        store.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn record_discovery_persists_canonical() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(&dir.path().join("urls.db")).await?;
        store.upsert_source("s1", "crawl", None, "{}").await?;

        store
            .record_discovery(
                "s1",
                "https://example.com/a",
                Some("https://example.com/canonical-a"),
                Some("crawl"),
                Some(200),
                None,
            )
            .await?;

        assert_eq!(
            store.canonical_for("https://example.com/a").await?.as_deref(),
            Some("https://example.com/canonical-a")
        );

        store.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn contains_url_reflects_prior_inserts() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(&dir.path().join("urls.db")).await?;
        store.upsert_source("s1", "crawl", None, "{}").await?;

        assert!(!store.contains_url("https://example.com/a").await?);
        store
            .record_discovery("s1", "https://example.com/a", None, None, None, None)
            .await?;
        assert!(store.contains_url("https://example.com/a").await?);

        store.close().await;
        Ok(())
    }
}
