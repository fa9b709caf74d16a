//! Output artifact writers: `new.ndjson`, `new.csv`, `per_site_counts.csv`,
//! `latest_all.csv`, and `run.log`.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::store::Store;

use super::RunSummary;

#[derive(Serialize)]
struct NewUrlRecord<'a> {
    site_id: &'a str,
    url: &'a str,
    first_seen: i64,
    lastmod: Option<&'a str>,
}

fn iso(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// Write `new.ndjson` and `new.csv` from the store's `query_new_urls` over the
/// run window (or `[now-since, now]` when the caller passed `--since`).
pub async fn write_new_url_reports(store: &Store, out_dir: &Path, start: i64, end: i64) -> Result<()> {
    let rows = store.query_new_urls(start, end).await?;

    let ndjson_path = out_dir.join("new.ndjson");
    let mut ndjson = std::fs::File::create(&ndjson_path)
        .with_context(|| format!("failed to create {}", ndjson_path.display()))?;
    for row in &rows {
        let record = NewUrlRecord {
            site_id: &row.source_id,
            url: &row.url,
            first_seen: row.first_seen,
            lastmod: row.lastmod.as_deref(),
        };
        writeln!(ndjson, "{}", serde_json::to_string(&record)?)?;
    }

    let csv_path = out_dir.join("new.csv");
    let mut writer = csv::Writer::from_path(&csv_path)
        .with_context(|| format!("failed to create {}", csv_path.display()))?;
    writer.write_record(["site_id", "url", "first_seen_iso", "lastmod"])?;
    for row in &rows {
        writer.write_record([
            row.source_id.as_str(),
            row.url.as_str(),
            &iso(row.first_seen),
            row.lastmod.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;

    Ok(())
}

/// Write `per_site_counts.csv` from each site's end-of-run counters joined
/// with the store's `counts_for_site`.
pub async fn write_per_site_counts(store: &Store, out_dir: &Path, summary: &RunSummary) -> Result<()> {
    let csv_path = out_dir.join("per_site_counts.csv");
    let mut writer = csv::Writer::from_path(&csv_path)
        .with_context(|| format!("failed to create {}", csv_path.display()))?;
    writer.write_record(["site_id", "new_count", "total_seen", "errors"])?;

    for outcome in &summary.outcomes {
        let counts = store.counts_for_site(&outcome.site_id).await?;
        writer.write_record([
            outcome.site_id.as_str(),
            &counts.new_count.to_string(),
            &counts.total_seen.to_string(),
            &outcome.counters.errors.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `latest_all.csv` from `query_latest_all(since)` — only emitted when
/// the run was given an explicit `--since` window.
pub async fn write_latest_all(store: &Store, out_dir: &Path, since: i64) -> Result<()> {
    let rows = store.query_latest_all(since).await?;
    let csv_path = out_dir.join("latest_all.csv");
    let mut writer = csv::Writer::from_path(&csv_path)
        .with_context(|| format!("failed to create {}", csv_path.display()))?;
    writer.write_record(["site_id", "url", "last_seen_iso", "lastmod"])?;
    for row in rows {
        writer.write_record([
            row.source_id.as_str(),
            row.url.as_str(),
            &iso(row.last_seen),
            row.lastmod.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `run.log`: one start/metrics line pair per site.
pub fn write_run_log(out_dir: &Path, summary: &RunSummary) -> Result<()> {
    let log_path = out_dir.join("run.log");
    let mut file = std::fs::File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    for outcome in &summary.outcomes {
        let c = &outcome.counters;
        writeln!(
            file,
            "[{}] metrics: fetched={} parsed={} discovered={} inserted={} skipped_robots={} errors={}",
            outcome.site_id, c.fetched, c.parsed, c.discovered, c.inserted, c.skipped_robots, c.errors
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn iso_formats_epoch_as_utc() {
        assert_eq!(iso(0), "1970-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn writes_new_url_reports() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(&dir.path().join("u.db")).await?;
        store.upsert_source("s1", "crawl", None, "{}").await?;
        store
            .record_discovery("s1", "https://example.com/a", None, None, None, Some("2024-01-01"))
            .await?;

        write_new_url_reports(&store, dir.path(), 0, chrono::Utc::now().timestamp() + 10).await?;
        let ndjson = std::fs::read_to_string(dir.path().join("new.ndjson"))?;
        assert!(ndjson.contains("https://example.com/a"));
        let csv = std::fs::read_to_string(dir.path().join("new.csv"))?;
        assert!(csv.contains("site_id,url,first_seen_iso,lastmod"));

        store.close().await;
        Ok(())
    }
}
