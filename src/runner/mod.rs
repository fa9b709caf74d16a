//! Per-site worker pool and run orchestration.

pub mod reports;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::Semaphore;

use crate::adapters::{build_adapter, AdapterContext, Counters};
use crate::config::{RunConfig, SiteConfig};
use crate::http::HttpClient;
use crate::normalize::normalize_url;
use crate::rate_limiter::RateLimiter;
use crate::resolver::resolve_canonical_once;
use crate::robots::RobotsCache;
use crate::store::Store;
use futures::StreamExt;

pub struct SiteOutcome {
    pub site_id: String,
    pub counters: Counters,
}

pub struct RunSummary {
    pub run_start: i64,
    pub run_end: i64,
    pub outcomes: Vec<SiteOutcome>,
}

/// Run the harvest: load sites, spawn one worker per site bounded by
/// `config.concurrency()`, wait for all to finish, then return the window
/// and per-site counters for report emission.
pub async fn run(config: RunConfig) -> Result<RunSummary> {
    let sites = crate::config::load_sites(config.sites_path())
        .context("failed to load site configuration")?;

    let db_path = config.out_dir().join("urls.db");
    let bootstrap_store = Store::open(&db_path).await?;
    for site in &sites {
        bootstrap_store
            .upsert_source(site.id(), site.kind().as_str(), site.base(), &site.cfg_json())
            .await?;
    }
    bootstrap_store.close().await;

    let http = Arc::new(HttpClient::new("LinkHarvest/1.0").context("failed to build http client")?);
    let robots = Arc::new(RobotsCache::new(http.inner().clone()));
    let rate_limiter = Arc::new(RateLimiter::new());
    let semaphore = Arc::new(Semaphore::new(config.concurrency()));

    let run_start = chrono::Utc::now().timestamp();

    let mut tasks = Vec::new();
    for site in sites {
        let http = http.clone();
        let robots = robots.clone();
        let rate_limiter = rate_limiter.clone();
        let semaphore = semaphore.clone();
        let db_path = db_path.clone();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            run_site(site, http, robots, rate_limiter, db_path).await
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(err)) => error!("site worker failed: {err:#}"),
            Err(err) => error!("site worker panicked: {err}"),
        }
    }

    let run_end = chrono::Utc::now().timestamp();

    Ok(RunSummary {
        run_start,
        run_end,
        outcomes,
    })
}

async fn run_site(
    site: SiteConfig,
    http: Arc<HttpClient>,
    robots: Arc<RobotsCache>,
    rate_limiter: Arc<RateLimiter>,
    db_path: std::path::PathBuf,
) -> Result<SiteOutcome> {
    let site_id = site.id().to_string();
    info!("[{site_id}] start kind={}", site.kind().as_str());

    let store = Arc::new(Store::open(&db_path).await?);
    let ctx = AdapterContext::new(http, robots, rate_limiter, store.clone(), site.clone());
    let adapter = build_adapter(&site);

    let mut stream = adapter.discover(&ctx);
    while let Some(item) = stream.next().await {
        if let Err(err) = handle_discovered(&ctx, &item).await {
            error!("[{site_id}] failed to persist discovery for {}: {err:#}", item.url);
            ctx.counters.lock().await.errors += 1;
        }
    }
    drop(stream);
    let counters = ctx.counters.into_inner();

    info!(
        "[{site_id}] metrics: fetched={} parsed={} discovered={} inserted={} skipped_robots={} errors={}",
        counters.fetched, counters.parsed, counters.discovered, counters.inserted, counters.skipped_robots, counters.errors
    );

    store.close().await;
    Ok(SiteOutcome { site_id, counters })
}

async fn handle_discovered(
    ctx: &AdapterContext,
    item: &crate::adapters::Discovered,
) -> Result<()> {
    let naive = normalize_url(&item.url);

    let (final_url, canonical) = if ctx.store.contains_url(&naive).await? {
        (naive, None)
    } else if let Ok(parsed) = url::Url::parse(&item.url) {
        let resolved = resolve_canonical_once(
            &parsed,
            &ctx.http,
            &ctx.robots,
            &ctx.rate_limiter,
            ctx.site.rate_limit_rps(),
            ctx.site.user_agent(),
        )
        .await;
        let canonical = resolved.canonical.as_deref().map(normalize_url);
        let candidate = canonical
            .clone()
            .unwrap_or_else(|| normalize_url(&resolved.resolved));
        (candidate, canonical)
    } else {
        (naive, None)
    };

    let is_new = ctx
        .store
        .record_discovery(
            ctx.site.id(),
            &final_url,
            canonical.as_deref(),
            Some(item.source),
            None,
            item.lastmod.as_deref(),
        )
        .await?;

    if is_new {
        ctx.counters.lock().await.inserted += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Discovered;

    fn site(base: &str) -> SiteConfig {
        let yaml = format!("id: s\nkind: crawl\nbase: \"{base}\"\n");
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn handle_discovered_persists_resolved_canonical() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/post")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(r#"<link rel="canonical" href="https://example.com/canonical-post">"#)
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let ctx = AdapterContext::new(
            Arc::new(HttpClient::new("LinkHarvest/1.0").unwrap()),
            Arc::new(RobotsCache::new(reqwest::Client::new())),
            Arc::new(RateLimiter::new()),
            Arc::new(Store::open(&dir.path().join("u.db")).await.unwrap()),
            site(&server.url()),
        );

        let item = Discovered {
            url: format!("{}/post", server.url()),
            lastmod: None,
            source: "crawl",
        };

        handle_discovered(&ctx, &item).await.unwrap();

        let canonical = ctx
            .store
            .canonical_for("https://example.com/canonical-post")
            .await
            .unwrap();
        assert_eq!(canonical.as_deref(), Some("https://example.com/canonical-post"));
        assert_eq!(ctx.counters.lock().await.inserted, 1);
    }
}
