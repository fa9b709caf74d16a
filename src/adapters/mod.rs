//! Discovery adapters: one per site `kind`, each a lazy stream of
//! [`Discovered`] records pulling shared services from an [`AdapterContext`].

pub mod crawl;
pub mod rss;
pub mod sitemap;
pub mod wordpress;

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::config::SiteConfig;
use crate::http::HttpClient;
use crate::rate_limiter::RateLimiter;
use crate::robots::RobotsCache;
use crate::store::Store;

/// A URL discovered by an adapter, not yet normalized or persisted.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub url: String,
    pub lastmod: Option<String>,
    pub source: &'static str,
}

/// Per-site fetch/error counters, read by the runner after the adapter finishes.
#[derive(Debug, Default)]
pub struct Counters {
    pub fetched: u64,
    pub parsed: u64,
    pub discovered: u64,
    pub inserted: u64,
    pub skipped_robots: u64,
    pub errors: u64,
    pub status: HashMap<u16, u64>,
}

impl Counters {
    pub fn record_status(&mut self, status: u16) {
        *self.status.entry(status).or_insert(0) += 1;
    }
}

/// Shared services every adapter pulls from.
pub struct AdapterContext {
    pub http: Arc<HttpClient>,
    pub robots: Arc<RobotsCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub store: Arc<Store>,
    pub site: SiteConfig,
    pub counters: tokio::sync::Mutex<Counters>,
}

impl AdapterContext {
    pub fn new(
        http: Arc<HttpClient>,
        robots: Arc<RobotsCache>,
        rate_limiter: Arc<RateLimiter>,
        store: Arc<Store>,
        site: SiteConfig,
    ) -> Self {
        Self {
            http,
            robots,
            rate_limiter,
            store,
            site,
            counters: tokio::sync::Mutex::new(Counters::default()),
        }
    }

    /// robots + rate-limit preflight common to every adapter fetch.
    async fn preflight(&self, url: &url::Url) -> bool {
        if !self.robots.allowed(url, self.site.user_agent()).await {
            self.counters.lock().await.skipped_robots += 1;
            return false;
        }
        self.rate_limiter
            .await_slot(url, self.site.rate_limit_rps())
            .await;
        true
    }
}

/// Common implementation contract: discovery is a lazy stream.
pub trait Adapter {
    fn discover<'a>(&'a self, ctx: &'a AdapterContext) -> BoxStream<'a, Discovered>;
}

/// Construct the adapter appropriate for a site's configured `kind`.
///
/// `crawl` dispatches to the JS-render variant internally based on the
/// site's `js_render` flag rather than being a separate top-level kind.
pub fn build_adapter(site: &SiteConfig) -> Box<dyn Adapter + Send + Sync> {
    use crate::config::SourceKind;
    match site.kind() {
        SourceKind::Wordpress => Box::new(wordpress::WordpressAdapter),
        SourceKind::Rss => Box::new(rss::RssAdapter),
        SourceKind::Sitemap => Box::new(sitemap::SitemapAdapter),
        SourceKind::Crawl => Box::new(crawl::CrawlAdapter),
    }
}
