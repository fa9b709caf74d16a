//! WordPress REST API pagination adapter.
//!
//! Pages `{base}/wp-json/wp/v2/posts?per_page=100&_fields=link,modified&orderby=date&page=N`
//! until a 304 (stop, all subsequent pages also unchanged), a 400/404 (end of
//! pagination), any other non-200 status, or an empty/unparseable page.

use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use url::Url;

use super::{Adapter, AdapterContext, Discovered};

pub struct WordpressAdapter;

const PER_PAGE: u32 = 100;

struct PageState {
    page: u32,
    max_pages: u32,
    done: bool,
}

impl Adapter for WordpressAdapter {
    fn discover<'a>(&'a self, ctx: &'a AdapterContext) -> BoxStream<'a, Discovered> {
        let initial = PageState {
            page: 1,
            max_pages: ctx.site.max_pages() as u32,
            done: false,
        };
        stream::unfold(initial, move |state| async move {
            if state.done || state.page > state.max_pages {
                return None;
            }
            let items = fetch_page(ctx, state.page).await;
            let next = PageState {
                page: state.page + 1,
                max_pages: state.max_pages,
                done: items.is_none(),
            };
            Some((items.unwrap_or_default(), next))
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

async fn fetch_page(ctx: &AdapterContext, page: u32) -> Option<Vec<Discovered>> {
    let base = ctx.site.base()?.trim_end_matches('/');
    let endpoint = format!(
        "{base}/wp-json/wp/v2/posts?per_page={PER_PAGE}&_fields=link,modified&orderby=date&page={page}"
    );
    let url = Url::parse(&endpoint).ok()?;

    if !ctx.preflight(&url).await {
        return None;
    }

    let (etag, lastmod) = ctx.store.get_resource_etag_lastmod(url.as_str()).await.ok()?;

    let resp = match ctx
        .http
        .get(
            url.as_str(),
            etag.as_deref(),
            lastmod.as_deref(),
            None,
            3,
            Some(ctx.site.user_agent()),
        )
        .await
    {
        Ok(r) => r,
        Err(err) => {
            warn!("wordpress fetch failed for {url}: {err}");
            ctx.counters.lock().await.errors += 1;
            return None;
        }
    };

    ctx.counters.lock().await.fetched += 1;
    let status = resp.status().as_u16();
    ctx.counters.lock().await.record_status(status);

    if status == 304 {
        debug!("wordpress page {page} not modified, stopping pagination for {base}");
        return None;
    }
    if status == 400 || status == 404 {
        debug!("wordpress page {page} returned {status}, end of pagination for {base}");
        return None;
    }
    if !resp.status().is_success() {
        warn!("wordpress page {page} returned {status} for {base}");
        ctx.counters.lock().await.errors += 1;
        return None;
    }

    let new_etag = resp
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let new_lastmod = resp
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = resp.text().await.ok()?;
    let items: Vec<serde_json::Value> = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(err) => {
            warn!("wordpress page {page} JSON parse failed for {base}: {err}");
            ctx.counters.lock().await.errors += 1;
            return None;
        }
    };

    if items.is_empty() {
        return None;
    }

    ctx.store
        .set_resource_etag_lastmod(url.as_str(), new_etag.as_deref(), new_lastmod.as_deref())
        .await
        .ok();

    ctx.counters.lock().await.parsed += 1;

    let discovered: Vec<Discovered> = items
        .iter()
        .filter_map(|item| {
            let link = item.get("link")?.as_str()?.to_string();
            let modified = item
                .get("modified")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(Discovered {
                url: link,
                lastmod: modified,
                source: "api",
            })
        })
        .collect();

    ctx.counters.lock().await.discovered += discovered.len() as u64;
    Some(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::http::HttpClient;
    use crate::rate_limiter::RateLimiter;
    use crate::robots::RobotsCache;
    use crate::store::Store;
    use futures::StreamExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn site_config(base: &str) -> SiteConfig {
        let yaml = format!(
            "id: wp\nkind: wordpress\nbase: \"{base}\"\n"
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn site_config_with_max_pages(base: &str, max_pages: u32) -> SiteConfig {
        let yaml = format!(
            "id: wp\nkind: wordpress\nbase: \"{base}\"\nmax_pages: {max_pages}\n"
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn stops_pagination_on_404() {
        let mut server = mockito::Server::new_async().await;
        let page1_body = serde_json::json!([
            {"link": format!("{}/post-1", server.url()), "modified": "2024-01-01T00:00:00"},
            {"link": format!("{}/post-2", server.url()), "modified": "2024-01-02T00:00:00"},
        ]);
        let _m1 = server
            .mock("GET", mockito::Matcher::Regex(r"^/wp-json/wp/v2/posts.*page=1.*".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(page1_body.to_string())
            .create_async()
            .await;
        let _m2 = server
            .mock("GET", mockito::Matcher::Regex(r"^/wp-json/wp/v2/posts.*page=2.*".into()))
            .with_status(404)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let ctx = AdapterContext::new(
            Arc::new(HttpClient::new("LinkHarvest/1.0").unwrap()),
            Arc::new(RobotsCache::new(reqwest::Client::new())),
            Arc::new(RateLimiter::new()),
            Arc::new(Store::open(&dir.path().join("urls.db")).await.unwrap()),
            site_config(&server.url()),
        );

        let results: Vec<Discovered> = WordpressAdapter.discover(&ctx).collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(ctx.counters.lock().await.errors, 0);
    }

    #[tokio::test]
    async fn stops_at_configured_max_pages_even_if_still_200() {
        let mut server = mockito::Server::new_async().await;
        let page_body = serde_json::json!([
            {"link": format!("{}/post", server.url()), "modified": "2024-01-01T00:00:00"},
        ]);
        let _m = server
            .mock("GET", mockito::Matcher::Regex(r"^/wp-json/wp/v2/posts.*".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(page_body.to_string())
            .expect(2)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let ctx = AdapterContext::new(
            Arc::new(HttpClient::new("LinkHarvest/1.0").unwrap()),
            Arc::new(RobotsCache::new(reqwest::Client::new())),
            Arc::new(RateLimiter::new()),
            Arc::new(Store::open(&dir.path().join("urls.db")).await.unwrap()),
            site_config_with_max_pages(&server.url(), 2),
        );

        let results: Vec<Discovered> = WordpressAdapter.discover(&ctx).collect().await;
        assert_eq!(results.len(), 2);
        _m.assert_async().await;
    }
}
