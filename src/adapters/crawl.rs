//! Recursive HTML crawl adapter, with a headless-render variant selected by
//! the site's `js_render` flag.

use std::collections::HashSet;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use log::warn;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::{Adapter, AdapterContext, Discovered};

pub struct CrawlAdapter;

struct Frontier {
    queue: std::collections::VecDeque<(String, u8)>,
    visited: HashSet<String>,
    rendered: usize,
}

impl Adapter for CrawlAdapter {
    fn discover<'a>(&'a self, ctx: &'a AdapterContext) -> BoxStream<'a, Discovered> {
        let Some(base) = ctx.site.base() else {
            return Box::pin(stream::empty());
        };
        let base = base.to_string();
        let max_depth = ctx.site.max_depth();

        let max_rendered_pages = ctx.site.max_rendered_pages();

        Box::pin(stream::unfold(
            Frontier {
                queue: std::collections::VecDeque::from([(base, 0u8)]),
                visited: HashSet::new(),
                rendered: 0,
            },
            move |mut frontier: Frontier| async move {
                loop {
                    let (url_str, depth) = frontier.queue.pop_front()?;
                    if frontier.visited.contains(&url_str) {
                        continue;
                    }
                    frontier.visited.insert(url_str.clone());

                    let Ok(url) = Url::parse(&url_str) else {
                        continue;
                    };
                    if !in_scope(&url, ctx) {
                        continue;
                    }

                    let allow_render = frontier.rendered < max_rendered_pages;
                    let page = process_one(ctx, &url, allow_render).await;
                    let Some((children, discovered, rendered_used)) = page else {
                        continue;
                    };
                    if rendered_used {
                        frontier.rendered += 1;
                    }

                    if depth < max_depth {
                        for child in children {
                            if in_scope(&child, ctx) && !frontier.visited.contains(child.as_str()) {
                                frontier.queue.push_back((child.to_string(), depth + 1));
                            }
                        }
                    }

                    if discovered.is_empty() {
                        continue;
                    }
                    return Some((discovered, frontier));
                }
            },
        )
        .flat_map(stream::iter))
    }
}

fn in_scope(url: &Url, ctx: &AdapterContext) -> bool {
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    if let Some(scope_host) = ctx.site.scope_host() {
        if url.host_str() != Some(scope_host) {
            return false;
        }
    }
    let include_paths = ctx.site.include_paths();
    if !include_paths.is_empty() && !include_paths.iter().any(|p| url.path().starts_with(p.as_str())) {
        return false;
    }
    for pattern in ctx.site.exclude_patterns() {
        if let Ok(re) = Regex::new(pattern) {
            if re.is_match(url.path()) {
                return false;
            }
        }
    }
    true
}

/// Fetch (or render) one URL, returning in-scope child links, this URL's own
/// `Discovered` record(s), and whether a headless render was actually used
/// (so the caller can charge it against `max_rendered_pages`). `None` on
/// robots/304/error.
async fn process_one(
    ctx: &AdapterContext,
    url: &Url,
    allow_render: bool,
) -> Option<(Vec<Url>, Vec<Discovered>, bool)> {
    if !ctx.preflight(url).await {
        return None;
    }

    let ttl = ctx.site.recrawl_ttl_seconds();
    if ttl > 0 {
        if let Ok(Some(last_seen)) = ctx.store.url_last_seen(url.as_str()).await {
            let age = chrono::Utc::now().timestamp() - last_seen;
            if age >= 0 && (age as u64) < ttl {
                return None;
            }
        }
    }

    let (etag, stored_lastmod) = ctx.store.get_resource_etag_lastmod(url.as_str()).await.ok()?;

    let resp = match ctx
        .http
        .get(url.as_str(), etag.as_deref(), stored_lastmod.as_deref(), None, 3, Some(ctx.site.user_agent()))
        .await
    {
        Ok(r) => r,
        Err(err) => {
            warn!("crawl fetch failed for {url}: {err}");
            ctx.counters.lock().await.errors += 1;
            return None;
        }
    };

    ctx.counters.lock().await.fetched += 1;
    let status = resp.status().as_u16();
    ctx.counters.lock().await.record_status(status);

    if status == 304 {
        return None;
    }
    if !resp.status().is_success() {
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

    let static_body = resp.text().await.ok()?;

    let (html, rendered_used) = if ctx.site.js_render() && allow_render {
        match render_with_browser(ctx, url).await {
            Some(rendered) => (rendered, true),
            None => (static_body, false),
        }
    } else {
        (static_body, false)
    };

    ctx.store
        .set_resource_etag_lastmod(url.as_str(), new_etag.as_deref(), new_lastmod.as_deref())
        .await
        .ok();
    ctx.counters.lock().await.parsed += 1;

    let children = extract_links(&html, url);
    let discovered: Vec<Discovered> = children
        .iter()
        .filter(|u| in_scope(u, ctx))
        .map(|u| Discovered {
            url: u.to_string(),
            lastmod: None,
            source: "crawl",
        })
        .collect();

    ctx.counters.lock().await.discovered += discovered.len() as u64;
    Some((children, discovered, rendered_used))
}

fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .collect()
}

/// Best-effort headless render; falls back to the static body on any failure.
/// Bounded to 30s total across navigation and the optional selector wait.
async fn render_with_browser(ctx: &AdapterContext, url: &Url) -> Option<String> {
    let (mut browser, _handle, _data_dir) =
        match crate::browser_setup::launch_browser(true, None).await {
            Ok(b) => b,
            Err(err) => {
                warn!("failed to launch browser for {url}: {err}");
                return None;
            }
        };

    let result = tokio::time::timeout(Duration::from_secs(30), async {
        let page = browser.new_page(url.as_str()).await.ok()?;
        page.wait_for_navigation().await.ok()?;
        if let Some(selector) = ctx.site.wait_selector() {
            let _ = tokio::time::timeout(Duration::from_secs(30), page.find_element(selector)).await;
        }
        page.content().await.ok()
    })
    .await
    .ok()
    .flatten();

    let _ = browser.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(base: &str, scope_host: Option<&str>) -> crate::config::SiteConfig {
        let scope_line = scope_host
            .map(|h| format!("scope_host: \"{h}\"\n"))
            .unwrap_or_default();
        let yaml = format!("id: c\nkind: crawl\nbase: \"{base}\"\n{scope_line}");
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn extract_links_resolves_relative_hrefs() {
        let base = Url::parse("https://example.com/dir/page").unwrap();
        let html = r#"<a href="child">c</a><a href="/abs">a</a><a href="https://other.com/x">o</a>"#;
        let links = extract_links(html, &base);
        let strs: Vec<_> = links.iter().map(|u| u.to_string()).collect();
        assert!(strs.contains(&"https://example.com/dir/child".to_string()));
        assert!(strs.contains(&"https://example.com/abs".to_string()));
        assert!(strs.contains(&"https://other.com/x".to_string()));
    }

    fn js_site(base: &str, max_rendered_pages: usize) -> crate::config::SiteConfig {
        let yaml = format!(
            "id: c\nkind: crawl\nbase: \"{base}\"\njs_render: true\nmax_rendered_pages: {max_rendered_pages}\n"
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn allow_render_false_skips_browser_and_uses_static_body() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(r#"<a href="/static-child">c</a>"#)
            .create_async()
            .await;

        let http = std::sync::Arc::new(crate::http::HttpClient::new("LinkHarvest/1.0").unwrap());
        let robots = std::sync::Arc::new(crate::robots::RobotsCache::new(reqwest::Client::new()));
        let rl = std::sync::Arc::new(crate::rate_limiter::RateLimiter::new());
        let dir = tempfile::TempDir::new().unwrap();
        let store = std::sync::Arc::new(crate::store::Store::open(&dir.path().join("u.db")).await.unwrap());
        let ctx = AdapterContext::new(http, robots, rl, store, js_site(&server.url(), 0));

        let url = Url::parse(&server.url()).unwrap();
        let (children, _discovered, rendered_used) =
            process_one(&ctx, &url, false).await.unwrap();
        assert!(!rendered_used);
        assert!(children.iter().any(|c| c.path() == "/static-child"));
    }

    #[tokio::test]
    async fn scope_rejects_other_hosts() {
        let http = std::sync::Arc::new(crate::http::HttpClient::new("LinkHarvest/1.0").unwrap());
        let robots = std::sync::Arc::new(crate::robots::RobotsCache::new(reqwest::Client::new()));
        let rl = std::sync::Arc::new(crate::rate_limiter::RateLimiter::new());
        let dir = tempfile::TempDir::new().unwrap();
        let store = std::sync::Arc::new(crate::store::Store::open(&dir.path().join("u.db")).await.unwrap());
        let ctx = AdapterContext::new(http, robots, rl, store, site("https://example.com", Some("example.com")));

        let in_scope_url = Url::parse("https://example.com/a").unwrap();
        let out_of_scope = Url::parse("https://other.com/a").unwrap();
        assert!(in_scope(&in_scope_url, &ctx));
        assert!(!in_scope(&out_of_scope, &ctx));
    }
}
