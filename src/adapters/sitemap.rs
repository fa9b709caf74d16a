//! XML sitemap adapter, with one level of sitemap-index recursion.

use futures::stream::{self, BoxStream, StreamExt};
use log::warn;
use quick_xml::events::Event;
use quick_xml::Reader;
use url::Url;

use super::{Adapter, AdapterContext, Discovered};

pub struct SitemapAdapter;

impl Adapter for SitemapAdapter {
    fn discover<'a>(&'a self, ctx: &'a AdapterContext) -> BoxStream<'a, Discovered> {
        Box::pin(stream::once(async move { fetch_top(ctx).await }).flat_map(stream::iter))
    }
}

async fn fetch_top(ctx: &AdapterContext) -> Vec<Discovered> {
    let Some(sitemap) = ctx.site.sitemap() else {
        return Vec::new();
    };

    let Some(doc) = fetch_document(ctx, sitemap).await else {
        return Vec::new();
    };

    match parse_sitemap(&doc) {
        ParsedSitemap::UrlSet(entries) => entries,
        ParsedSitemap::Index(children) => {
            let mut out = Vec::new();
            for child in children {
                if let Some(doc) = fetch_document(ctx, &child).await {
                    if let ParsedSitemap::UrlSet(entries) = parse_sitemap(&doc) {
                        out.extend(entries);
                    }
                    // A nested index inside a child is intentionally not recursed further.
                }
            }
            out
        }
    }
}

async fn fetch_document(ctx: &AdapterContext, sitemap_url: &str) -> Option<String> {
    let url = Url::parse(sitemap_url).ok()?;

    if !ctx.preflight(&url).await {
        return None;
    }

    let (etag, lastmod) = ctx.store.get_resource_etag_lastmod(url.as_str()).await.ok()?;

    let resp = match ctx
        .http
        .get(url.as_str(), etag.as_deref(), lastmod.as_deref(), None, 3, Some(ctx.site.user_agent()))
        .await
    {
        Ok(r) => r,
        Err(err) => {
            warn!("sitemap fetch failed for {sitemap_url}: {err}");
            ctx.counters.lock().await.errors += 1;
            return None;
        }
    };

    ctx.counters.lock().await.fetched += 1;
    let status = resp.status().as_u16();
    ctx.counters.lock().await.record_status(status);

    if status == 304 || !resp.status().is_success() {
        if !resp.status().is_success() && status != 304 {
            ctx.counters.lock().await.errors += 1;
        }
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

    ctx.store
        .set_resource_etag_lastmod(url.as_str(), new_etag.as_deref(), new_lastmod.as_deref())
        .await
        .ok();
    ctx.counters.lock().await.parsed += 1;

    resp.text().await.ok()
}

enum ParsedSitemap {
    UrlSet(Vec<Discovered>),
    Index(Vec<String>),
}

fn parse_sitemap(xml: &str) -> ParsedSitemap {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut is_index = false;
    let mut root_seen = false;

    let mut urlset_entries = Vec::new();
    let mut index_locs = Vec::new();
    let mut cur_loc: Option<String> = None;
    let mut cur_lastmod: Option<String> = None;
    let mut active_tag: Option<String> = None;
    let mut in_entry = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e.name());
                if !root_seen {
                    root_seen = true;
                    is_index = name == "sitemapindex";
                }
                match name.as_str() {
                    "url" | "sitemap" => {
                        in_entry = true;
                        cur_loc = None;
                        cur_lastmod = None;
                    }
                    _ => {}
                }
                active_tag = Some(name);
            }
            Ok(Event::Text(t)) => {
                if in_entry {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    match active_tag.as_deref() {
                        Some("loc") => cur_loc = Some(text),
                        Some("lastmod") => cur_lastmod = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(&e.name());
                if name == "url" || name == "sitemap" {
                    in_entry = false;
                    if let Some(loc) = cur_loc.take() {
                        if is_index {
                            index_locs.push(loc);
                        } else {
                            urlset_entries.push(Discovered {
                                url: loc,
                                lastmod: cur_lastmod.take(),
                                source: "sitemap",
                            });
                        }
                    }
                }
                active_tag = None;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    if is_index {
        ParsedSitemap::Index(index_locs)
    } else {
        ParsedSitemap::UrlSet(urlset_entries)
    }
}

fn local_name(name: &quick_xml::name::QName) -> String {
    String::from_utf8_lossy(name.local_name().as_ref()).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_urlset_with_two_urls() {
        let xml = r#"
        <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
          <url><loc>https://example.com/a</loc><lastmod>2024-01-01</lastmod></url>
          <url><loc>https://example.com/b</loc></url>
        </urlset>
        "#;
        match parse_sitemap(xml) {
            ParsedSitemap::UrlSet(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].url, "https://example.com/a");
                assert_eq!(entries[0].lastmod.as_deref(), Some("2024-01-01"));
            }
            ParsedSitemap::Index(_) => panic!("expected urlset"),
        }
    }

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"
        <sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
          <sitemap><loc>https://example.com/sitemap-1.xml</loc></sitemap>
          <sitemap><loc>https://example.com/sitemap-2.xml</loc></sitemap>
        </sitemapindex>
        "#;
        match parse_sitemap(xml) {
            ParsedSitemap::Index(locs) => assert_eq!(locs.len(), 2),
            ParsedSitemap::UrlSet(_) => panic!("expected index"),
        }
    }
}
