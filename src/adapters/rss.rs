//! RSS/Atom feed adapter.
//!
//! A single GET of the configured feed URL, parsed leniently: each entry
//! yields `link` (RSS) or `id`/`guid` (Atom/fallback) as its URL, and
//! `updated`/`published`/`pubDate` as its lastmod.

use futures::stream::{self, BoxStream, StreamExt};
use log::warn;
use quick_xml::events::Event;
use quick_xml::Reader;
use url::Url;

use super::{Adapter, AdapterContext, Discovered};

pub struct RssAdapter;

impl Adapter for RssAdapter {
    fn discover<'a>(&'a self, ctx: &'a AdapterContext) -> BoxStream<'a, Discovered> {
        Box::pin(stream::once(async move { fetch(ctx).await.unwrap_or_default() }).flat_map(stream::iter))
    }
}

async fn fetch(ctx: &AdapterContext) -> Option<Vec<Discovered>> {
    let feed = ctx.site.feed()?;
    let url = Url::parse(feed).ok()?;

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
            warn!("rss fetch failed for {feed}: {err}");
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
        warn!("rss feed {feed} returned {status}");
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
    let entries = parse_feed(&body);
    if entries.is_empty() {
        ctx.counters.lock().await.errors += 1;
        return None;
    }

    ctx.store
        .set_resource_etag_lastmod(url.as_str(), new_etag.as_deref(), new_lastmod.as_deref())
        .await
        .ok();

    ctx.counters.lock().await.parsed += 1;
    ctx.counters.lock().await.discovered += entries.len() as u64;
    Some(entries)
}

struct RawEntry {
    link: Option<String>,
    id: Option<String>,
    date: Option<String>,
}

/// Walk `item`/`entry` elements in document order, tolerant of RSS 2.0 and Atom.
fn parse_feed(xml: &str) -> Vec<Discovered> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut active_tag: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e.name());
                match name.as_str() {
                    "item" | "entry" => {
                        current = Some(RawEntry { link: None, id: None, date: None });
                    }
                    "link" => {
                        if let Some(entry) = current.as_mut() {
                            // Atom <link href="..."/>
                            if let Some(href) = e
                                .attributes()
                                .filter_map(|a| a.ok())
                                .find(|a| a.key.as_ref() == b"href")
                            {
                                if let Ok(v) = href.unescape_value() {
                                    entry.link = Some(v.into_owned());
                                }
                            }
                        }
                        active_tag = Some(name);
                    }
                    _ => active_tag = Some(name),
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(entry) = current.as_mut() {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    match active_tag.as_deref() {
                        Some("link") => {
                            if entry.link.is_none() {
                                entry.link = Some(text);
                            }
                        }
                        Some("guid") | Some("id") => entry.id = Some(text),
                        Some("pubdate") | Some("updated") | Some("published") => {
                            entry.date = Some(text)
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(&e.name());
                if (name == "item" || name == "entry") && current.is_some() {
                    let entry = current.take().unwrap();
                    if let Some(url) = entry.link.or(entry.id) {
                        entries.push(Discovered {
                            url,
                            lastmod: entry.date,
                            source: "rss",
                        });
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

    entries
}

fn local_name(name: &quick_xml::name::QName) -> String {
    String::from_utf8_lossy(name.local_name().as_ref())
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_entries_in_document_order() {
        let xml = r#"
        <rss><channel>
          <item><link>https://example.com/a</link><pubDate>2024-01-01</pubDate></item>
          <item><guid>https://example.com/b</guid><pubDate>2024-01-02</pubDate></item>
        </channel></rss>
        "#;
        let entries = parse_feed(xml);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://example.com/a");
        assert_eq!(entries[1].url, "https://example.com/b");
        assert_eq!(entries[1].lastmod.as_deref(), Some("2024-01-02"));
    }

    #[test]
    fn parses_atom_entries() {
        let xml = r#"
        <feed xmlns="http://www.w3.org/2005/Atom">
          <entry>
            <link href="https://example.com/atom-a"/>
            <updated>2024-02-01T00:00:00Z</updated>
          </entry>
        </feed>
        "#;
        let entries = parse_feed(xml);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://example.com/atom-a");
    }
}
