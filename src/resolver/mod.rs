//! One-shot canonical URL resolution.

use log::debug;
use reqwest::header::ACCEPT;
use scraper::{Html, Selector};
use url::Url;

use crate::http::HttpClient;
use crate::rate_limiter::RateLimiter;
use crate::robots::RobotsCache;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

pub struct ResolvedUrl {
    pub resolved: String,
    pub canonical: Option<String>,
}

/// Best-effort single GET: follow at most one redirect's `Location`, or look
/// for `<link rel="canonical">` in a successful HTML response. Any failure
/// falls back to the original URL unchanged.
pub async fn resolve_canonical_once(
    url: &Url,
    http: &HttpClient,
    robots: &RobotsCache,
    rate_limiter: &RateLimiter,
    rps: f64,
    user_agent: &str,
) -> ResolvedUrl {
    let fallback = ResolvedUrl {
        resolved: url.to_string(),
        canonical: None,
    };

    if !robots.allowed(url, user_agent).await {
        return fallback;
    }

    rate_limiter.await_slot(url, rps).await;

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(ACCEPT, ACCEPT_HTML.parse().unwrap());

    let resp = match http
        .get(url.as_str(), None, None, Some(&headers), 1, Some(user_agent))
        .await
    {
        Ok(r) => r,
        Err(err) => {
            debug!("canonical resolution failed for {url}: {err}");
            return fallback;
        }
    };

    if resp.status().is_redirection() {
        if let Some(location) = resp.headers().get(reqwest::header::LOCATION) {
            if let Ok(location) = location.to_str() {
                if let Ok(resolved) = url.join(location) {
                    return ResolvedUrl {
                        resolved: resolved.to_string(),
                        canonical: None,
                    };
                }
            }
        }
        return fallback;
    }

    if !resp.status().is_success() {
        return fallback;
    }

    let is_html = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("html"));

    if !is_html {
        return ResolvedUrl {
            resolved: url.to_string(),
            canonical: None,
        };
    }

    let body = match resp.text().await {
        Ok(b) => b,
        Err(_) => return fallback,
    };

    let canonical = extract_canonical(&body);
    ResolvedUrl {
        resolved: url.to_string(),
        canonical,
    }
}

fn extract_canonical(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"link[rel="canonical"]"#).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_canonical_link() {
        let html = r#"<html><head><link rel="canonical" href="https://example.com/real"></head></html>"#;
        assert_eq!(
            extract_canonical(html),
            Some("https://example.com/real".to_string())
        );
    }

    #[test]
    fn missing_canonical_returns_none() {
        let html = "<html><head></head></html>";
        assert_eq!(extract_canonical(html), None);
    }
}
