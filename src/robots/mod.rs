//! Per-origin robots.txt cache.
//!
//! A robots fetch failure degrades to an allow-all policy for that origin
//! rather than blocking harvesting — a broken or slow robots.txt must never
//! be a reason to stop discovering URLs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::warn;
use robotstxt::DefaultMatcher;
use tokio::sync::Mutex;
use url::Url;

const TTL: Duration = Duration::from_secs(3600);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

struct Entry {
    body: String,
    fetched_at: Instant,
}

pub struct RobotsCache {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, Entry>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn origin(url: &Url) -> String {
        format!(
            "{}://{}",
            url.scheme(),
            url.host_str().unwrap_or_default()
        )
    }

    async fn policy_body(&self, url: &Url) -> String {
        let origin = Self::origin(url);

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&origin) {
                if entry.fetched_at.elapsed() < TTL {
                    return entry.body.clone();
                }
            }
        }

        let robots_url = format!("{origin}/robots.txt");
        let body = match tokio::time::timeout(
            FETCH_TIMEOUT,
            self.client.get(&robots_url).send(),
        )
        .await
        {
            Ok(Ok(resp)) if resp.status().is_success() => {
                resp.text().await.unwrap_or_default()
            }
            Ok(Ok(resp)) => {
                warn!("robots.txt at {robots_url} returned {}; allowing all", resp.status());
                String::new()
            }
            Ok(Err(err)) => {
                warn!("robots.txt fetch failed for {robots_url}: {err}; allowing all");
                String::new()
            }
            Err(_) => {
                warn!("robots.txt fetch timed out for {robots_url}; allowing all");
                String::new()
            }
        };

        let mut cache = self.cache.lock().await;
        cache.insert(
            origin,
            Entry {
                body: body.clone(),
                fetched_at: Instant::now(),
            },
        );
        body
    }

    /// Whether `user_agent` is allowed to fetch `url` per the origin's cached policy.
    pub async fn allowed(&self, url: &Url, user_agent: &str) -> bool {
        let body = self.policy_body(url).await;
        if body.is_empty() {
            return true;
        }
        DefaultMatcher::default().one_agent_allowed_by_robots(&body, user_agent, url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_all_when_origin_unreachable() {
        let cache = RobotsCache::new(reqwest::Client::new());
        let url = Url::parse("http://127.0.0.1:1/anything").unwrap();
        assert!(cache.allowed(&url, "LinkHarvest/1.0").await);
    }

    #[tokio::test]
    async fn server_respects_disallow() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/robots.txt")
            .with_status(200)
            .with_body("User-agent: *\nDisallow: /private\n")
            .create_async()
            .await;

        let cache = RobotsCache::new(reqwest::Client::new());
        let base = server.url();
        let allowed = Url::parse(&format!("{base}/public")).unwrap();
        let disallowed = Url::parse(&format!("{base}/private/page")).unwrap();

        assert!(cache.allowed(&allowed, "LinkHarvest/1.0").await);
        assert!(!cache.allowed(&disallowed, "LinkHarvest/1.0").await);
    }
}
