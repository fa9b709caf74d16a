//! Retrying, conditional-GET-aware HTTP client.

use std::time::Duration;

use log::warn;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, USER_AGENT};
use reqwest::{Client, Response, StatusCode};

const RETRYABLE: &[u16] = &[429, 500, 502, 503, 504];
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

pub struct HttpClient {
    client: Client,
    default_user_agent: String,
}

impl HttpClient {
    pub fn new(default_user_agent: impl Into<String>) -> reqwest::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            default_user_agent: default_user_agent.into(),
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET with conditional headers, retry/backoff, and jitter.
    ///
    /// On retry exhaustion with a retryable status, the last response is
    /// returned rather than an error. A transport error on the final attempt
    /// propagates.
    pub async fn get(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        extra_headers: Option<&HeaderMap>,
        max_retries: u32,
        user_agent: Option<&str>,
    ) -> reqwest::Result<Response> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent.unwrap_or(&self.default_user_agent))
                .unwrap_or_else(|_| HeaderValue::from_static("LinkHarvest/1.0")),
        );
        if let Some(etag) = etag {
            if let Ok(v) = HeaderValue::from_str(etag) {
                headers.insert(IF_NONE_MATCH, v);
            }
        }
        if let Some(lm) = last_modified {
            if let Ok(v) = HeaderValue::from_str(lm) {
                headers.insert(IF_MODIFIED_SINCE, v);
            }
        }
        if let Some(extra) = extra_headers {
            for (name, value) in extra {
                headers.insert(name.clone(), value.clone());
            }
        }

        let mut attempt = 0u32;
        let mut backoff = BASE_BACKOFF;
        loop {
            let result = self
                .client
                .get(url)
                .headers(headers.clone())
                .send()
                .await;

            let should_retry = match &result {
                Ok(resp) => RETRYABLE.contains(&resp.status().as_u16()),
                Err(_) => true,
            };

            if !should_retry || attempt >= max_retries {
                return result;
            }

            attempt += 1;
            let jitter = rand::rng().random_range(0.8..1.2);
            let delay = Duration::from_secs_f64((backoff.as_secs_f64() * jitter).min(MAX_BACKOFF.as_secs_f64()));
            warn!("retrying {url} (attempt {attempt}/{max_retries}) after {delay:?}");
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub fn header_name(name: &'static str) -> HeaderName {
        HeaderName::from_static(name)
    }

    pub fn status_is_retryable(status: StatusCode) -> bool {
        RETRYABLE.contains(&status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_on_503_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let m1 = server
            .mock("GET", "/thing")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let m2 = server
            .mock("GET", "/thing")
            .with_status(200)
            .with_body("ok")
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::new("LinkHarvest/1.0").unwrap();
        let url = format!("{}/thing", server.url());
        let resp = client
            .get(&url, None, None, None, 3, None)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        m1.assert_async().await;
        m2.assert_async().await;
    }

    #[tokio::test]
    async fn sends_conditional_headers() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/thing")
            .match_header("if-none-match", "\"abc\"")
            .with_status(304)
            .create_async()
            .await;

        let client = HttpClient::new("LinkHarvest/1.0").unwrap();
        let url = format!("{}/thing", server.url());
        let resp = client
            .get(&url, Some("\"abc\""), None, None, 3, None)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        m.assert_async().await;
    }
}
