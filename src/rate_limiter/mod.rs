//! Per-host politeness rate limiter.
//!
//! Tracks, for each host, the earliest instant a request is allowed to fire.
//! `await_slot` either claims the current instant immediately or sleeps until
//! its host's next-allowed time, guaranteeing callers for the same host are
//! never less than `1 / rps` seconds apart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

pub struct RateLimiter {
    next_ok: Mutex<HashMap<String, Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            next_ok: Mutex::new(HashMap::new()),
        }
    }

    /// Block until this host's next slot is free, then claim it.
    pub async fn await_slot(&self, url: &Url, rps: f64) {
        let host = url.host_str().unwrap_or_default().to_string();
        let min_interval = Duration::from_secs_f64(1.0 / rps.max(0.01));

        loop {
            let wait_until = {
                let mut guard = self.next_ok.lock().await;
                let now = Instant::now();
                let entry = guard.entry(host.clone()).or_insert(now);
                if *entry <= now {
                    *entry = now + min_interval;
                    None
                } else {
                    Some(*entry)
                }
            };

            match wait_until {
                None => return,
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spaces_consecutive_slots_by_min_interval() {
        let limiter = RateLimiter::new();
        let url = Url::parse("https://example.com/a").unwrap();

        let start = Instant::now();
        limiter.await_slot(&url, 10.0).await;
        limiter.await_slot(&url, 10.0).await;
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(90),
            "expected >= ~100ms spacing, got {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn different_hosts_do_not_block_each_other() {
        let limiter = RateLimiter::new();
        let a = Url::parse("https://a.test/").unwrap();
        let b = Url::parse("https://b.test/").unwrap();

        let start = Instant::now();
        limiter.await_slot(&a, 1.0).await;
        limiter.await_slot(&b, 1.0).await;
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_millis(200));
    }
}
