use std::num::NonZeroU64;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tower::BoxError;

use crate::context::Context;
use crate::plan::FetchInfo;

pub(crate) const RATE_LIMIT_EXCEEDED: &str = "rate limit exceeded";

/// A refusal to send a fetch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RateLimitDeny {
    /// Shown to the client. May be empty.
    pub reason: String,
}

impl RateLimitDeny {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Consulted once per fetch node before its request is sent.
#[cfg_attr(test, mockall::automock)]
pub trait RateLimiter: Send + Sync {
    fn rate_limit_pre_fetch<'a>(
        &self,
        ctx: &Context,
        info: Option<&'a FetchInfo>,
        input: &[u8],
    ) -> Result<Option<RateLimitDeny>, BoxError>;

    /// Writes the JSON placed under `extensions.rateLimit`.
    fn render_response_extension(&self, _ctx: &Context, out: &mut Vec<u8>) -> Result<(), BoxError> {
        out.extend_from_slice(b"null");
        Ok(())
    }
}

#[derive(Debug)]
struct Window {
    start: Instant,
    previous: u64,
    current: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WindowStats {
    policy: String,
    allowed: u64,
    used: u64,
}

/// Sliding window limit applied per data source.
///
/// The count of the previous window is weighted by how much of it still overlaps the
/// sliding window.
#[derive(Debug)]
pub struct WindowRateLimiter {
    capacity: NonZeroU64,
    per: Duration,
    windows: DashMap<String, Window>,
}

impl WindowRateLimiter {
    pub fn new(capacity: NonZeroU64, per: Duration) -> Self {
        Self {
            capacity,
            per,
            windows: DashMap::new(),
        }
    }

    fn acquire(&self, data_source_id: &str, now: Instant) -> bool {
        let mut window = self
            .windows
            .entry(data_source_id.to_string())
            .or_insert_with(|| Window {
                start: now,
                previous: 0,
                current: 0,
            });
        let elapsed = now.duration_since(window.start);
        if elapsed >= self.per * 2 {
            window.start = now;
            window.previous = 0;
            window.current = 0;
        } else if elapsed >= self.per {
            window.start += self.per;
            window.previous = window.current;
            window.current = 0;
        }
        let overlap = 1.0
            - now.duration_since(window.start).as_secs_f64() / self.per.as_secs_f64().max(f64::EPSILON);
        let estimate = (window.previous as f64 * overlap.max(0.0)) as u64 + window.current;
        if estimate >= self.capacity.get() {
            return false;
        }
        window.current += 1;
        true
    }

    fn used(&self) -> u64 {
        self.windows.iter().map(|window| window.current).sum()
    }
}

impl RateLimiter for WindowRateLimiter {
    fn rate_limit_pre_fetch<'a>(
        &self,
        _ctx: &Context,
        info: Option<&'a FetchInfo>,
        _input: &[u8],
    ) -> Result<Option<RateLimitDeny>, BoxError> {
        let data_source_id = info.map(|info| info.data_source_id.as_str()).unwrap_or_default();
        if self.acquire(data_source_id, Instant::now()) {
            return Ok(None);
        }
        tracing::debug!(data_source_id, "rate limit exceeded");
        Ok(Some(RateLimitDeny::new(RATE_LIMIT_EXCEEDED)))
    }

    fn render_response_extension(&self, _ctx: &Context, out: &mut Vec<u8>) -> Result<(), BoxError> {
        let stats = WindowStats {
            policy: format!(
                "{} requests per {}",
                self.capacity,
                humantime::format_duration(self.per)
            ),
            allowed: self.capacity.get(),
            used: self.used(),
        };
        serde_json::to_writer(out, &stats)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(data_source: &str) -> FetchInfo {
        FetchInfo::new(data_source, Vec::new())
    }

    #[tokio::test(start_paused = true)]
    async fn limits_each_data_source() {
        let limiter = WindowRateLimiter::new(NonZeroU64::new(2).unwrap(), Duration::from_secs(1));
        let ctx = Context::new();
        let products = info("products");
        let reviews = info("reviews");

        assert_eq!(limiter.rate_limit_pre_fetch(&ctx, Some(&products), b"{}").unwrap(), None);
        assert_eq!(limiter.rate_limit_pre_fetch(&ctx, Some(&products), b"{}").unwrap(), None);
        assert_eq!(
            limiter.rate_limit_pre_fetch(&ctx, Some(&products), b"{}").unwrap(),
            Some(RateLimitDeny::new("rate limit exceeded"))
        );
        assert_eq!(limiter.rate_limit_pre_fetch(&ctx, Some(&reviews), b"{}").unwrap(), None);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(limiter.rate_limit_pre_fetch(&ctx, Some(&products), b"{}").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn renders_stats() {
        let limiter = WindowRateLimiter::new(NonZeroU64::new(10).unwrap(), Duration::from_secs(1));
        let ctx = Context::new();
        for _ in 0..3 {
            limiter
                .rate_limit_pre_fetch(&ctx, Some(&info("users")), b"{}")
                .unwrap();
        }
        let mut out = Vec::new();
        limiter.render_response_extension(&ctx, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"policy":"10 requests per 1s","allowed":10,"used":3}"#
        );
    }
}
