//! Shared GitHub quota tracking.
//!
//! GitHub reports quota per API resource through the `X-RateLimit-*` response
//! headers. The limiter remembers the most recent observation for each
//! resource and suspends callers while a bucket is exhausted, until the
//! advertised reset time has passed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Extra wait added to every advertised reset to absorb clock skew.
const RESET_PADDING: Duration = Duration::from_secs(1);

/// Wait applied when GitHub reports exhaustion without a usable reset time.
pub const DEFAULT_EXHAUSTED_WAIT: Duration = Duration::from_secs(60);

/// Quota bucket a request is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiResource {
    Core,
    Search,
}

impl ApiResource {
    /// Map the value of the `X-RateLimit-Resource` header.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim() {
            "core" => Some(Self::Core),
            "search" => Some(Self::Search),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Search => "search",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    remaining: Option<u64>,
    reset_at: Option<Instant>,
}

/// Gate in front of every outbound GitHub call.
///
/// Cheap to share behind an `Arc`; all state sits behind one async mutex.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<ApiResource, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until one request unit of `resource` is available, then consume it.
    pub async fn acquire(&self, resource: ApiResource) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(resource).or_default();
                let now = Instant::now();
                match (bucket.remaining, bucket.reset_at) {
                    (Some(0), Some(reset_at)) if reset_at > now => Some(reset_at - now),
                    (Some(0), _) => {
                        // Reset has passed; quota is unknown until the next response.
                        *bucket = Bucket::default();
                        None
                    }
                    (Some(n), _) => {
                        bucket.remaining = Some(n - 1);
                        None
                    }
                    (None, _) => None,
                }
            };

            match wait {
                Some(duration) => {
                    tracing::info!(
                        resource = resource.as_str(),
                        wait_secs = duration.as_secs(),
                        "GitHub quota exhausted, suspending until reset"
                    );
                    tokio::time::sleep(duration).await;
                }
                None => return,
            }
        }
    }

    /// Record `X-RateLimit-Remaining` / `X-RateLimit-Reset` from a response.
    ///
    /// `reset_epoch` is the unix timestamp (seconds) at which the bucket refills.
    pub async fn observe(&self, resource: ApiResource, remaining: u64, reset_epoch: Option<i64>) {
        let reset_at = reset_epoch.map(reset_instant);
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(resource).or_default();
        bucket.remaining = Some(remaining);
        if reset_at.is_some() {
            bucket.reset_at = reset_at;
        }
    }

    /// Mark `resource` exhausted for at least `wait`.
    ///
    /// Used for quota-exhausted responses (403/429). A later reset already on
    /// record is kept.
    pub async fn record_exhausted(&self, resource: ApiResource, wait: Duration) {
        let until = Instant::now() + wait + RESET_PADDING;
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(resource).or_default();
        bucket.remaining = Some(0);
        bucket.reset_at = Some(match bucket.reset_at {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        tracing::warn!(
            resource = resource.as_str(),
            wait_secs = (wait + RESET_PADDING).as_secs(),
            "GitHub rate limit exhausted"
        );
    }

    /// Last observed remaining quota for `resource`.
    pub async fn remaining(&self, resource: ApiResource) -> Option<u64> {
        self.buckets
            .lock()
            .await
            .get(&resource)
            .and_then(|bucket| bucket.remaining)
    }
}

/// Seconds until `reset_epoch`, counted from the current wall clock.
pub fn seconds_until(reset_epoch: i64) -> Duration {
    let delta = reset_epoch.saturating_sub(Utc::now().timestamp());
    Duration::from_secs(u64::try_from(delta).unwrap_or(0))
}

fn reset_instant(reset_epoch: i64) -> Instant {
    Instant::now() + seconds_until(reset_epoch) + RESET_PADDING
}
