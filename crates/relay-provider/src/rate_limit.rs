use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::ProviderError;

/// Rate-limit hints a vendor attached to a failed call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    pub retry_after_ms: Option<u64>,
    pub remaining_requests: Option<u32>,
}

/// Paces calls per provider/model pair.
pub trait RateLimiter: Send + Sync {
    /// Milliseconds the caller should wait before the next call; 0 means go.
    fn check_and_wait(&self, provider: &str, model: &str) -> u64;

    fn record_request(&self, provider: &str, model: &str);

    fn update_from_error(
        &self,
        provider: &str,
        model: &str,
        error: &ProviderError,
        info: Option<&RateLimitInfo>,
    );
}

const WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_COOLDOWN_MS: u64 = 2000;

#[derive(Debug, Default)]
struct Bucket {
    window: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl Bucket {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.duration_since(*front) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
    }
}

/// A one-minute sliding window per `provider/model`, plus a cooldown set by
/// rate-limit errors.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    requests_per_minute: Option<u32>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl SlidingWindowLimiter {
    /// `None` disables the window; error cooldowns still apply.
    pub fn new(requests_per_minute: Option<u32>) -> Self {
        Self {
            requests_per_minute: requests_per_minute.filter(|n| *n > 0),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{provider}/{model}")
    }

    fn wait_at(&self, provider: &str, model: &str, now: Instant) -> u64 {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&Self::key(provider, model)) else {
            return 0;
        };
        bucket.prune(now);

        let cooldown = bucket
            .cooldown_until
            .map(|until| until.duration_since(now))
            .unwrap_or_default();

        let window = match (self.requests_per_minute, bucket.window.front()) {
            (Some(limit), Some(oldest)) if bucket.window.len() >= limit as usize => {
                WINDOW.saturating_sub(now.duration_since(*oldest))
            }
            _ => Duration::ZERO,
        };

        cooldown.max(window).as_millis() as u64
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check_and_wait(&self, provider: &str, model: &str) -> u64 {
        self.wait_at(provider, model, Instant::now())
    }

    fn record_request(&self, provider: &str, model: &str) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(Self::key(provider, model)).or_default();
        bucket.prune(now);
        bucket.window.push_back(now);
    }

    fn update_from_error(
        &self,
        provider: &str,
        model: &str,
        error: &ProviderError,
        info: Option<&RateLimitInfo>,
    ) {
        let hinted = info.and_then(|i| i.retry_after_ms);
        let retry_after = match error {
            ProviderError::RateLimited { retry_after_ms, .. } => {
                hinted.or(*retry_after_ms).unwrap_or(DEFAULT_COOLDOWN_MS)
            }
            _ => match hinted {
                Some(ms) => ms,
                None => return,
            },
        };

        let until = Instant::now() + Duration::from_millis(retry_after);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(Self::key(provider, model)).or_default();
        if bucket.cooldown_until.map_or(true, |current| current < until) {
            bucket.cooldown_until = Some(until);
        }
        debug!(provider, model, retry_after_ms = retry_after, "rate limit cooldown set");
    }
}
