//! Per-key admission control.
//!
//! Two interchangeable strategies sit behind [`RateLimiter`]: a continuously
//! refilling token bucket and a sliding window of request timestamps. A
//! [`NoopLimiter`] lets call sites keep the same code path when limiting is off.
//!
//! Per-key state is created lazily on first use. Lookups go through the shard read
//! lock of the map; only a miss takes the write lock to insert. Each key's record
//! sits behind its own mutex, so two callers evaluating the same key never race on
//! its counters.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::utils::error::{Result, WebSocketError};

/// Limits understood by the limiter implementations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Limit {
    /// Refill `rate` tokens per second up to `burst`.
    TokenBucket { rate: f64, burst: u32 },
    /// At most `max_requests` within any `window`.
    SlidingWindow { window: Duration, max_requests: u32 },
    /// No limiting.
    Unlimited,
}

impl Limit {
    /// Builds the limiter matching this limit.
    pub fn into_limiter(self) -> Result<Arc<dyn RateLimiter>> {
        Ok(match self {
            Limit::TokenBucket { rate, burst } => Arc::new(TokenBucketLimiter::new(rate, burst)?),
            Limit::SlidingWindow { window, max_requests } => {
                Arc::new(SlidingWindowLimiter::new(window, max_requests)?)
            }
            Limit::Unlimited => Arc::new(NoopLimiter),
        })
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Limit::TokenBucket { rate, burst } if !(rate > 0.0) || burst == 0 => Err(
                WebSocketError::ConfigurationError("token bucket needs rate > 0 and burst > 0".into()),
            ),
            Limit::SlidingWindow { window, max_requests } if window.is_zero() || max_requests == 0 => {
                Err(WebSocketError::ConfigurationError(
                    "sliding window needs a non-zero window and max_requests > 0".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Capability set shared by every limiting strategy.
pub trait RateLimiter: Send + Sync {
    /// Admits a single request for `key`.
    fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    /// Admits `n` requests for `key` at once, or none of them.
    fn allow_n(&self, key: &str, n: u32) -> bool;

    /// Forgets all state recorded for `key`.
    fn reset(&self, key: &str);

    fn limit(&self) -> Limit;

    /// Replaces the limit. The variant must match the strategy.
    fn set_limit(&self, limit: Limit) -> Result<()>;

    /// Drops state for keys without recent activity. Runs at most once per
    /// cleanup interval; extra calls return immediately.
    fn cleanup(&self);
}

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

/// Rate-limits the cleanup sweep itself.
#[derive(Debug)]
struct Sweep {
    interval: Duration,
    idle_ttl: Duration,
    last_run: Mutex<Instant>,
}

impl Sweep {
    fn new(interval: Duration, idle_ttl: Duration) -> Self {
        Self {
            interval,
            idle_ttl,
            last_run: Mutex::new(Instant::now()),
        }
    }

    fn due(&self) -> bool {
        let mut last = self.last_run.lock();
        if last.elapsed() < self.interval {
            return false;
        }
        *last = Instant::now();
        true
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(burst: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: now,
            last_seen: now,
        }
    }

    fn take(&mut self, rate: f64, burst: u32, n: u32, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        self.last_refill = now;
        self.last_seen = now;
        if self.tokens >= f64::from(n) {
            self.tokens -= f64::from(n);
            true
        } else {
            false
        }
    }
}

/// Token bucket: continuous refill at `rate` tokens per second, capped at `burst`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    params: RwLock<(f64, u32)>,
    buckets: DashMap<String, Mutex<Bucket>>,
    sweep: Sweep,
}

impl TokenBucketLimiter {
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        Limit::TokenBucket { rate, burst }.validate()?;
        Ok(Self {
            params: RwLock::new((rate, burst)),
            buckets: DashMap::new(),
            sweep: Sweep::new(DEFAULT_CLEANUP_INTERVAL, DEFAULT_IDLE_TTL),
        })
    }

    /// Overrides how often `cleanup` may sweep and how long a key may stay idle.
    pub fn with_cleanup(mut self, interval: Duration, idle_ttl: Duration) -> Self {
        self.sweep = Sweep::new(interval, idle_ttl);
        self
    }

    /// Number of keys currently holding state.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow_n(&self, key: &str, n: u32) -> bool {
        let (rate, burst) = *self.params.read();
        if n > burst {
            return false;
        }
        let now = Instant::now();

        if let Some(bucket) = self.buckets.get(key) {
            let allowed = bucket.lock().take(rate, burst, n, now);
            return allowed;
        }

        let bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| Mutex::new(Bucket::full(burst, now)));
        let allowed = bucket.lock().take(rate, burst, n, now);
        allowed
    }

    fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    fn limit(&self) -> Limit {
        let (rate, burst) = *self.params.read();
        Limit::TokenBucket { rate, burst }
    }

    fn set_limit(&self, limit: Limit) -> Result<()> {
        match limit {
            Limit::TokenBucket { rate, burst } => {
                limit.validate()?;
                *self.params.write() = (rate, burst);
                Ok(())
            }
            other => Err(WebSocketError::ConfigurationError(format!(
                "token bucket limiter cannot take {other:?}"
            ))),
        }
    }

    fn cleanup(&self) {
        if !self.sweep.due() {
            return;
        }
        let idle_ttl = self.sweep.idle_ttl;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.get_mut().last_seen.elapsed() < idle_ttl);
        debug!(removed = before.saturating_sub(self.buckets.len()), "token bucket cleanup");
    }
}

#[derive(Debug)]
struct Window {
    hits: VecDeque<Instant>,
    last_seen: Instant,
}

impl Window {
    fn admit(&mut self, window: Duration, max_requests: u32, n: u32, now: Instant) -> bool {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.last_seen = now;
        if self.hits.len() + n as usize > max_requests as usize {
            return false;
        }
        self.hits.extend(std::iter::repeat(now).take(n as usize));
        true
    }
}

/// Sliding window: at most `max_requests` timestamps inside the trailing `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    params: RwLock<(Duration, u32)>,
    windows: DashMap<String, Mutex<Window>>,
    sweep: Sweep,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Result<Self> {
        Limit::SlidingWindow { window, max_requests }.validate()?;
        Ok(Self {
            params: RwLock::new((window, max_requests)),
            windows: DashMap::new(),
            sweep: Sweep::new(DEFAULT_CLEANUP_INTERVAL, DEFAULT_IDLE_TTL),
        })
    }

    pub fn with_cleanup(mut self, interval: Duration, idle_ttl: Duration) -> Self {
        self.sweep = Sweep::new(interval, idle_ttl);
        self
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn allow_n(&self, key: &str, n: u32) -> bool {
        let (window, max_requests) = *self.params.read();
        let now = Instant::now();

        if let Some(entry) = self.windows.get(key) {
            let allowed = entry.lock().admit(window, max_requests, n, now);
            return allowed;
        }

        let entry = self.windows.entry(key.to_owned()).or_insert_with(|| {
            Mutex::new(Window {
                hits: VecDeque::new(),
                last_seen: now,
            })
        });
        let allowed = entry.lock().admit(window, max_requests, n, now);
        allowed
    }

    fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    fn limit(&self) -> Limit {
        let (window, max_requests) = *self.params.read();
        Limit::SlidingWindow { window, max_requests }
    }

    fn set_limit(&self, limit: Limit) -> Result<()> {
        match limit {
            Limit::SlidingWindow { window, max_requests } => {
                limit.validate()?;
                *self.params.write() = (window, max_requests);
                Ok(())
            }
            other => Err(WebSocketError::ConfigurationError(format!(
                "sliding window limiter cannot take {other:?}"
            ))),
        }
    }

    fn cleanup(&self) {
        if !self.sweep.due() {
            return;
        }
        let idle_ttl = self.sweep.idle_ttl;
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.get_mut().last_seen.elapsed() < idle_ttl);
        debug!(removed = before.saturating_sub(self.windows.len()), "sliding window cleanup");
    }
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLimiter;

impl RateLimiter for NoopLimiter {
    fn allow_n(&self, _key: &str, _n: u32) -> bool {
        true
    }

    fn reset(&self, _key: &str) {}

    fn limit(&self) -> Limit {
        Limit::Unlimited
    }

    fn set_limit(&self, limit: Limit) -> Result<()> {
        match limit {
            Limit::Unlimited => Ok(()),
            other => Err(WebSocketError::ConfigurationError(format!(
                "no-op limiter cannot take {other:?}"
            ))),
        }
    }

    fn cleanup(&self) {}
}
