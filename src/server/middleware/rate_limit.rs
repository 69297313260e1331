use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{net::IpAddr, num::NonZeroU32, sync::Arc};

type KeyedLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, NoOpMiddleware>;

/// Admission control for new connections, keyed by peer IP.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    limiter: Option<Arc<KeyedLimiter>>,
}

impl std::fmt::Debug for ConnectionRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRateLimiter")
            .field("enabled", &self.limiter.is_some())
            .finish()
    }
}

impl ConnectionRateLimiter {
    /// Allows `per_second` connection attempts per IP, with an equal burst.
    /// Zero disables the check.
    pub fn new(per_second: u32) -> Self {
        let limiter = NonZeroU32::new(per_second)
            .map(|rate| Arc::new(RateLimiter::keyed(Quota::per_second(rate).allow_burst(rate))));
        Self { limiter }
    }

    /// Returns `true` if a connection from `ip` may proceed. Never waits.
    pub fn check(&self, ip: IpAddr) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check_key(&ip).is_ok(),
            None => true,
        }
    }

    /// Forgets addresses whose quota has fully replenished.
    pub fn cleanup(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    pub fn tracked_addresses(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.len())
    }
}
