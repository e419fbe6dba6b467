//! Process-wide admission control: a single token bucket gating every
//! accepted connection before it reaches protocol dispatch.

use crate::config::RateLimiterSectionConfig;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A single process-wide bucket. `tokens` is scaled by `PRECISION` so the
/// per-tick refill (which can be a fraction of a token) stays exact in
/// integer arithmetic.
const PRECISION: i64 = 1000;

pub struct TokenBucket {
    tokens: AtomicI64,
    max: i64,
    refill_per_tick: i64,
    enabled: bool,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: &RateLimiterSectionConfig) -> Arc<Self> {
        let max = (config.burst_size.max(1) as i64) * PRECISION;
        let ticks_per_second = (Duration::from_secs(1).as_millis() / TICK_INTERVAL.as_millis()) as i64;
        let refill_per_tick = (config.requests_per_second.max(1) as i64 * PRECISION) / ticks_per_second.max(1);

        Arc::new(Self {
            tokens: AtomicI64::new(max),
            max,
            refill_per_tick: refill_per_tick.max(1),
            enabled: config.enabled,
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Spawns the background refill task. No-op if the limiter is disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        let bucket = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                bucket.refill();
            }
        });
    }

    fn refill(&self) {
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            let next = (current + self.refill_per_tick).min(self.max);
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement-iff-positive admission check. Always allows when the
    /// limiter is disabled.
    pub fn try_acquire(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current < PRECISION {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("ratelimit: rejected, tokens={}", current);
                metrics::counter!("gateway_rate_limit_rejected_total").increment(1);
                return false;
            }
            let next = current - PRECISION;
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.allowed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_rate_limit_allowed_total").increment(1);
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn allowed_count(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
