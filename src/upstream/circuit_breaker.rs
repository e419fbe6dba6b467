use crate::config::CircuitBreakerSectionConfig;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed -> Open -> HalfOpen -> Closed/Open.
///
/// Per-node granularity — each upstream "host:port" gets its own breaker,
/// named `upstream_<host>_<port>` so unhealthy nodes can be isolated without
/// affecting the rest of the cluster.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<NodeBreaker>>,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Default)]
struct Stats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
}

struct RequestRecord {
    at: Instant,
    success: bool,
}

/// Per-node circuit breaker state.
struct NodeBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_inflight: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    /// Number of consecutive times this breaker has re-opened, used to scale
    /// the recovery timeout under exponential backoff.
    backoff_count: AtomicU32,
    history: Mutex<VecDeque<RequestRecord>>,
    stats: Stats,
    config: CircuitBreakerSectionConfig,
}

/// Result of checking the circuit breaker before a request.
pub enum BreakerCheck {
    Allowed,
    Probe,
    Rejected,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    pub fn breaker_name(host: &str, port: u16) -> String {
        format!("upstream_{host}_{port}")
    }

    pub fn check(&self, node_key: &str, config: &CircuitBreakerSectionConfig) -> BreakerCheck {
        self.get_or_create(node_key, config).check()
    }

    pub fn record_success(&self, node_key: &str, config: &CircuitBreakerSectionConfig) {
        self.get_or_create(node_key, config).record_success();
    }

    pub fn record_failure(&self, node_key: &str, config: &CircuitBreakerSectionConfig) {
        self.get_or_create(node_key, config).record_failure();
    }

    /// Records an outcome, classifying `status_code` against the breaker's
    /// `failure_status_codes` set when given.
    pub fn record_outcome(
        &self,
        node_key: &str,
        config: &CircuitBreakerSectionConfig,
        status_code: Option<u16>,
    ) {
        let breaker = self.get_or_create(node_key, config);
        let is_failure = match status_code {
            Some(code) => breaker.config.failure_status_codes.contains(&code),
            None => true,
        };
        if is_failure {
            breaker.record_failure();
        } else {
            breaker.record_success();
        }
    }

    pub fn record_timeout(&self, node_key: &str, config: &CircuitBreakerSectionConfig) {
        let breaker = self.get_or_create(node_key, config);
        breaker.stats.timed_out.fetch_add(1, Ordering::Relaxed);
        breaker.record_failure();
    }

    pub fn is_open(&self, node_key: &str, config: &CircuitBreakerSectionConfig) -> bool {
        let breaker = self.get_or_create(node_key, config);
        let state = breaker.state.load(Ordering::Acquire);
        if state != STATE_OPEN {
            return false;
        }
        let opened_at = breaker.opened_at.lock().unwrap();
        match *opened_at {
            Some(at) => at.elapsed() < breaker.recovery_timeout(),
            None => false,
        }
    }

    fn get_or_create(
        &self,
        node_key: &str,
        config: &CircuitBreakerSectionConfig,
    ) -> Arc<NodeBreaker> {
        if let Some(entry) = self.breakers.get(node_key) {
            return entry.value().clone();
        }
        self.breakers
            .entry(node_key.to_string())
            .or_insert_with(|| {
                Arc::new(NodeBreaker {
                    state: AtomicU8::new(STATE_CLOSED),
                    consecutive_failures: AtomicU32::new(0),
                    consecutive_successes: AtomicU32::new(0),
                    half_open_inflight: AtomicU32::new(0),
                    opened_at: Mutex::new(None),
                    backoff_count: AtomicU32::new(0),
                    history: Mutex::new(VecDeque::new()),
                    stats: Stats::default(),
                    config: config.clone(),
                })
            })
            .clone()
    }

    pub fn retain_nodes(&self, active_keys: &std::collections::HashSet<String>) {
        self.breakers.retain(|k, _| active_keys.contains(k));
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBreaker {
    fn recovery_timeout(&self) -> Duration {
        if !self.config.enable_exponential_backoff {
            return Duration::from_secs(self.config.recovery_timeout_secs);
        }
        let n = self.backoff_count.load(Ordering::Relaxed);
        let scaled = (self.config.recovery_timeout_secs as f64)
            * self.config.backoff_multiplier.powi(n as i32);
        let capped = scaled.min(self.config.max_recovery_timeout_secs as f64);
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn push_history(&self, success: bool) {
        let mut history = self.history.lock().unwrap();
        history.push_back(RequestRecord {
            at: Instant::now(),
            success,
        });
        let window = Duration::from_secs(self.config.metrics_window_secs);
        let cap = (self.config.minimum_requests as usize * 2).max(1);
        while let Some(front) = history.front() {
            if front.at.elapsed() > window || history.len() > cap {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate_exceeded(&self) -> bool {
        let history = self.history.lock().unwrap();
        if history.len() < self.config.minimum_requests as usize {
            return false;
        }
        let failures = history.iter().filter(|r| !r.success).count();
        (failures as f64 / history.len() as f64) >= self.config.failure_rate_threshold
    }

    fn check(&self) -> BreakerCheck {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let opened_at = *self.opened_at.lock().unwrap();
                if let Some(at) = opened_at {
                    if at.elapsed() >= self.recovery_timeout()
                        && self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    {
                        self.consecutive_successes.store(0, Ordering::Relaxed);
                        self.half_open_inflight.store(0, Ordering::Relaxed);
                    }
                }
                if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
                    self.admit_half_open()
                } else {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    BreakerCheck::Rejected
                }
            }
            STATE_HALF_OPEN => self.admit_half_open(),
            _ => BreakerCheck::Allowed,
        }
    }

    fn admit_half_open(&self) -> BreakerCheck {
        let inflight = self.half_open_inflight.fetch_add(1, Ordering::AcqRel) + 1;
        if inflight > self.config.half_open_max_requests {
            self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            BreakerCheck::Rejected
        } else {
            BreakerCheck::Probe
        }
    }

    fn record_success(&self) {
        self.stats.successful.fetch_add(1, Ordering::Relaxed);
        self.push_history(true);
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                let count = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.backoff_count.store(0, Ordering::Relaxed);
                    tracing::info!("circuit_breaker: closed (recovered after {count} successes)");
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.push_history(false);
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold || self.failure_rate_exceeded() {
                    self.trip();
                }
            }
            STATE_HALF_OPEN => {
                self.trip();
                self.backoff_count.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn trip(&self) {
        self.state.store(STATE_OPEN, Ordering::Release);
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        self.consecutive_successes.store(0, Ordering::Relaxed);
        tracing::warn!("circuit_breaker: opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(failure_threshold: u32, success_threshold: u32, recovery_timeout_secs: u64) -> CircuitBreakerSectionConfig {
        CircuitBreakerSectionConfig {
            enabled: true,
            failure_threshold,
            success_threshold,
            timeout: 5,
            routes: vec![],
            failure_rate_threshold: 1.1, // disable rate-based trip in these tests
            minimum_requests: 1000,
            metrics_window_secs: 60,
            recovery_timeout_secs,
            half_open_max_requests: 5,
            enable_exponential_backoff: false,
            backoff_multiplier: 2.0,
            max_recovery_timeout_secs: 300,
            failure_status_codes: vec![500, 502, 503, 504],
        }
    }

    #[test]
    fn test_starts_closed() {
        let reg = CircuitBreakerRegistry::new();
        assert!(matches!(reg.check("a:80", &cfg(3, 2, 1)), BreakerCheck::Allowed));
    }

    #[test]
    fn test_trips_after_failures() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(3, 2, 1);
        for _ in 0..3 {
            assert!(matches!(reg.check("a:80", &c), BreakerCheck::Allowed));
            reg.record_failure("a:80", &c);
        }
        assert!(matches!(reg.check("a:80", &c), BreakerCheck::Rejected));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(3, 2, 1);
        reg.record_failure("a:80", &c);
        reg.record_failure("a:80", &c);
        reg.record_success("a:80", &c);
        reg.record_failure("a:80", &c);
        reg.record_failure("a:80", &c);
        assert!(matches!(reg.check("a:80", &c), BreakerCheck::Allowed));
    }

    #[test]
    fn test_half_open_after_timeout() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(1, 1, 0);
        reg.record_failure("b:80", &c);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(matches!(reg.check("b:80", &c), BreakerCheck::Probe));
    }

    #[test]
    fn test_half_open_success_closes() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(1, 1, 0);
        reg.record_failure("a:80", &c);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = reg.check("a:80", &c);
        reg.record_success("a:80", &c);
        assert!(matches!(reg.check("a:80", &c), BreakerCheck::Allowed));
    }

    #[test]
    fn test_half_open_limits_inflight_probes() {
        let reg = CircuitBreakerRegistry::new();
        let mut c = cfg(1, 5, 0);
        c.half_open_max_requests = 2;
        reg.record_failure("a:80", &c);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(matches!(reg.check("a:80", &c), BreakerCheck::Probe));
        assert!(matches!(reg.check("a:80", &c), BreakerCheck::Probe));
        assert!(matches!(reg.check("a:80", &c), BreakerCheck::Rejected));
    }

    #[test]
    fn test_is_open() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(1, 1, 60);
        assert!(!reg.is_open("a:80", &c));
        reg.record_failure("a:80", &c);
        assert!(reg.is_open("a:80", &c));
    }

    #[test]
    fn test_record_outcome_classifies_status_codes() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(1, 1, 60);
        reg.record_outcome("a:80", &c, Some(503));
        assert!(reg.is_open("a:80", &c));
    }

    #[test]
    fn test_record_outcome_2xx_is_success() {
        let reg = CircuitBreakerRegistry::new();
        let c = cfg(1, 1, 60);
        reg.record_outcome("a:80", &c, Some(200));
        assert!(!reg.is_open("a:80", &c));
    }

    #[test]
    fn test_breaker_name_format() {
        assert_eq!(CircuitBreakerRegistry::breaker_name("10.0.0.1", 8080), "upstream_10.0.0.1_8080");
    }
}
