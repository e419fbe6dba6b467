pub mod ip_hash;
pub mod least_conn;
pub mod peak_ewma;
pub mod random;
pub mod round_robin;
pub mod weighted_round_robin;

use crate::config::UpstreamServerSpec;
use ip_hash::IpHashBalancer;
use least_conn::LeastConnBalancer;
use peak_ewma::{LatencyGuard, PeakEwmaBalancer};
use random::RandomBalancer;
use round_robin::RoundRobinBalancer;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use weighted_round_robin::WeightedRoundRobinBalancer;

/// Health as tracked by the active health checker. A server starts
/// `Unknown` (treated as available, same as the teacher's previous
/// optimistic-bool default) until a probe says otherwise; `Recovering`
/// marks a previously `Unhealthy` node that has started passing probes
/// again but hasn't yet reached `healthy_threshold` consecutive successes.
/// Only `Unhealthy` excludes a node from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Recovering,
}

impl HealthStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Healthy,
            2 => Self::Unhealthy,
            3 => Self::Recovering,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Unhealthy => 2,
            Self::Recovering => 3,
        }
    }

    pub fn is_available(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }
}

/// EWMA smoothing factor for `UpstreamInstance::avg_response_time_ms`,
/// separate from (and usually larger than) the `peak_ewma` balancer's own
/// internal latency EWMA, which exists purely to rank candidates.
const RESPONSE_TIME_ALPHA: f64 = 0.3;

/// A resolved upstream instance carrying per-request state (active count,
/// health, rolling response time). Cheap to clone — counters are shared
/// via `Arc`.
#[derive(Debug, Clone)]
pub struct UpstreamInstance {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub active_requests: Arc<AtomicUsize>,
    health: Arc<AtomicU8>,
    /// f64 bits of the EWMA of observed response times, in milliseconds.
    avg_response_time_ms: Arc<AtomicU64>,
    /// Pre-computed "host:port" string — avoids a `format!()` allocation on
    /// every request.
    endpoint: Arc<str>,
}

impl UpstreamInstance {
    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_count(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn set_health_status(&self, status: HealthStatus) {
        self.health.store(status.as_u8(), Ordering::Relaxed);
    }

    pub fn is_available(&self) -> bool {
        self.health_status().is_available()
    }

    pub fn avg_response_time_ms(&self) -> f64 {
        f64::from_bits(self.avg_response_time_ms.load(Ordering::Relaxed))
    }

    /// Fold a newly observed response time into the EWMA (α=0.3), used by
    /// both the active health checker and `on_request_complete`.
    pub fn record_response_time_ms(&self, sample_ms: f64) {
        let current = f64::from_bits(self.avg_response_time_ms.load(Ordering::Relaxed));
        let updated = if current == 0.0 {
            sample_ms
        } else {
            RESPONSE_TIME_ALPHA * sample_ms + (1.0 - RESPONSE_TIME_ALPHA) * current
        };
        self.avg_response_time_ms
            .store(updated.to_bits(), Ordering::Relaxed);
    }
}

impl From<&UpstreamServerSpec> for UpstreamInstance {
    fn from(node: &UpstreamServerSpec) -> Self {
        let endpoint: Arc<str> = format!("{}:{}", node.host, node.port).into();
        Self {
            host: node.host.clone(),
            port: node.port,
            weight: node.weight,
            active_requests: Arc::new(AtomicUsize::new(0)),
            health: Arc::new(AtomicU8::new(HealthStatus::Unknown.as_u8())),
            avg_response_time_ms: Arc::new(AtomicU64::new(0)),
            endpoint,
        }
    }
}

/// Enum-based load balancer — no trait objects, no dynamic dispatch.
/// Implements the five strategies named in the external routing contract
/// plus a bonus `PeakEwma` strategy.
pub enum LoadBalancer {
    RoundRobin(RoundRobinBalancer),
    LeastConn(LeastConnBalancer),
    WeightedRoundRobin(WeightedRoundRobinBalancer),
    Random(RandomBalancer),
    IpHash(IpHashBalancer),
    PeakEwma(PeakEwmaBalancer),
}

impl LoadBalancer {
    pub fn new(strategy: &str) -> Arc<Self> {
        match strategy {
            "least_connections" | "least_conn" => {
                Arc::new(Self::LeastConn(LeastConnBalancer::new()))
            }
            "weighted_round_robin" => {
                Arc::new(Self::WeightedRoundRobin(WeightedRoundRobinBalancer::new()))
            }
            "random" => Arc::new(Self::Random(RandomBalancer::new())),
            "ip_hash" => Arc::new(Self::IpHash(IpHashBalancer::new())),
            "peak_ewma" | "ewma" => Arc::new(Self::PeakEwma(PeakEwmaBalancer::new_default())),
            _ => Arc::new(Self::RoundRobin(RoundRobinBalancer::new())),
        }
    }

    pub fn update_instances(&self, servers: &[UpstreamServerSpec]) {
        let instances: Vec<UpstreamInstance> = servers.iter().map(UpstreamInstance::from).collect();
        match self {
            Self::RoundRobin(lb) => lb.update_instances(instances),
            Self::LeastConn(lb) => lb.update_instances(instances),
            Self::WeightedRoundRobin(lb) => lb.update_instances(instances),
            Self::Random(lb) => lb.update_instances(instances),
            Self::IpHash(lb) => lb.update_instances(instances),
            Self::PeakEwma(lb) => lb.update_instances(instances),
        }
    }

    /// Sets a node's (by "host:port") health status, e.g. from health check
    /// results. Takes effect on the next selection.
    pub fn set_node_health(&self, endpoint: &str, status: HealthStatus) {
        for inst in self.get_instances() {
            if inst.endpoint() == endpoint {
                inst.set_health_status(status);
            }
        }
    }

    pub fn node_health(&self, endpoint: &str) -> HealthStatus {
        self.get_instances()
            .into_iter()
            .find(|inst| inst.endpoint() == endpoint)
            .map(|inst| inst.health_status())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Folds an observed response time (ms) into a node's EWMA, whether
    /// from an active health-check probe or a completed proxied request.
    pub fn record_response_time(&self, endpoint: &str, sample_ms: f64) {
        for inst in self.get_instances() {
            if inst.endpoint() == endpoint {
                inst.record_response_time_ms(sample_ms);
            }
        }
    }

    /// Unified select — returns a `RequestGuard` that auto-decrements
    /// counters on drop. `client_ip` is only consulted by `IpHash`.
    pub fn select(self: &Arc<Self>, client_ip: Option<&str>) -> Option<RequestGuard> {
        match self.as_ref() {
            Self::RoundRobin(lb) => Some(RequestGuard::plain(lb.do_select()?)),
            Self::LeastConn(lb) => {
                let instance = lb.do_select()?;
                instance.inc_active();
                Some(RequestGuard::counted(instance, self.clone()))
            }
            Self::WeightedRoundRobin(lb) => Some(RequestGuard::plain(lb.do_select()?)),
            Self::Random(lb) => Some(RequestGuard::plain(lb.do_select()?)),
            Self::IpHash(lb) => Some(RequestGuard::plain(lb.do_select(client_ip)?)),
            Self::PeakEwma(lb) => {
                let latency_guard = lb.do_select()?;
                let instance = latency_guard.get_instance().clone();
                Some(RequestGuard::ewma(instance, latency_guard))
            }
        }
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        match self {
            Self::RoundRobin(lb) => lb.get_instances(),
            Self::LeastConn(lb) => lb.get_instances(),
            Self::WeightedRoundRobin(lb) => lb.get_instances(),
            Self::Random(lb) => lb.get_instances(),
            Self::IpHash(lb) => lb.get_instances(),
            Self::PeakEwma(lb) => lb.get_instances(),
        }
    }
}

/// RAII guard returned from `LoadBalancer::select()`.
/// Automatically decrements active counters on drop (only `LeastConn` uses
/// a live counter; the others track state internally or not at all).
pub struct RequestGuard {
    pub instance: UpstreamInstance,
    pub(crate) _balancer: Option<Arc<LoadBalancer>>,
    pub(crate) _latency_guard: Option<LatencyGuard>,
    started_at: Instant,
}

impl RequestGuard {
    fn plain(instance: UpstreamInstance) -> Self {
        Self {
            instance,
            _balancer: None,
            _latency_guard: None,
            started_at: Instant::now(),
        }
    }

    fn counted(instance: UpstreamInstance, balancer: Arc<LoadBalancer>) -> Self {
        Self {
            instance,
            _balancer: Some(balancer),
            _latency_guard: None,
            started_at: Instant::now(),
        }
    }

    fn ewma(instance: UpstreamInstance, guard: LatencyGuard) -> Self {
        Self {
            instance,
            _balancer: None,
            _latency_guard: Some(guard),
            started_at: Instant::now(),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.instance.endpoint()
    }

    /// Mark request as failed (records penalty latency for PeakEWMA).
    pub fn mark_failed(&mut self) {
        if let Some(ref mut guard) = self._latency_guard {
            guard.mark_failed();
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self._balancer.is_some() {
            self.instance.dec_active();
        }
        let elapsed_ms = self.started_at.elapsed().as_secs_f64() * 1000.0;
        self.instance.record_response_time_ms(elapsed_ms);
    }
}

/// Resolved upstream target metadata for building the proxied request.
pub struct UpstreamTarget {
    pub instance: UpstreamInstance,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamServerSpec;

    fn spec(host: &str) -> UpstreamServerSpec {
        UpstreamServerSpec {
            host: host.to_string(),
            port: 80,
            weight: 1,
        }
    }

    #[test]
    fn test_unknown_and_recovering_are_available_only_unhealthy_is_not() {
        assert!(HealthStatus::Unknown.is_available());
        assert!(HealthStatus::Healthy.is_available());
        assert!(HealthStatus::Recovering.is_available());
        assert!(!HealthStatus::Unhealthy.is_available());
    }

    #[test]
    fn test_new_instance_starts_unknown() {
        let inst = UpstreamInstance::from(&spec("10.0.0.1"));
        assert_eq!(inst.health_status(), HealthStatus::Unknown);
        assert!(inst.is_available());
    }

    #[test]
    fn test_set_health_status_round_trips() {
        let inst = UpstreamInstance::from(&spec("10.0.0.1"));
        inst.set_health_status(HealthStatus::Unhealthy);
        assert_eq!(inst.health_status(), HealthStatus::Unhealthy);
        assert!(!inst.is_available());
        inst.set_health_status(HealthStatus::Recovering);
        assert_eq!(inst.health_status(), HealthStatus::Recovering);
        assert!(inst.is_available());
    }

    #[test]
    fn test_record_response_time_ms_first_sample_sets_baseline() {
        let inst = UpstreamInstance::from(&spec("10.0.0.1"));
        assert_eq!(inst.avg_response_time_ms(), 0.0);
        inst.record_response_time_ms(100.0);
        assert_eq!(inst.avg_response_time_ms(), 100.0);
    }

    #[test]
    fn test_record_response_time_ms_applies_ewma() {
        let inst = UpstreamInstance::from(&spec("10.0.0.1"));
        inst.record_response_time_ms(100.0);
        inst.record_response_time_ms(200.0);
        // alpha=0.3: 0.3*200 + 0.7*100 = 130
        let avg = inst.avg_response_time_ms();
        assert!((avg - 130.0).abs() < 1e-9, "expected 130.0, got {avg}");
    }

    #[test]
    fn test_load_balancer_set_and_get_node_health() {
        let lb = LoadBalancer::new("round_robin");
        lb.update_instances(&[spec("10.0.0.1")]);
        assert_eq!(lb.node_health("10.0.0.1:80"), HealthStatus::Unknown);
        lb.set_node_health("10.0.0.1:80", HealthStatus::Unhealthy);
        assert_eq!(lb.node_health("10.0.0.1:80"), HealthStatus::Unhealthy);
        assert_eq!(lb.node_health("10.0.0.2:80"), HealthStatus::Unknown);
    }

    #[test]
    fn test_request_guard_records_response_time_on_drop() {
        let lb = LoadBalancer::new("round_robin");
        lb.update_instances(&[spec("10.0.0.1")]);
        let guard = lb.select(None).unwrap();
        let instance = guard.instance.clone();
        assert_eq!(instance.avg_response_time_ms(), 0.0);
        drop(guard);
        assert!(instance.avg_response_time_ms() > 0.0);
    }
}
