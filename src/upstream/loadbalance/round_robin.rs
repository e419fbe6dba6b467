use super::UpstreamInstance;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Weighted Round-Robin using prefix sum + modular counter, computed over the
/// currently-available subset of instances on every selection so that a node
/// marked unhealthy drops out immediately without requiring `update_instances`.
pub struct RoundRobinBalancer {
    instances: ArcSwap<Vec<UpstreamInstance>>,
    counter: AtomicU64,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self {
            instances: ArcSwap::from_pointee(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        self.instances.store(Arc::new(instances));
    }

    pub fn do_select(&self) -> Option<UpstreamInstance> {
        let instances = self.instances.load();
        let available: Vec<&UpstreamInstance> =
            instances.iter().filter(|i| i.is_available()).collect();
        if available.is_empty() {
            return None;
        }

        let mut prefix_sum = Vec::with_capacity(available.len());
        let mut total: u64 = 0;
        for inst in &available {
            total += inst.weight.max(1) as u64;
            prefix_sum.push(total);
        }

        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let target = count % total;
        let idx = prefix_sum.partition_point(|&s| s <= target);
        Some(available[idx].clone())
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.instances.load().as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::HealthStatus;

    fn inst(host: &str, weight: u32) -> UpstreamInstance {
        let endpoint: Arc<str> = format!("{}:{}", host, 80).into();
        UpstreamInstance {
            host: host.to_string(),
            port: 80,
            weight,
            active_requests: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            health: Arc::new(std::sync::atomic::AtomicU8::new(0)),
            avg_response_time_ms: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            endpoint,
        }
    }

    #[test]
    fn test_uniform() {
        let lb = RoundRobinBalancer::new();
        lb.update_instances(vec![inst("A", 100), inst("B", 100)]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..1000 {
            let i = lb.do_select().unwrap();
            *counts.entry(i.host.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["A"], 500);
        assert_eq!(counts["B"], 500);
    }

    #[test]
    fn test_weighted() {
        let lb = RoundRobinBalancer::new();
        lb.update_instances(vec![inst("A", 2), inst("B", 3)]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..5000 {
            let i = lb.do_select().unwrap();
            *counts.entry(i.host.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["A"], 2000);
        assert_eq!(counts["B"], 3000);
    }

    #[test]
    fn test_empty() {
        let lb = RoundRobinBalancer::new();
        lb.update_instances(vec![]);
        assert!(lb.do_select().is_none());
    }

    #[test]
    fn test_single() {
        let lb = RoundRobinBalancer::new();
        lb.update_instances(vec![inst("A", 100)]);
        for _ in 0..100 {
            assert_eq!(lb.do_select().unwrap().host, "A");
        }
    }

    #[test]
    fn test_skips_unavailable_nodes() {
        let lb = RoundRobinBalancer::new();
        lb.update_instances(vec![inst("A", 100), inst("B", 100)]);
        lb.get_instances()[0].set_health_status(HealthStatus::Unhealthy);
        for _ in 0..50 {
            assert_eq!(lb.do_select().unwrap().host, "B");
        }
    }
}
