use super::UpstreamInstance;
use arc_swap::ArcSwap;
use rand::Rng;
use std::sync::Arc;

/// Unweighted uniform random selection over the available set.
pub struct RandomBalancer {
    instances: ArcSwap<Vec<UpstreamInstance>>,
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self {
            instances: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl RandomBalancer {
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
        let idx = rand::thread_rng().gen_range(0..available.len());
        Some(available[idx].clone())
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.instances.load().as_ref().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(host: &str) -> UpstreamInstance {
        let endpoint: Arc<str> = format!("{}:{}", host, 80).into();
        UpstreamInstance {
            host: host.to_string(),
            port: 80,
            weight: 100,
            active_requests: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            health: Arc::new(std::sync::atomic::AtomicU8::new(0)),
            avg_response_time_ms: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            endpoint,
        }
    }

    #[test]
    fn test_uniform_distribution_ignores_weight() {
        let lb = RandomBalancer::new();
        let mut a = inst("A");
        a.weight = 900; // weight must not skew selection for this strategy
        lb.update_instances(vec![a, inst("B")]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..20_000 {
            let i = lb.do_select().unwrap();
            *counts.entry(i.host.clone()).or_insert(0) += 1;
        }
        let a_count = *counts.get("A").unwrap_or(&0);
        assert!((8500..11500).contains(&a_count), "A count: {}", a_count);
    }

    #[test]
    fn test_empty() {
        let lb = RandomBalancer::new();
        lb.update_instances(vec![]);
        assert!(lb.do_select().is_none());
    }

    #[test]
    fn test_single() {
        let lb = RandomBalancer::new();
        lb.update_instances(vec![inst("A")]);
        for _ in 0..100 {
            assert_eq!(lb.do_select().unwrap().host, "A");
        }
    }
}
