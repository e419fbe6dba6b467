use super::UpstreamInstance;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Strict least-connections: picks `argmin(active_connections)` over the
/// available set, ties broken by list order.
pub struct LeastConnBalancer {
    instances: ArcSwap<Vec<UpstreamInstance>>,
}

impl Default for LeastConnBalancer {
    fn default() -> Self {
        Self {
            instances: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl LeastConnBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        let old = self.instances.load();
        let new_instances: Vec<UpstreamInstance> = instances
            .into_iter()
            .map(|mut inst| {
                if let Some(existing) = old.iter().find(|e| e.endpoint() == inst.endpoint()) {
                    inst.active_requests = existing.active_requests.clone();
                }
                inst
            })
            .collect();
        self.instances.store(Arc::new(new_instances));
    }

    pub fn do_select(&self) -> Option<UpstreamInstance> {
        let instances = self.instances.load();
        instances
            .iter()
            .filter(|i| i.is_available())
            .min_by_key(|i| i.active_count())
            .cloned()
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.instances.load().as_ref().clone()
    }

    #[cfg(test)]
    pub fn get_active_count(&self, endpoint: &str) -> usize {
        self.instances
            .load()
            .iter()
            .find(|i| i.endpoint() == endpoint)
            .map(|i| i.active_count())
            .unwrap_or(0)
    }
}
