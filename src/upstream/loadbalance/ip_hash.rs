use super::UpstreamInstance;
use arc_swap::ArcSwap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Deterministic client-affinity selection: `hash(client_ip) mod
/// |available|` picks the same instance for the same client as long as the
/// available set doesn't change. No client IP falls back to the first
/// available instance.
pub struct IpHashBalancer {
    instances: ArcSwap<Vec<UpstreamInstance>>,
}

impl Default for IpHashBalancer {
    fn default() -> Self {
        Self {
            instances: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl IpHashBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        self.instances.store(Arc::new(instances));
    }

    pub fn do_select(&self, client_ip: Option<&str>) -> Option<UpstreamInstance> {
        let instances = self.instances.load();
        let available: Vec<&UpstreamInstance> =
            instances.iter().filter(|i| i.is_available()).collect();
        if available.is_empty() {
            return None;
        }

        let idx = match client_ip {
            Some(ip) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                ip.hash(&mut hasher);
                (hasher.finish() as usize) % available.len()
            }
            None => 0,
        };
        Some(available[idx].clone())
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.instances.load().as_ref().clone()
    }
}
