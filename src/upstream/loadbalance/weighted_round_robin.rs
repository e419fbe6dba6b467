use super::UpstreamInstance;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Nginx-style smooth weighted round robin: each instance carries a
/// persistent `current_weight` that accumulates its nominal weight every
/// selection; the instance with the highest current weight wins and has the
/// total weight subtracted, which spreads picks evenly in proportion to
/// weight instead of bursting through one instance at a time.
pub struct WeightedRoundRobinBalancer {
    state: ArcSwap<Vec<Weighted>>,
}

struct Weighted {
    instance: UpstreamInstance,
    current_weight: AtomicI64,
}

impl Default for WeightedRoundRobinBalancer {
    fn default() -> Self {
        Self {
            state: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_instances(&self, instances: Vec<UpstreamInstance>) {
        let old = self.state.load();
        let new_state: Vec<Weighted> = instances
            .into_iter()
            .map(|inst| {
                let current_weight = old
                    .iter()
                    .find(|w| w.instance.endpoint() == inst.endpoint())
                    .map(|w| w.current_weight.load(Ordering::Relaxed))
                    .unwrap_or(0);
                Weighted {
                    instance: inst,
                    current_weight: AtomicI64::new(current_weight),
                }
            })
            .collect();
        self.state.store(Arc::new(new_state));
    }

    pub fn do_select(&self) -> Option<UpstreamInstance> {
        let state = self.state.load();
        let available: Vec<&Weighted> = state
            .iter()
            .filter(|w| w.instance.is_available())
            .collect();
        if available.is_empty() {
            return None;
        }

        let total_weight: i64 = available.iter().map(|w| w.instance.weight.max(1) as i64).sum();

        let mut best: Option<&Weighted> = None;
        let mut best_weight = i64::MIN;
        for w in &available {
            let updated = w.current_weight.fetch_add(w.instance.weight.max(1) as i64, Ordering::AcqRel)
                + w.instance.weight.max(1) as i64;
            if updated > best_weight {
                best_weight = updated;
                best = Some(w);
            }
        }

        let chosen = best?;
        chosen.current_weight.fetch_sub(total_weight, Ordering::AcqRel);
        Some(chosen.instance.clone())
    }

    pub fn get_instances(&self) -> Vec<UpstreamInstance> {
        self.state.load().iter().map(|w| w.instance.clone()).collect()
    }
}
