use crate::cache::HttpCache;
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy::filter::Blacklist;
use crate::ratelimit::TokenBucket;
use crate::routing::RouteTable;
use crate::upstream::ClusterStore;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Root shared state, cheaply cloneable — every field is already an `Arc` or
/// an `Arc`-wrapping handle, so cloning `GatewayState` is just a handful of
/// refcount bumps.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub routing: Arc<ArcSwap<RouteTable>>,
    pub upstream: ClusterStore,
    pub cache: Arc<HttpCache>,
    pub rate_limiter: Arc<TokenBucket>,
    pub blacklist: Arc<Blacklist>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        let route_table = RouteTable::new(&config.routes);
        let upstream = ClusterStore::new();
        for route in &config.routes {
            if let Some(ref upstream_cfg) = route.upstream {
                upstream.upsert(Arc::<str>::from(route.path.as_str()), upstream_cfg.clone());
            }
        }

        let metrics = Metrics::install();
        metrics::gauge!("gateway_config_routes_total").set(config.routes.len() as f64);

        let cache = Arc::new(HttpCache::new(config.cache.clone()));
        let rate_limiter = TokenBucket::new(&config.rate_limiter);
        let blacklist = Arc::new(Blacklist::default());

        info!(routes = config.routes.len(), "gateway state initialized");

        Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            routing: Arc::new(ArcSwap::new(Arc::new(route_table))),
            upstream,
            cache,
            rate_limiter,
            blacklist,
        }
    }

    /// Rebuild the route table and upstream clusters from a freshly loaded
    /// config, e.g. after a `SIGHUP`-triggered reload. Cache and rate limiter
    /// are left untouched — a reload changes routing/backends, not runtime
    /// admission state.
    pub fn reload_routes(&self, config: &GatewayConfig) {
        let route_table = RouteTable::new(&config.routes);
        self.routing.store(Arc::new(route_table));

        let mut seen = std::collections::HashSet::new();
        for route in &config.routes {
            if let Some(ref upstream_cfg) = route.upstream {
                self.upstream
                    .upsert(Arc::<str>::from(route.path.as_str()), upstream_cfg.clone());
                seen.insert(route.path.clone());
            }
        }
        let mut stale = Vec::new();
        self.upstream.for_each(|name, _| {
            if !seen.contains(name) {
                stale.push(name.to_string());
            }
        });
        for name in stale {
            self.upstream.remove(&name);
        }

        metrics::gauge!("gateway_config_routes_total").set(config.routes.len() as f64);
        metrics::counter!("gateway_config_reloads_total").increment(1);
        info!(routes = config.routes.len(), "routes reloaded");
    }
}
