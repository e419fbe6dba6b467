use crate::config::{HealthCheckConfig, UpstreamRouteConfig, UpstreamServerSpec};
use crate::proxy::context::BoxBody;
use crate::upstream::circuit_breaker::CircuitBreakerRegistry;
use crate::upstream::loadbalance::{HealthStatus, LoadBalancer, RequestGuard, UpstreamTarget};
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Runtime representation of a route's upstream group — owns all per-route
/// load-balancing, health, and circuit-breaker state. One `Cluster` backs
/// every routing-table entry whose `RouteEntry::upstream` is set, keyed by
/// route path.
#[derive(Clone)]
pub struct Cluster {
    name: Arc<str>,
    config: Arc<UpstreamRouteConfig>,
    health_check: Arc<Option<HealthCheckConfig>>,

    http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    lb: Arc<LoadBalancer>,
    circuit_breakers: Arc<CircuitBreakerRegistry>,

    health_check_count: Arc<DashMap<String, AtomicU32>>,
}

impl Cluster {
    pub fn new(name: impl Into<Arc<str>>, config: UpstreamRouteConfig) -> Self {
        let lb = LoadBalancer::new(&config.strategy);
        lb.update_instances(&config.servers);

        Self {
            name: name.into(),
            health_check: Arc::new(config.health_check.clone()),
            config: Arc::new(config),
            http_client: build_cluster_http_client(),
            lb,
            circuit_breakers: Arc::new(CircuitBreakerRegistry::new()),
            health_check_count: Arc::new(DashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &UpstreamRouteConfig {
        &self.config
    }

    pub fn health_check(&self) -> Option<&HealthCheckConfig> {
        self.health_check.as_ref().as_ref()
    }

    pub fn http_client(&self) -> &Client<HttpsConnector<HttpConnector>, BoxBody> {
        &self.http_client
    }

    pub fn lb(&self) -> &Arc<LoadBalancer> {
        &self.lb
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.circuit_breakers
    }

    pub fn select_upstream(&self, client_ip: Option<&str>) -> Option<(UpstreamTarget, RequestGuard)> {
        let guard = self.lb.select(client_ip)?;
        let target = UpstreamTarget {
            instance: guard.instance.clone(),
        };
        Some((target, guard))
    }

    pub fn servers(&self) -> &[UpstreamServerSpec] {
        &self.config.servers
    }

    pub fn is_node_healthy(&self, node_key: &str) -> bool {
        self.lb.node_health(node_key).is_available()
    }

    pub fn node_health(&self, node_key: &str) -> HealthStatus {
        self.lb.node_health(node_key)
    }

    pub fn mark_node_healthy(&self, node_key: &str) {
        self.reset_health_count(node_key);
        self.lb.set_node_health(node_key, HealthStatus::Healthy);
    }

    pub fn mark_node_unhealthy(&self, node_key: &str) {
        self.reset_health_count(node_key);
        self.lb.set_node_health(node_key, HealthStatus::Unhealthy);
    }

    /// A node that has failed at least one probe since its last `Healthy`
    /// verdict, but hasn't yet cleared `healthy_threshold` consecutive
    /// successes to be promoted back to `Healthy`.
    pub fn mark_node_recovering(&self, node_key: &str) {
        self.lb.set_node_health(node_key, HealthStatus::Recovering);
    }

    /// Folds a response time sample (ms) into the node's EWMA, whether
    /// observed by a health-check probe or a completed proxied request.
    pub fn record_response_time(&self, node_key: &str, sample_ms: f64) {
        self.lb.record_response_time(node_key, sample_ms);
    }

    pub fn record_health_check(&self, node_key: &str) -> u32 {
        if let Some(entry) = self.health_check_count.get(node_key) {
            return entry.value().fetch_add(1, Ordering::Relaxed) + 1;
        }
        let counter = self
            .health_check_count
            .entry(node_key.to_string())
            .or_insert_with(|| AtomicU32::new(0));
        counter.value().fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_health_count(&self, node_key: &str) {
        if let Some(entry) = self.health_check_count.get(node_key) {
            entry.value().store(0, Ordering::Relaxed);
        }
    }

    pub fn purge_stale_nodes(&self) {
        let active_keys: HashSet<String> = self
            .config
            .servers
            .iter()
            .map(|n| format!("{}:{}", n.host, n.port))
            .collect();

        self.health_check_count
            .retain(|k, _| active_keys.contains(k));
        self.circuit_breakers.retain_nodes(&active_keys);
    }
}

/// Central registry of all live per-route upstream clusters. Thread-safe,
/// cheaply cloneable.
#[derive(Clone)]
pub struct ClusterStore {
    clusters: Arc<DashMap<String, Cluster>>,
}

impl Default for ClusterStore {
    fn default() -> Self {
        Self {
            clusters: Arc::new(DashMap::new()),
        }
    }
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Cluster> {
        self.clusters.get(name).map(|entry| entry.value().clone())
    }

    pub fn upsert(&self, name: impl Into<Arc<str>> + Clone, config: UpstreamRouteConfig) {
        let key = name.clone().into().to_string();
        let cluster = Cluster::new(name, config);
        self.clusters.insert(key, cluster);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.clusters.remove(name).is_some()
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Cluster)) {
        for entry in self.clusters.iter() {
            f(entry.key(), entry.value());
        }
    }
}

/// Builds a hyper client shared by every upstream cluster, supporting both
/// plain HTTP and TLS (ring-backed, webpki roots) upstreams with HTTP/2
/// negotiated via ALPN.
fn build_cluster_http_client() -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http.set_connect_timeout(Some(Duration::from_secs(5)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https)
}
