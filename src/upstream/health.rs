use crate::config::HealthCheckConfig;
use crate::upstream::cluster::{Cluster, ClusterStore};
use crate::upstream::loadbalance::HealthStatus;
use futures_util::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const HEALTH_CHECK_CONCURRENCY: usize = 8;

/// Run a single round of active health checks across all clusters that
/// declare one. The caller is responsible for looping / scheduling.
pub async fn run_health_checks(cluster_store: &ClusterStore, client: &reqwest::Client) {
    let mut tasks: Vec<(Cluster, HealthCheckConfig)> = Vec::new();

    cluster_store.for_each(|_name, cluster| {
        if let Some(hc) = cluster.health_check() {
            if !cluster.servers().is_empty() {
                tasks.push((cluster.clone(), hc.clone()));
            }
        }
    });

    for (cluster, hc) in tasks {
        let servers = cluster.servers().to_vec();
        stream::iter(servers)
            .map(|node| {
                let client = client.clone();
                let cluster = cluster.clone();
                let hc = hc.clone();
                async move {
                    check_one_node(&client, &cluster, &hc, &node.host, node.port).await;
                }
            })
            .buffer_unordered(HEALTH_CHECK_CONCURRENCY)
            .collect::<()>()
            .await;
    }
}

/// Builds a shared HTTP client for health check probes.
pub fn build_health_check_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}

async fn check_one_node(
    client: &reqwest::Client,
    cluster: &Cluster,
    hc: &HealthCheckConfig,
    host: &str,
    port: u16,
) {
    let url = format!("http://{}:{}{}", host, port, hc.path);
    let node_key = format!("{}:{}", host, port);
    let cluster_name = cluster.name().to_string();

    let started_at = Instant::now();
    let result = client
        .get(&url)
        .timeout(Duration::from_secs(hc.timeout))
        .header(reqwest::header::HOST, host)
        .header(reqwest::header::USER_AGENT, "edge-gateway-healthcheck/1.0")
        .header(reqwest::header::CONNECTION, "close")
        .send()
        .await;

    let healthy = match result {
        Ok(resp) => {
            if resp.status().as_u16() != hc.expected_status {
                false
            } else if let Some(expected) = &hc.expected_body {
                match resp.text().await {
                    Ok(body) => &body == expected,
                    Err(_) => false,
                }
            } else {
                true
            }
        }
        Err(_) => false,
    };

    if healthy {
        cluster.record_response_time(&node_key, started_at.elapsed().as_secs_f64() * 1000.0);
        let count = cluster.record_health_check(&node_key);
        let already_healthy = cluster.node_health(&node_key) == HealthStatus::Healthy;
        if count >= hc.healthy_threshold && !already_healthy {
            cluster.mark_node_healthy(&node_key);
            metrics::gauge!(
                "gateway_upstream_health_status",
                "route" => cluster_name.clone(),
                "upstream" => node_key.clone(),
            )
            .set(1.0);
            warn!(
                "health: node recovered, route={}, node={}",
                cluster_name, node_key
            );
        } else if !already_healthy {
            // Passed a probe but hasn't cleared healthy_threshold yet; only
            // worth flagging as Recovering if it was previously Unhealthy.
            if cluster.node_health(&node_key) == HealthStatus::Unhealthy {
                cluster.mark_node_recovering(&node_key);
            }
        }
        metrics::counter!(
            "gateway_health_check_total",
            "route" => cluster_name.clone(),
            "upstream" => node_key.clone(),
            "result" => "success",
        )
        .increment(1);
        debug!(
            "health: active check passed, route={}, node={}",
            cluster_name, node_key
        );
    } else {
        cluster.reset_health_count(&node_key);
        let count = cluster.record_health_check(&node_key);
        if count >= hc.unhealthy_threshold {
            cluster.mark_node_unhealthy(&node_key);
            metrics::gauge!(
                "gateway_upstream_health_status",
                "route" => cluster_name.clone(),
                "upstream" => node_key.clone(),
            )
            .set(0.0);
            warn!(
                "health: node marked unhealthy, route={}, node={}, consecutive_failures={}",
                cluster_name, node_key, count
            );
        }
        metrics::counter!(
            "gateway_health_check_total",
            "route" => cluster_name.clone(),
            "upstream" => node_key.clone(),
            "result" => "failure",
        )
        .increment(1);
        debug!(
            "health: active check failed, route={}, node={}",
            cluster_name, node_key
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckConfig, UpstreamRouteConfig, UpstreamServerSpec};
    use std::sync::Arc;

    fn hc() -> HealthCheckConfig {
        HealthCheckConfig {
            path: "/health".into(),
            interval: 5,
            timeout: 1,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            expected_status: 200,
            expected_body: None,
        }
    }

    fn cluster_with_hc() -> Cluster {
        Cluster::new(
            Arc::<str>::from("/api"),
            UpstreamRouteConfig {
                servers: vec![UpstreamServerSpec {
                    host: "127.0.0.1".into(),
                    port: 1,
                    weight: 1,
                }],
                strategy: "round_robin".into(),
                health_check: Some(hc()),
            },
        )
    }

    #[tokio::test]
    async fn test_unreachable_node_marked_unhealthy_after_threshold() {
        let cluster = cluster_with_hc();
        let client = build_health_check_client();
        let config = hc();

        for _ in 0..config.unhealthy_threshold {
            check_one_node(&client, &cluster, &config, "127.0.0.1", 1).await;
        }
        assert!(!cluster.is_node_healthy("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_run_health_checks_skips_clusters_without_health_check() {
        let store = ClusterStore::new();
        store.upsert(
            Arc::<str>::from("/no-hc"),
            UpstreamRouteConfig {
                servers: vec![UpstreamServerSpec {
                    host: "127.0.0.1".into(),
                    port: 1,
                    weight: 1,
                }],
                strategy: "round_robin".into(),
                health_check: None,
            },
        );
        let client = build_health_check_client();
        run_health_checks(&store, &client).await;
        let cluster = store.get("/no-hc").unwrap();
        assert!(cluster.is_node_healthy("127.0.0.1:1"));
    }
}
