use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parses `<integer><s|m|h|d>` durations; falls back to plain integer seconds
/// for operators who write bare numbers.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (num, unit) = raw.split_at(raw.len() - 1);
    let n: u64 = num
        .parse()
        .map_err(|_| format!("invalid duration: {raw}"))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        _ => return Err(format!("invalid duration unit in: {raw}")),
    };
    Ok(Duration::from_secs(secs))
}

/// Parses `<integer>[KMGT]B` byte sizes.
pub fn parse_byte_size(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u64>() {
        return Ok(n);
    }
    let upper = raw.to_ascii_uppercase();
    let (num, mult): (&str, u64) = if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("TB") {
        (n, 1024 * 1024 * 1024 * 1024)
    } else {
        return Err(format!("invalid byte size: {raw}"));
    };
    let n: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size: {raw}"))?;
    Ok(n * mult)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrText {
    Num(u64),
    Text(String),
}

fn de_duration_secs<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match NumOrText::deserialize(d)? {
        NumOrText::Num(n) => Ok(n),
        NumOrText::Text(s) => parse_duration(&s).map(|d| d.as_secs()).map_err(D::Error::custom),
    }
}

fn de_byte_size<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match NumOrText::deserialize(d)? {
        NumOrText::Num(n) => Ok(n),
        NumOrText::Text(s) => parse_byte_size(&s).map_err(D::Error::custom),
    }
}

/// Top-level gateway configuration, matching the YAML document operators
/// author. Sections with no data-plane behavior of their own (`auth`,
/// `security`, `logging`) still round-trip so a full operator document
/// parses cleanly, but only `logging` feeds anything back into the process
/// (the log level) — JWT/API-key auth and CORS are not enforced by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub routes: Vec<RouteEntry>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub cache: CacheSectionConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerSectionConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSectionConfig,

    #[serde(default)]
    pub rate_limiter: RateLimiterSectionConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub metrics: MetricsSectionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub security: SecurityConfig,
}

impl GatewayConfig {
    pub fn total_route_count(&self) -> usize {
        self.routes.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// 0 means auto-detect via the container CPU limit.
    #[serde(default)]
    pub worker_threads: usize,

    #[serde(default)]
    pub ssl: SslConfig,

    #[serde(default = "default_keepalive", deserialize_with = "de_duration_secs")]
    pub keep_alive_timeout: u64,

    #[serde(default = "default_read_timeout", deserialize_with = "de_duration_secs")]
    pub read_timeout: u64,

    #[serde(default = "default_write_timeout", deserialize_with = "de_duration_secs")]
    pub write_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            worker_threads: 0,
            ssl: SslConfig::default(),
            keep_alive_timeout: default_keepalive(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
        }
    }
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_keepalive() -> u64 {
    60
}
fn default_read_timeout() -> u64 {
    30
}
fn default_write_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// A single routing entry. Exactly one of `upstream`, `file_server`,
/// `tcp_proxy` is expected; which one is set determines the protocol the
/// router dispatches matching connections to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub path: String,

    #[serde(default)]
    pub upstream: Option<UpstreamRouteConfig>,

    #[serde(default)]
    pub file_server: Option<FileServerConfig>,

    #[serde(default)]
    pub tcp_proxy: Option<TcpProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRouteConfig {
    pub servers: Vec<UpstreamServerSpec>,

    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamServerSpec {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileServerConfig {
    pub root: String,

    #[serde(default = "default_index_files")]
    pub index_files: Vec<String>,

    #[serde(default)]
    pub directory_listing: bool,

    #[serde(default)]
    pub cache_control: Option<String>,
}

fn default_index_files() -> Vec<String> {
    vec!["index.html".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpProxyConfig {
    pub target_host: String,
    pub target_port: u16,

    #[serde(default = "default_tcp_buffer_size", deserialize_with = "de_byte_size")]
    pub buffer_size: u64,

    #[serde(default = "default_tcp_idle_timeout", deserialize_with = "de_duration_secs")]
    pub idle_timeout: u64,
}

fn default_tcp_buffer_size() -> u64 {
    8192
}
fn default_tcp_idle_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_hc_path")]
    pub path: String,

    #[serde(default = "default_hc_interval", deserialize_with = "de_duration_secs")]
    pub interval: u64,

    #[serde(default = "default_hc_timeout", deserialize_with = "de_duration_secs")]
    pub timeout: u64,

    #[serde(default = "default_hc_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_hc_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    #[serde(default)]
    pub expected_body: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_hc_path(),
            interval: default_hc_interval(),
            timeout: default_hc_timeout(),
            healthy_threshold: default_hc_threshold(),
            unhealthy_threshold: default_hc_threshold(),
            expected_status: default_expected_status(),
            expected_body: None,
        }
    }
}

fn default_hc_path() -> String {
    "/health".to_string()
}
fn default_hc_interval() -> u64 {
    10
}
fn default_hc_timeout() -> u64 {
    3
}
fn default_hc_threshold() -> u32 {
    3
}
fn default_expected_status() -> u16 {
    200
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt: Option<serde_json::Value>,
    #[serde(default)]
    pub api_key: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSectionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_type")]
    pub r#type: String,

    #[serde(default = "default_cache_max_size", deserialize_with = "de_byte_size")]
    pub max_size: u64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_ttl", deserialize_with = "de_duration_secs")]
    pub ttl: u64,

    #[serde(default = "default_cache_min_ttl", deserialize_with = "de_duration_secs")]
    pub min_ttl: u64,

    #[serde(default = "default_cache_max_ttl", deserialize_with = "de_duration_secs")]
    pub max_ttl: u64,

    /// Honor response `Cache-Control`/`Expires` headers when deriving TTL
    /// and response cacheability; when false, only `ttl`/`rules` apply.
    #[serde(default = "default_true")]
    pub respect_cache_control: bool,

    #[serde(default)]
    pub cache_private_responses: bool,

    #[serde(default = "default_cache_bypass_headers")]
    pub cache_bypass_headers: Vec<String>,

    /// Path prefixes that are never cached, regardless of method/headers.
    #[serde(default)]
    pub no_cache_paths: Vec<String>,

    #[serde(default)]
    pub rules: Vec<CacheRule>,
}

impl Default for CacheSectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            r#type: default_cache_type(),
            max_size: default_cache_max_size(),
            max_entries: default_cache_max_entries(),
            ttl: default_cache_ttl(),
            min_ttl: default_cache_min_ttl(),
            max_ttl: default_cache_max_ttl(),
            respect_cache_control: true,
            cache_private_responses: false,
            cache_bypass_headers: default_cache_bypass_headers(),
            no_cache_paths: Vec::new(),
            rules: Vec::new(),
        }
    }
}

fn default_cache_type() -> String {
    "lru".to_string()
}
fn default_cache_max_size() -> u64 {
    100 * 1024 * 1024
}
fn default_cache_max_entries() -> usize {
    10_000
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_cache_min_ttl() -> u64 {
    60
}
fn default_cache_max_ttl() -> u64 {
    3600
}
fn default_cache_bypass_headers() -> Vec<String> {
    vec!["Authorization".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRule {
    pub path_prefix: String,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerSectionConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub health_checks: Option<HealthCheckConfig>,
    #[serde(default)]
    pub session_affinity: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSectionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cb_timeout", deserialize_with = "de_duration_secs")]
    pub timeout: u64,

    #[serde(default)]
    pub routes: Vec<String>,

    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u32,

    #[serde(default = "default_metrics_window", deserialize_with = "de_duration_secs")]
    pub metrics_window_secs: u64,

    #[serde(default = "default_recovery_timeout", deserialize_with = "de_duration_secs")]
    pub recovery_timeout_secs: u64,

    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,

    #[serde(default = "default_true")]
    pub enable_exponential_backoff: bool,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_recovery_timeout", deserialize_with = "de_duration_secs")]
    pub max_recovery_timeout_secs: u64,

    #[serde(default = "default_failure_status_codes")]
    pub failure_status_codes: Vec<u16>,
}

impl Default for CircuitBreakerSectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_cb_failure_threshold(),
            success_threshold: default_cb_success_threshold(),
            timeout: default_cb_timeout(),
            routes: Vec::new(),
            failure_rate_threshold: default_failure_rate_threshold(),
            minimum_requests: default_minimum_requests(),
            metrics_window_secs: default_metrics_window(),
            recovery_timeout_secs: default_recovery_timeout(),
            half_open_max_requests: default_half_open_max_requests(),
            enable_exponential_backoff: true,
            backoff_multiplier: default_backoff_multiplier(),
            max_recovery_timeout_secs: default_max_recovery_timeout(),
            failure_status_codes: default_failure_status_codes(),
        }
    }
}

fn default_cb_failure_threshold() -> u32 {
    5
}
fn default_cb_success_threshold() -> u32 {
    3
}
fn default_cb_timeout() -> u64 {
    5
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_minimum_requests() -> u32 {
    10
}
fn default_metrics_window() -> u64 {
    60
}
fn default_recovery_timeout() -> u64 {
    30
}
fn default_half_open_max_requests() -> u32 {
    5
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_recovery_timeout() -> u64 {
    300
}
fn default_failure_status_codes() -> Vec<u16> {
    vec![500, 502, 503, 504]
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSectionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_rps")]
    pub requests_per_second: u64,

    #[serde(default = "default_burst")]
    pub burst_size: u64,

    #[serde(default)]
    pub per_ip: Option<serde_json::Value>,

    #[serde(default)]
    pub routes: Vec<String>,
}

impl Default for RateLimiterSectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: default_rps(),
            burst_size: default_burst(),
            per_ip: None,
            routes: Vec::new(),
        }
    }
}

fn default_rps() -> u64 {
    1000
}
fn default_burst() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,

    #[serde(default = "default_compression_level")]
    pub level: u32,

    #[serde(default = "default_min_size", deserialize_with = "de_byte_size")]
    pub min_size: u64,

    #[serde(default = "default_mime_types")]
    pub mime_types: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithms: default_algorithms(),
            level: default_compression_level(),
            min_size: default_min_size(),
            mime_types: default_mime_types(),
        }
    }
}

fn default_algorithms() -> Vec<String> {
    vec!["gzip".to_string()]
}
fn default_compression_level() -> u32 {
    6
}
fn default_min_size() -> u64 {
    256
}
fn default_mime_types() -> Vec<String> {
    vec![
        "text/html".to_string(),
        "text/plain".to_string(),
        "text/css".to_string(),
        "application/json".to_string(),
        "application/javascript".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsSectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9091
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub headers: Option<serde_json::Value>,
    #[serde(default)]
    pub cors: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_variants() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("garbage").is_err());
    }

    #[test]
    fn test_parse_byte_size_variants() {
        assert_eq!(parse_byte_size("100KB").unwrap(), 100 * 1024);
        assert_eq!(parse_byte_size("5MB").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_byte_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("2048").unwrap(), 2048);
        assert!(parse_byte_size("nonsense").is_err());
    }

    #[test]
    fn test_server_config_defaults() {
        let yaml = "port: 8080\n";
        let sc: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sc.port, 8080);
        assert_eq!(sc.host, "0.0.0.0");
        assert_eq!(sc.keep_alive_timeout, 60);
        assert!(!sc.ssl.enabled);
    }

    #[test]
    fn test_server_config_duration_units() {
        let yaml = "port: 9000\nkeep_alive_timeout: 2m\nread_timeout: 10s\n";
        let sc: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sc.keep_alive_timeout, 120);
        assert_eq!(sc.read_timeout, 10);
    }

    #[test]
    fn test_route_entry_upstream() {
        let yaml = r#"
path: /api
upstream:
  servers:
    - host: 10.0.0.1
      port: 8080
      weight: 5
  strategy: weighted_round_robin
"#;
        let route: RouteEntry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(route.path, "/api");
        let up = route.upstream.unwrap();
        assert_eq!(up.strategy, "weighted_round_robin");
        assert_eq!(up.servers[0].weight, 5);
    }

    #[test]
    fn test_route_entry_file_server_defaults() {
        let yaml = r#"
path: /static
file_server:
  root: /var/www
"#;
        let route: RouteEntry = serde_yaml::from_str(yaml).unwrap();
        let fs = route.file_server.unwrap();
        assert_eq!(fs.root, "/var/www");
        assert_eq!(fs.index_files, vec!["index.html"]);
        assert!(!fs.directory_listing);
    }

    #[test]
    fn test_route_entry_tcp_proxy() {
        let yaml = r#"
path: /raw
tcp_proxy:
  target_host: 10.0.0.2
  target_port: 6379
  buffer_size: 16KB
"#;
        let route: RouteEntry = serde_yaml::from_str(yaml).unwrap();
        let tcp = route.tcp_proxy.unwrap();
        assert_eq!(tcp.target_port, 6379);
        assert_eq!(tcp.buffer_size, 16 * 1024);
        assert_eq!(tcp.idle_timeout, 300);
    }

    #[test]
    fn test_circuit_breaker_section_defaults() {
        let cb = CircuitBreakerSectionConfig::default();
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.success_threshold, 3);
        assert_eq!(cb.failure_status_codes, vec![500, 502, 503, 504]);
        assert_eq!(cb.max_recovery_timeout_secs, 300);
    }

    #[test]
    fn test_rate_limiter_section_defaults() {
        let rl = RateLimiterSectionConfig::default();
        assert!(!rl.enabled);
        assert_eq!(rl.requests_per_second, 1000);
        assert_eq!(rl.burst_size, 200);
    }

    #[test]
    fn test_full_gateway_config_roundtrip() {
        let yaml = r#"
server:
  port: 8443
  ssl:
    enabled: true
    cert_file: /etc/gw/cert.pem
    key_file: /etc/gw/key.pem
routes:
  - path: /api
    upstream:
      servers:
        - host: 10.0.0.1
          port: 8080
cache:
  enabled: true
  max_size: 50MB
rate_limiter:
  enabled: true
  requests_per_second: 500
"#;
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.port, 8443);
        assert!(cfg.server.ssl.enabled);
        assert_eq!(cfg.routes.len(), 1);
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.cache.max_size, 50 * 1024 * 1024);
        assert!(cfg.rate_limiter.enabled);
        assert_eq!(cfg.rate_limiter.requests_per_second, 500);
    }
}
