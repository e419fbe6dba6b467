use super::types::*;
use super::GatewayConfig;
use std::path::Path;

#[test]
fn test_load_missing_file_uses_defaults() {
    let cfg = GatewayConfig::load(Path::new("/nonexistent/gateway.yaml")).unwrap();
    assert_eq!(cfg.server.port, 8080);
    assert!(cfg.routes.is_empty());
}

#[test]
fn test_load_yaml_config() {
    let yaml = r#"
server:
  port: 8081
routes:
  - path: /api
    upstream:
      servers:
        - host: 127.0.0.1
          port: 9000
"#;
    let tmp = std::env::temp_dir().join("gateway_test_config.yaml");
    std::fs::write(&tmp, yaml).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.routes.len(), 1);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_toml_config() {
    let toml_str = r#"
[server]
port = 8082
"#;
    let tmp = std::env::temp_dir().join("gateway_test_config.toml");
    std::fs::write(&tmp, toml_str).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server.port, 8082);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "server": { "port": 8083 },
        "routes": [{
            "path": "/static",
            "file_server": { "root": "/var/www" }
        }]
    }"#;
    let tmp = std::env::temp_dir().join("gateway_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server.port, 8083);
    assert_eq!(cfg.routes.len(), 1);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_unsupported_format() {
    let tmp = std::env::temp_dir().join("gateway_test_config.ini");
    std::fs::write(&tmp, "key=value").unwrap();
    assert!(GatewayConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_ssl_requires_cert_and_key() {
    let mut cfg = GatewayConfig::default();
    cfg.server.ssl.enabled = true;
    assert!(cfg.validate().is_err());

    cfg.server.ssl.cert_file = Some("/etc/cert.pem".into());
    cfg.server.ssl.key_file = Some("/etc/key.pem".into());
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_route_requires_exactly_one_surface() {
    let mut cfg = GatewayConfig::default();
    cfg.routes.push(RouteEntry {
        path: "/x".into(),
        upstream: None,
        file_server: None,
        tcp_proxy: None,
    });
    assert!(cfg.validate().is_err());

    cfg.routes[0].file_server = Some(FileServerConfig {
        root: "/var/www".into(),
        index_files: vec!["index.html".into()],
        directory_listing: false,
        cache_control: None,
    });
    cfg.routes[0].upstream = Some(UpstreamRouteConfig {
        servers: vec![UpstreamServerSpec {
            host: "127.0.0.1".into(),
            port: 80,
            weight: 1,
        }],
        strategy: "round_robin".into(),
        health_check: None,
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_upstream_requires_servers() {
    let mut cfg = GatewayConfig::default();
    cfg.routes.push(RouteEntry {
        path: "/x".into(),
        upstream: Some(UpstreamRouteConfig {
            servers: vec![],
            strategy: "round_robin".into(),
            health_check: None,
        }),
        file_server: None,
        tcp_proxy: None,
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_failure_rate_threshold_range() {
    let mut cfg = GatewayConfig::default();
    cfg.circuit_breaker.failure_rate_threshold = 1.5;
    assert!(cfg.validate().is_err());
    cfg.circuit_breaker.failure_rate_threshold = 0.5;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_env_override_server_port() {
    std::env::set_var("GATEWAY_SERVER_PORT", "7777");
    let mut cfg = GatewayConfig::default();
    cfg.apply_env_overrides();
    assert_eq!(cfg.server.port, 7777);
    std::env::remove_var("GATEWAY_SERVER_PORT");
}
