pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file and apply environment variable
    /// overrides for server-level settings. When the file does not exist,
    /// built-in defaults are used so the gateway can start with zero
    /// configuration for local development.
    ///
    /// This is the "external collaborator stub" for reload: it is a plain
    /// function an operator (or a future file watcher) can call again to
    /// produce a fresh `GatewayConfig`, which the caller then swaps into
    /// `GatewayState` via `ArcSwap::store`. No inotify loop lives here.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => {
                    anyhow::bail!("unsupported config format: .{ext}, use .yaml, .toml or .json")
                }
                None => anyhow::bail!("config file has no extension, use .yaml, .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    /// Kept as `load` for call-site compatibility with the bootstrap path.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_from_path(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GATEWAY_SERVER_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_SSL_ENABLED") {
            self.server.ssl.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("GATEWAY_SSL_CERT_FILE") {
            self.server.ssl.cert_file = Some(v);
        }
        if let Ok(v) = std::env::var("GATEWAY_SSL_KEY_FILE") {
            self.server.ssl.key_file = Some(v);
        }
        if let Ok(v) = std::env::var("GATEWAY_RATE_LIMITER_ENABLED") {
            self.rate_limiter.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("GATEWAY_RATE_LIMITER_RPS") {
            if let Ok(n) = v.parse::<u64>() {
                self.rate_limiter.requests_per_second = n;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_METRICS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.metrics.port = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.ssl.enabled
            && (self.server.ssl.cert_file.is_none() || self.server.ssl.key_file.is_none())
        {
            anyhow::bail!("server.ssl.enabled requires both cert_file and key_file");
        }

        for route in &self.routes {
            let surfaces = [
                route.upstream.is_some(),
                route.file_server.is_some(),
                route.tcp_proxy.is_some(),
            ];
            let set_count = surfaces.iter().filter(|s| **s).count();
            if set_count != 1 {
                anyhow::bail!(
                    "route {} must set exactly one of upstream, file_server, tcp_proxy",
                    route.path
                );
            }
            if let Some(up) = &route.upstream {
                if up.servers.is_empty() {
                    anyhow::bail!("route {} upstream has no servers", route.path);
                }
            }
        }

        if self.circuit_breaker.failure_rate_threshold < 0.0
            || self.circuit_breaker.failure_rate_threshold > 1.0
        {
            anyhow::bail!("circuit_breaker.failure_rate_threshold must be within [0.0, 1.0]");
        }

        Ok(())
    }
}
