use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Cluster state and runner call settings
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Request telemetry
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Maximum time a proxied request may wait for the backend (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Path of the persisted runner membership (default: cluster.json)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Per-runner timeout for application listings in seconds (default: 10)
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,

    /// Per-runner timeout for system info in seconds (default: 5)
    #[serde(default = "default_system_timeout")]
    pub system_timeout_secs: u64,

    /// Ceiling on the whole system-info fan-out in seconds (default: 45)
    #[serde(default = "default_aggregate_timeout")]
    pub aggregate_timeout_secs: u64,

    /// Timeout for a single application creation call in seconds (default: 60)
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,
}

impl ClusterConfig {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn system_timeout(&self) -> Duration {
        Duration::from_secs(self.system_timeout_secs)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_secs(self.aggregate_timeout_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            refresh_timeout_secs: default_refresh_timeout(),
            system_timeout_secs: default_system_timeout(),
            aggregate_timeout_secs: default_aggregate_timeout(),
            create_timeout_secs: default_create_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    /// UDP address receiving one JSON datagram per request (disabled when unset)
    pub udp_target: Option<SocketAddr>,
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per runner
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    300 // 5 minutes, app builds behind the proxy can be slow
}

fn default_state_file() -> PathBuf {
    PathBuf::from("cluster.json")
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_system_timeout() -> u64 {
    5
}

fn default_aggregate_timeout() -> u64 {
    45
}

fn default_create_timeout() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let cluster = &self.cluster;

        for (name, value) in [
            ("cluster.refresh_timeout_secs", cluster.refresh_timeout_secs),
            ("cluster.system_timeout_secs", cluster.system_timeout_secs),
            ("cluster.aggregate_timeout_secs", cluster.aggregate_timeout_secs),
            ("cluster.create_timeout_secs", cluster.create_timeout_secs),
            ("server.request_timeout_secs", self.server.request_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than zero", name));
            }
        }

        if cluster.aggregate_timeout_secs < cluster.system_timeout_secs {
            errors.push(format!(
                "cluster.aggregate_timeout_secs ({}) must not be below cluster.system_timeout_secs ({})",
                cluster.aggregate_timeout_secs, cluster.system_timeout_secs
            ));
        }

        if cluster.state_file.as_os_str().is_empty() {
            errors.push("cluster.state_file must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"
request_timeout_secs = 60

[cluster]
state_file = "/var/lib/runnergate/cluster.json"
refresh_timeout_secs = 3
aggregate_timeout_secs = 20

[telemetry]
udp_target = "127.0.0.1:9125"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.bind_addr().unwrap().to_string(), "127.0.0.1:9090");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.cluster.state_file,
            PathBuf::from("/var/lib/runnergate/cluster.json")
        );
        assert_eq!(config.cluster.refresh_timeout(), Duration::from_secs(3));
        assert_eq!(config.cluster.system_timeout(), Duration::from_secs(5));
        assert_eq!(config.cluster.aggregate_timeout(), Duration::from_secs(20));
        assert_eq!(
            config.telemetry.udp_target.unwrap().to_string(),
            "127.0.0.1:9125"
        );
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
        assert_eq!(config.request_timeout_secs, 300);
    }

    #[test]
    fn test_default_cluster_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.state_file, PathBuf::from("cluster.json"));
        assert_eq!(config.refresh_timeout(), Duration::from_secs(10));
        assert_eq!(config.system_timeout(), Duration::from_secs(5));
        assert_eq!(config.aggregate_timeout(), Duration::from_secs(45));
        assert_eq!(config.create_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.telemetry.udp_target.is_none());
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let config: Config = toml::from_str(
            r#"
[cluster]
refresh_timeout_secs = 0
system_timeout_secs = 0
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("cluster.refresh_timeout_secs"));
        assert!(err.contains("cluster.system_timeout_secs"));
    }

    #[test]
    fn test_validate_ceiling_below_system_timeout() {
        let config: Config = toml::from_str(
            r#"
[cluster]
system_timeout_secs = 30
aggregate_timeout_secs = 10
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("aggregate_timeout_secs"));
    }

    #[test]
    fn test_invalid_telemetry_target_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[telemetry]
udp_target = "not an address"
"#,
        );
        assert!(result.is_err());
    }
}
