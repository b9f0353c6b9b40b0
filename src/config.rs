//! Configuration types consumed by the gateway core.
//!
//! The core expects a fully-validated [`Config`]: `load_from_file` plus
//! `validate` produce one from YAML or JSON. Online status fields are
//! `Option`s on purpose - an unset field is filled from the backend's live
//! status, while a field explicitly set to zero stays zero.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateways: HashMap<String, GatewayConfig>,
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Optional listen address for the Prometheus scrape endpoint.
    #[serde(default)]
    pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen addresses; binding is all-or-nothing per gateway.
    pub binds: Vec<String>,
    #[serde(default)]
    pub receive_proxy_protocol: bool,
    #[serde(default)]
    pub receive_real_ip: bool,
    /// Deadline for the client to complete its handshake, in milliseconds.
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    /// Ids of the servers this gateway may route to.
    pub servers: Vec<String>,
    #[serde(default = "default_server_not_found_message")]
    pub server_not_found_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Domain patterns matched against the requested hostname. Exact
    /// entries win over `*.` wildcards; first registered wins on collision.
    pub domains: Vec<String>,
    /// Backend dial target, `host:port`.
    pub address: String,
    /// Optional local address to bind outbound connections to.
    #[serde(default)]
    pub proxy_bind: Option<String>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default)]
    pub send_proxy_protocol: bool,
    #[serde(default)]
    pub send_real_ip: bool,
    #[serde(default = "default_disconnect_message")]
    pub disconnect_message: String,
    #[serde(default)]
    pub online_status: OnlineStatusConfig,
    #[serde(default)]
    pub offline_status: OfflineStatusConfig,
}

/// Status overrides applied while the backend is reachable. Every field is
/// optional; unset fields pass the backend's live values through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnlineStatusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_player_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_sample: Option<Vec<PlayerSampleConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
}

/// Status served verbatim while the backend is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineStatusConfig {
    #[serde(default = "default_offline_version_name")]
    pub version_name: String,
    #[serde(default)]
    pub protocol_number: i32,
    #[serde(default)]
    pub max_player_count: i32,
    #[serde(default)]
    pub player_count: i32,
    #[serde(default)]
    pub player_sample: Vec<PlayerSampleConfig>,
    #[serde(default)]
    pub icon_path: Option<String>,
    #[serde(default = "default_offline_motd")]
    pub motd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerSampleConfig {
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of connection-processing workers.
    #[serde(default = "default_pool_workers")]
    pub workers: usize,
    /// Submission queue capacity; defaults to twice the worker count.
    #[serde(default)]
    pub queue_size: Option<usize>,
}

impl Default for OfflineStatusConfig {
    fn default() -> Self {
        Self {
            version_name: default_offline_version_name(),
            protocol_number: 0,
            max_player_count: 0,
            player_count: 0,
            player_sample: Vec::new(),
            icon_path: None,
            motd: default_offline_motd(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_pool_workers(),
            queue_size: None,
        }
    }
}

impl PoolConfig {
    pub fn effective_queue_size(&self) -> usize {
        self.queue_size.unwrap_or(self.workers * 2).max(1)
    }
}

fn default_client_timeout_ms() -> u64 {
    5000
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_server_not_found_message() -> String {
    "There is no server with that address.".to_string()
}

fn default_disconnect_message() -> String {
    "The server is currently unreachable.".to_string()
}

fn default_offline_version_name() -> String {
    "Offline".to_string()
}

fn default_offline_motd() -> String {
    "This server is offline.".to_string()
}

fn default_pool_workers() -> usize {
    16
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;

        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            // Default to YAML
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-references and shapes the core relies on. Ambiguous
    /// domain collisions are reported as warnings, never as errors.
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(anyhow::anyhow!("pool.workers must be at least 1"));
        }

        if let Some(bind) = &self.metrics_bind {
            bind.parse::<std::net::SocketAddr>()
                .map_err(|_| anyhow::anyhow!("invalid metrics_bind address '{}'", bind))?;
        }

        for (id, server) in &self.servers {
            if server.domains.is_empty() {
                return Err(anyhow::anyhow!("server '{}' has no domains", id));
            }
            if server.address.is_empty() {
                return Err(anyhow::anyhow!("server '{}' has no address", id));
            }
            if let Some(bind) = &server.proxy_bind {
                bind.parse::<std::net::IpAddr>().map_err(|_| {
                    anyhow::anyhow!("server '{}' has invalid proxy_bind '{}'", id, bind)
                })?;
            }
        }

        for (id, gateway) in &self.gateways {
            if gateway.binds.is_empty() {
                return Err(anyhow::anyhow!("gateway '{}' has no bind addresses", id));
            }
            for bind in &gateway.binds {
                bind.parse::<std::net::SocketAddr>().map_err(|_| {
                    anyhow::anyhow!("gateway '{}' has invalid bind address '{}'", id, bind)
                })?;
            }
            if gateway.servers.is_empty() {
                return Err(anyhow::anyhow!("gateway '{}' routes to no servers", id));
            }
            for server_id in &gateway.servers {
                if !self.servers.contains_key(server_id) {
                    return Err(anyhow::anyhow!(
                        "gateway '{}' references unknown server '{}'",
                        id,
                        server_id
                    ));
                }
            }

            // Duplicate domains across one gateway's servers: first
            // registered wins at table build, so only warn here.
            let mut seen: HashMap<String, &str> = HashMap::new();
            for server_id in &gateway.servers {
                for domain in &self.servers[server_id].domains {
                    let normalized = crate::protocol::normalize_domain(domain);
                    if let Some(existing) = seen.get(&normalized) {
                        warn!(
                            gateway = %id,
                            domain = %normalized,
                            first = %existing,
                            duplicate = %server_id,
                            "domain registered by multiple servers; first registered wins"
                        );
                    } else {
                        seen.insert(normalized, server_id);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn minimal_config_yaml() -> &'static str {
        r#"
gateways:
  default:
    binds: ["127.0.0.1:25565"]
    servers: [vanilla]
servers:
  vanilla:
    domains: ["play.example.com"]
    address: "127.0.0.1:25566"
"#
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = serde_yaml::from_str(minimal_config_yaml()).unwrap();
        config.validate().unwrap();

        let gateway = &config.gateways["default"];
        assert_eq!(gateway.client_timeout_ms, 5000);
        assert!(!gateway.receive_proxy_protocol);
        assert_eq!(
            gateway.server_not_found_message,
            "There is no server with that address."
        );

        let server = &config.servers["vanilla"];
        assert_eq!(server.dial_timeout_ms, 5000);
        assert!(server.online_status.player_count.is_none());
        assert_eq!(server.offline_status.max_player_count, 0);
        assert_eq!(config.pool.workers, 16);
        assert_eq!(config.pool.effective_queue_size(), 32);
    }

    #[test]
    fn test_zero_player_count_is_present_not_default() {
        let yaml = r#"
domains: ["a.example.com"]
address: "127.0.0.1:25566"
online_status:
  player_count: 0
"#;
        let server: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(server.online_status.player_count, Some(0));
        assert_eq!(server.online_status.max_player_count, None);
    }

    #[test]
    fn test_unknown_server_reference_rejected() {
        let yaml = r#"
gateways:
  default:
    binds: ["127.0.0.1:25565"]
    servers: [missing]
servers:
  vanilla:
    domains: ["play.example.com"]
    address: "127.0.0.1:25566"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_bind_rejected() {
        let yaml = r#"
gateways:
  default:
    binds: ["not-an-addr"]
    servers: [vanilla]
servers:
  vanilla:
    domains: ["play.example.com"]
    address: "127.0.0.1:25566"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
