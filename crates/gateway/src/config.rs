use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::service::factory::KNOWN_SERVICES;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// `mainnet`, `testnet` or `simnet`; prefixes every container name.
    pub network: String,
    /// Root of the per-service data directories (certificates, macaroons, lnd.conf).
    pub data_dir: PathBuf,
    pub docker_socket: String,
    pub api_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Launcher log to follow for setup progress.
    #[serde(default)]
    pub launcher_log: Option<PathBuf>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    /// `native`, `external`, `infura`, `light`; empty means native.
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disabled: false,
            mode: String::new(),
            rpc: RpcConfig::default(),
        }
    }
}

/// Upstream endpoint overrides. Anything left unset falls back to the
/// stack's conventional location for the service and network.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub macaroon: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// boltz: per-currency daemons
    #[serde(default)]
    pub bitcoin: Option<Box<RpcConfig>>,
    #[serde(default)]
    pub litecoin: Option<Box<RpcConfig>>,
}

impl GatewayConfig {
    /// Load configuration from gateway.toml and environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&GatewayConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        // 1. /etc/dexgate/gateway.toml (container image)
        // 2. config/gateway.toml (local development)
        for path in ["/etc/dexgate/gateway", "config/gateway"] {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // GATEWAY_SERVER__BIND_ADDRESS, GATEWAY_NETWORK, ...
        builder = builder.add_source(
            config::Environment::with_prefix("GATEWAY")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .context("Invalid bind_address")?;

        if !["mainnet", "testnet", "simnet"].contains(&self.network.as_str()) {
            anyhow::bail!("Unknown network '{}'", self.network);
        }

        if self.api_timeout_secs == 0 {
            anyhow::bail!("api_timeout_secs must be greater than zero");
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !KNOWN_SERVICES.contains(&service.name.as_str()) {
                anyhow::bail!("Unknown service '{}'", service.name);
            }
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("Service '{}' configured twice", service.name);
            }
        }

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            network: "testnet".to_string(),
            data_dir: PathBuf::from("/root/network/data"),
            docker_socket: "/var/run/docker.sock".to_string(),
            api_timeout_secs: 10,
            reconnect_delay_secs: 3,
            launcher_log: None,
            server: ServerConfig {
                bind_address: "0.0.0.0:8080".to_string(),
            },
            logging: LoggingConfig {
                level: "info,gateway=debug".to_string(),
                format: LogFormat::Pretty,
            },
            services: KNOWN_SERVICES.iter().map(|name| ServiceConfig::new(*name)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.services.len(), KNOWN_SERVICES.len());
        assert_eq!(config.api_timeout_secs, 10);
        assert_eq!(config.reconnect_delay_secs, 3);
    }

    #[test]
    fn test_rejects_bad_bind_address() {
        let mut config = GatewayConfig::default();
        config.server.bind_address = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_and_duplicate_services() {
        let mut config = GatewayConfig::default();
        config.services.push(ServiceConfig::new("xud"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown service 'xud'"));

        let mut config = GatewayConfig::default();
        config.services.push(ServiceConfig::new("geth"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_rejects_unknown_network() {
        let mut config = GatewayConfig::default();
        config.network = "regtest".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_round_trip_through_config_layers() {
        let defaults = config::Config::try_from(&GatewayConfig::default()).unwrap();
        let config: GatewayConfig = config::Config::builder()
            .add_source(defaults)
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.network, "testnet");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.services.iter().all(|s| !s.disabled));
    }
}
