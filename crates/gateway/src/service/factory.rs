//! Builds the adapter set from configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::basic::{BasicKind, BasicService};
use super::bitcoind::BitcoindService;
use super::boltz::BoltzService;
use super::connext::{ConnextService, HttpHealth};
use super::geth::{GethService, NetVersionProbe, MAINNET_LIGHT_PROVIDERS, TESTNET_LIGHT_PROVIDERS};
use super::lnd::{GrpcLightning, LndService};
use super::opendexd::{GrpcXud, OpendexdService};
use super::{ContainerHandle, Service, ServiceError};
use crate::config::{GatewayConfig, RpcConfig, ServiceConfig};
use crate::rpc::grpc::GrpcTarget;
use crate::rpc::jsonrpc::HttpJsonRpc;
use crate::runtime::ContainerRuntime;

pub const KNOWN_SERVICES: &[&str] = &[
    "bitcoind",
    "litecoind",
    "geth",
    "lndbtc",
    "lndltc",
    "connext",
    "opendexd",
    "arby",
    "boltz",
    "webui",
];

pub const PROXY: &str = "proxy";

pub struct ServiceFactory<'a> {
    config: &'a GatewayConfig,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
}

impl<'a> ServiceFactory<'a> {
    pub fn new(config: &'a GatewayConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            http: reqwest::Client::new(),
        }
    }

    /// Every configured adapter, in configuration order, followed by the gateway itself.
    pub fn build_all(&self) -> Result<Vec<Arc<dyn Service>>, ServiceError> {
        let mut services = self
            .config
            .services
            .iter()
            .map(|sc| self.build(sc))
            .collect::<Result<Vec<_>, _>>()?;

        let proxy = BasicService::new(PROXY, BasicKind::Proxy, self.container(PROXY));
        services.push(Arc::new(proxy));
        Ok(services)
    }

    pub fn build(&self, sc: &ServiceConfig) -> Result<Arc<dyn Service>, ServiceError> {
        let name = sc.name.as_str();
        let container = self
            .container(name)
            .with_disabled(sc.disabled)
            .with_mode(sc.mode.clone());
        let rpc = &sc.rpc;

        let service: Arc<dyn Service> = match name {
            "bitcoind" | "litecoind" => {
                let l2 = if name == "bitcoind" { "lndbtc" } else { "lndltc" };
                let url = format!("http://{}:{}", self.host(rpc, name), self.port(rpc, name));
                let client = HttpJsonRpc::with_client(self.http.clone(), url).with_basic_auth(
                    rpc.username.clone().unwrap_or_else(|| "xu".to_string()),
                    rpc.password.clone().unwrap_or_else(|| "xu".to_string()),
                );
                Arc::new(BitcoindService::new(name, l2, container, Box::new(client)))
            }
            "geth" => {
                let url = format!("http://{}:{}", self.host(rpc, name), self.port(rpc, name));
                let client = HttpJsonRpc::with_client(self.http.clone(), url);
                let probe = NetVersionProbe::new(self.http.clone());
                let geth = GethService::new(
                    name,
                    container,
                    self.chain_id(),
                    Box::new(client),
                    Box::new(probe),
                );
                Arc::new(match self.config.network.as_str() {
                    "mainnet" => geth.with_light_providers(MAINNET_LIGHT_PROVIDERS),
                    "testnet" => geth.with_light_providers(TESTNET_LIGHT_PROVIDERS),
                    _ => geth,
                })
            }
            "lndbtc" | "lndltc" => {
                let chain = if name == "lndbtc" { "bitcoin" } else { "litecoin" };
                let dir = self.config.data_dir.join(name);
                let target = self.grpc_target(
                    rpc,
                    name,
                    dir.join("tls.cert"),
                    dir.join("data/chain")
                        .join(chain)
                        .join(&self.config.network)
                        .join("readonly.macaroon"),
                );
                let client = GrpcLightning::new(name, target, self.retry_delay());
                Arc::new(LndService::new(
                    name,
                    chain,
                    container,
                    Box::new(client),
                    dir.join("lnd.conf"),
                ))
            }
            "connext" => {
                let health = HttpHealth::new(self.http.clone(), &self.host(rpc, name), self.port(rpc, name));
                Arc::new(ConnextService::new(name, container, Box::new(health)))
            }
            "opendexd" => {
                let dir = self.config.data_dir.join(name);
                let mut target = GrpcTarget::new(self.host(rpc, name), self.port(rpc, name))
                    .with_tls_cert(rpc.tls_cert.clone().unwrap_or_else(|| dir.join("tls.cert")));
                target.macaroon = rpc.macaroon.clone();
                let client = GrpcXud::new(name, target, self.retry_delay());
                Arc::new(OpendexdService::new(
                    name,
                    container,
                    Box::new(client),
                    dir.join("nodekey.dat"),
                ))
            }
            "boltz" => {
                let btc = self.boltz_target(rpc.bitcoin.as_deref(), "bitcoin", 9002);
                let ltc = self.boltz_target(rpc.litecoin.as_deref(), "litecoin", 9102);
                Arc::new(BoltzService::new(name, container, btc, ltc, self.retry_delay()))
            }
            "arby" => Arc::new(BasicService::new(name, BasicKind::Arby, container)),
            "webui" => Arc::new(BasicService::new(name, BasicKind::Webui, container)),
            other => {
                return Err(ServiceError::InvalidArgument(format!(
                    "unknown service: {}",
                    other
                )))
            }
        };

        Ok(service)
    }

    fn container(&self, name: &str) -> ContainerHandle {
        ContainerHandle::new(
            container_name(&self.config.network, name),
            self.runtime.clone(),
        )
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.config.reconnect_delay_secs)
    }

    fn chain_id(&self) -> &'static str {
        if self.config.network == "mainnet" {
            "1"
        } else {
            "4"
        }
    }

    fn host(&self, rpc: &RpcConfig, name: &str) -> String {
        rpc.host.clone().unwrap_or_else(|| name.to_string())
    }

    fn port(&self, rpc: &RpcConfig, name: &str) -> u16 {
        rpc.port
            .unwrap_or_else(|| default_port(name, &self.config.network))
    }

    fn grpc_target(&self, rpc: &RpcConfig, name: &str, cert: PathBuf, macaroon: PathBuf) -> GrpcTarget {
        GrpcTarget::new(self.host(rpc, name), self.port(rpc, name))
            .with_tls_cert(rpc.tls_cert.clone().unwrap_or(cert))
            .with_macaroon(rpc.macaroon.clone().unwrap_or(macaroon))
    }

    fn boltz_target(&self, rpc: Option<&RpcConfig>, chain: &str, port: u16) -> GrpcTarget {
        let dir = self.config.data_dir.join("boltz").join(chain);
        let rpc = rpc.cloned().unwrap_or_default();
        GrpcTarget::new(
            rpc.host.unwrap_or_else(|| "boltz".to_string()),
            rpc.port.unwrap_or(port),
        )
        .with_tls_cert(rpc.tls_cert.unwrap_or_else(|| dir.join("tls.cert")))
        .with_macaroon(rpc.macaroon.unwrap_or_else(|| dir.join("admin.macaroon")))
    }
}

/// Compose-style container name: `<network>_<service>_1`.
pub fn container_name(network: &str, service: &str) -> String {
    format!("{}_{}_1", network, service)
}

fn default_port(service: &str, network: &str) -> u16 {
    match (service, network) {
        ("bitcoind", "mainnet") => 8332,
        ("bitcoind", "testnet") => 18332,
        ("bitcoind", _) => 18443,
        ("litecoind", "mainnet") => 9332,
        ("litecoind", "testnet") => 19332,
        ("litecoind", _) => 19443,
        ("geth", _) => 8545,
        ("lndbtc" | "lndltc", _) => 10009,
        ("connext", _) => 8000,
        ("opendexd", "mainnet") => 8886,
        ("opendexd", "testnet") => 18886,
        ("opendexd", _) => 28886,
        _ => 0,
    }
}
