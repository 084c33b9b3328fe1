//! lnd adapter (`lndbtc`, `lndltc`).
//!
//! Status comes from `Lightning.GetInfo`. The node's `lnd.conf` is read on
//! demand so chain adapters can tell which backend lnd is using.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use super::{waiting_for, ContainerHandle, Service, ServiceError, StatusContext};
use crate::rpc::conn::ResilientConnection;
use crate::rpc::grpc::{request_with_deadline, unary, AuthedChannel, GrpcConnector, GrpcTarget};
use crate::rpc::proto::lnrpc::{lightning_client::LightningClient, GetInfoRequest, GetInfoResponse};
use crate::rpc::RpcError;
use crate::runtime::BoxFuture;

pub const WALLET_LOCKED: &str = "Wallet locked. Unlock with lncli unlock.";

/// The slice of the Lightning API the gateway uses.
pub trait LightningApi: Send + Sync {
    fn get_info(&self, deadline: Instant) -> BoxFuture<'_, Result<GetInfoResponse, RpcError>>;

    fn open(&self) {}

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async { Ok(()) })
    }
}

pub struct GrpcLightning {
    conn: ResilientConnection<GrpcConnector<LightningClient<AuthedChannel>>>,
}

impl GrpcLightning {
    pub fn new(name: &str, target: GrpcTarget, retry_delay: Duration) -> Self {
        let connector = GrpcConnector::new(LightningClient::new);
        Self {
            conn: ResilientConnection::new(format!("{}.rpc", name), connector, target)
                .with_retry_delay(retry_delay),
        }
    }
}

impl LightningApi for GrpcLightning {
    fn get_info(&self, deadline: Instant) -> BoxFuture<'_, Result<GetInfoResponse, RpcError>> {
        Box::pin(async move {
            let mut client = self.conn.current_client().ok_or(RpcError::NoClient)?;
            let request = request_with_deadline(GetInfoRequest {}, deadline);
            unary(deadline, client.get_info(request)).await
        })
    }

    fn open(&self) {
        self.conn.open();
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move { Ok(self.conn.close().await?) })
    }
}

pub struct LndService {
    name: String,
    /// `bitcoin` or `litecoin`, the section prefix in `lnd.conf`.
    chain: String,
    container: ContainerHandle,
    rpc: Box<dyn LightningApi>,
    conf_path: PathBuf,
}

impl LndService {
    pub fn new(
        name: impl Into<String>,
        chain: impl Into<String>,
        container: ContainerHandle,
        rpc: Box<dyn LightningApi>,
        conf_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            chain: chain.into(),
            container,
            rpc,
            conf_path: conf_path.into(),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    pub async fn get_info(&self, deadline: Instant) -> Result<GetInfoResponse, RpcError> {
        self.rpc.get_info(deadline).await
    }

    /// Values of `key` in `lnd.conf`. A dotted key is looked up in the
    /// section named after its prefix, a plain key in the default section.
    pub async fn config_values(&self, key: &str) -> Result<Vec<String>, ServiceError> {
        let content = tokio::fs::read_to_string(&self.conf_path).await?;
        let entries = parse_conf(&content);
        let values = lookup(&entries, key);
        if values.is_empty() {
            return Err(ServiceError::Malformed(format!(
                "{} not set in {}",
                key,
                self.conf_path.display()
            )));
        }
        Ok(values)
    }

    /// Chain backend lnd runs against: `bitcoind`, `litecoind`, `neutrino`, ...
    pub async fn backend_node(&self) -> Result<String, ServiceError> {
        let key = format!("{}.node", self.chain);
        let mut values = self.config_values(&key).await?;
        Ok(values.swap_remove(0))
    }

    async fn interpret(&self, ctx: &StatusContext) -> String {
        let base = self.container.base_status();
        if !base.is_running() {
            return base.to_string();
        }

        match self.rpc.get_info(ctx.deadline()).await {
            Ok(info) if info.synced_to_chain => "Ready".to_string(),
            Ok(_) => "Syncing".to_string(),
            Err(e) => self.error_status(&e),
        }
    }

    fn error_status(&self, err: &RpcError) -> String {
        match err {
            RpcError::Status(status)
                if status.message().contains("wallet locked")
                    || status.message().contains("Wallet is encrypted") =>
            {
                WALLET_LOCKED.to_string()
            }
            // Before unlock only the WalletUnlocker service is served
            RpcError::Status(status)
                if status.code() == tonic::Code::Unimplemented
                    && status.message().contains("lnrpc.Lightning") =>
            {
                WALLET_LOCKED.to_string()
            }
            e if e.is_unreachable() => waiting_for(&self.name),
            e => format!("Error: {}", e),
        }
    }
}

impl Service for LndService {
    fn name(&self) -> &str {
        &self.name
    }

    fn container(&self) -> &ContainerHandle {
        &self.container
    }

    fn status<'a>(&'a self, ctx: &'a StatusContext) -> BoxFuture<'a, String> {
        Box::pin(self.interpret(ctx))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn open(&self) {
        self.rpc.open();
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        self.rpc.close()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfEntry {
    /// Lower-cased section name, empty for the default section.
    pub section: String,
    pub key: String,
    pub value: String,
}

/// Parses an lnd-style INI file, keeping repeated keys in order.
pub fn parse_conf(content: &str) -> Vec<ConfEntry> {
    let mut section = String::new();
    let mut entries = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_lowercase();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        entries.push(ConfEntry {
            section: section.clone(),
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        });
    }

    entries
}

/// All values of `key`, in file order.
pub fn lookup(entries: &[ConfEntry], key: &str) -> Vec<String> {
    let section = match key.split_once('.') {
        Some((prefix, _)) => prefix.to_lowercase(),
        None => String::new(),
    };
    entries
        .iter()
        .filter(|e| e.section == section && e.key == key)
        .map(|e| e.value.clone())
        .collect()
}
