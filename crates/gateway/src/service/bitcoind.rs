//! bitcoind / litecoind adapter.
//!
//! The chain node can run inside the stack, be an external node lnd points
//! at, or be absent because lnd runs neutrino. Which one applies is read
//! from the lnd sibling's `lnd.conf`.

use std::any::Any;

use serde_json::{json, Value};

use super::lnd::LndService;
use super::{sync_status, waiting_for, ContainerHandle, Service, ServiceError, StatusContext};
use crate::rpc::jsonrpc::JsonRpc;
use crate::rpc::RpcError;
use crate::runtime::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Native,
    External,
    Light,
}

pub struct BitcoindService {
    name: String,
    /// The lnd adapter backed by this node.
    l2_name: String,
    container: ContainerHandle,
    rpc: Box<dyn JsonRpc>,
}

impl BitcoindService {
    pub fn new(
        name: impl Into<String>,
        l2_name: impl Into<String>,
        container: ContainerHandle,
        rpc: Box<dyn JsonRpc>,
    ) -> Self {
        Self {
            name: name.into(),
            l2_name: l2_name.into(),
            container,
            rpc,
        }
    }

    pub fn l2_name(&self) -> &str {
        &self.l2_name
    }

    pub async fn mode(&self, ctx: &StatusContext) -> Result<ChainMode, ServiceError> {
        let lnd = ctx
            .sibling_as::<LndService>(&self.l2_name)
            .ok_or_else(|| ServiceError::Sibling(self.l2_name.clone()))?;

        let backend = lnd.backend_node().await?;
        match backend.as_str() {
            "bitcoind" | "litecoind" => {
                let hosts = lnd.config_values(&format!("{}.rpchost", backend)).await?;
                let host = hosts
                    .first()
                    .and_then(|h| h.split(':').next())
                    .unwrap_or_default();
                if host == backend {
                    Ok(ChainMode::Native)
                } else {
                    Ok(ChainMode::External)
                }
            }
            "neutrino" => Ok(ChainMode::Light),
            other => Err(ServiceError::Malformed(format!("unexpected backend: {}", other))),
        }
    }

    pub async fn blockchain_info(&self, ctx: &StatusContext) -> Result<Value, RpcError> {
        self.rpc.call("getblockchaininfo", json!([]), ctx.deadline()).await
    }

    async fn interpret(&self, ctx: &StatusContext) -> String {
        match self.mode(ctx).await {
            Ok(ChainMode::External) => "Ready (connected to external)".to_string(),
            Ok(ChainMode::Light) => "Ready (light mode)".to_string(),
            Ok(ChainMode::Native) => self.native_status(ctx).await,
            Err(e) => format!("Error: {}", e),
        }
    }

    async fn native_status(&self, ctx: &StatusContext) -> String {
        let base = self.container.base_status();
        if !base.is_running() {
            return base.to_string();
        }

        match self.blockchain_info(ctx).await {
            Ok(info) => match (info["blocks"].as_u64(), info["headers"].as_u64()) {
                (Some(blocks), Some(headers)) => sync_status(blocks, headers),
                _ => "Error: getblockchaininfo without blocks/headers".to_string(),
            },
            // Warmup messages such as "Loading block index..."
            Err(RpcError::Remote { message, .. }) => message,
            Err(_) => waiting_for(&self.name),
        }
    }
}

impl Service for BitcoindService {
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
}
