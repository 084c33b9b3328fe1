//! geth adapter.
//!
//! Which Ethereum provider is in use is whatever connext was configured
//! with; only the in-stack node is inspected in depth, other providers just
//! get a liveness probe.

use std::any::Any;

use serde_json::{json, Value};
use tokio::time::Instant;

use super::connext::ConnextService;
use super::{
    sync_status, waiting_for, BaseStatus, ContainerHandle, Service, ServiceError, StatusContext,
};
use crate::rpc::jsonrpc::{HttpJsonRpc, JsonRpc};
use crate::rpc::RpcError;
use crate::runtime::BoxFuture;

pub const NATIVE_PROVIDER: &str = "http://geth:8545";

pub const TESTNET_LIGHT_PROVIDERS: &[&str] = &[
    "http://eth.kilrau.com:52041",
    "http://michael1011.at:8546",
    "http://gethopendexdxv2k4pv5t5a5lswq2hcv3icmj3uwg7m2n2vuykiyv77legiad.onion:8546",
];

pub const MAINNET_LIGHT_PROVIDERS: &[&str] = &[
    "http://eth.kilrau.com:41007",
    "http://michael1011.at:8545",
    "http://gethopendexdxv2k4pv5t5a5lswq2hcv3icmj3uwg7m2n2vuykiyv77legiad.onion:8545",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GethMode {
    Native,
    External,
    Infura,
    Light,
}

/// Which kind of provider `url` is.
pub fn classify_provider(url: &str, light_providers: &[String]) -> GethMode {
    if url == NATIVE_PROVIDER {
        GethMode::Native
    } else if url.contains("infura") {
        GethMode::Infura
    } else if light_providers.iter().any(|p| p == url) {
        GethMode::Light
    } else {
        GethMode::External
    }
}

/// `0x`-prefixed JSON-RPC quantity.
pub fn parse_quantity(value: &Value) -> Option<u64> {
    let raw = value.as_str()?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).ok()
}

/// Reachability check of a provider outside the stack.
pub trait ProviderProbe: Send + Sync {
    fn probe<'a>(&'a self, url: &'a str, deadline: Instant) -> BoxFuture<'a, Result<(), RpcError>>;
}

pub struct NetVersionProbe {
    client: reqwest::Client,
}

impl NetVersionProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ProviderProbe for NetVersionProbe {
    fn probe<'a>(&'a self, url: &'a str, deadline: Instant) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let rpc = HttpJsonRpc::with_client(self.client.clone(), url);
            rpc.call("net_version", json!([]), deadline).await?;
            Ok(())
        })
    }
}

pub struct GethService {
    name: String,
    container: ContainerHandle,
    /// Key into connext's `chainProviders`.
    chain_id: String,
    light_providers: Vec<String>,
    rpc: Box<dyn JsonRpc>,
    probe: Box<dyn ProviderProbe>,
}

impl GethService {
    pub fn new(
        name: impl Into<String>,
        container: ContainerHandle,
        chain_id: impl Into<String>,
        rpc: Box<dyn JsonRpc>,
        probe: Box<dyn ProviderProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            container,
            chain_id: chain_id.into(),
            light_providers: Vec::new(),
            rpc,
            probe,
        }
    }

    pub fn with_light_providers(mut self, providers: &[&str]) -> Self {
        self.light_providers = providers.iter().map(|p| p.to_string()).collect();
        self
    }

    /// The provider connext is configured with.
    pub fn provider(&self, ctx: &StatusContext) -> Result<String, ServiceError> {
        let connext = ctx
            .sibling_as::<ConnextService>("connext")
            .ok_or_else(|| ServiceError::Sibling("connext".to_string()))?;
        connext.eth_provider(&self.chain_id)
    }

    async fn interpret(&self, ctx: &StatusContext) -> String {
        let base = self.container.base_status();
        if base == BaseStatus::Disabled {
            return base.to_string();
        }

        let provider = match self.provider(ctx) {
            Ok(provider) => provider,
            Err(e) => return format!("Error: {}", e),
        };

        let (ready, unavailable) = match classify_provider(&provider, &self.light_providers) {
            GethMode::Native => return self.native_status(ctx, base).await,
            GethMode::External => (
                "Ready (connected to external)",
                "Unavailable (connection to external failed)",
            ),
            GethMode::Infura => (
                "Ready (connected to Infura)",
                "Unavailable (connection to Infura failed)",
            ),
            GethMode::Light => ("Ready (light mode)", "Unavailable (light mode failed)"),
        };

        match self.probe.probe(&provider, ctx.deadline()).await {
            Ok(()) => ready.to_string(),
            Err(_) => unavailable.to_string(),
        }
    }

    async fn native_status(&self, ctx: &StatusContext, base: BaseStatus) -> String {
        if !base.is_running() {
            return base.to_string();
        }

        match self.rpc.call("eth_syncing", json!([]), ctx.deadline()).await {
            Ok(Value::Bool(false)) => {}
            Ok(progress) if progress.is_object() => {
                return match (
                    parse_quantity(&progress["currentBlock"]),
                    parse_quantity(&progress["highestBlock"]),
                ) {
                    (Some(current), Some(highest)) => sync_status(current, highest),
                    _ => "Error: eth_syncing without block numbers".to_string(),
                };
            }
            Ok(other) => return format!("Error: unexpected eth_syncing result {}", other),
            Err(_) => return waiting_for(&self.name),
        }

        match self.rpc.call("eth_blockNumber", json!([]), ctx.deadline()).await {
            Ok(height) => match parse_quantity(&height) {
                Some(0) => "Waiting for sync".to_string(),
                Some(_) => "Ready".to_string(),
                None => format!("Error: unexpected eth_blockNumber result {}", height),
            },
            Err(_) => waiting_for(&self.name),
        }
    }
}

impl Service for GethService {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::jsonrpc::testing::ScriptedRpc;
    use crate::runtime::fake::FakeRuntime;
    use crate::service::connext::HealthProbe;
    use crate::service::ServiceRegistry;
    use crate::setup::SetupState;
    use crate::tracker::ContainerRecord;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::Duration;

    struct Never;

    impl HealthProbe for Never {
        fn healthy(&self, _deadline: Instant) -> BoxFuture<'_, bool> {
            Box::pin(async { false })
        }
    }

    /// Records probed URLs and answers with a fixed outcome.
    struct RecordingProbe {
        up: bool,
        probed: Arc<Mutex<Vec<String>>>,
    }

    impl ProviderProbe for RecordingProbe {
        fn probe<'a>(&'a self, url: &'a str, _deadline: Instant) -> BoxFuture<'a, Result<(), RpcError>> {
            self.probed.lock().push(url.to_string());
            let up = self.up;
            Box::pin(async move {
                if up {
                    Ok(())
                } else {
                    Err(RpcError::Timeout)
                }
            })
        }
    }

    struct Fixture {
        ctx: StatusContext,
        rpc: Arc<ScriptedRpc>,
        probed: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(provider: Option<&str>, geth_state: Option<&str>, disabled: bool, probe_up: bool) -> Fixture {
        let runtime = Arc::new(FakeRuntime::new());

        let connext = ConnextService::new(
            "connext",
            ContainerHandle::new("simnet_connext_1", runtime.clone()),
            Box::new(Never),
        );
        if let Some(provider) = provider {
            let config = json!({ "chainProviders": { "4": provider } }).to_string();
            connext.container().tracker().update(Some(
                ContainerRecord::new("c1", "simnet_connext_1", "running").with_env("VECTOR_CONFIG", config),
            ));
        }

        let rpc = Arc::new(ScriptedRpc::new());
        let probed = Arc::new(Mutex::new(Vec::new()));
        let geth = GethService::new(
            "geth",
            ContainerHandle::new("simnet_geth_1", runtime.clone()).with_disabled(disabled),
            "4",
            Box::new(rpc.clone()),
            Box::new(RecordingProbe {
                up: probe_up,
                probed: probed.clone(),
            }),
        )
        .with_light_providers(TESTNET_LIGHT_PROVIDERS);
        if let Some(state) = geth_state {
            geth.container()
                .tracker()
                .update(Some(ContainerRecord::new("g1", "simnet_geth_1", state)));
        }

        let registry = ServiceRegistry::new(vec![
            Arc::new(connext) as Arc<dyn Service>,
            Arc::new(geth) as Arc<dyn Service>,
        ])
        .unwrap();
        Fixture {
            ctx: StatusContext::new(
                Arc::new(registry),
                Instant::now() + Duration::from_secs(1),
                SetupState::Attached,
            ),
            rpc,
            probed,
        }
    }

    async fn status(fixture: &Fixture) -> String {
        fixture.ctx.sibling("geth").unwrap().status(&fixture.ctx).await
    }

    #[test]
    fn test_provider_classification() {
        let light: Vec<String> = TESTNET_LIGHT_PROVIDERS.iter().map(|p| p.to_string()).collect();
        assert_eq!(classify_provider("http://geth:8545", &light), GethMode::Native);
        assert_eq!(
            classify_provider("https://rinkeby.infura.io/v3/abc", &light),
            GethMode::Infura
        );
        assert_eq!(classify_provider("http://michael1011.at:8546", &light), GethMode::Light);
        assert_eq!(classify_provider("http://10.0.0.9:8545", &light), GethMode::External);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x10")), Some(16));
        assert_eq!(parse_quantity(&json!("0x0")), Some(0));
        assert_eq!(parse_quantity(&json!(16)), None);
        assert_eq!(parse_quantity(&json!("0xzz")), None);
    }

    #[tokio::test]
    async fn test_native_node_progress() {
        let fixture = fixture(Some(NATIVE_PROVIDER), Some("running"), false, true);
        fixture.rpc.reply(
            "eth_syncing",
            Ok(json!({"currentBlock": "0x32", "highestBlock": "0x64"})),
        );
        fixture.rpc.reply("eth_syncing", Ok(json!(false)));
        fixture.rpc.reply("eth_blockNumber", Ok(json!("0x0")));
        fixture.rpc.reply("eth_syncing", Ok(json!(false)));
        fixture.rpc.reply("eth_blockNumber", Ok(json!("0x1b4")));

        assert_eq!(status(&fixture).await, "Syncing 50.00% (50/100)");
        assert_eq!(status(&fixture).await, "Waiting for sync");
        assert_eq!(status(&fixture).await, "Ready");
        assert_eq!(status(&fixture).await, "Waiting for geth to come up...");
        assert!(fixture.probed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_native_container_states() {
        let stopped = fixture(Some(NATIVE_PROVIDER), Some("exited"), false, true);
        assert_eq!(status(&stopped).await, "Container exited");

        let disabled = fixture(None, None, true, true);
        assert_eq!(status(&disabled).await, "Disabled");
        assert_eq!(disabled.rpc.calls(), 0);
        assert!(disabled.probed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_providers_are_probed() {
        let infura = fixture(Some("https://rinkeby.infura.io/v3/abc"), None, false, true);
        assert_eq!(status(&infura).await, "Ready (connected to Infura)");
        assert_eq!(*infura.probed.lock(), vec!["https://rinkeby.infura.io/v3/abc"]);

        let light = fixture(Some("http://eth.kilrau.com:52041"), None, false, false);
        assert_eq!(status(&light).await, "Unavailable (light mode failed)");

        let external = fixture(Some("http://10.0.0.9:8545"), None, false, false);
        assert_eq!(
            status(&external).await,
            "Unavailable (connection to external failed)"
        );
        assert_eq!(external.rpc.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_provider_reports_error() {
        // connext container not created yet
        let fixture = fixture(None, Some("running"), false, true);
        assert_eq!(
            status(&fixture).await,
            "Error: Container not found: simnet_connext_1"
        );
        assert_eq!(fixture.rpc.calls(), 0);
        assert!(fixture.probed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_provider_for_other_chain_reports_error() {
        let fixture = fixture(Some(NATIVE_PROVIDER), Some("running"), false, true);
        let mainnet = GethService::new(
            "geth",
            ContainerHandle::new("mainnet_geth_1", Arc::new(FakeRuntime::new())),
            "1",
            Box::new(fixture.rpc.clone()),
            Box::new(RecordingProbe {
                up: true,
                probed: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        assert_eq!(
            mainnet.status(&fixture.ctx).await,
            "Error: Malformed data: no provider for chain 1"
        );
    }

    #[tokio::test]
    async fn test_missing_connext_sibling_reports_error() {
        let runtime = Arc::new(FakeRuntime::new());
        let geth = GethService::new(
            "geth",
            ContainerHandle::new("simnet_geth_1", runtime),
            "4",
            Box::new(ScriptedRpc::new()),
            Box::new(RecordingProbe {
                up: true,
                probed: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        let registry = ServiceRegistry::new(Vec::new()).unwrap();
        let ctx = StatusContext::new(
            Arc::new(registry),
            Instant::now() + Duration::from_secs(1),
            SetupState::Attached,
        );
        assert_eq!(
            geth.status(&ctx).await,
            "Error: Sibling service unavailable: connext"
        );
    }
}
