//! opendexd adapter.
//!
//! opendexd aggregates its own view of lnd and connext, so its status is a
//! readiness summary of the whole trading layer.

use std::any::Any;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use super::{BaseStatus, ContainerHandle, Service, ServiceError, StatusContext};
use crate::rpc::conn::ResilientConnection;
use crate::rpc::grpc::{request_with_deadline, unary, AuthedChannel, GrpcConnector, GrpcTarget};
use crate::rpc::proto::xudrpc::{
    xud_client::XudClient, xud_init_client::XudInitClient, CreateNodeRequest, CreateNodeResponse,
    GetBalanceRequest, GetBalanceResponse, GetInfoRequest, GetInfoResponse, UnlockNodeRequest,
    UnlockNodeResponse,
};
use crate::rpc::RpcError;
use crate::runtime::BoxFuture;

pub const WALLET_MISSING: &str = "Wallet missing. Create with opendex-cli create/restore.";
pub const WALLET_LOCKED: &str = "Wallet locked. Unlock with opendex-cli unlock.";

/// The opendexd calls the gateway makes.
pub trait XudApi: Send + Sync {
    fn get_info(&self, deadline: Instant) -> BoxFuture<'_, Result<GetInfoResponse, RpcError>>;

    fn get_balance(
        &self,
        currency: Option<String>,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<GetBalanceResponse, RpcError>>;

    fn create_node(
        &self,
        password: String,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<CreateNodeResponse, RpcError>>;

    fn unlock_node(
        &self,
        password: String,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<UnlockNodeResponse, RpcError>>;

    fn open(&self) {}

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Both opendexd services over one channel.
#[derive(Clone)]
pub struct XudClients {
    xud: XudClient<AuthedChannel>,
    init: XudInitClient<AuthedChannel>,
}

impl XudClients {
    fn new(channel: AuthedChannel) -> Self {
        Self {
            xud: XudClient::new(channel.clone()),
            init: XudInitClient::new(channel),
        }
    }
}

pub struct GrpcXud {
    conn: ResilientConnection<GrpcConnector<XudClients>>,
}

impl GrpcXud {
    pub fn new(name: &str, target: GrpcTarget, retry_delay: Duration) -> Self {
        let connector = GrpcConnector::new(XudClients::new);
        Self {
            conn: ResilientConnection::new(format!("{}.rpc", name), connector, target)
                .with_retry_delay(retry_delay),
        }
    }

    fn clients(&self) -> Result<XudClients, RpcError> {
        self.conn.current_client().ok_or(RpcError::NoClient)
    }
}

impl XudApi for GrpcXud {
    fn get_info(&self, deadline: Instant) -> BoxFuture<'_, Result<GetInfoResponse, RpcError>> {
        Box::pin(async move {
            let mut clients = self.clients()?;
            let request = request_with_deadline(GetInfoRequest {}, deadline);
            unary(deadline, clients.xud.get_info(request)).await
        })
    }

    fn get_balance(
        &self,
        currency: Option<String>,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<GetBalanceResponse, RpcError>> {
        Box::pin(async move {
            let mut clients = self.clients()?;
            let message = GetBalanceRequest {
                currency: currency.unwrap_or_default(),
            };
            let request = request_with_deadline(message, deadline);
            unary(deadline, clients.xud.get_balance(request)).await
        })
    }

    fn create_node(
        &self,
        password: String,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<CreateNodeResponse, RpcError>> {
        Box::pin(async move {
            let mut clients = self.clients()?;
            let request = request_with_deadline(CreateNodeRequest { password }, deadline);
            unary(deadline, clients.init.create_node(request)).await
        })
    }

    fn unlock_node(
        &self,
        password: String,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<UnlockNodeResponse, RpcError>> {
        Box::pin(async move {
            let mut clients = self.clients()?;
            let request = request_with_deadline(UnlockNodeRequest { password }, deadline);
            unary(deadline, clients.init.unlock_node(request)).await
        })
    }

    fn open(&self) {
        self.conn.open();
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move { Ok(self.conn.close().await?) })
    }
}

pub struct OpendexdService {
    name: String,
    container: ContainerHandle,
    rpc: Box<dyn XudApi>,
    /// Present once a wallet has been created.
    nodekey_path: PathBuf,
}

impl OpendexdService {
    pub fn new(
        name: impl Into<String>,
        container: ContainerHandle,
        rpc: Box<dyn XudApi>,
        nodekey_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            container,
            rpc,
            nodekey_path: nodekey_path.into(),
        }
    }

    pub async fn get_info(&self, deadline: Instant) -> Result<GetInfoResponse, RpcError> {
        self.rpc.get_info(deadline).await
    }

    pub async fn get_balance(
        &self,
        currency: Option<String>,
        deadline: Instant,
    ) -> Result<GetBalanceResponse, RpcError> {
        self.rpc.get_balance(currency, deadline).await
    }

    pub async fn create_node(
        &self,
        password: String,
        deadline: Instant,
    ) -> Result<CreateNodeResponse, RpcError> {
        self.rpc.create_node(password, deadline).await
    }

    pub async fn unlock_node(
        &self,
        password: String,
        deadline: Instant,
    ) -> Result<UnlockNodeResponse, RpcError> {
        self.rpc.unlock_node(password, deadline).await
    }

    async fn interpret(&self, ctx: &StatusContext) -> String {
        let base = self.container.base_status();
        if !base.is_running() {
            if ctx.is_setup() && base != BaseStatus::Disabled {
                return "Waiting for sync".to_string();
            }
            return base.to_string();
        }

        match self.rpc.get_info(ctx.deadline()).await {
            Ok(info) => readiness(&info),
            Err(e) => self.error_status(&e).await,
        }
    }

    async fn error_status(&self, err: &RpcError) -> String {
        match err {
            RpcError::Status(status) if status.message().contains("is locked") => {
                if tokio::fs::try_exists(&self.nodekey_path).await.unwrap_or(false) {
                    WALLET_LOCKED.to_string()
                } else {
                    WALLET_MISSING.to_string()
                }
            }
            RpcError::Status(status) if status.message().contains("is starting") => {
                "Starting...".to_string()
            }
            // No channel yet: the daemon has not written its TLS certificate
            e if e.is_unreachable() => "Starting...".to_string(),
            e => format!("Error: {}", e),
        }
    }
}

/// Summarise opendexd's view of its lnds and connext.
pub fn readiness(info: &GetInfoResponse) -> String {
    fn lnd_status<'a>(info: &'a GetInfoResponse, currency: &str) -> &'a str {
        info.lnd
            .get(currency)
            .map(|lnd| lnd.status.as_str())
            .unwrap_or_default()
    }

    let parts = [
        ("lndbtc", lnd_status(info, "BTC")),
        ("lndltc", lnd_status(info, "LTC")),
        (
            "connext",
            info.connext
                .as_ref()
                .map(|c| c.status.as_str())
                .unwrap_or_default(),
        ),
    ];

    if parts.iter().all(|(_, status)| *status == "Ready") {
        return "Ready".to_string();
    }
    if parts
        .iter()
        .any(|(_, status)| status.contains("has no active channels"))
    {
        return "Waiting for channels".to_string();
    }

    let pending: Vec<&str> = parts
        .iter()
        .filter(|(_, status)| *status != "Ready")
        .map(|(name, _)| *name)
        .collect();
    format!("Waiting for {}", pending.join(", "))
}

impl Service for OpendexdService {
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


#[cfg(test)]
mod tests {
    use super::testing::ScriptedXud;
    use super::*;
    use crate::rpc::proto::xudrpc::{ConnextInfo, LndInfo};
    use crate::runtime::fake::FakeRuntime;
    use crate::service::ServiceRegistry;
    use crate::setup::SetupState;
    use crate::tracker::ContainerRecord;
    use std::sync::Arc;

    fn info(btc: &str, ltc: Option<&str>, connext: &str) -> GetInfoResponse {
        let mut info = GetInfoResponse {
            connext: Some(ConnextInfo {
                status: connext.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        info.lnd.insert(
            "BTC".to_string(),
            LndInfo {
                status: btc.to_string(),
                ..Default::default()
            },
        );
        if let Some(ltc) = ltc {
            info.lnd.insert(
                "LTC".to_string(),
                LndInfo {
                    status: ltc.to_string(),
                    ..Default::default()
                },
            );
        }
        info
    }

    fn ctx(setup: SetupState) -> StatusContext {
        let registry = Arc::new(ServiceRegistry::new(Vec::new()).unwrap());
        StatusContext::new(registry, Instant::now() + Duration::from_secs(1), setup)
    }

    fn service(
        replies: Vec<Result<GetInfoResponse, RpcError>>,
        nodekey: PathBuf,
        running: bool,
    ) -> OpendexdService {
        let runtime = Arc::new(FakeRuntime::new());
        let container = ContainerHandle::new("simnet_opendexd_1", runtime);
        if running {
            container
                .tracker()
                .update(Some(ContainerRecord::new("id1", "simnet_opendexd_1", "running")));
        }
        OpendexdService::new("opendexd", container, Box::new(ScriptedXud::new(replies)), nodekey)
    }

    #[test]
    fn test_readiness_summary() {
        assert_eq!(readiness(&info("Ready", Some("Ready"), "Ready")), "Ready");
        assert_eq!(
            readiness(&info("Ready", Some("Syncing"), "Ready")),
            "Waiting for lndltc"
        );
        assert_eq!(
            readiness(&info("Ready", None, "Starting")),
            "Waiting for lndltc, connext"
        );
        assert_eq!(
            readiness(&info("Ready", Some("lnd-LTC has no active channels"), "Ready")),
            "Waiting for channels"
        );
    }

    #[tokio::test]
    async fn test_locked_wallet_depends_on_nodekey() {
        let dir = tempfile::tempdir().unwrap();
        let nodekey = dir.path().join("nodekey.dat");
        let locked = || Err(RpcError::Status(tonic::Status::unavailable("opendexd is locked")));

        let missing = service(vec![locked()], nodekey.clone(), true);
        assert_eq!(missing.status(&ctx(SetupState::Attached)).await, WALLET_MISSING);

        std::fs::write(&nodekey, b"key").unwrap();
        let present = service(vec![locked()], nodekey, true);
        assert_eq!(present.status(&ctx(SetupState::Attached)).await, WALLET_LOCKED);
    }

    #[tokio::test]
    async fn test_status_paths() {
        let nodekey = PathBuf::from("/nonexistent/nodekey.dat");
        let service = service(
            vec![
                Ok(info("Ready", Some("Ready"), "Ready")),
                Err(RpcError::Status(tonic::Status::unknown("opendexd is starting"))),
                Err(RpcError::Status(tonic::Status::internal("boom"))),
            ],
            nodekey.clone(),
            true,
        );
        let ctx = ctx(SetupState::Attached);

        assert_eq!(service.status(&ctx).await, "Ready");
        assert_eq!(service.status(&ctx).await, "Starting...");
        assert!(service.status(&ctx).await.starts_with("Error: rpc error"));
        assert_eq!(service.status(&ctx).await, "Starting...");
    }

    #[tokio::test]
    async fn test_waits_for_sync_during_setup() {
        let service = service(Vec::new(), PathBuf::from("/nonexistent"), false);
        assert_eq!(service.status(&ctx(SetupState::Setup)).await, "Waiting for sync");
        assert_eq!(
            service.status(&ctx(SetupState::Attached)).await,
            "Container missing"
        );
    }
}
