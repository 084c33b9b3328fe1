//! boltz adapter.
//!
//! One boltz-client daemon per currency runs inside the container. Status is
//! taken through the bundled `wrapper` CLI; swaps go over gRPC.

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;

use super::{BaseStatus, ContainerHandle, Service, ServiceError, StatusContext};
use crate::rpc::conn::ResilientConnection;
use crate::rpc::grpc::{request_with_deadline, unary, AuthedChannel, GrpcConnector, GrpcTarget};
use crate::rpc::proto::boltzrpc::{
    boltz_client::BoltzClient, CreateReverseSwapRequest, CreateReverseSwapResponse, DepositRequest,
    DepositResponse, GetServiceInfoRequest, GetServiceInfoResponse,
};
use crate::rpc::RpcError;
use crate::runtime::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    Btc,
    Ltc,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Btc => "btc",
            Currency::Ltc => "ltc",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "btc" => Ok(Currency::Btc),
            "ltc" => Ok(Currency::Ltc),
            other => Err(ServiceError::InvalidArgument(format!("unknown currency: {}", other))),
        }
    }
}

type BoltzConnection = ResilientConnection<GrpcConnector<BoltzClient<AuthedChannel>>>;

pub struct BoltzService {
    name: String,
    container: ContainerHandle,
    btc: BoltzConnection,
    ltc: BoltzConnection,
}

impl BoltzService {
    pub fn new(
        name: impl Into<String>,
        container: ContainerHandle,
        btc: GrpcTarget,
        ltc: GrpcTarget,
        retry_delay: Duration,
    ) -> Self {
        let name = name.into();
        let connection = |currency: Currency, target: GrpcTarget| {
            ResilientConnection::new(
                format!("{}.{}", name, currency),
                GrpcConnector::new(BoltzClient::new),
                target,
            )
            .with_retry_delay(retry_delay)
        };
        Self {
            btc: connection(Currency::Btc, btc),
            ltc: connection(Currency::Ltc, ltc),
            name,
            container,
        }
    }

    fn client(&self, currency: Currency) -> Result<BoltzClient<AuthedChannel>, RpcError> {
        let conn = match currency {
            Currency::Btc => &self.btc,
            Currency::Ltc => &self.ltc,
        };
        conn.current_client().ok_or(RpcError::NoClient)
    }

    pub async fn service_info(
        &self,
        currency: Currency,
        deadline: Instant,
    ) -> Result<GetServiceInfoResponse, RpcError> {
        let mut client = self.client(currency)?;
        let request = request_with_deadline(GetServiceInfoRequest {}, deadline);
        unary(deadline, client.get_service_info(request)).await
    }

    pub async fn deposit(
        &self,
        currency: Currency,
        inbound_liquidity: u32,
        deadline: Instant,
    ) -> Result<DepositResponse, RpcError> {
        let mut client = self.client(currency)?;
        let request = request_with_deadline(DepositRequest { inbound_liquidity }, deadline);
        unary(deadline, client.deposit(request)).await
    }

    pub async fn withdraw(
        &self,
        currency: Currency,
        amount: i64,
        address: String,
        deadline: Instant,
    ) -> Result<CreateReverseSwapResponse, RpcError> {
        let mut client = self.client(currency)?;
        let message = CreateReverseSwapRequest {
            amount,
            address,
            accept_zero_conf: true,
        };
        let request = request_with_deadline(message, deadline);
        unary(deadline, client.create_reverse_swap(request)).await
    }

    /// Whether the daemon for `currency` answers `getinfo`.
    async fn node_up(&self, currency: Currency) -> bool {
        let cmd = vec![
            "wrapper".to_string(),
            currency.to_string(),
            "getinfo".to_string(),
        ];
        match self.container.exec_checked(cmd).await {
            Ok(output) => serde_json::from_str::<serde_json::Value>(&output)
                .map(|v| v.is_object())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn interpret(&self, ctx: &StatusContext) -> String {
        let base = self.container.base_status();
        if !base.is_running() {
            if ctx.is_setup() && base != BaseStatus::Disabled {
                return "Waiting for sync".to_string();
            }
            return base.to_string();
        }

        let checks = async { tokio::join!(self.node_up(Currency::Btc), self.node_up(Currency::Ltc)) };
        match ctx.within(checks).await {
            Ok((true, true)) => "Ready".to_string(),
            Ok((btc, ltc)) => {
                let word = |up: bool| if up { "up" } else { "down" };
                format!("btc {}; ltc {}", word(btc), word(ltc))
            }
            Err(_) => "btc down; ltc down".to_string(),
        }
    }
}

impl Service for BoltzService {
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
        self.btc.open();
        self.ltc.open();
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ServiceError>> {
        Box::pin(async move {
            let btc = self.btc.close().await;
            let ltc = self.ltc.close().await;
            btc?;
            ltc?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::ExecOutput;
    use crate::service::ServiceRegistry;
    use crate::setup::SetupState;
    use crate::tracker::ContainerRecord;
    use std::sync::Arc;

    const NAME: &str = "testnet_boltz_1";

    fn boltz(runtime: &Arc<FakeRuntime>) -> BoltzService {
        BoltzService::new(
            "boltz",
            ContainerHandle::new(NAME, runtime.clone()),
            GrpcTarget::new("boltz", 9002),
            GrpcTarget::new("boltz", 9003),
            Duration::from_secs(3),
        )
    }

    fn ctx(setup: SetupState) -> StatusContext {
        let registry = Arc::new(ServiceRegistry::new(Vec::new()).unwrap());
        StatusContext::new(registry, Instant::now() + Duration::from_secs(1), setup)
    }

    fn getinfo(runtime: &FakeRuntime, currency: &str, output: &str, exit_code: i64) {
        runtime.set_exec_result(
            NAME,
            &["wrapper", currency, "getinfo"],
            ExecOutput {
                output: output.to_string(),
                exit_code,
            },
        );
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!("BTC".parse::<Currency>().unwrap(), Currency::Btc);
        assert_eq!("ltc".parse::<Currency>().unwrap(), Currency::Ltc);
        assert!(matches!(
            "eth".parse::<Currency>(),
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_status_from_wrapper_getinfo() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container(ContainerRecord::new("id1", NAME, "running"));
        let service = boltz(&runtime);
        service.container().refresh().await.unwrap();

        getinfo(&runtime, "btc", r#"{"symbol":"BTC","lnd_pubkey":"02ab"}"#, 0);
        getinfo(&runtime, "ltc", "connection refused", 1);
        assert_eq!(service.status(&ctx(SetupState::Attached)).await, "btc up; ltc down");

        getinfo(&runtime, "ltc", r#"{"symbol":"LTC"}"#, 0);
        assert_eq!(service.status(&ctx(SetupState::Attached)).await, "Ready");

        getinfo(&runtime, "btc", "not json", 0);
        assert_eq!(service.status(&ctx(SetupState::Attached)).await, "btc down; ltc up");
    }

    #[tokio::test]
    async fn test_not_running() {
        let runtime = Arc::new(FakeRuntime::new());
        let service = boltz(&runtime);
        assert_eq!(service.status(&ctx(SetupState::Setup)).await, "Waiting for sync");
        assert_eq!(service.status(&ctx(SetupState::Attached)).await, "Container missing");
        assert_eq!(runtime.exec_count(), 0);
    }

    #[tokio::test]
    async fn test_pass_through_without_link() {
        let runtime = Arc::new(FakeRuntime::new());
        let service = boltz(&runtime);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            service.deposit(Currency::Btc, 25, deadline).await,
            Err(RpcError::NoClient)
        ));
        service.close().await.unwrap();
    }
}
