//! connext adapter.

use std::any::Any;
use std::collections::HashMap;

use reqwest::StatusCode;
use tokio::time::Instant;

use super::opendexd::OpendexdService;
use super::{ContainerHandle, Service, ServiceError, StatusContext};
use crate::runtime::BoxFuture;

const VECTOR_CONFIG: &str = "VECTOR_CONFIG";

/// Liveness probe of the connext node itself.
pub trait HealthProbe: Send + Sync {
    fn healthy(&self, deadline: Instant) -> BoxFuture<'_, bool>;
}

/// `GET /health`, answered with 204 once the node is up.
pub struct HttpHealth {
    url: String,
    client: reqwest::Client,
}

impl HttpHealth {
    pub fn new(client: reqwest::Client, host: &str, port: u16) -> Self {
        Self {
            url: format!("http://{}:{}/health", host, port),
            client,
        }
    }
}

impl HealthProbe for HttpHealth {
    fn healthy(&self, deadline: Instant) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.client.get(&self.url).timeout(remaining).send().await {
                Ok(response) => response.status() == StatusCode::NO_CONTENT,
                Err(_) => false,
            }
        })
    }
}

pub struct ConnextService {
    name: String,
    container: ContainerHandle,
    health: Box<dyn HealthProbe>,
}

impl ConnextService {
    pub fn new(name: impl Into<String>, container: ContainerHandle, health: Box<dyn HealthProbe>) -> Self {
        Self {
            name: name.into(),
            container,
            health,
        }
    }

    /// `chainProviders` from the container's `VECTOR_CONFIG`, keyed by chain id.
    pub fn chain_providers(&self) -> Result<HashMap<String, String>, ServiceError> {
        let raw = self
            .container
            .getenv(VECTOR_CONFIG)?
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ServiceError::Malformed(format!("{} not found", VECTOR_CONFIG)))?;
        parse_chain_providers(&raw)
    }

    pub fn eth_provider(&self, chain_id: &str) -> Result<String, ServiceError> {
        self.chain_providers()?
            .remove(chain_id)
            .ok_or_else(|| ServiceError::Malformed(format!("no provider for chain {}", chain_id)))
    }

    async fn interpret(&self, ctx: &StatusContext) -> String {
        let base = self.container.base_status();
        if !base.is_running() {
            return base.to_string();
        }

        // opendexd's view wins when it is reachable and reports one
        if let Some(opendexd) = ctx.sibling_as::<OpendexdService>("opendexd") {
            if let Ok(info) = opendexd.get_info(ctx.deadline()).await {
                if let Some(connext) = info.connext.filter(|c| !c.status.is_empty()) {
                    return connext.status;
                }
            }
        }

        if self.health.healthy(ctx.deadline()).await {
            "Ready".to_string()
        } else {
            "Starting...".to_string()
        }
    }
}

pub fn parse_chain_providers(raw: &str) -> Result<HashMap<String, String>, ServiceError> {
    let config: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ServiceError::Malformed(format!("{}: {}", VECTOR_CONFIG, e)))?;
    let providers = config["chainProviders"]
        .as_object()
        .ok_or_else(|| ServiceError::Malformed(format!("{} has no chainProviders", VECTOR_CONFIG)))?;
    Ok(providers
        .iter()
        .filter_map(|(chain, url)| Some((chain.clone(), url.as_str()?.to_string())))
        .collect())
}

impl Service for ConnextService {
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
    use crate::rpc::proto::xudrpc::{ConnextInfo, GetInfoResponse};
    use crate::rpc::RpcError;
    use crate::runtime::fake::FakeRuntime;
    use crate::service::opendexd::testing::ScriptedXud;
    use crate::service::ServiceRegistry;
    use crate::setup::SetupState;
    use crate::tracker::ContainerRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    const CONFIG: &str = r#"{"adminToken":"x","chainProviders":{"4":"http://geth:8545"}}"#;

    struct FixedHealth {
        healthy: bool,
        probes: Arc<AtomicUsize>,
    }

    impl HealthProbe for FixedHealth {
        fn healthy(&self, _deadline: Instant) -> BoxFuture<'_, bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let healthy = self.healthy;
            Box::pin(async move { healthy })
        }
    }

    fn connext(runtime: &Arc<FakeRuntime>, healthy: bool, probes: &Arc<AtomicUsize>) -> ConnextService {
        ConnextService::new(
            "connext",
            ContainerHandle::new("simnet_connext_1", runtime.clone()),
            Box::new(FixedHealth {
                healthy,
                probes: probes.clone(),
            }),
        )
    }

    fn ctx(services: Vec<Arc<dyn Service>>) -> StatusContext {
        let registry = Arc::new(ServiceRegistry::new(services).unwrap());
        StatusContext::new(
            registry,
            Instant::now() + Duration::from_secs(1),
            SetupState::Attached,
        )
    }

    fn running(runtime: &Arc<FakeRuntime>, service: &ConnextService, config: Option<&str>) {
        let mut record = ContainerRecord::new("id1", "simnet_connext_1", "running");
        if let Some(config) = config {
            record = record.with_env(VECTOR_CONFIG, config);
        }
        runtime.add_container(record.clone());
        service.container().tracker().update(Some(record));
    }

    #[test]
    fn test_eth_provider_from_vector_config() {
        let runtime = Arc::new(FakeRuntime::new());
        let probes = Arc::new(AtomicUsize::new(0));
        let service = connext(&runtime, true, &probes);

        assert!(matches!(
            service.eth_provider("4"),
            Err(ServiceError::ContainerMissing(_))
        ));

        running(&runtime, &service, Some(""));
        assert!(service.eth_provider("4").is_err());

        running(&runtime, &service, Some(CONFIG));
        assert_eq!(service.eth_provider("4").unwrap(), "http://geth:8545");
        assert!(service.eth_provider("1").is_err());
    }

    #[tokio::test]
    async fn test_health_fallback() {
        let runtime = Arc::new(FakeRuntime::new());
        let probes = Arc::new(AtomicUsize::new(0));

        let up = connext(&runtime, true, &probes);
        running(&runtime, &up, None);
        assert_eq!(up.status(&ctx(Vec::new())).await, "Ready");

        let down = connext(&runtime, false, &probes);
        running(&runtime, &down, None);
        assert_eq!(down.status(&ctx(Vec::new())).await, "Starting...");
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_prefers_opendexd_view() {
        let runtime = Arc::new(FakeRuntime::new());
        let probes = Arc::new(AtomicUsize::new(0));
        let service = connext(&runtime, true, &probes);
        running(&runtime, &service, None);

        let info = GetInfoResponse {
            connext: Some(ConnextInfo {
                status: "Connext has no active channels".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let opendexd = OpendexdService::new(
            "opendexd",
            ContainerHandle::new("simnet_opendexd_1", runtime.clone()),
            Box::new(ScriptedXud::new(vec![Ok(info), Err(RpcError::NoClient)])),
            "/nonexistent/nodekey.dat",
        );
        let ctx = ctx(vec![Arc::new(opendexd) as Arc<dyn Service>]);

        assert_eq!(service.status(&ctx).await, "Connext has no active channels");
        assert_eq!(probes.load(Ordering::SeqCst), 0);

        // opendexd unreachable: fall back to the health endpoint
        assert_eq!(service.status(&ctx).await, "Ready");
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_opendexd_without_connext_info_falls_back_to_health() {
        let runtime = Arc::new(FakeRuntime::new());
        let probes = Arc::new(AtomicUsize::new(0));
        let service = connext(&runtime, false, &probes);
        running(&runtime, &service, None);

        let opendexd = OpendexdService::new(
            "opendexd",
            ContainerHandle::new("simnet_opendexd_1", runtime.clone()),
            Box::new(ScriptedXud::new(vec![Ok(GetInfoResponse::default())])),
            "/nonexistent/nodekey.dat",
        );
        let ctx = ctx(vec![Arc::new(opendexd) as Arc<dyn Service>]);

        assert_eq!(service.status(&ctx).await, "Starting...");
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }
}
