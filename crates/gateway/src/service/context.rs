//! Status context: what one status round hands to every adapter.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use super::{Service, ServiceRegistry};
use crate::rpc::RpcError;
use crate::setup::SetupState;

pub struct StatusContext {
    deadline: Instant,
    setup: SetupState,
    registry: Arc<ServiceRegistry>,
}

impl StatusContext {
    pub fn new(registry: Arc<ServiceRegistry>, deadline: Instant, setup: SetupState) -> Self {
        Self {
            deadline,
            setup,
            registry,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn setup_state(&self) -> SetupState {
        self.setup
    }

    /// True while the launcher is still setting the stack up.
    pub fn is_setup(&self) -> bool {
        self.setup == SetupState::Setup
    }

    /// Bound a future by the round deadline.
    pub async fn within<F: Future>(&self, fut: F) -> Result<F::Output, RpcError> {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| RpcError::Timeout)
    }

    pub fn sibling(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.registry.get(name)
    }

    /// Sibling adapter downcast to its concrete kind.
    pub fn sibling_as<T: Service>(&self, name: &str) -> Option<&T> {
        self.sibling(name)?.as_any().downcast_ref::<T>()
    }
}
