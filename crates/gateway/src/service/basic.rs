//! Adapters with no upstream protocol: arby, webui and the gateway itself.

use std::any::Any;

use super::{BaseStatus, ContainerHandle, Service, StatusContext};
use crate::runtime::BoxFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicKind {
    Arby,
    Webui,
    /// The gateway's own container; answering at all means it is up.
    Proxy,
}

pub struct BasicService {
    name: String,
    kind: BasicKind,
    container: ContainerHandle,
}

impl BasicService {
    pub fn new(name: impl Into<String>, kind: BasicKind, container: ContainerHandle) -> Self {
        Self {
            name: name.into(),
            kind,
            container,
        }
    }

    pub fn kind(&self) -> BasicKind {
        self.kind
    }

    fn interpret(&self, ctx: &StatusContext) -> String {
        if self.kind == BasicKind::Proxy {
            return "Ready".to_string();
        }
        let base = self.container.base_status();
        if base.is_running() {
            return "Ready".to_string();
        }
        if self.kind == BasicKind::Arby && ctx.is_setup() && base != BaseStatus::Disabled {
            return "Waiting for sync".to_string();
        }
        base.to_string()
    }
}

impl Service for BasicService {
    fn name(&self) -> &str {
        &self.name
    }

    fn container(&self) -> &ContainerHandle {
        &self.container
    }

    fn status<'a>(&'a self, ctx: &'a StatusContext) -> BoxFuture<'a, String> {
        Box::pin(async move { self.interpret(ctx) })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
