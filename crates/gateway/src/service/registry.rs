//! Service registry: immutable name and container-name lookup.

use std::collections::HashMap;
use std::sync::Arc;

use super::Service;

pub struct ServiceRegistry {
    ordered: Vec<Arc<dyn Service>>,
    by_name: HashMap<String, usize>,
    by_container: HashMap<String, usize>,
}

impl ServiceRegistry {
    /// Builds the registry; a repeated service name is returned as the error.
    pub fn new(services: Vec<Arc<dyn Service>>) -> Result<Self, String> {
        let mut by_name = HashMap::with_capacity(services.len());
        let mut by_container = HashMap::with_capacity(services.len());

        for (idx, service) in services.iter().enumerate() {
            if by_name.insert(service.name().to_string(), idx).is_some() {
                return Err(service.name().to_string());
            }
            by_container.insert(service.container().container_name().to_string(), idx);
        }

        Ok(Self {
            ordered: services,
            by_name,
            by_container,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.by_name.get(name).map(|&idx| &self.ordered[idx])
    }

    pub fn by_container(&self, container_name: &str) -> Option<&Arc<dyn Service>> {
        self.by_container.get(container_name).map(|&idx| &self.ordered[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Service>> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
