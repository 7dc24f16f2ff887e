//! Process-wide container registry.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::container::{Container, ContainerSpec, IsolationBackend, NullIsolation};
use crate::embedder::SharedEmbedder;
use crate::error::{VfsError, VfsResult};

pub struct ContainerManager {
    containers: DashMap<String, Arc<Container>>,
    embedder: SharedEmbedder,
    use_quantization: bool,
}

impl ContainerManager {
    pub fn new(embedder: SharedEmbedder, use_quantization: bool) -> Self {
        Self {
            containers: DashMap::new(),
            embedder,
            use_quantization,
        }
    }

    /// Build a container from the spec, start it and register it under its
    /// id. Duplicate ids are rejected before any construction work.
    pub fn create_and_register(&self, spec: ContainerSpec) -> VfsResult<Arc<Container>> {
        self.create_with_isolation(spec, Box::new(NullIsolation))
    }

    pub fn create_with_isolation(
        &self,
        spec: ContainerSpec,
        isolation: Box<dyn IsolationBackend>,
    ) -> VfsResult<Arc<Container>> {
        if self.containers.contains_key(&spec.id) {
            return Err(VfsError::AlreadyExists(format!("container {}", spec.id)));
        }

        let id = spec.id.clone();
        let container = Arc::new(Container::new(
            spec,
            self.embedder.clone(),
            self.use_quantization,
            isolation,
        )?);
        container.start()?;

        // A concurrent create may have won the race while we were loading
        // the data directory; the map entry decides.
        match self.containers.entry(id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(container.clone());
            }
            Entry::Occupied(_) => {
                return Err(VfsError::AlreadyExists(format!("container {id}")));
            }
        }

        info!(container = %id, "container registered");
        Ok(container)
    }

    /// Erase the registry entry. The container is dropped with the last
    /// handle, tearing down its search engine and isolation handle.
    pub fn unregister(&self, id: &str) -> VfsResult<()> {
        self.containers
            .remove(id)
            .map(|_| info!(container = %id, "container unregistered"))
            .ok_or_else(|| VfsError::NotFound(format!("container {id}")))
    }

    pub fn get(&self, id: &str) -> VfsResult<Arc<Container>> {
        self.containers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VfsError::NotFound(format!("container {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.containers.len()
    }

    pub fn all(&self) -> Vec<Arc<Container>> {
        self.containers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn by_owner(&self, owner: &str) -> Vec<Arc<Container>> {
        self.containers
            .iter()
            .filter(|entry| entry.value().owner() == owner)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Filter by label key, optionally constraining the value.
    pub fn by_label(&self, key: &str, value: Option<&str>) -> Vec<Arc<Container>> {
        self.containers
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .labels()
                    .get(key)
                    .is_some_and(|v| value.is_none_or(|expected| v == expected))
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn available(&self) -> Vec<Arc<Container>> {
        self.containers
            .iter()
            .filter(|entry| entry.value().is_available())
            .map(|entry| entry.value().clone())
            .collect()
    }
}
