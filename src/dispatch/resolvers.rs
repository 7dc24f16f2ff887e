//! Declarative guard chains run between schema validation and the
//! controller. Each resolver either produces or checks a value for the
//! next stage; the chain short-circuits on the first failure, so a denied
//! request never reaches mutating code.

use std::sync::Arc;

use serde_json::Value;

use crate::container::Container;
use crate::error::{VfsError, VfsResult};
use crate::manager::ContainerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    ContainerExists,
    ContainerNotExists,
    ContainerOwnership,
    ContainerIsActive,
    FileExists,
    FileNotExists,
    UserExists,
}

/// Values accumulated while the chain runs.
#[derive(Default)]
pub struct Resolved {
    pub container: Option<Arc<Container>>,
}

impl Resolved {
    pub fn container(&self) -> VfsResult<&Arc<Container>> {
        self.container
            .as_ref()
            .ok_or_else(|| VfsError::Internal("resolver chain produced no container".to_string()))
    }
}

fn str_field<'a>(payload: &'a Value, name: &str) -> VfsResult<&'a str> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| VfsError::InvalidArgument(format!("missing field {name:?}")))
}

impl Resolver {
    pub fn resolve(
        &self,
        manager: &ContainerManager,
        payload: &Value,
        resolved: &mut Resolved,
    ) -> VfsResult<()> {
        match self {
            Resolver::ContainerExists => {
                let id = str_field(payload, "container_id")?;
                resolved.container = Some(manager.get(id)?);
                Ok(())
            }
            Resolver::ContainerNotExists => {
                let id = str_field(payload, "container_id")?;
                if manager.contains(id) {
                    return Err(VfsError::AlreadyExists(format!("container {id}")));
                }
                Ok(())
            }
            Resolver::ContainerOwnership => {
                let user = str_field(payload, "user_id")?;
                let container = resolved.container()?;
                if !container.user_allowed(user) {
                    return Err(VfsError::PermissionDenied(format!(
                        "user {user} does not own container {}",
                        container.id()
                    )));
                }
                Ok(())
            }
            Resolver::ContainerIsActive => {
                let container = resolved.container()?;
                if !container.is_available() {
                    return Err(VfsError::PermissionDenied(format!(
                        "container {} is {}",
                        container.id(),
                        container.status().as_str()
                    )));
                }
                Ok(())
            }
            Resolver::FileExists => {
                let path = str_field(payload, "path")?;
                let container = resolved.container()?;
                if !container.file_exists(path) {
                    return Err(VfsError::NotFound(format!(
                        "file {path} in container {}",
                        container.id()
                    )));
                }
                Ok(())
            }
            Resolver::FileNotExists => {
                let path = str_field(payload, "path")?;
                let container = resolved.container()?;
                if container.file_exists(path) {
                    return Err(VfsError::AlreadyExists(format!(
                        "file {path} in container {}",
                        container.id()
                    )));
                }
                Ok(())
            }
            Resolver::UserExists => {
                let user = str_field(payload, "user_id")?;
                if user.trim().is_empty() {
                    return Err(VfsError::InvalidArgument("empty user id".to_string()));
                }
                Ok(())
            }
        }
    }
}

/// Run a chain left to right, stopping at the first failure.
pub fn run_chain(
    chain: &[Resolver],
    manager: &ContainerManager,
    payload: &Value,
) -> VfsResult<Resolved> {
    let mut resolved = Resolved::default();
    for resolver in chain {
        resolver.resolve(manager, payload, &mut resolved)?;
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerSpec, ResourceLimits};
    use crate::embedder::{HashEmbedder, SharedEmbedder};
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn setup() -> (ContainerManager, TempDir) {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(32).unwrap());
        let manager = ContainerManager::new(embedder, false);
        let dir = TempDir::new().unwrap();
        manager
            .create_and_register(ContainerSpec {
                id: "c1".to_string(),
                owner: "alice".to_string(),
                namespace: "default".to_string(),
                data_path: dir.path().to_path_buf(),
                labels: HashMap::new(),
                commands: Vec::new(),
                limits: ResourceLimits::default(),
            })
            .unwrap();
        (manager, dir)
    }

    #[test]
    fn chain_produces_the_container_handle() {
        let (manager, _dir) = setup();
        let payload = json!({"container_id": "c1", "user_id": "alice"});
        let resolved = run_chain(
            &[
                Resolver::ContainerExists,
                Resolver::ContainerOwnership,
                Resolver::ContainerIsActive,
            ],
            &manager,
            &payload,
        )
        .unwrap();
        assert_eq!(resolved.container().unwrap().id(), "c1");
    }

    #[test]
    fn ownership_mismatch_short_circuits() {
        let (manager, _dir) = setup();
        let payload = json!({"container_id": "c1", "user_id": "mallory"});
        let result = run_chain(
            &[Resolver::ContainerExists, Resolver::ContainerOwnership],
            &manager,
            &payload,
        );
        assert!(matches!(result, Err(VfsError::PermissionDenied(_))));
    }

    #[test]
    fn missing_container_is_not_found() {
        let (manager, _dir) = setup();
        let payload = json!({"container_id": "ghost", "user_id": "alice"});
        let result = run_chain(&[Resolver::ContainerExists], &manager, &payload);
        assert!(matches!(result, Err(VfsError::NotFound(_))));
    }

    #[test]
    fn stopped_container_fails_the_active_check() {
        let (manager, _dir) = setup();
        manager.get("c1").unwrap().stop().unwrap();
        let payload = json!({"container_id": "c1", "user_id": "alice"});
        let result = run_chain(
            &[Resolver::ContainerExists, Resolver::ContainerIsActive],
            &manager,
            &payload,
        );
        assert!(matches!(result, Err(VfsError::PermissionDenied(_))));
    }

    #[test]
    fn file_guards_check_the_store() {
        let (manager, _dir) = setup();
        manager
            .get("c1")
            .unwrap()
            .add_file("/a.txt", b"hello")
            .unwrap();

        let present = json!({"container_id": "c1", "user_id": "alice", "path": "/a.txt"});
        let absent = json!({"container_id": "c1", "user_id": "alice", "path": "/b.txt"});

        run_chain(&[Resolver::ContainerExists, Resolver::FileExists], &manager, &present).unwrap();
        run_chain(&[Resolver::ContainerExists, Resolver::FileNotExists], &manager, &absent).unwrap();

        assert!(run_chain(&[Resolver::ContainerExists, Resolver::FileExists], &manager, &absent).is_err());
        assert!(
            run_chain(&[Resolver::ContainerExists, Resolver::FileNotExists], &manager, &present)
                .is_err()
        );
    }

    #[test]
    fn duplicate_container_fails_not_exists() {
        let (manager, _dir) = setup();
        let payload = json!({"container_id": "c1", "user_id": "alice"});
        assert!(matches!(
            run_chain(&[Resolver::ContainerNotExists], &manager, &payload),
            Err(VfsError::AlreadyExists(_))
        ));
    }
}
