//! Route controllers: invoked only after schema validation and the
//! resolver chain have both passed.

use std::collections::HashMap;

use serde_json::{Value, json};
use tracing::info;

use crate::container::{ContainerSpec, ResourceLimits};
use crate::error::{VfsError, VfsResult};
use crate::manager::ContainerManager;

use super::resolvers::Resolved;

fn str_field<'a>(payload: &'a Value, name: &str) -> VfsResult<&'a str> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| VfsError::InvalidArgument(format!("missing field {name:?}")))
}

pub fn container_create(
    manager: &ContainerManager,
    _resolved: &Resolved,
    payload: &Value,
) -> VfsResult<Value> {
    let id = str_field(payload, "container_id")?;
    let owner = str_field(payload, "user_id")?;
    let data_path = str_field(payload, "data_path")?;
    let namespace = payload
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or("default");

    let labels: HashMap<String, String> = payload
        .get("labels")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let mut limits = ResourceLimits::default();
    if let Some(memory) = payload.get("memory_capacity").and_then(Value::as_u64) {
        limits.memory_capacity = memory;
    }
    if let Some(disk) = payload.get("storage_quota").and_then(Value::as_u64) {
        limits.storage_quota = disk;
    }
    if let Some(pids) = payload.get("max_open_files").and_then(Value::as_u64) {
        limits.max_open_files = pids;
    }

    std::fs::create_dir_all(data_path)?;

    // Persist the metadata document so a reloaded container reconstructs
    // the identity it was created with.
    let config_path = std::path::Path::new(data_path).join(crate::config::CONTAINER_CONFIG_FILE);
    if !config_path.exists() {
        let doc = json!({
            "owner": owner,
            "namespace": namespace,
            "labels": &labels,
            "limits": limits,
        });
        std::fs::write(&config_path, serde_json::to_string_pretty(&doc)?)?;
    }

    let container = manager.create_and_register(ContainerSpec {
        id: id.to_string(),
        owner: owner.to_string(),
        namespace: namespace.to_string(),
        data_path: data_path.into(),
        labels,
        commands: Vec::new(),
        limits,
    })?;

    info!(container = id, owner, "container created via control plane");
    Ok(json!({
        "container_id": container.id(),
        "owner": container.owner(),
        "status": container.status().as_str(),
        "files": container.search().read().file_count(),
    }))
}

pub fn container_delete(
    manager: &ContainerManager,
    resolved: &Resolved,
    _payload: &Value,
) -> VfsResult<Value> {
    let container = resolved.container()?;
    let id = container.id().to_string();
    manager.unregister(&id)?;
    Ok(json!({ "container_id": id, "deleted": true }))
}

pub fn container_stop(
    _manager: &ContainerManager,
    resolved: &Resolved,
    _payload: &Value,
) -> VfsResult<Value> {
    let container = resolved.container()?;
    container.stop()?;
    Ok(json!({
        "container_id": container.id(),
        "status": container.status().as_str(),
    }))
}

pub fn get_container_files(
    _manager: &ContainerManager,
    resolved: &Resolved,
    payload: &Value,
) -> VfsResult<Value> {
    let container = resolved.container()?;
    let path = payload.get("path").and_then(Value::as_str).unwrap_or("/");
    let files = container.list_files(path);
    Ok(json!({
        "container_id": container.id(),
        "path": path,
        "files": files,
        "total_bytes": container.size(),
    }))
}

pub fn file_create(
    _manager: &ContainerManager,
    resolved: &Resolved,
    payload: &Value,
) -> VfsResult<Value> {
    let container = resolved.container()?;
    let path = str_field(payload, "path")?;
    let content = str_field(payload, "content")?;

    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    container.add_file(&path, content.as_bytes())?;
    Ok(json!({
        "container_id": container.id(),
        "path": path,
        "size": content.len(),
        "created": true,
    }))
}

pub fn file_delete(
    _manager: &ContainerManager,
    resolved: &Resolved,
    payload: &Value,
) -> VfsResult<Value> {
    let container = resolved.container()?;
    let path = str_field(payload, "path")?;
    container.remove_file(path)?;
    Ok(json!({
        "container_id": container.id(),
        "path": path,
        "deleted": true,
    }))
}

pub fn semantic_search(
    _manager: &ContainerManager,
    resolved: &Resolved,
    payload: &Value,
) -> VfsResult<Value> {
    let container = resolved.container()?;
    let query = str_field(payload, "query")?;
    let limit = payload
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(10)
        .min(100) as usize;

    if query.len() > crate::config::MAX_SEARCH_QUERY_LENGTH {
        return Err(VfsError::InvalidArgument(format!(
            "query too long ({} chars)",
            query.len()
        )));
    }

    let hits = container.semantic_search(query, limit)?;
    crate::fs::record_container_access(container, &format!("/.search/{query}"), "search");

    let results: Vec<Value> = hits
        .iter()
        .map(|hit| json!({ "path": hit.path, "distance": hit.distance }))
        .collect();
    Ok(json!({
        "container_id": container.id(),
        "query": query,
        "results": results,
    }))
}
