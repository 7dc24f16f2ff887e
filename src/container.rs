//! Owner-bound, resource-limited knowledge containers.
//!
//! A container couples an on-disk data directory with an in-memory search
//! engine. The index is rebuilt from the file tree at load; mutations are
//! written through to disk. Lifecycle and resource limits are enforced
//! through the isolation backend, which is consumed by contract only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::Glob;
use ignore::WalkBuilder;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ACCESS_POLICY_FILE, CONTAINER_CONFIG_FILE, is_system_dir};
use crate::embedder::SharedEmbedder;
use crate::error::{VfsError, VfsResult};
use crate::index::SearchHit;
use crate::search::{FileMeta, SearchEngine};

/// Largest file body pulled into the search store during the load walk.
const MAX_LOADED_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Unknown,
    Running,
    Stopped,
    Invalid,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Unknown => "unknown",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Invalid => "invalid",
        }
    }

    /// Lifecycle: `Unknown -> {Running, Stopped}`, `Running <-> Stopped`,
    /// `Invalid` is terminal.
    fn can_transition(self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, next),
            (Unknown, Running) | (Unknown, Stopped) | (Running, Stopped) | (Stopped, Running)
        )
    }
}

/// Resource budget enforced through the isolation backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_capacity: u64,
    pub storage_quota: u64,
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_capacity: 256 * 1024 * 1024,
            storage_quota: 1024 * 1024 * 1024,
            max_open_files: 1024,
        }
    }
}

/// The OS-level isolation primitive (PID/cgroup) consumed by contract.
pub trait IsolationBackend: Send + Sync {
    fn start(&self) -> VfsResult<()>;
    fn stop(&self) -> VfsResult<()>;
    fn set_limit(&self, key: &str, value: u64) -> VfsResult<()>;
    fn apply_limits(&self, limits: &ResourceLimits) -> VfsResult<()>;
}

/// Process-local stand-in used for tests and single-host runs.
pub struct NullIsolation;

impl IsolationBackend for NullIsolation {
    fn start(&self) -> VfsResult<()> {
        Ok(())
    }
    fn stop(&self) -> VfsResult<()> {
        Ok(())
    }
    fn set_limit(&self, _key: &str, _value: u64) -> VfsResult<()> {
        Ok(())
    }
    fn apply_limits(&self, _limits: &ResourceLimits) -> VfsResult<()> {
        Ok(())
    }
}

/// Metadata document at the container data root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfigFile {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

/// Access policy document at the container data root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPolicyFile {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub id: String,
    pub owner: String,
    pub namespace: String,
    pub data_path: PathBuf,
    pub labels: HashMap<String, String>,
    pub commands: Vec<String>,
    pub limits: ResourceLimits,
}

pub struct Container {
    id: String,
    owner: String,
    namespace: String,
    data_path: PathBuf,
    labels: HashMap<String, String>,
    commands: Vec<String>,
    policy: AccessPolicyFile,
    limits: RwLock<ResourceLimits>,
    status: RwLock<ContainerStatus>,
    search: RwLock<SearchEngine>,
    isolation: Box<dyn IsolationBackend>,
}

impl Container {
    /// Build a container over an existing data directory and hydrate the
    /// search engine from its file tree. The container starts in `Unknown`.
    pub fn new(
        spec: ContainerSpec,
        embedder: SharedEmbedder,
        use_quantization: bool,
        isolation: Box<dyn IsolationBackend>,
    ) -> VfsResult<Self> {
        let data_path = dunce::canonicalize(&spec.data_path)
            .map_err(|_| VfsError::NotFound(format!("data path {:?}", spec.data_path)))?;

        let mut owner = spec.owner;
        let mut namespace = spec.namespace;
        let mut labels = spec.labels;
        let mut commands = spec.commands;
        let mut limits = spec.limits;

        // The on-disk metadata document wins over the caller's spec, so a
        // reloaded container reconstructs the identity it was created with.
        let config_path = data_path.join(CONTAINER_CONFIG_FILE);
        if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            let on_disk: ContainerConfigFile = serde_json::from_str(&raw)
                .map_err(|e| VfsError::InvalidArgument(format!("bad {CONTAINER_CONFIG_FILE}: {e}")))?;
            if let Some(disk_owner) = on_disk.owner {
                owner = disk_owner;
            }
            if let Some(disk_namespace) = on_disk.namespace {
                namespace = disk_namespace;
            }
            labels.extend(on_disk.labels);
            if !on_disk.commands.is_empty() {
                commands = on_disk.commands;
            }
            if let Some(disk_limits) = on_disk.limits {
                limits = disk_limits;
            }
        }

        let policy_path = data_path.join(ACCESS_POLICY_FILE);
        let policy = if policy_path.exists() {
            let raw = std::fs::read_to_string(&policy_path)?;
            serde_json::from_str(&raw)
                .map_err(|e| VfsError::InvalidArgument(format!("bad {ACCESS_POLICY_FILE}: {e}")))?
        } else {
            AccessPolicyFile::default()
        };

        let container = Self {
            id: spec.id,
            owner,
            namespace,
            data_path,
            labels,
            commands,
            policy,
            limits: RwLock::new(limits),
            status: RwLock::new(ContainerStatus::Unknown),
            search: RwLock::new(SearchEngine::new(embedder, use_quantization)),
            isolation,
        };

        container.load_data_dir()?;
        Ok(container)
    }

    /// Walk the data directory and feed every regular file into the search
    /// engine. System directories and the metadata documents are skipped.
    fn load_data_dir(&self) -> VfsResult<()> {
        let mut search = self.search.write();
        let mut loaded = 0usize;

        let walker = WalkBuilder::new(&self.data_path)
            .hidden(false)
            .git_ignore(true)
            .max_depth(Some(20))
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_some_and(|ft| ft.is_dir()) && is_system_dir(&name))
            })
            .build();

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name == CONTAINER_CONFIG_FILE || name == ACCESS_POLICY_FILE {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_LOADED_FILE_BYTES).unwrap_or(true) {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(&self.data_path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let virtual_path = format!("/{rel}");

            match std::fs::read(entry.path()) {
                Ok(content) => {
                    if let Err(e) = search.add_file(&virtual_path, &content, FileMeta::regular(0, 0)) {
                        warn!(container = %self.id, path = %virtual_path, error = %e, "skipping file at load");
                    } else {
                        loaded += 1;
                    }
                }
                Err(e) => {
                    warn!(container = %self.id, path = %virtual_path, error = %e, "unreadable file at load");
                }
            }
        }

        info!(container = %self.id, files = loaded, "container data directory loaded");
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn status(&self) -> ContainerStatus {
        *self.status.read()
    }

    /// Owner plus anyone named in the access policy's allow-list.
    pub fn user_allowed(&self, user: &str) -> bool {
        self.owner == user || self.policy.allowed_users.iter().any(|u| u == user)
    }

    pub fn limits(&self) -> ResourceLimits {
        *self.limits.read()
    }

    pub fn is_available(&self) -> bool {
        self.status() == ContainerStatus::Running
    }

    pub fn search(&self) -> &RwLock<SearchEngine> {
        &self.search
    }

    fn transition(&self, next: ContainerStatus) -> VfsResult<()> {
        let mut status = self.status.write();
        if *status == ContainerStatus::Invalid {
            return Err(VfsError::Internal(format!(
                "container {} is invalid and cannot transition",
                self.id
            )));
        }
        if !status.can_transition(next) {
            return Err(VfsError::InvalidArgument(format!(
                "container {} cannot go {} -> {}",
                self.id,
                status.as_str(),
                next.as_str()
            )));
        }
        *status = next;
        Ok(())
    }

    /// `Stopped -> Running` passes through the isolation primitive.
    pub fn start(&self) -> VfsResult<()> {
        self.isolation.start()?;
        self.transition(ContainerStatus::Running)?;
        info!(container = %self.id, "container running");
        Ok(())
    }

    pub fn stop(&self) -> VfsResult<()> {
        self.isolation.stop()?;
        self.transition(ContainerStatus::Stopped)?;
        info!(container = %self.id, "container stopped");
        Ok(())
    }

    /// Mark the container unusable. Terminal.
    pub fn invalidate(&self) {
        *self.status.write() = ContainerStatus::Invalid;
        warn!(container = %self.id, "container invalidated");
    }

    fn ensure_running(&self) -> VfsResult<()> {
        match self.status() {
            ContainerStatus::Running => Ok(()),
            ContainerStatus::Invalid => Err(VfsError::Internal(format!(
                "container {} is invalid",
                self.id
            ))),
            other => Err(VfsError::PermissionDenied(format!(
                "container {} is {}",
                self.id,
                other.as_str()
            ))),
        }
    }

    /// Resource changes are allowed while Running or Stopped.
    pub fn set_resource_limit(&self, key: &str, value: u64) -> VfsResult<()> {
        match self.status() {
            ContainerStatus::Running | ContainerStatus::Stopped => {}
            ContainerStatus::Invalid => {
                return Err(VfsError::Internal(format!("container {} is invalid", self.id)));
            }
            ContainerStatus::Unknown => {
                return Err(VfsError::PermissionDenied(format!(
                    "container {} is not initialised",
                    self.id
                )));
            }
        }

        let mut limits = self.limits.write();
        match key {
            "memory" => limits.memory_capacity = value,
            "disk" => limits.storage_quota = value,
            "pids" => limits.max_open_files = value,
            "apply" => {
                self.isolation.apply_limits(&limits)?;
                return Ok(());
            }
            other => {
                return Err(VfsError::InvalidArgument(format!(
                    "unknown resource key {other:?}"
                )));
            }
        }
        self.isolation.set_limit(key, value)?;
        debug!(container = %self.id, key, value, "resource limit updated");
        Ok(())
    }

    /// Total stored content bytes.
    pub fn size(&self) -> u64 {
        self.search.read().total_content_bytes()
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.search.read().contains(path)
    }

    pub fn is_directory(&self, virtual_path: &str) -> bool {
        if virtual_path == "/" {
            return true;
        }
        let prefix = format!("{}/", virtual_path.trim_end_matches('/'));
        self.search
            .read()
            .paths()
            .any(|p| p.starts_with(&prefix))
    }

    /// List the immediate children of a virtual directory.
    pub fn list_files(&self, virtual_path: &str) -> Vec<String> {
        let prefix = if virtual_path == "/" {
            "/".to_string()
        } else {
            format!("{}/", virtual_path.trim_end_matches('/'))
        };

        let search = self.search.read();
        let mut names: Vec<String> = search
            .paths()
            .filter_map(|p| p.strip_prefix(&prefix))
            .map(|rest| match rest.split_once('/') {
                Some((dir, _)) => format!("{dir}/"),
                None => rest.to_string(),
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn get_file_content(&self, path: &str) -> VfsResult<Vec<u8>> {
        self.search
            .read()
            .file(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }

    /// Write a file through to disk and into the search store. Requires
    /// `Running`, a writable policy and free quota.
    pub fn add_file(&self, path: &str, content: &[u8]) -> VfsResult<()> {
        self.ensure_running()?;
        if self.policy.read_only {
            return Err(VfsError::PermissionDenied(format!(
                "container {} is read-only by policy",
                self.id
            )));
        }
        if self.size() >= self.limits.read().storage_quota {
            return Err(VfsError::ResourceExhausted(format!(
                "container {} storage quota reached",
                self.id
            )));
        }

        let disk_path = self.disk_path(path)?;
        if let Some(parent) = disk_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&disk_path, content)?;

        self.search
            .write()
            .add_file(path, content, FileMeta::regular(0, 0))
    }

    pub fn update_file(&self, path: &str, content: &[u8]) -> VfsResult<()> {
        self.ensure_running()?;
        if self.policy.read_only {
            return Err(VfsError::PermissionDenied(format!(
                "container {} is read-only by policy",
                self.id
            )));
        }

        let disk_path = self.disk_path(path)?;
        std::fs::write(&disk_path, content)?;
        self.search.write().update_file(path, content)
    }

    pub fn remove_file(&self, path: &str) -> VfsResult<()> {
        self.ensure_running()?;
        let disk_path = self.disk_path(path)?;

        self.search.write().remove_file(path)?;
        if disk_path.exists() {
            std::fs::remove_file(&disk_path)?;
        }
        Ok(())
    }

    /// Glob match over virtual paths.
    pub fn search_files(&self, pattern: &str) -> VfsResult<Vec<String>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| VfsError::InvalidArgument(format!("bad glob pattern: {e}")))?
            .compile_matcher();
        Ok(self
            .search
            .read()
            .paths()
            .filter(|p| matcher.is_match(p.trim_start_matches('/')) || matcher.is_match(p))
            .cloned()
            .collect())
    }

    pub fn semantic_search(&self, query: &str, k: usize) -> VfsResult<Vec<SearchHit>> {
        self.ensure_running()?;
        self.search.write().semantic_search(query, k)
    }

    pub fn hybrid_search(&self, query: &str, k: usize) -> VfsResult<Vec<SearchHit>> {
        self.ensure_running()?;
        self.search.write().hybrid_search(query, k)
    }

    /// Record an access; returns true when the caller should schedule a
    /// background model refresh.
    pub fn record_access(&self, path: &str, reason: &str) -> bool {
        self.search.write().record_access(path, reason)
    }

    pub fn update_models(&self) -> VfsResult<()> {
        self.search.write().update_models()
    }

    fn disk_path(&self, virtual_path: &str) -> VfsResult<PathBuf> {
        let rel = virtual_path.trim_start_matches('/');
        if rel.is_empty() || rel.split('/').any(|part| part == "..") {
            return Err(VfsError::InvalidArgument(format!(
                "bad virtual path {virtual_path:?}"
            )));
        }
        Ok(self.data_path.join(rel))
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.status() == ContainerStatus::Running {
            let _ = self.isolation.stop();
        }
    }
}
