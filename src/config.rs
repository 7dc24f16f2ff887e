use serde::{Deserialize, Serialize};

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Directory names skipped when a container's data directory is walked at
/// load time. Mirrors what a host-mounted container root typically carries.
pub const SYSTEM_DIR_IGNORE_SET: &[&str] = &[
    "sys", "proc", "dev", "boot", "lost+found", "run", "tmp", "mnt", "media",
    "srv", "opt", "snap", "swapfile", "swap.img",
];

/// File name of the per-container metadata document.
pub const CONTAINER_CONFIG_FILE: &str = "container_config.json";

/// File name of the per-container access policy document.
pub const ACCESS_POLICY_FILE: &str = "access_policy.json";

pub fn is_system_dir(name: &str) -> bool {
    SYSTEM_DIR_IGNORE_SET.contains(&name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root under which per-container state (logs, scratch) is kept.
    pub data_dir: String,
    /// Dimension of the embedding space. Must be divisible by `pq_subspaces`.
    pub embedding_dim: usize,
    /// Whether the vector index stores PQ codes instead of raw vectors.
    pub use_quantization: bool,
    /// Product-quantizer subspace count (M).
    pub pq_subspaces: usize,
    /// Product-quantizer centroids per subspace (k).
    pub pq_centroids: usize,
    /// Bus send retry budget.
    pub bus_send_retries: u32,
    /// Delay between bus send retries, in milliseconds.
    pub bus_retry_delay_ms: u64,
    /// Minimum interval between background model refreshes, in seconds.
    pub model_refresh_secs: u64,
    /// Largest file body accepted into a container, in bytes.
    pub max_file_size_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("VECTORFS_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("vectorfs-backend").to_string_lossy().to_string())
                .unwrap_or_else(|| ".vectorfs-data".to_string())
        });

        Self {
            data_dir,
            embedding_dim: std::env::var("VECTORFS_EMBEDDING_DIM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(128),
            use_quantization: std::env::var("VECTORFS_QUANTIZATION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            pq_subspaces: std::env::var("VECTORFS_PQ_SUBSPACES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            pq_centroids: std::env::var("VECTORFS_PQ_CENTROIDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            bus_send_retries: std::env::var("VECTORFS_BUS_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            bus_retry_delay_ms: std::env::var("VECTORFS_BUS_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            model_refresh_secs: std::env::var("VECTORFS_MODEL_REFRESH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            max_file_size_bytes: std::env::var("VECTORFS_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1024 * 1024), // 10MB
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: ".vectorfs-data".to_string(),
            embedding_dim: 128,
            use_quantization: false,
            pq_subspaces: 8,
            pq_centroids: 256,
            bus_send_retries: 5,
            bus_retry_delay_ms: 100,
            model_refresh_secs: 300,
            max_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_dirs_are_skipped() {
        assert!(is_system_dir("proc"));
        assert!(is_system_dir("lost+found"));
        assert!(!is_system_dir("notes"));
    }

    #[test]
    fn default_dim_divides_into_subspaces() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.embedding_dim % cfg.pq_subspaces, 0);
    }
}
