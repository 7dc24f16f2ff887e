use thiserror::Error;

/// POSIX error codes returned by the filesystem surface. Kept here so the
/// fs handlers and the tests agree on the exact values without pulling in
/// libc.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ERANGE: i32 = 34;
    pub const ENODATA: i32 = 61;
    pub const ENOTSUP: i32 = 95;
}

#[derive(Error, Debug)]
pub enum VfsError {
    /// Model or config missing, dimension mismatch at construction.
    /// Fatal to the owning component, not the process.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Retryable condition (no subscribers connected, bus send timed out).
    #[error("Transient: {0}")]
    Transient(String),

    /// Bad magic, inconsistent compressed block sizes.
    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VfsError {
    /// Translate to a negated POSIX errno for the FUSE operation contract.
    /// This is the only place in the crate where errors become integers.
    pub fn to_errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => -errno::ENOENT,
            VfsError::PermissionDenied(_) => -errno::EACCES,
            VfsError::AlreadyExists(_) => -errno::EEXIST,
            VfsError::InvalidArgument(_) => -errno::EINVAL,
            VfsError::ResourceExhausted(_) => -errno::ENOSPC,
            VfsError::Transient(_) => -errno::EAGAIN,
            VfsError::Configuration(_)
            | VfsError::Corruption(_)
            | VfsError::Io(_)
            | VfsError::Serde(_)
            | VfsError::Internal(_) => -errno::EIO,
        }
    }

    /// Short kind tag used in response envelopes, so clients can match on
    /// the taxonomy without parsing message text.
    pub fn kind(&self) -> &'static str {
        match self {
            VfsError::Configuration(_) => "ConfigurationError",
            VfsError::NotFound(_) => "NotFound",
            VfsError::PermissionDenied(_) => "PermissionDenied",
            VfsError::AlreadyExists(_) => "AlreadyExists",
            VfsError::InvalidArgument(_) => "InvalidArgument",
            VfsError::ResourceExhausted(_) => "ResourceExhausted",
            VfsError::Transient(_) => "Transient",
            VfsError::Corruption(_) => "Corruption",
            VfsError::Io(_) | VfsError::Serde(_) | VfsError::Internal(_) => "Internal",
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;
