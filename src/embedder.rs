//! Text embedding backends.
//!
//! The embedding model is consumed as a pure `text -> Vec<f32>` function
//! behind the [`TextEmbedder`] trait. The default backend is a deterministic
//! token-hashing embedder that needs no model weights, so every build and
//! test runs fully offline; the `fastembed` feature swaps in a real model.

use std::sync::Arc;

use crate::error::{VfsError, VfsResult};

/// Contract for an embedding backend: pure, thread-safe, deterministic for
/// a loaded model. `dim` is constant after construction. Inference does not
/// fail for non-empty input; callers lowercase text before calling.
pub trait TextEmbedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
    fn model_name(&self) -> &str;
}

/// Shared handle. One embedder per process, borrowed by every container's
/// search engine; never cloned per file.
pub type SharedEmbedder = Arc<dyn TextEmbedder>;

/// Construct the process-wide embedder for the given dimension.
///
/// With the `fastembed` feature enabled and `VECTORFS_MODEL` set, the
/// model-backed embedder is used and its dimension wins; otherwise the
/// deterministic hash embedder is built at the requested dimension.
pub fn build_embedder(dim: usize) -> VfsResult<SharedEmbedder> {
    #[cfg(feature = "fastembed")]
    if std::env::var("VECTORFS_MODEL").is_ok() {
        return Ok(Arc::new(model::ModelEmbedder::load()?));
    }

    Ok(Arc::new(HashEmbedder::new(dim)?))
}

/// Deterministic bag-of-tokens embedder.
///
/// Each lowercase alphanumeric token is FNV-1a-hashed into one of `dim`
/// buckets with a hash-derived sign, and the bucket histogram is
/// L2-normalised. Identical text always embeds identically, and texts that
/// share tokens land near each other, which is all the index, graph and
/// ranking layers require of the backend.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> VfsResult<Self> {
        if dim == 0 {
            return Err(VfsError::Configuration(
                "embedding dimension must be non-zero".to_string(),
            ));
        }
        Ok(Self { dim })
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001b3;

fn fnv1a(token: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in token.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl TextEmbedder for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token);
            let bucket = (hash % self.dim as u64) as usize;
            // High bit of the hash decides the sign so that unrelated
            // tokens sharing a bucket partially cancel instead of piling up.
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn model_name(&self) -> &str {
        "hash-bow"
    }
}

#[cfg(feature = "fastembed")]
mod model {
    use super::TextEmbedder;
    use crate::error::{VfsError, VfsResult};
    use fastembed::TextEmbedding;
    use std::sync::Mutex;

    /// fastembed-backed embedder. The model handle is behind a Mutex
    /// because the tokenizer is not Sync; inference is serialised, which
    /// matches the one-pipeline-worker concurrency model.
    pub struct ModelEmbedder {
        model: Mutex<TextEmbedding>,
        dim: usize,
        name: String,
    }

    impl ModelEmbedder {
        pub fn load() -> VfsResult<Self> {
            let name = std::env::var("VECTORFS_MODEL")
                .unwrap_or_else(|_| "default".to_string());
            let mut model = TextEmbedding::try_new(Default::default())
                .map_err(|e| VfsError::Configuration(format!("model load failed: {e}")))?;
            let probe = model
                .embed(vec!["dimension probe".to_string()], None)
                .map_err(|e| VfsError::Configuration(format!("model probe failed: {e}")))?;
            let dim = probe.first().map(Vec::len).ok_or_else(|| {
                VfsError::Configuration("model returned no probe embedding".to_string())
            })?;
            Ok(Self {
                model: Mutex::new(model),
                dim,
                name,
            })
        }
    }

    impl TextEmbedder for ModelEmbedder {
        fn dim(&self) -> usize {
            self.dim
        }

        fn embed(&self, text: &str) -> Vec<f32> {
            let mut guard = match self.model.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard
                .embed(vec![text.to_string()], None)
                .ok()
                .and_then(|mut batch| batch.pop())
                .unwrap_or_else(|| vec![0.0; self.dim])
        }

        fn model_name(&self) -> &str {
            &self.name
        }
    }
}
