//! Scalar and product quantization for stored embeddings.
//!
//! The scalar quantizer maps each dimension linearly onto a byte; the
//! product quantizer splits the space into M subspaces and k-means-clusters
//! each one, so a vector compresses to M code bytes. Search against PQ
//! codes goes through a per-query table of squared subspace distances
//! (asymmetric distance), never through reconstructed floats.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::error::{VfsError, VfsResult};

/// Per-dimension linear byte quantizer.
#[derive(Debug, Default)]
pub struct ScalarQuantizer {
    mins: Vec<f32>,
    maxs: Vec<f32>,
    trained: bool,
}

impl ScalarQuantizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Record per-dimension min/max over the training sample.
    pub fn train(&mut self, samples: &[Vec<f32>], dim: usize) -> VfsResult<()> {
        if samples.is_empty() {
            return Err(VfsError::InvalidArgument(
                "scalar quantizer needs at least one training vector".to_string(),
            ));
        }
        if samples.iter().any(|s| s.len() != dim) {
            return Err(VfsError::InvalidArgument(format!(
                "training vector dimension mismatch, expected {dim}"
            )));
        }

        self.mins = vec![f32::INFINITY; dim];
        self.maxs = vec![f32::NEG_INFINITY; dim];
        for sample in samples {
            for (i, v) in sample.iter().enumerate() {
                self.mins[i] = self.mins[i].min(*v);
                self.maxs[i] = self.maxs[i].max(*v);
            }
        }
        self.trained = true;
        info!(vectors = samples.len(), dim, "scalar quantizer trained");
        Ok(())
    }

    /// Round-to-nearest with saturation at the byte range edges.
    pub fn quantize(&self, vector: &[f32]) -> VfsResult<Vec<u8>> {
        self.check_ready(vector.len())?;
        Ok(vector
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let range = self.maxs[i] - self.mins[i];
                if range <= 0.0 {
                    return 0u8;
                }
                let scaled = (v - self.mins[i]) / range * 255.0;
                scaled.round().clamp(0.0, 255.0) as u8
            })
            .collect())
    }

    pub fn dequantize(&self, codes: &[u8]) -> VfsResult<Vec<f32>> {
        self.check_ready(codes.len())?;
        Ok(codes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let range = self.maxs[i] - self.mins[i];
                self.mins[i] + f32::from(*c) / 255.0 * range
            })
            .collect())
    }

    /// Baseline distance between two code words: reconstruct both and take
    /// the Euclidean distance.
    pub fn approx_distance(&self, a: &[u8], b: &[u8]) -> VfsResult<f32> {
        let da = self.dequantize(a)?;
        let db = self.dequantize(b)?;
        Ok(da
            .iter()
            .zip(&db)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt())
    }

    fn check_ready(&self, len: usize) -> VfsResult<()> {
        if !self.trained {
            return Err(VfsError::InvalidArgument(
                "scalar quantizer is not trained".to_string(),
            ));
        }
        if len != self.mins.len() {
            return Err(VfsError::InvalidArgument(format!(
                "dimension mismatch: expected {}, got {len}",
                self.mins.len()
            )));
        }
        Ok(())
    }
}

/// Product quantizer: M subspaces, k centroids each, one code byte per
/// subspace.
pub struct ProductQuantizer {
    subspaces: usize,
    centroids_per_subspace: usize,
    dim: usize,
    sub_dim: usize,
    /// `centroids[m]` is a flat `k * sub_dim` buffer for subspace `m`.
    centroids: Vec<Vec<f32>>,
    /// Per-query squared-distance table, `subspaces * k` entries.
    query_tables: Vec<Vec<f32>>,
    trained: bool,
    rng: StdRng,
}

const KMEANS_MAX_ITERATIONS: usize = 100;
const KMEANS_CONVERGENCE: f32 = 1e-6;

impl ProductQuantizer {
    pub fn new(subspaces: usize, centroids_per_subspace: usize) -> VfsResult<Self> {
        if subspaces == 0 {
            return Err(VfsError::InvalidArgument(
                "product quantizer needs at least one subspace".to_string(),
            ));
        }
        if centroids_per_subspace == 0 || centroids_per_subspace > 256 {
            return Err(VfsError::InvalidArgument(
                "centroid count must be in 1..=256 for one-byte codes".to_string(),
            ));
        }
        Ok(Self {
            subspaces,
            centroids_per_subspace,
            dim: 0,
            sub_dim: 0,
            centroids: Vec::new(),
            query_tables: Vec::new(),
            trained: false,
            rng: StdRng::from_os_rng(),
        })
    }

    /// Deterministic construction for tests.
    pub fn with_seed(subspaces: usize, centroids_per_subspace: usize, seed: u64) -> VfsResult<Self> {
        let mut pq = Self::new(subspaces, centroids_per_subspace)?;
        pq.rng = StdRng::seed_from_u64(seed);
        Ok(pq)
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn code_len(&self) -> usize {
        self.subspaces
    }

    pub fn train(&mut self, samples: &[Vec<f32>], dim: usize) -> VfsResult<()> {
        if samples.is_empty() {
            return Err(VfsError::InvalidArgument(
                "product quantizer needs at least one training vector".to_string(),
            ));
        }
        if dim % self.subspaces != 0 {
            return Err(VfsError::InvalidArgument(format!(
                "dimension {dim} is not divisible by {} subspaces",
                self.subspaces
            )));
        }
        if samples.iter().any(|s| s.len() != dim) {
            return Err(VfsError::InvalidArgument(format!(
                "training vector dimension mismatch, expected {dim}"
            )));
        }

        self.dim = dim;
        self.sub_dim = dim / self.subspaces;
        self.centroids.clear();

        for m in 0..self.subspaces {
            let offset = m * self.sub_dim;
            let slices: Vec<&[f32]> = samples
                .iter()
                .map(|s| &s[offset..offset + self.sub_dim])
                .collect();
            let centroids = self.kmeans(&slices);
            self.centroids.push(centroids);
        }

        self.trained = true;
        self.query_tables.clear();
        info!(
            vectors = samples.len(),
            dim,
            subspaces = self.subspaces,
            "product quantizer trained"
        );
        Ok(())
    }

    /// Lloyd's iterations over one subspace. Training sets smaller than k
    /// are padded by sampling with replacement.
    fn kmeans(&mut self, points: &[&[f32]]) -> Vec<f32> {
        let k = self.centroids_per_subspace;
        let sub_dim = self.sub_dim;

        let mut centroids = vec![0.0f32; k * sub_dim];
        for c in 0..k {
            // Uniform draw with replacement; also covers training sets
            // smaller than k.
            let pick = self.rng.random_range(0..points.len());
            centroids[c * sub_dim..(c + 1) * sub_dim].copy_from_slice(points[pick]);
        }

        let mut assignments = vec![0usize; points.len()];
        for _ in 0..KMEANS_MAX_ITERATIONS {
            for (i, point) in points.iter().enumerate() {
                assignments[i] = Self::nearest_centroid(&centroids, sub_dim, point).0;
            }

            let mut sums = vec![0.0f32; k * sub_dim];
            let mut counts = vec![0usize; k];
            for (point, &cluster) in points.iter().zip(&assignments) {
                counts[cluster] += 1;
                for (d, v) in point.iter().enumerate() {
                    sums[cluster * sub_dim + d] += v;
                }
            }

            let mut max_shift = 0.0f32;
            for c in 0..k {
                if counts[c] == 0 {
                    continue; // empty cluster keeps its centroid
                }
                for d in 0..sub_dim {
                    let new = sums[c * sub_dim + d] / counts[c] as f32;
                    let shift = (new - centroids[c * sub_dim + d]).abs();
                    max_shift = max_shift.max(shift);
                    centroids[c * sub_dim + d] = new;
                }
            }

            if max_shift < KMEANS_CONVERGENCE {
                break;
            }
        }

        centroids
    }

    fn nearest_centroid(centroids: &[f32], sub_dim: usize, point: &[f32]) -> (usize, f32) {
        let k = centroids.len() / sub_dim;
        let mut best = (0usize, f32::INFINITY);
        for c in 0..k {
            let base = c * sub_dim;
            let mut dist = 0.0f32;
            for d in 0..sub_dim {
                let diff = point[d] - centroids[base + d];
                dist += diff * diff;
            }
            if dist < best.1 {
                best = (c, dist);
            }
        }
        best
    }

    /// Encode a vector as one nearest-centroid index per subspace.
    pub fn encode(&self, vector: &[f32]) -> VfsResult<Vec<u8>> {
        self.check_ready(vector.len())?;
        let mut codes = Vec::with_capacity(self.subspaces);
        for m in 0..self.subspaces {
            let offset = m * self.sub_dim;
            let sub = &vector[offset..offset + self.sub_dim];
            let (idx, _) = Self::nearest_centroid(&self.centroids[m], self.sub_dim, sub);
            codes.push(idx as u8);
        }
        Ok(codes)
    }

    /// Concatenate the centroids named by the code word.
    pub fn decode(&self, codes: &[u8]) -> VfsResult<Vec<f32>> {
        if !self.trained {
            return Err(VfsError::InvalidArgument(
                "product quantizer is not trained".to_string(),
            ));
        }
        if codes.len() != self.subspaces {
            return Err(VfsError::InvalidArgument(format!(
                "code length mismatch: expected {}, got {}",
                self.subspaces,
                codes.len()
            )));
        }
        let mut vector = Vec::with_capacity(self.dim);
        for (m, code) in codes.iter().enumerate() {
            let base = usize::from(*code) * self.sub_dim;
            vector.extend_from_slice(&self.centroids[m][base..base + self.sub_dim]);
        }
        Ok(vector)
    }

    /// Precompute the squared distance from a query to every centroid of
    /// every subspace. Must be called before `asymmetric_distance`.
    pub fn precompute_query_tables(&mut self, query: &[f32]) -> VfsResult<()> {
        self.check_ready(query.len())?;
        let mut tables = Vec::with_capacity(self.subspaces);
        for m in 0..self.subspaces {
            let offset = m * self.sub_dim;
            let sub = &query[offset..offset + self.sub_dim];
            let mut table = Vec::with_capacity(self.centroids_per_subspace);
            for c in 0..self.centroids_per_subspace {
                let base = c * self.sub_dim;
                let mut dist = 0.0f32;
                for d in 0..self.sub_dim {
                    let diff = sub[d] - self.centroids[m][base + d];
                    dist += diff * diff;
                }
                table.push(dist);
            }
            tables.push(table);
        }
        self.query_tables = tables;
        Ok(())
    }

    /// Distance between the current query and a coded database vector,
    /// summed from the precomputed subspace tables.
    pub fn asymmetric_distance(&self, codes: &[u8]) -> VfsResult<f32> {
        if self.query_tables.len() != self.subspaces {
            return Err(VfsError::Internal(
                "asymmetric distance requested before query tables were computed".to_string(),
            ));
        }
        if codes.len() != self.subspaces {
            return Err(VfsError::InvalidArgument(format!(
                "code length mismatch: expected {}, got {}",
                self.subspaces,
                codes.len()
            )));
        }
        let mut total = 0.0f32;
        for (m, code) in codes.iter().enumerate() {
            total += self.query_tables[m][usize::from(*code)];
        }
        Ok(total.sqrt())
    }

    fn check_ready(&self, len: usize) -> VfsResult<()> {
        if !self.trained {
            return Err(VfsError::InvalidArgument(
                "product quantizer is not trained".to_string(),
            ));
        }
        if len != self.dim {
            return Err(VfsError::InvalidArgument(format!(
                "dimension mismatch: expected {}, got {len}",
                self.dim
            )));
        }
        Ok(())
    }
}
