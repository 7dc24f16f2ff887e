//! Exact vector index with lazy rebuild.
//!
//! Stores one row per virtual path, either as a raw f32 vector or as a
//! product-quantizer code word. Search is brute-force L2 in insertion
//! order, which keeps distances exact and tie-breaks deterministic; the
//! quantized path goes exclusively through asymmetric distances.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{VfsError, VfsResult};
use crate::quantizer::ProductQuantizer;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub path: String,
    pub distance: f32,
}

struct IndexEntry {
    path: String,
    vector: Vec<f32>,
    codes: Option<Vec<u8>>,
}

pub struct VectorIndex {
    dim: usize,
    use_quantization: bool,
    pq: Option<ProductQuantizer>,
    entries: Vec<IndexEntry>,
    slots: HashMap<String, usize>,
    dirty: bool,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            use_quantization: false,
            pq: None,
            entries: Vec::new(),
            slots: HashMap::new(),
            dirty: true,
        }
    }

    /// Quantized index: rows are searched through PQ codes. The quantizer
    /// is trained on the stored vectors at the first rebuild.
    pub fn with_quantizer(dim: usize, pq: ProductQuantizer) -> Self {
        let mut index = Self::new(dim);
        index.use_quantization = true;
        index.pq = Some(pq);
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn contains(&self, path: &str) -> bool {
        self.slots.contains_key(path)
    }

    /// Insert or replace a row. Replacement keeps the original insertion
    /// slot so tie-breaking stays stable across updates.
    pub fn upsert(&mut self, path: &str, vector: Vec<f32>, codes: Option<Vec<u8>>) -> VfsResult<()> {
        if vector.len() != self.dim {
            return Err(VfsError::InvalidArgument(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dim,
                vector.len()
            )));
        }

        match self.slots.get(path) {
            Some(&slot) => {
                self.entries[slot].vector = vector;
                self.entries[slot].codes = codes;
            }
            None => {
                self.slots.insert(path.to_string(), self.entries.len());
                self.entries.push(IndexEntry {
                    path: path.to_string(),
                    vector,
                    codes,
                });
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, path: &str) {
        let Some(slot) = self.slots.remove(path) else {
            return;
        };
        self.entries.remove(slot);
        for entry_slot in self.slots.values_mut() {
            if *entry_slot > slot {
                *entry_slot -= 1;
            }
        }
        self.dirty = true;
    }

    /// Bring derived state in line with the stored rows. In quantized mode
    /// this trains the quantizer on first use and fills in missing codes.
    pub fn rebuild(&mut self) -> VfsResult<()> {
        if !self.dirty {
            return Ok(());
        }

        if self.use_quantization && !self.entries.is_empty() {
            let pq = self
                .pq
                .as_mut()
                .ok_or_else(|| VfsError::Internal("quantized index without quantizer".to_string()))?;

            if !pq.is_trained() {
                let samples: Vec<Vec<f32>> =
                    self.entries.iter().map(|e| e.vector.clone()).collect();
                pq.train(&samples, self.dim)?;
            }
            for entry in &mut self.entries {
                if entry.codes.is_none() {
                    entry.codes = Some(pq.encode(&entry.vector)?);
                }
            }
        }

        self.dirty = false;
        info!(files = self.entries.len(), quantized = self.use_quantization, "vector index rebuilt");
        Ok(())
    }

    /// Top-k nearest rows by ascending L2 distance. Triggers a rebuild when
    /// dirty. Equal distances keep insertion order. Empty index returns an
    /// empty vector.
    pub fn search(&mut self, query: &[f32], k: usize) -> VfsResult<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(VfsError::InvalidArgument(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dim,
                query.len()
            )));
        }
        if self.dirty {
            self.rebuild()?;
        }
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = if self.use_quantization {
            let pq = self
                .pq
                .as_mut()
                .ok_or_else(|| VfsError::Internal("quantized index without quantizer".to_string()))?;
            pq.precompute_query_tables(query)?;
            let mut hits = Vec::with_capacity(self.entries.len());
            for entry in &self.entries {
                let codes = entry.codes.as_ref().ok_or_else(|| {
                    VfsError::Internal(format!("missing codes for {} after rebuild", entry.path))
                })?;
                hits.push(SearchHit {
                    path: entry.path.clone(),
                    distance: pq.asymmetric_distance(codes)?,
                });
            }
            hits
        } else {
            self.entries
                .iter()
                .map(|entry| {
                    let dist = entry
                        .vector
                        .iter()
                        .zip(query)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>()
                        .sqrt();
                    SearchHit {
                        path: entry.path.clone(),
                        distance: dist,
                    }
                })
                .collect()
        };

        // Stable sort preserves insertion order between equal distances.
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k.min(self.entries.len()));
        debug!(k, results = hits.len(), "index search complete");
        Ok(hits)
    }
}
