//! Per-container semantic engine: the file store, the vector index, the
//! affinity graph, the HMM and the recent-access ring live here, behind the
//! container's search lock.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::embedder::SharedEmbedder;
use crate::error::{VfsError, VfsResult};
use crate::graph::SemanticGraph;
use crate::index::{SearchHit, VectorIndex};
use crate::markov::{FileCategory, HiddenMarkovModel};
use crate::quantizer::{ProductQuantizer, ScalarQuantizer};

/// POSIX-style metadata carried by every stored file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileMeta {
    pub fn regular(uid: u32, gid: u32) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            mode: 0o644,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub content: Vec<u8>,
    pub meta: FileMeta,
    pub embedding: Vec<f32>,
    pub embedding_fresh: bool,
    pub sq_codes: Option<Vec<u8>>,
    pub pq_codes: Option<Vec<u8>>,
    content_hash: String,
}

impl StoredFile {
    pub fn content_text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

const RECENT_CAPACITY: usize = 50;
const RECENT_EVICT_BATCH: usize = 10;
const TRAINING_WINDOW: usize = 10;
const SIMILARITY_EDGE_THRESHOLD: f64 = 0.3;

fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub struct SearchEngine {
    embedder: SharedEmbedder,
    index: VectorIndex,
    graph: SemanticGraph,
    hmm: HiddenMarkovModel,
    files: BTreeMap<String, StoredFile>,
    recent_queries: VecDeque<String>,
    sq: Option<ScalarQuantizer>,
    use_quantization: bool,
    model_refresh_interval: Duration,
    last_model_refresh: Instant,
}

impl SearchEngine {
    pub fn new(embedder: SharedEmbedder, use_quantization: bool) -> Self {
        let dim = embedder.dim();
        let index = if use_quantization {
            // Default PQ shape: 8 subspaces, 256 centroids. Training
            // happens at the first rebuild once embeddings exist.
            let pq = ProductQuantizer::new(8, 256).expect("static PQ shape is valid");
            VectorIndex::with_quantizer(dim, pq)
        } else {
            VectorIndex::new(dim)
        };

        Self {
            embedder,
            index,
            graph: SemanticGraph::new(),
            hmm: HiddenMarkovModel::new(),
            files: BTreeMap::new(),
            recent_queries: VecDeque::new(),
            sq: use_quantization.then(ScalarQuantizer::new),
            use_quantization,
            model_refresh_interval: Duration::from_secs(300),
            last_model_refresh: Instant::now(),
        }
    }

    pub fn set_model_refresh_interval(&mut self, interval: Duration) {
        self.model_refresh_interval = interval;
    }

    #[cfg(test)]
    fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.model_refresh_interval = interval;
        self
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn indexed_count(&self) -> usize {
        self.index.len()
    }

    pub fn total_content_bytes(&self) -> u64 {
        self.files.values().map(|f| f.content.len() as u64).sum()
    }

    pub fn file(&self, path: &str) -> Option<&StoredFile> {
        self.files.get(path)
    }

    pub fn file_meta_mut(&mut self, path: &str) -> Option<&mut FileMeta> {
        self.files.get_mut(path).map(|f| &mut f.meta)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &StoredFile)> {
        self.files.iter()
    }

    pub fn recent_queries(&self) -> Vec<String> {
        self.recent_queries.iter().cloned().collect()
    }

    pub fn engine_info(&self) -> String {
        format!(
            "SearchEngine[model={}, dim={}, files={}, indexed={}, quantized={}]",
            self.embedder.model_name(),
            self.embedder.dim(),
            self.files.len(),
            self.index.len(),
            self.use_quantization,
        )
    }

    /// Store a new file, embed it and mark the index dirty. The access is
    /// recorded with reason `"write"`.
    pub fn add_file(&mut self, path: &str, content: &[u8], meta: FileMeta) -> VfsResult<()> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(VfsError::InvalidArgument(format!(
                "virtual path must be absolute: {path:?}"
            )));
        }
        if self.files.contains_key(path) {
            return Err(VfsError::AlreadyExists(path.to_string()));
        }

        let mut meta = meta;
        meta.size = content.len() as u64;
        self.files.insert(
            path.to_string(),
            StoredFile {
                content_hash: hash_content(content),
                content: content.to_vec(),
                meta,
                embedding: Vec::new(),
                embedding_fresh: false,
                sq_codes: None,
                pq_codes: None,
            },
        );

        self.update_embedding(path)?;
        self.index.mark_dirty();
        self.record_access(path, "write");
        debug!(path, "file added to search store");
        Ok(())
    }

    /// Drop a file's content and derived artifacts, its index row and its
    /// graph node.
    pub fn remove_file(&mut self, path: &str) -> VfsResult<()> {
        if self.files.remove(path).is_none() {
            return Err(VfsError::NotFound(path.to_string()));
        }
        self.index.remove(path);
        self.graph.remove_node(path);
        Ok(())
    }

    /// Replace an existing file's content and recompute its artifacts.
    pub fn update_file(&mut self, path: &str, content: &[u8]) -> VfsResult<()> {
        let file = self
            .files
            .get_mut(path)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))?;

        let new_hash = hash_content(content);
        if file.content_hash == new_hash {
            // Content unchanged; skip the re-embed entirely.
            return Ok(());
        }

        file.embedding_fresh = false;
        file.content = content.to_vec();
        file.content_hash = new_hash;
        file.meta.size = content.len() as u64;
        file.meta.mtime = chrono::Utc::now().timestamp();

        self.update_embedding(path)?;
        self.index.mark_dirty();
        self.record_access(path, "write");
        Ok(())
    }

    fn update_embedding(&mut self, path: &str) -> VfsResult<()> {
        let Some(file) = self.files.get_mut(path) else {
            return Ok(());
        };
        if file.content.is_empty() {
            return Ok(());
        }

        let normalized = file.content_text().to_lowercase();
        let embedding = self.embedder.embed(&normalized);
        file.embedding = embedding.clone();
        file.embedding_fresh = true;

        if let Some(sq) = self.sq.as_ref().filter(|sq| sq.is_trained()) {
            file.sq_codes = sq.quantize(&embedding).ok();
        }

        let codes = file.pq_codes.clone();
        self.index.upsert(path, embedding, codes)?;
        Ok(())
    }

    /// Embed the normalised query and return the top-k exact matches.
    pub fn semantic_search(&mut self, query: &str, k: usize) -> VfsResult<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(VfsError::InvalidArgument("empty search query".to_string()));
        }

        let normalized = query.to_lowercase();
        let query_vec = self.embedder.embed(&normalized);
        self.index.search(&query_vec, k)
    }

    /// Hybrid ranking: nearest-neighbour distance discounted by random-walk
    /// importance, so graph hubs surface earlier.
    pub fn hybrid_search(&mut self, query: &str, k: usize) -> VfsResult<Vec<SearchHit>> {
        let base = self.semantic_search(query, k * 2)?;
        if base.is_empty() {
            return Ok(base);
        }

        self.graph.random_walk_ranking();

        let mut combined: Vec<SearchHit> = base
            .into_iter()
            .map(|hit| {
                let importance = self.graph.importance(&hit.path);
                SearchHit {
                    distance: hit.distance / (1.0 + importance as f32),
                    path: hit.path,
                }
            })
            .collect();

        combined.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        combined.truncate(k);
        Ok(combined)
    }

    /// Graph recommendations for the current file, falling back to HMM
    /// predictions when the neighbourhood is empty.
    pub fn recommendations(&self, current: &str) -> Vec<String> {
        let recs = self.graph.get_recommendations(current, 3);
        if !recs.is_empty() {
            return recs;
        }
        self.hmm.predict_next(&self.recent_queries(), 3)
    }

    pub fn predict_next(&self, k: usize) -> Vec<String> {
        self.hmm.predict_next(&self.recent_queries(), k)
    }

    pub fn classify_file(&self, path: &str) -> FileCategory {
        self.hmm.classify(path, &self.recent_queries())
    }

    pub fn semantic_hubs(&self, k: usize) -> Vec<String> {
        self.graph.get_semantic_hubs(k)
    }

    pub fn graph(&self) -> &SemanticGraph {
        &self.graph
    }

    pub fn hmm(&self) -> &HiddenMarkovModel {
        &self.hmm
    }

    pub fn hmm_mut(&mut self) -> &mut HiddenMarkovModel {
        &mut self.hmm
    }

    pub fn force_rebuild(&mut self) -> VfsResult<usize> {
        self.index.mark_dirty();
        self.index.rebuild()?;
        Ok(self.index.len())
    }

    /// Record an access: feed the graph, the recent-query ring and the HMM
    /// training buffer. Returns true when a background model refresh is
    /// due; the caller schedules it off the lock.
    pub fn record_access(&mut self, path: &str, reason: &str) -> bool {
        self.graph.record_access(path, reason);

        self.recent_queries.push_back(path.to_string());
        if self.recent_queries.len() > RECENT_CAPACITY {
            self.recent_queries.drain(..RECENT_EVICT_BATCH);
        }

        if self.recent_queries.len() >= TRAINING_WINDOW {
            let window: Vec<String> = self
                .recent_queries
                .iter()
                .skip(self.recent_queries.len() - TRAINING_WINDOW)
                .cloned()
                .collect();
            self.hmm.add_sequence(window);
        }

        self.last_model_refresh.elapsed() >= self.model_refresh_interval
    }

    /// Recompute semantic relationships, walk ranking and the HMM. Also
    /// trains the quantizers once enough fresh embeddings exist.
    pub fn update_models(&mut self) -> VfsResult<()> {
        let fresh: Vec<(&String, &StoredFile)> = self
            .files
            .iter()
            .filter(|(_, f)| f.embedding_fresh && !f.embedding.is_empty())
            .collect();

        // Pairwise cosine over the fresh embeddings; edges above the
        // threshold feed the graph.
        let pairs: Vec<(String, String, f64)> = fresh
            .par_iter()
            .enumerate()
            .flat_map(|(i, (path_a, file_a))| {
                fresh
                    .iter()
                    .enumerate()
                    .filter(move |(j, _)| i != *j)
                    .filter_map(|(_, (path_b, file_b))| {
                        let sim = cosine_similarity(&file_a.embedding, &file_b.embedding);
                        (sim > SIMILARITY_EDGE_THRESHOLD)
                            .then(|| ((*path_a).clone(), (*path_b).clone(), sim))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        for (a, b, sim) in pairs {
            self.graph.add_edge(&a, &b, sim, 1);
        }

        if self.use_quantization {
            self.train_quantizers()?;
        }

        self.graph.random_walk_ranking();
        self.hmm.train();
        self.last_model_refresh = Instant::now();
        info!(
            files = self.files.len(),
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            "models updated"
        );
        Ok(())
    }

    /// Hydrate the store and index from a pipeline-produced record. A
    /// carried embedding is trusted and reused; otherwise the content is
    /// re-embedded locally.
    pub fn apply_record(&mut self, record: &crate::ipc::FileRecord) -> VfsResult<()> {
        let content = match (&record.content, &record.compressed) {
            (Some(content), _) => content.clone(),
            (None, Some(compressed)) => crate::compress::decompress_bytes(compressed)?,
            (None, None) => {
                return Err(VfsError::InvalidArgument(format!(
                    "record for {} carries no content",
                    record.path
                )));
            }
        };

        let embedding = record
            .embedding
            .as_ref()
            .filter(|_| record.embedding_fresh)
            .filter(|e| e.len() == self.embedder.dim())
            .cloned();

        match (self.files.contains_key(&record.path), embedding) {
            (_, Some(embedding)) => {
                let hash = hash_content(&content);
                let meta = self
                    .files
                    .get(&record.path)
                    .map(|f| f.meta.clone())
                    .unwrap_or_else(|| FileMeta::regular(0, 0));
                let mut meta = meta;
                meta.size = content.len() as u64;
                if let Some(modified) = record.modified_at {
                    meta.mtime = modified;
                }
                self.files.insert(
                    record.path.clone(),
                    StoredFile {
                        content_hash: hash,
                        content,
                        meta,
                        embedding: embedding.clone(),
                        embedding_fresh: true,
                        sq_codes: record.sq_codes.clone(),
                        pq_codes: record.pq_codes.clone(),
                    },
                );
                // The index encodes with its own quantizer at rebuild; the
                // wire codes stay on the stored record only.
                self.index.upsert(&record.path, embedding, None)?;
                self.index.mark_dirty();
                self.record_access(&record.path, "write");
                Ok(())
            }
            (true, None) => self.update_file(&record.path, &content),
            (false, None) => self.add_file(&record.path, &content, FileMeta::regular(0, 0)),
        }
    }

    fn train_quantizers(&mut self) -> VfsResult<()> {
        let samples: Vec<Vec<f32>> = self
            .files
            .values()
            .filter(|f| f.embedding_fresh && !f.embedding.is_empty())
            .map(|f| f.embedding.clone())
            .collect();
        if samples.is_empty() {
            return Ok(());
        }

        let dim = self.embedder.dim();
        if let Some(sq) = self.sq.as_mut() {
            if !sq.is_trained() {
                sq.train(&samples, dim)?;
            }
        }

        // Backfill scalar codes for files embedded before training.
        if let Some(sq) = self.sq.as_ref().filter(|sq| sq.is_trained()) {
            for file in self.files.values_mut() {
                if file.embedding_fresh && file.sq_codes.is_none() {
                    file.sq_codes = sq.quantize(&file.embedding).ok();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use std::sync::Arc;

    fn engine() -> SearchEngine {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(64).unwrap());
        SearchEngine::new(embedder, false)
    }

    fn meta() -> FileMeta {
        FileMeta::regular(1000, 1000)
    }

    #[test]
    fn added_file_is_searchable_by_its_content() {
        let mut engine = engine();
        engine
            .add_file("/readme.md", b"project documentation and release notes", meta())
            .unwrap();
        engine.add_file("/main.cpp", b"int main", meta()).unwrap();

        let hits = engine.semantic_search("documentation", 1).unwrap();
        assert_eq!(hits[0].path, "/readme.md");
    }

    #[test]
    fn exact_content_query_matches_with_near_zero_distance() {
        let mut engine = engine();
        engine
            .add_file("/readme.md", b"project documentation and release notes", meta())
            .unwrap();

        let hits = engine
            .semantic_search("project documentation and release notes", 1)
            .unwrap();
        assert_eq!(hits[0].path, "/readme.md");
        assert!(hits[0].distance <= 1e-4);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut engine = engine();
        engine.add_file("/a.txt", b"one", meta()).unwrap();
        assert!(matches!(
            engine.add_file("/a.txt", b"two", meta()),
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn removed_file_leaves_the_index() {
        let mut engine = engine();
        engine.add_file("/a.txt", b"alpha beta", meta()).unwrap();
        engine.add_file("/b.txt", b"gamma delta", meta()).unwrap();
        engine.remove_file("/a.txt").unwrap();

        let hits = engine.semantic_search("alpha beta", 5).unwrap();
        assert!(hits.iter().all(|h| h.path != "/a.txt"));
        assert!(matches!(
            engine.remove_file("/a.txt"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn update_changes_search_results() {
        let mut engine = engine();
        engine.add_file("/note.txt", b"about penguins", meta()).unwrap();
        engine
            .update_file("/note.txt", b"about volcanoes erupting")
            .unwrap();

        let hits = engine.semantic_search("volcanoes", 1).unwrap();
        assert_eq!(hits[0].path, "/note.txt");
        assert!(engine.file("/note.txt").unwrap().embedding_fresh);
    }

    #[test]
    fn update_of_missing_file_is_not_found() {
        let mut engine = engine();
        assert!(matches!(
            engine.update_file("/ghost", b"boo"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn empty_query_is_invalid() {
        let mut engine = engine();
        assert!(matches!(
            engine.semantic_search("  ", 3),
            Err(VfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn recent_query_ring_is_bounded() {
        let mut engine = engine();
        for i in 0..RECENT_CAPACITY + 1 {
            engine.record_access(&format!("/f{i}"), "read");
        }
        assert_eq!(
            engine.recent_queries().len(),
            RECENT_CAPACITY + 1 - RECENT_EVICT_BATCH
        );
    }

    #[test]
    fn model_refresh_flag_fires_after_interval() {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(64).unwrap());
        let mut engine =
            SearchEngine::new(embedder, false).with_refresh_interval(Duration::ZERO);
        assert!(engine.record_access("/a", "read"));
    }

    #[test]
    fn update_models_links_similar_files() {
        let mut engine = engine();
        engine
            .add_file("/a.md", b"rust async runtime internals", meta())
            .unwrap();
        engine
            .add_file("/b.md", b"rust async runtime scheduler", meta())
            .unwrap();
        engine
            .add_file("/c.md", b"gardening tips for spring", meta())
            .unwrap();

        engine.update_models().unwrap();
        assert!(engine.graph().get_transition_probability("/a.md", "/b.md") > 0.0);
        assert_eq!(engine.graph().get_transition_probability("/a.md", "/missing.md"), 0.0);
    }

    #[test]
    fn hybrid_search_prefers_important_nodes() {
        let mut engine = engine();
        // Two files with identical content embed identically; the graph
        // importance boost must break the tie in favour of the hub.
        engine
            .add_file("/intro.md", b"shared documentation text", meta())
            .unwrap();
        engine
            .add_file("/readme.md", b"shared documentation text", meta())
            .unwrap();

        // Make /readme.md a hub: several files point at it.
        for i in 0..6 {
            let path = format!("/f{i}.txt");
            engine.add_file(&path, b"filler", meta()).unwrap();
        }
        for _ in 0..6 {
            engine.record_access("/other.md", "read");
            engine.record_access("/readme.md", "read");
        }

        // A query matching both files equally leaves a distance tie that
        // only the importance boost can break.
        let hits = engine.hybrid_search("documentation", 2).unwrap();
        assert_eq!(hits[0].path, "/readme.md");
    }

    #[test]
    fn recommendations_fall_back_to_hmm() {
        let mut engine = engine();
        for _ in 0..10 {
            engine.hmm_mut().add_sequence(vec![
                "/a.cpp".to_string(),
                "/a.hpp".to_string(),
                "/a_test.cpp".to_string(),
            ]);
        }
        engine.hmm_mut().train();
        engine.record_access("/a.cpp", "read");
        engine.record_access("/a.hpp", "read");

        // No graph edges for /unknown; HMM supplies the predictions.
        let recs = engine.recommendations("/unknown");
        assert!(!recs.is_empty());
    }
}
