//! File-affinity graph: weighted directed edges between virtual paths,
//! temporal edges derived from the access stream, random-walk importance,
//! neighbourhood recommendations and hub detection.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Edge attributes. `weight` is the normalized transition probability:
/// outgoing weights of any node sum to 1 after every insertion.
#[derive(Debug, Clone)]
pub struct EdgeData {
    pub weight: f64,
    pub similarity: f64,
    pub usage: u64,
}

#[derive(Debug, Clone)]
struct AccessRecord {
    path: String,
    at: Instant,
    #[allow(dead_code)]
    reason: String,
}

const HISTORY_CAPACITY: usize = 1000;
const HISTORY_EVICT_BATCH: usize = 100;
const TEMPORAL_WINDOW: usize = 10;
const TEMPORAL_CUTOFF: Duration = Duration::from_secs(300);
const NUM_WALKS: usize = 1000;
const WALK_LENGTH: usize = 50;

pub struct SemanticGraph {
    graph: StableDiGraph<String, EdgeData>,
    nodes: HashMap<String, NodeIndex>,
    importance: HashMap<String, f64>,
    history: VecDeque<AccessRecord>,
    rng: StdRng,
}

impl SemanticGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::default(),
            nodes: HashMap::new(),
            importance: HashMap::new(),
            history: VecDeque::new(),
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        let mut graph = Self::new();
        graph.rng = StdRng::seed_from_u64(seed);
        graph
    }

    fn node(&mut self, path: &str) -> NodeIndex {
        if let Some(idx) = self.nodes.get(path) {
            return *idx;
        }
        let idx = self.graph.add_node(path.to_string());
        self.nodes.insert(path.to_string(), idx);
        idx
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn importance(&self, path: &str) -> f64 {
        self.importance.get(path).copied().unwrap_or(0.0)
    }

    /// Insert or merge an edge. Merging averages the stored weight with the
    /// incoming `similarity * (1 + ln usage)`, keeps the larger similarity
    /// and sums usage counts; outgoing weights of `src` are renormalised
    /// afterwards.
    pub fn add_edge(&mut self, src: &str, dst: &str, similarity: f64, usage: u64) {
        let usage = usage.max(1);
        let edge_weight = similarity * (1.0 + (usage as f64).ln());

        let src_idx = self.node(src);
        let dst_idx = self.node(dst);

        match self.graph.find_edge(src_idx, dst_idx) {
            Some(edge) => {
                let data = self
                    .graph
                    .edge_weight_mut(edge)
                    .expect("edge disappeared during merge");
                data.weight = (data.weight + edge_weight) / 2.0;
                data.similarity = data.similarity.max(similarity);
                data.usage += usage;
            }
            None => {
                self.graph.add_edge(
                    src_idx,
                    dst_idx,
                    EdgeData {
                        weight: edge_weight,
                        similarity,
                        usage,
                    },
                );
            }
        }

        self.normalize_outgoing(src_idx);
    }

    fn normalize_outgoing(&mut self, node: NodeIndex) {
        let edges: Vec<_> = self.graph.edges(node).map(|e| e.id()).collect();
        let total: f64 = edges
            .iter()
            .filter_map(|e| self.graph.edge_weight(*e))
            .map(|d| d.weight)
            .sum();
        if total > 0.0 {
            for edge in edges {
                if let Some(data) = self.graph.edge_weight_mut(edge) {
                    data.weight /= total;
                }
            }
        }
    }

    /// Append an access to the bounded history and derive temporal edges
    /// from recent pairs.
    pub fn record_access(&mut self, path: &str, reason: &str) {
        self.record_access_at(path, reason, Instant::now());
    }

    fn record_access_at(&mut self, path: &str, reason: &str, at: Instant) {
        self.history.push_back(AccessRecord {
            path: path.to_string(),
            at,
            reason: reason.to_string(),
        });

        if self.history.len() > HISTORY_CAPACITY {
            self.history.drain(..HISTORY_EVICT_BATCH);
        }

        self.update_transition_edges();
    }

    /// Walk the tail window pairwise; accesses closer than the cutoff get
    /// an edge whose usage weight decays with the gap.
    fn update_transition_edges(&mut self) {
        if self.history.len() < 2 {
            return;
        }
        let window = TEMPORAL_WINDOW.min(self.history.len());
        let start = self.history.len() - window;

        let pairs: Vec<(String, String, Duration)> = (start..self.history.len() - 1)
            .map(|i| {
                let a = &self.history[i];
                let b = &self.history[i + 1];
                (
                    a.path.clone(),
                    b.path.clone(),
                    b.at.saturating_duration_since(a.at),
                )
            })
            .collect();

        for (from, to, gap) in pairs {
            if gap < TEMPORAL_CUTOFF {
                let temporal = 1.0 / (1.0 + gap.as_secs_f64() / 60.0);
                self.add_edge(&from, &to, 0.5, (temporal * 10.0).ceil() as u64);
            }
        }
    }

    /// Estimate node importance by sampling random walks. Each walk starts
    /// at a uniformly random node and steps along outgoing edges by their
    /// normalized weights, teleporting uniformly at sinks. Results are
    /// stored in the importance map and returned sorted descending.
    pub fn random_walk_ranking(&mut self) -> Vec<(String, f64)> {
        self.random_walk_ranking_with(NUM_WALKS, WALK_LENGTH)
    }

    pub fn random_walk_ranking_with(
        &mut self,
        num_walks: usize,
        walk_length: usize,
    ) -> Vec<(String, f64)> {
        let nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        if nodes.is_empty() || num_walks == 0 || walk_length == 0 {
            return Vec::new();
        }

        let mut visits: HashMap<NodeIndex, usize> = HashMap::new();
        for _ in 0..num_walks {
            let mut current = nodes[self.rng.random_range(0..nodes.len())];
            for _ in 0..walk_length {
                *visits.entry(current).or_insert(0) += 1;

                let outgoing: Vec<(NodeIndex, f64)> = self
                    .graph
                    .edges(current)
                    .map(|e| (e.target(), e.weight().weight))
                    .collect();
                if outgoing.is_empty() {
                    current = nodes[self.rng.random_range(0..nodes.len())];
                    continue;
                }

                let sample: f64 = self.rng.random_range(0.0..1.0);
                let mut cumulative = 0.0;
                let mut next = outgoing[outgoing.len() - 1].0;
                for (target, weight) in &outgoing {
                    cumulative += weight;
                    if sample <= cumulative {
                        next = *target;
                        break;
                    }
                }
                current = next;
            }
        }

        let total = (num_walks * walk_length) as f64;
        let mut ranking: Vec<(String, f64)> = visits
            .into_iter()
            .filter_map(|(idx, count)| {
                self.graph
                    .node_weight(idx)
                    .map(|path| (path.clone(), count as f64 / total))
            })
            .collect();
        ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        self.importance = ranking.iter().cloned().collect();
        debug!(nodes = self.graph.node_count(), "random walk ranking updated");
        ranking
    }

    /// Score the outgoing neighbours of `path` by transition weight,
    /// importance and similarity; return the top-k targets.
    pub fn get_recommendations(&self, path: &str, k: usize) -> Vec<String> {
        let Some(&idx) = self.nodes.get(path) else {
            return Vec::new();
        };

        let mut candidates: Vec<(String, f64)> = self
            .graph
            .edges(idx)
            .filter_map(|e| {
                let target = self.graph.node_weight(e.target())?;
                let importance = self.importance.get(target).copied().unwrap_or(0.0);
                let score = e.weight().weight * (1.0 + importance) * (1.0 + e.weight().similarity);
                Some((target.clone(), score))
            })
            .collect();

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(k);
        candidates.into_iter().map(|(path, _)| path).collect()
    }

    /// Nodes whose combined degree, outgoing similarity and importance
    /// exceed their peers.
    pub fn get_semantic_hubs(&self, k: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .graph
            .node_indices()
            .filter_map(|idx| {
                let path = self.graph.node_weight(idx)?;
                let out_edges: Vec<_> = self.graph.edges(idx).collect();
                let out_degree = out_edges.len() as f64;
                let in_degree = self
                    .graph
                    .edges_directed(idx, Direction::Incoming)
                    .count() as f64;
                let avg_similarity = if out_edges.is_empty() {
                    0.0
                } else {
                    out_edges.iter().map(|e| e.weight().similarity).sum::<f64>()
                        / out_edges.len() as f64
                };
                let importance = self.importance.get(path).copied().unwrap_or(0.0);
                let score = (in_degree + out_degree) * avg_similarity * (1.0 + importance);
                Some((path.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored.into_iter().map(|(path, _)| path).collect()
    }

    pub fn get_transition_probability(&self, from: &str, to: &str) -> f64 {
        let (Some(&src), Some(&dst)) = (self.nodes.get(from), self.nodes.get(to)) else {
            return 0.0;
        };
        self.graph
            .find_edge(src, dst)
            .and_then(|e| self.graph.edge_weight(e))
            .map(|d| d.weight)
            .unwrap_or(0.0)
    }

    /// Drop a path and its edges; called when a file is removed.
    pub fn remove_node(&mut self, path: &str) {
        if let Some(idx) = self.nodes.remove(path) {
            self.graph.remove_node(idx);
            self.importance.remove(path);
        }
    }

    /// Sum of outgoing weights per node, for invariant checks.
    pub fn outgoing_weight_sums(&self) -> Vec<(String, f64)> {
        self.graph
            .node_indices()
            .filter_map(|idx| {
                let path = self.graph.node_weight(idx)?;
                let edges: Vec<_> = self.graph.edges(idx).collect();
                if edges.is_empty() {
                    return None;
                }
                Some((path.clone(), edges.iter().map(|e| e.weight().weight).sum()))
            })
            .collect()
    }
}

impl Default for SemanticGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn outgoing_weights_sum_to_one_after_inserts() {
        let mut g = SemanticGraph::with_seed(1);
        g.add_edge("/a", "/b", 0.9, 1);
        g.add_edge("/a", "/c", 0.4, 2);
        g.add_edge("/a", "/b", 0.7, 3);

        for (_, sum) in g.outgoing_weight_sums() {
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn merged_edge_keeps_max_similarity_and_sums_usage() {
        let mut g = SemanticGraph::with_seed(2);
        g.add_edge("/a", "/b", 0.3, 2);
        g.add_edge("/a", "/b", 0.8, 5);

        // Single outgoing edge renormalises back to weight 1.
        assert!((g.get_transition_probability("/a", "/b") - 1.0).abs() < 1e-9);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn history_is_bounded_with_batch_eviction() {
        let mut g = SemanticGraph::with_seed(3);
        for i in 0..HISTORY_CAPACITY + 1 {
            g.record_access(&format!("/f{i}"), "read");
        }
        assert_eq!(g.history_len(), HISTORY_CAPACITY + 1 - HISTORY_EVICT_BATCH);
    }

    #[test]
    fn rapid_accesses_create_temporal_edges() {
        let mut g = SemanticGraph::with_seed(4);
        g.record_access("/a", "read");
        g.record_access("/b", "read");
        assert!(g.get_transition_probability("/a", "/b") > 0.0);
    }

    #[test]
    fn stale_accesses_do_not_link() {
        let mut g = SemanticGraph::with_seed(5);
        let now = Instant::now();
        let long_ago = now.checked_sub(Duration::from_secs(400)).unwrap();
        g.record_access_at("/a", "read", long_ago);
        g.record_access_at("/b", "read", now);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn random_walks_favor_well_connected_nodes() {
        let mut g = SemanticGraph::with_seed(6);
        // Everything points at /hub.
        for i in 0..5 {
            g.add_edge(&format!("/f{i}"), "/hub", 0.8, 1);
        }
        g.add_edge("/hub", "/f0", 0.5, 1);

        let ranking = g.random_walk_ranking();
        assert_eq!(ranking[0].0, "/hub");
        assert!(g.importance("/hub") > g.importance("/f3"));
    }

    #[test]
    fn recommendations_come_from_outgoing_edges() {
        let mut g = SemanticGraph::with_seed(7);
        g.add_edge("/a", "/strong", 0.9, 5);
        g.add_edge("/a", "/weak", 0.1, 1);
        g.add_edge("/b", "/elsewhere", 0.5, 1);

        let recs = g.get_recommendations("/a", 2);
        assert_eq!(recs[0], "/strong");
        assert!(!recs.contains(&"/elsewhere".to_string()));
        assert!(g.get_recommendations("/missing", 3).is_empty());
    }

    #[test]
    fn hubs_rank_by_degree_and_similarity() {
        let mut g = SemanticGraph::with_seed(8);
        for i in 0..4 {
            g.add_edge("/hub", &format!("/f{i}"), 0.9, 1);
            g.add_edge(&format!("/f{i}"), "/hub", 0.9, 1);
        }
        g.add_edge("/lone", "/f0", 0.1, 1);

        let hubs = g.get_semantic_hubs(1);
        assert_eq!(hubs, vec!["/hub".to_string()]);
    }

    #[test]
    fn removed_node_disappears_from_graph() {
        let mut g = SemanticGraph::with_seed(9);
        g.add_edge("/a", "/b", 0.5, 1);
        g.remove_node("/b");
        assert_eq!(g.get_transition_probability("/a", "/b"), 0.0);
        assert!(g.get_recommendations("/a", 3).is_empty());
    }

    proptest! {
        #[test]
        fn normalization_holds_for_any_edge_sequence(
            edges in proptest::collection::vec((0u8..6, 0u8..6, 0.01f64..1.0, 1u64..10), 1..50)
        ) {
            let mut g = SemanticGraph::with_seed(10);
            for (src, dst, sim, usage) in edges {
                g.add_edge(&format!("/n{src}"), &format!("/n{dst}"), sim, usage);
            }
            for (_, sum) in g.outgoing_weight_sums() {
                prop_assert!((sum - 1.0).abs() < 1e-9);
            }
        }
    }
}
