//! Pseudo-path reports: reading a reserved path returns a synthetic
//! human-readable report instead of stored bytes.

use std::fmt::Write as _;

use tracing::info;

use crate::markov::HiddenMarkovModel;

use super::{VectorFs, decode_query};

fn preview(content: &[u8]) -> String {
    let text = String::from_utf8_lossy(content);
    if text.chars().count() > 50 {
        let head: String = text.chars().take(50).collect();
        format!("{head}...")
    } else {
        text.into_owned()
    }
}

impl VectorFs {
    /// `/.search/<url-encoded-query>`: hybrid results with category labels,
    /// recommendations, predictions and hubs.
    pub(super) fn search_report(&self, raw_query: &str) -> String {
        let query = decode_query(raw_query);
        let started = std::time::Instant::now();

        self.record_access(&format!("/.search/{query}"), "search");

        let mut search = self.search().write();
        let results = search.hybrid_search(&query, 5).unwrap_or_default();

        // Recommendations hang off the best match for the query.
        let recommendations = results
            .first()
            .map(|top| search.recommendations(&top.path))
            .unwrap_or_default();
        let predicted = search.predict_next(3);
        let hubs = search.semantic_hubs(3);

        let mut out = String::new();
        out.push_str("=== Enhanced Semantic Search Results ===\n");
        let _ = writeln!(out, "Query: {query}\n");

        if results.is_empty() {
            out.push_str("No results found\n");
            if search.indexed_count() == 0 {
                out.push_str("Hint: Create some files with content first!\n");
            }
        } else {
            out.push_str("Search results (importance-weighted):\n");
            for hit in &results {
                let _ = writeln!(out, "  {} (score: {:.4})", hit.path, hit.distance);
                if let Some(file) = search.file(&hit.path) {
                    let _ = writeln!(out, "    Content: {}", preview(&file.content));
                }
                let category = search.classify_file(&hit.path);
                let _ = writeln!(out, "    Category: {}", category.as_str());
            }
            out.push('\n');
        }

        if !recommendations.is_empty() {
            out.push_str("Recommended files:\n");
            for rec in &recommendations {
                let _ = writeln!(out, "  -> {rec}");
            }
            out.push('\n');
        }

        if !predicted.is_empty() {
            out.push_str("Predicted next files:\n");
            for pred in &predicted {
                let _ = writeln!(out, "  ~> {pred}");
            }
            out.push('\n');
        }

        if !hubs.is_empty() {
            out.push_str("Semantic hubs:\n");
            for hub in &hubs {
                let _ = writeln!(out, "  * {hub}");
            }
            out.push('\n');
        }

        out.push_str("=== Analytics ===\n");
        let _ = writeln!(out, "Total indexed files: {}", search.indexed_count());
        let _ = writeln!(out, "Recent access patterns: {}", search.recent_queries().len());
        let _ = writeln!(out, "Engine: {}", search.engine_info());

        info!(query = %query, elapsed_ms = started.elapsed().as_millis() as u64, "search report generated");
        out
    }

    /// `/.reindex`: force a rebuild and report the indexed count.
    pub(super) fn reindex_report(&self) -> String {
        let mut out = String::from("Forcing reindex...\n");
        match self.search().write().force_rebuild() {
            Ok(count) => {
                out.push_str("Reindex completed!\n");
                let _ = writeln!(out, "Indexed files: {count}");
            }
            Err(e) => {
                let _ = writeln!(out, "Reindex failed: {e}");
            }
        }
        out
    }

    /// `/.all`: every virtual path.
    pub(super) fn all_report(&self) -> String {
        let search = self.search().read();
        let mut out = String::new();
        for path in search.paths() {
            let _ = writeln!(out, "--- {path} ---");
        }
        out
    }

    /// `/.debug`: sizes of the virtual file and directory sets.
    pub(super) fn debug_report(&self) -> String {
        let search = self.search().read();
        let mut out = String::from("=== DEBUG INFO ===\n");
        let _ = writeln!(out, "Total virtual_files: {}", search.file_count());
        out.push_str("Files:\n");
        for (path, file) in search.files() {
            let _ = writeln!(out, "  - {} ({} bytes)", path, file.content.len());
        }
        let _ = writeln!(out, "Total virtual_dirs: {}", self.dir_count());
        out
    }

    /// `/.embeddings`: first components of every stored embedding.
    pub(super) fn embeddings_report(&self) -> String {
        let search = self.search().read();
        let mut out = String::from("Embeddings report:\n");
        let _ = writeln!(out, "Total files: {}", search.file_count());

        let mut count = 0usize;
        for (path, file) in search.files() {
            if !file.embedding_fresh || file.embedding.is_empty() {
                continue;
            }
            count += 1;
            let _ = writeln!(out, "--- {path} ---");
            let _ = writeln!(out, "Content: {}", preview(&file.content));
            let _ = writeln!(out, "Embedding size: {}", file.embedding.len());
            let first: Vec<String> = file
                .embedding
                .iter()
                .take(5)
                .map(|v| format!("{v:.4}"))
                .collect();
            let _ = writeln!(out, "First 5 values: {}", first.join(" "));
        }
        let _ = writeln!(out, "Total with embeddings: {count}");
        out
    }

    /// `/.markov`: self-test on a scratch model plus live-model stats.
    pub(super) fn markov_report(&self) -> String {
        let mut out = String::from("=== Markov Self-Test ===\n");

        // The self-test runs on a scratch model so reading the report
        // never perturbs the live one.
        let mut probe = HiddenMarkovModel::new();
        for _ in 0..10 {
            probe.add_sequence(vec![
                "/src/main.cpp".to_string(),
                "/src/main.hpp".to_string(),
                "/src/main_test.cpp".to_string(),
            ]);
        }
        probe.train();

        let recent = vec!["/src/main.cpp".to_string(), "/src/main.hpp".to_string()];
        let predictions = probe.predict_next(&recent, 3);
        let _ = writeln!(out, "Probe sequences: {}", probe.sequence_count());
        let _ = writeln!(out, "Probe observations: {}", probe.observation_count());
        out.push_str("Probe predictions after [main.cpp, main.hpp]:\n");
        for p in &predictions {
            let _ = writeln!(out, "  ~> {p}");
        }

        let (trans, emit) = probe.row_sums();
        let rows_ok = trans
            .iter()
            .chain(emit.iter())
            .all(|s| *s == 0.0 || (*s - 1.0).abs() < 1e-9);
        let _ = writeln!(out, "Row stochasticity: {}", if rows_ok { "ok" } else { "VIOLATED" });

        out.push_str("\n=== Live Model ===\n");
        let search = self.search().read();
        let _ = writeln!(out, "Trained: {}", search.hmm().is_trained());
        let _ = writeln!(out, "Observations: {}", search.hmm().observation_count());
        let _ = writeln!(out, "Sequences: {}", search.hmm().sequence_count());
        let _ = writeln!(out, "Graph nodes: {}", search.graph().node_count());
        let _ = writeln!(out, "Graph edges: {}", search.graph().edge_count());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::VectorFs;
    use crate::embedder::{HashEmbedder, SharedEmbedder};
    use crate::manager::ContainerManager;
    use crate::search::SearchEngine;
    use std::sync::Arc;

    fn fs() -> VectorFs {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(64).unwrap());
        let manager = Arc::new(ContainerManager::new(embedder.clone(), false));
        VectorFs::new(SearchEngine::new(embedder, false), manager, 1000, 1000)
    }

    fn populated() -> VectorFs {
        let fs = fs();
        fs.create("/readme.md", 0o644).unwrap();
        fs.write("/readme.md", b"project documentation and release notes", 0)
            .unwrap();
        fs.create("/main.cpp", 0o644).unwrap();
        fs.write("/main.cpp", b"int main", 0).unwrap();
        fs
    }

    #[test]
    fn search_report_mentions_the_best_match_first() {
        let fs = populated();
        let report = fs.search_report("documentation");
        let results_line = report
            .lines()
            .find(|l| l.trim_start().starts_with('/'))
            .unwrap();
        assert!(results_line.contains("/readme.md"), "got: {results_line}");
        assert!(report.contains("Category:"));
        assert!(report.contains("Total indexed files: 2"));
    }

    #[test]
    fn search_report_decodes_queries() {
        let fs = populated();
        let report = fs.search_report("release_notes");
        assert!(report.contains("Query: release notes"));
    }

    #[test]
    fn empty_index_report_gives_a_hint() {
        let fs = fs();
        let report = fs.search_report("anything");
        assert!(report.contains("No results found"));
        assert!(report.contains("Hint"));
    }

    #[test]
    fn reindex_reports_the_count() {
        let fs = populated();
        let report = fs.reindex_report();
        assert!(report.contains("Reindex completed!"));
        assert!(report.contains("Indexed files: 2"));
    }

    #[test]
    fn all_report_lists_every_path() {
        let fs = populated();
        let report = fs.all_report();
        assert!(report.contains("--- /readme.md ---"));
        assert!(report.contains("--- /main.cpp ---"));
    }

    #[test]
    fn debug_report_counts_files_and_dirs() {
        let fs = populated();
        let report = fs.debug_report();
        assert!(report.contains("Total virtual_files: 2"));
        assert!(report.contains("Total virtual_dirs: 1"));
    }

    #[test]
    fn embeddings_report_shows_components() {
        let fs = populated();
        let report = fs.embeddings_report();
        assert!(report.contains("Total with embeddings: 2"));
        assert!(report.contains("Embedding size: 64"));
        assert!(report.contains("First 5 values:"));
    }

    #[test]
    fn markov_report_runs_the_self_test() {
        let fs = populated();
        let report = fs.markov_report();
        assert!(report.contains("Markov Self-Test"));
        assert!(report.contains("/src/main_test.cpp"));
        assert!(report.contains("Row stochasticity: ok"));
    }
}
