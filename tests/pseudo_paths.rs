//! Mount-surface scenarios: pseudo-path reports and xattrs through the
//! POSIX operation contract.

use std::sync::Arc;

use vectorfs_backend::embedder::{HashEmbedder, SharedEmbedder};
use vectorfs_backend::fs::VectorFs;
use vectorfs_backend::manager::ContainerManager;
use vectorfs_backend::search::SearchEngine;

fn mounted() -> VectorFs {
    let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(64).unwrap());
    let manager = Arc::new(ContainerManager::new(embedder.clone(), false));
    let fs = VectorFs::new(SearchEngine::new(embedder, false), manager, 1000, 1000);

    fs.create("/readme.md", 0o644).unwrap();
    fs.write("/readme.md", b"project documentation and release notes", 0)
        .unwrap();
    fs.create("/main.cpp", 0o644).unwrap();
    fs.write("/main.cpp", b"int main", 0).unwrap();
    fs
}

fn read_to_string(fs: &VectorFs, path: &str) -> String {
    let bytes = fs.read(path, 1 << 20, 0).unwrap();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn search_pseudo_path_reports_the_best_match_first() {
    let fs = mounted();
    let report = read_to_string(&fs, "/.search/documentation");

    let first_result = report
        .lines()
        .find(|line| line.trim_start().starts_with('/'))
        .expect("report contains a result line");
    assert!(
        first_result.contains("/readme.md"),
        "first result line was: {first_result}"
    );
}

#[test]
fn search_report_sections_are_present() {
    let fs = mounted();
    // Seed the graph so recommendations and hubs have something to show.
    for _ in 0..4 {
        fs.read("/readme.md", 64, 0).unwrap();
        fs.read("/main.cpp", 64, 0).unwrap();
    }

    let report = read_to_string(&fs, "/.search/documentation");
    assert!(report.contains("=== Enhanced Semantic Search Results ==="));
    assert!(report.contains("Query: documentation"));
    assert!(report.contains("=== Analytics ==="));
    assert!(report.contains("Total indexed files: 2"));
}

#[test]
fn reindex_pseudo_path_reports_the_indexed_count() {
    let fs = mounted();
    let report = read_to_string(&fs, "/.reindex");
    assert!(report.contains("Reindex completed!"));
    assert!(report.contains("Indexed files: 2"));
}

#[test]
fn all_pseudo_path_lists_every_virtual_file() {
    let fs = mounted();
    let report = read_to_string(&fs, "/.all");
    assert!(report.contains("--- /readme.md ---"));
    assert!(report.contains("--- /main.cpp ---"));
}

#[test]
fn embeddings_pseudo_path_dumps_components() {
    let fs = mounted();
    let report = read_to_string(&fs, "/.embeddings");
    assert!(report.contains("Total with embeddings: 2"));
    assert!(report.contains("First 5 values:"));
}

#[test]
fn markov_pseudo_path_runs_a_self_test() {
    let fs = mounted();
    let report = read_to_string(&fs, "/.markov");
    assert!(report.contains("=== Markov Self-Test ==="));
    assert!(report.contains("Row stochasticity: ok"));
}

#[test]
fn pseudo_reads_honour_offsets() {
    let fs = mounted();
    let full = fs.read("/.all", 1 << 20, 0).unwrap();
    let tail = fs.read("/.all", 1 << 20, 4).unwrap();
    assert_eq!(&full[4..], tail.as_slice());
    assert!(fs.read("/.all", 16, full.len() as u64 + 10).unwrap().is_empty());
}

#[test]
fn containers_surface_under_the_reserved_directory() {
    use std::collections::HashMap;
    use vectorfs_backend::container::{ContainerSpec, ResourceLimits};

    let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(64).unwrap());
    let manager = Arc::new(ContainerManager::new(embedder.clone(), false));
    let dir = tempfile::TempDir::new().unwrap();
    let container = manager
        .create_and_register(ContainerSpec {
            id: "kb".to_string(),
            owner: "alice".to_string(),
            namespace: "default".to_string(),
            data_path: dir.path().to_path_buf(),
            labels: HashMap::new(),
            commands: Vec::new(),
            limits: ResourceLimits::default(),
        })
        .unwrap();
    container.add_file("/wiki.md", b"container notes").unwrap();

    let fs = VectorFs::new(SearchEngine::new(embedder, false), manager, 1000, 1000);

    let ids = fs.readdir("/.containers").unwrap();
    assert!(ids.contains(&"kb".to_string()));

    let entries = fs.readdir("/.containers/kb").unwrap();
    assert!(entries.contains(&"wiki.md".to_string()));

    let content = fs.read("/.containers/kb/wiki.md", 4096, 0).unwrap();
    assert_eq!(content, b"container notes");

    assert_eq!(fs.read("/.containers/ghost/x", 16, 0).err(), Some(-2));
}

#[test]
fn xattr_surface_matches_the_contract() {
    use vectorfs_backend::fs::{XattrListReply, XattrReply};

    let fs = mounted();
    assert_eq!(
        fs.getxattr("/readme.md", "user.content.size", 4096).unwrap(),
        XattrReply::Value("39".to_string())
    );
    assert_eq!(
        fs.getxattr("/readme.md", "user.embedding.updated", 4096).unwrap(),
        XattrReply::Value("true".to_string())
    );
    assert_eq!(fs.getxattr("/missing", "user.content.size", 4096).err(), Some(-2));
    assert_eq!(fs.setxattr("/readme.md", "user.a", b"v").err(), Some(-95));

    // Size-probe protocol: 0 asks for the needed length, short buffers
    // are ERANGE (-34).
    assert_eq!(
        fs.getxattr("/readme.md", "user.content.size", 0).unwrap(),
        XattrReply::Size(2)
    );
    assert_eq!(fs.getxattr("/readme.md", "user.content.size", 1).err(), Some(-34));
    assert!(matches!(
        fs.listxattr("/readme.md", 0).unwrap(),
        XattrListReply::Size(_)
    ));
}
