//! Container-level scenarios: create and search, hub-aware ranking,
//! next-file prediction, index/store consistency.

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;
use vectorfs_backend::container::{ContainerSpec, ResourceLimits};
use vectorfs_backend::embedder::{HashEmbedder, SharedEmbedder};
use vectorfs_backend::manager::ContainerManager;

fn manager() -> ContainerManager {
    let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(128).unwrap());
    ContainerManager::new(embedder, false)
}

fn spec(id: &str, owner: &str, dir: &TempDir) -> ContainerSpec {
    ContainerSpec {
        id: id.to_string(),
        owner: owner.to_string(),
        namespace: "default".to_string(),
        data_path: dir.path().to_path_buf(),
        labels: HashMap::new(),
        commands: Vec::new(),
        limits: ResourceLimits::default(),
    }
}

#[test]
fn create_and_search_within_one_container() {
    let manager = manager();
    let dir = TempDir::new().unwrap();
    let c1 = manager.create_and_register(spec("c1", "alice", &dir)).unwrap();

    c1.add_file("/readme.md", b"project documentation and release notes")
        .unwrap();

    let hits = c1.semantic_search("documentation", 1).unwrap();
    assert_eq!(hits[0].path, "/readme.md");

    c1.add_file("/main.cpp", b"int main").unwrap();
    let hits = c1.semantic_search("documentation", 2).unwrap();
    assert_eq!(hits[0].path, "/readme.md");
    assert!(
        hits[0].distance < hits[1].distance,
        "readme must outrank the unrelated source file"
    );
}

#[test]
fn exact_content_search_is_consistent_with_the_store() {
    let manager = manager();
    let dir = TempDir::new().unwrap();
    let c1 = manager.create_and_register(spec("c1", "alice", &dir)).unwrap();

    let bodies = [
        ("/notes/a.md", "alpha release checklist"),
        ("/notes/b.md", "beta milestone planning"),
        ("/src/lib.rs", "pub fn parse(input: &str) {}"),
    ];
    for (path, body) in &bodies {
        c1.add_file(path, body.as_bytes()).unwrap();
    }

    // Every stored file with a fresh embedding is its own nearest match.
    for (path, body) in &bodies {
        let hits = c1.semantic_search(body, 1).unwrap();
        assert_eq!(hits[0].path, *path);
        assert!(hits[0].distance <= 1e-4, "distance {}", hits[0].distance);
    }
}

#[test]
fn hybrid_ranking_prefers_hubs() {
    let manager = manager();
    let dir = TempDir::new().unwrap();
    let c1 = manager.create_and_register(spec("c1", "alice", &dir)).unwrap();

    // Two files the query matches equally; /intro.md is inserted first so
    // plain distance tie-breaking would rank it ahead.
    c1.add_file("/intro.md", b"shared documentation text").unwrap();
    c1.add_file("/readme.md", b"shared documentation text").unwrap();
    for i in 0..8 {
        c1.add_file(&format!("/filler{i}.txt"), format!("filler body {i}").as_bytes())
            .unwrap();
    }

    // Six reads of /readme.md interleaved with other files make it the
    // graph's hub, plus one recorded edge /readme.md -> /intro.md.
    for i in 0..6 {
        c1.record_access(&format!("/filler{i}.txt"), "read");
        c1.record_access("/readme.md", "read");
    }
    c1.record_access("/intro.md", "read");

    let hits = c1.hybrid_search("documentation", 2).unwrap();
    assert_eq!(hits[0].path, "/readme.md");
    assert_eq!(hits[1].path, "/intro.md");
}

#[test]
fn hmm_predicts_the_next_file_in_a_trained_sequence() {
    let manager = manager();
    let dir = TempDir::new().unwrap();
    let c1 = manager.create_and_register(spec("c1", "alice", &dir)).unwrap();

    {
        let mut engine = c1.search().write();
        for _ in 0..10 {
            engine.hmm_mut().add_sequence(vec![
                "/a.cpp".to_string(),
                "/a.hpp".to_string(),
                "/a_test.cpp".to_string(),
            ]);
        }
        engine.hmm_mut().train();
    }

    c1.record_access("/a.cpp", "read");
    c1.record_access("/a.hpp", "read");

    let predictions = c1.search().read().predict_next(1);
    assert_eq!(predictions, vec!["/a_test.cpp".to_string()]);
}

#[test]
fn recommendations_follow_recorded_transitions() {
    let manager = manager();
    let dir = TempDir::new().unwrap();
    let c1 = manager.create_and_register(spec("c1", "alice", &dir)).unwrap();

    c1.add_file("/guide.md", b"setup guide").unwrap();
    c1.add_file("/faq.md", b"frequently asked questions").unwrap();

    for _ in 0..3 {
        c1.record_access("/guide.md", "read");
        c1.record_access("/faq.md", "read");
    }

    let recs = c1.search().read().recommendations("/guide.md");
    assert!(recs.contains(&"/faq.md".to_string()));
}

#[test]
fn writes_are_visible_to_searches_issued_afterwards() {
    let manager = manager();
    let dir = TempDir::new().unwrap();
    let c1 = manager.create_and_register(spec("c1", "alice", &dir)).unwrap();

    c1.add_file("/draft.md", b"initial draft about databases").unwrap();
    c1.update_file("/draft.md", b"final text about compilers and parsers")
        .unwrap();

    let hits = c1.semantic_search("compilers parsers", 1).unwrap();
    assert_eq!(hits[0].path, "/draft.md");
    assert!(c1.search().read().file("/draft.md").unwrap().embedding_fresh);
}
