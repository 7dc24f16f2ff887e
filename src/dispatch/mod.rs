//! Control-plane message dispatcher.
//!
//! Inbound messages carry a type tag, a request id and a flat payload. A
//! static route table maps the tag to a `(verb, path)` pair, a payload
//! schema, a resolver chain and a controller. Every outcome, including
//! malformed input, becomes a response envelope; nothing escapes the
//! reader thread.

pub mod controllers;
pub mod resolvers;
pub mod schemas;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{VfsError, VfsResult};
use crate::ipc::MessageBus;
use crate::manager::ContainerManager;

use resolvers::{Resolved, Resolver, run_chain};
use schemas::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Delete,
}

type Controller = fn(&ContainerManager, &Resolved, &Value) -> VfsResult<Value>;

pub struct Route {
    pub message_type: &'static str,
    pub verb: Verb,
    pub path: &'static str,
    pub schema: Schema,
    pub chain: &'static [Resolver],
    pub controller: Controller,
}

pub static ROUTES: &[Route] = &[
    Route {
        message_type: "container_create",
        verb: Verb::Post,
        path: "container/create",
        schema: schemas::CONTAINER_CREATE,
        chain: &[Resolver::UserExists, Resolver::ContainerNotExists],
        controller: controllers::container_create,
    },
    Route {
        message_type: "container_delete",
        verb: Verb::Delete,
        path: "container/delete",
        schema: schemas::CONTAINER_TARGET,
        chain: &[Resolver::ContainerExists, Resolver::ContainerOwnership],
        controller: controllers::container_delete,
    },
    Route {
        message_type: "container_stop",
        verb: Verb::Post,
        path: "container/stop",
        schema: schemas::CONTAINER_TARGET,
        chain: &[
            Resolver::ContainerExists,
            Resolver::ContainerOwnership,
            Resolver::ContainerIsActive,
        ],
        controller: controllers::container_stop,
    },
    Route {
        message_type: "get_container_files",
        verb: Verb::Get,
        path: "container/files",
        schema: schemas::CONTAINER_FILES,
        chain: &[
            Resolver::ContainerExists,
            Resolver::ContainerOwnership,
            Resolver::ContainerIsActive,
        ],
        controller: controllers::get_container_files,
    },
    Route {
        message_type: "file_create",
        verb: Verb::Post,
        path: "file/create",
        schema: schemas::FILE_CREATE,
        chain: &[
            Resolver::ContainerExists,
            Resolver::ContainerOwnership,
            Resolver::ContainerIsActive,
            Resolver::FileNotExists,
        ],
        controller: controllers::file_create,
    },
    Route {
        message_type: "file_delete",
        verb: Verb::Delete,
        path: "file/delete",
        schema: schemas::FILE_DELETE,
        chain: &[
            Resolver::ContainerExists,
            Resolver::ContainerOwnership,
            Resolver::ContainerIsActive,
            Resolver::FileExists,
        ],
        controller: controllers::file_delete,
    },
    Route {
        message_type: "semantic_search_in_container",
        verb: Verb::Post,
        path: "search/semantic",
        schema: schemas::SEMANTIC_SEARCH,
        chain: &[
            Resolver::ContainerExists,
            Resolver::ContainerOwnership,
            Resolver::ContainerIsActive,
        ],
        controller: controllers::semantic_search,
    },
];

pub fn route_for_type(message_type: &str) -> Option<&'static Route> {
    ROUTES.iter().find(|r| r.message_type == message_type)
}

pub fn route_for(verb: Verb, path: &str) -> Option<&'static Route> {
    ROUTES.iter().find(|r| r.verb == verb && r.path == path)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub success: bool,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ResponseEnvelope {
    fn success(request_id: String, data: Value) -> Self {
        Self {
            request_id,
            success: true,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data: Some(data),
            error: None,
            detail: None,
        }
    }

    fn failure(request_id: String, error: &VfsError) -> Self {
        Self {
            request_id,
            success: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data: None,
            error: Some(error.kind().to_string()),
            detail: Some(error.to_string()),
        }
    }
}

pub struct MessageDispatcher {
    manager: Arc<ContainerManager>,
}

impl MessageDispatcher {
    pub fn new(manager: Arc<ContainerManager>) -> Self {
        Self { manager }
    }

    /// Dispatch a parsed message. Always answers with an envelope.
    pub fn dispatch(&self, message: &Value) -> ResponseEnvelope {
        let request_id = message
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match self.try_dispatch(message) {
            Ok(data) => ResponseEnvelope::success(request_id, data),
            Err(error) => {
                debug!(%error, request_id, "dispatch failed");
                ResponseEnvelope::failure(request_id, &error)
            }
        }
    }

    /// Dispatch raw bytes; malformed JSON becomes an error envelope.
    pub fn dispatch_bytes(&self, bytes: &[u8]) -> ResponseEnvelope {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(message) => self.dispatch(&message),
            Err(e) => ResponseEnvelope::failure(
                String::new(),
                &VfsError::InvalidArgument(format!("malformed JSON: {e}")),
            ),
        }
    }

    fn try_dispatch(&self, message: &Value) -> VfsResult<Value> {
        let message_type = message
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| VfsError::InvalidArgument("missing message type".to_string()))?;

        let route = route_for_type(message_type).ok_or_else(|| {
            VfsError::NotFound(format!("no route for message type {message_type:?}"))
        })?;

        route.schema.validate(message)?;
        let resolved = run_chain(route.chain, &self.manager, message)?;
        (route.controller)(&self.manager, &resolved, message)
    }
}

/// Background reader: polls the inbound bus with one dispatch in flight,
/// writes envelopes to the outbound bus, idles at 1 ms and exits when the
/// running flag clears. The owner joins the thread on teardown.
pub struct BusReader {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BusReader {
    pub fn spawn(
        dispatcher: Arc<MessageDispatcher>,
        inbound: Arc<dyn MessageBus>,
        outbound: Arc<dyn MessageBus>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = std::thread::Builder::new()
            .name("bus-reader".to_string())
            .spawn(move || {
                info!("bus reader started");
                while flag.load(Ordering::Relaxed) {
                    match inbound.try_recv() {
                        Some(payload) => {
                            let response = dispatcher.dispatch_bytes(&payload);
                            match serde_json::to_vec(&response) {
                                Ok(bytes) => {
                                    if let Err(e) = outbound.send(bytes) {
                                        warn!(error = %e, "failed to send response envelope");
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to serialise envelope"),
                            }
                        }
                        None => std::thread::sleep(Duration::from_millis(1)),
                    }
                }
                info!("bus reader stopped");
            })
            .expect("failed to spawn bus reader thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BusReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::{HashEmbedder, SharedEmbedder};
    use crate::ipc::InProcessBus;
    use serde_json::json;
    use tempfile::TempDir;

    fn dispatcher() -> (Arc<MessageDispatcher>, Arc<ContainerManager>, TempDir) {
        let embedder: SharedEmbedder = Arc::new(HashEmbedder::new(32).unwrap());
        let manager = Arc::new(ContainerManager::new(embedder, false));
        let dir = TempDir::new().unwrap();
        (Arc::new(MessageDispatcher::new(manager.clone())), manager, dir)
    }

    fn create_message(dir: &TempDir) -> Value {
        json!({
            "type": "container_create",
            "request_id": "req-1",
            "container_id": "c1",
            "user_id": "alice",
            "data_path": dir.path().to_string_lossy(),
        })
    }

    #[test]
    fn create_then_file_then_search_flow() {
        let (dispatcher, _manager, dir) = dispatcher();

        let created = dispatcher.dispatch(&create_message(&dir));
        assert!(created.success, "create failed: {:?}", created.error);

        let wrote = dispatcher.dispatch(&json!({
            "type": "file_create",
            "request_id": "req-2",
            "container_id": "c1",
            "user_id": "alice",
            "path": "/readme.md",
            "content": "project documentation and release notes",
        }));
        assert!(wrote.success);

        let found = dispatcher.dispatch(&json!({
            "type": "semantic_search_in_container",
            "request_id": "req-3",
            "container_id": "c1",
            "user_id": "alice",
            "query": "documentation",
            "limit": 1u64,
        }));
        assert!(found.success);
        let results = found.data.unwrap()["results"].as_array().unwrap().clone();
        assert_eq!(results[0]["path"], "/readme.md");
    }

    #[test]
    fn ownership_denial_does_not_mutate() {
        let (dispatcher, manager, dir) = dispatcher();
        dispatcher.dispatch(&create_message(&dir));
        dispatcher.dispatch(&json!({
            "type": "file_create",
            "request_id": "req-2",
            "container_id": "c1",
            "user_id": "alice",
            "path": "/readme.md",
            "content": "notes",
        }));

        let denied = dispatcher.dispatch(&json!({
            "type": "file_create",
            "request_id": "req-3",
            "container_id": "c1",
            "user_id": "mallory",
            "path": "/x",
            "content": "hi",
        }));
        assert!(!denied.success);
        assert_eq!(denied.error.as_deref(), Some("PermissionDenied"));
        assert_eq!(denied.request_id, "req-3");

        // The container still holds exactly one file.
        let container = manager.get("c1").unwrap();
        assert_eq!(container.search().read().file_count(), 1);
        assert!(!container.file_exists("/x"));
    }

    #[test]
    fn unknown_message_type_is_not_found() {
        let (dispatcher, _manager, _dir) = dispatcher();
        let response = dispatcher.dispatch(&json!({
            "type": "warp_core_eject",
            "request_id": "req-9",
        }));
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("NotFound"));
    }

    #[test]
    fn malformed_json_still_gets_an_envelope() {
        let (dispatcher, _manager, _dir) = dispatcher();
        let response = dispatcher.dispatch_bytes(b"{not json");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("InvalidArgument"));
    }

    #[test]
    fn schema_violation_is_reported_before_resolvers() {
        let (dispatcher, _manager, _dir) = dispatcher();
        let response = dispatcher.dispatch(&json!({
            "type": "file_create",
            "request_id": "req-4",
            "container_id": "c1",
            "user_id": "alice",
            // path and content missing
        }));
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("InvalidArgument"));
    }

    #[test]
    fn duplicate_create_is_already_exists() {
        let (dispatcher, _manager, dir) = dispatcher();
        assert!(dispatcher.dispatch(&create_message(&dir)).success);
        let duplicate = dispatcher.dispatch(&create_message(&dir));
        assert!(!duplicate.success);
        assert_eq!(duplicate.error.as_deref(), Some("AlreadyExists"));
    }

    #[test]
    fn route_table_is_addressable_by_verb_and_path() {
        assert!(route_for(Verb::Post, "container/create").is_some());
        assert!(route_for(Verb::Delete, "file/delete").is_some());
        assert!(route_for(Verb::Get, "file/delete").is_none());
    }

    #[test]
    fn reader_loop_round_trips_envelopes() {
        let (dispatcher, _manager, dir) = dispatcher();
        let inbound = InProcessBus::new(16);
        let outbound = InProcessBus::new(16);
        inbound.subscribe();
        outbound.subscribe();

        let mut reader = BusReader::spawn(dispatcher, inbound.clone(), outbound.clone());

        let message = serde_json::to_vec(&create_message(&dir)).unwrap();
        inbound.send(message).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let response = loop {
            if let Some(bytes) = outbound.try_recv() {
                break bytes;
            }
            assert!(std::time::Instant::now() < deadline, "no response in time");
            std::thread::sleep(Duration::from_millis(5));
        };

        let envelope: ResponseEnvelope = serde_json::from_slice(&response).unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.request_id, "req-1");

        reader.stop();
    }
}
