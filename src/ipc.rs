//! IPC payloads and the message-bus seam.
//!
//! The bus itself is an external collaborator consumed as a bidirectional
//! byte stream; [`InProcessBus`] is the in-process implementation used by
//! the binary's stdio loop and by tests. File payloads travel as
//! length-prefixed JSON with explicit optionality.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{VfsError, VfsResult};

/// File payload published by the pipeline and consumed by IPC subscribers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    /// Unique id of this wire record, for correlation and dedup on the
    /// consuming side.
    #[serde(default)]
    pub record_id: String,
    pub container_id: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    /// Content after the compression stage, in the block wire format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sq_codes: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pq_codes: Option<Vec<u8>>,
    #[serde(default)]
    pub embedding_fresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

impl FileRecord {
    pub fn new(container_id: &str, path: &str, content: &[u8]) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.to_string(),
            path: path.to_string(),
            content: Some(content.to_vec()),
            modified_at: Some(chrono::Utc::now().timestamp()),
            ..Default::default()
        }
    }
}

/// Frame a record as `u32-le length || JSON`.
pub fn encode_frame(record: &FileRecord) -> VfsResult<Vec<u8>> {
    let body = serde_json::to_vec(record)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame, returning the record and the bytes consumed.
pub fn decode_frame(data: &[u8]) -> VfsResult<(FileRecord, usize)> {
    if data.len() < 4 {
        return Err(VfsError::Corruption("frame header truncated".to_string()));
    }
    let len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    if data.len() < 4 + len {
        return Err(VfsError::Corruption(format!(
            "frame body truncated: need {len}, have {}",
            data.len() - 4
        )));
    }
    let record = serde_json::from_slice(&data[4..4 + len])?;
    Ok((record, 4 + len))
}

/// Bidirectional byte-payload bus, consumed by contract.
pub trait MessageBus: Send + Sync {
    /// Non-blocking send. `Transient` means nobody is listening or the
    /// queue is full; the caller decides whether to retry.
    fn send(&self, payload: Vec<u8>) -> VfsResult<()>;
    /// Non-blocking receive.
    fn try_recv(&self) -> Option<Vec<u8>>;
}

/// In-process bounded queue standing in for the external bus.
pub struct InProcessBus {
    queue: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    subscribers: AtomicUsize,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            subscribers: AtomicUsize::new(0),
        })
    }

    /// Register a consumer. Sends fail `Transient` until at least one
    /// subscriber is connected, mirroring the external bus behaviour.
    pub fn subscribe(&self) {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unsubscribe(&self) {
        self.subscribers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl MessageBus for InProcessBus {
    fn send(&self, payload: Vec<u8>) -> VfsResult<()> {
        if self.subscribers.load(Ordering::SeqCst) == 0 {
            return Err(VfsError::Transient("no subscribers connected".to_string()));
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(VfsError::ResourceExhausted("message queue full".to_string()));
        }
        queue.push_back(payload);
        Ok(())
    }

    fn try_recv(&self) -> Option<Vec<u8>> {
        self.queue.lock().pop_front()
    }
}

/// Publisher with a bounded retry loop. Retries only `Transient` failures;
/// exhaustion surfaces the last error so the pipeline can decide that the
/// job still succeeded.
pub struct BusPublisher {
    bus: Arc<dyn MessageBus>,
    retries: u32,
    retry_delay: Duration,
}

impl BusPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, retries: u32, retry_delay: Duration) -> Self {
        Self {
            bus,
            retries,
            retry_delay,
        }
    }

    pub fn publish(&self, record: &FileRecord) -> VfsResult<()> {
        let frame = encode_frame(record)?;

        let mut attempt = 0;
        loop {
            match self.bus.send(frame.clone()) {
                Ok(()) => {
                    debug!(path = %record.path, bytes = frame.len(), "record published");
                    return Ok(());
                }
                Err(VfsError::Transient(reason)) => {
                    attempt += 1;
                    if attempt >= self.retries {
                        warn!(path = %record.path, attempts = attempt, %reason, "publish gave up");
                        return Err(VfsError::Transient(reason));
                    }
                    std::thread::sleep(self.retry_delay);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Background consumer of published file records: decodes frames and
/// hydrates the owning container's search engine. The counterpart of the
/// pipeline's publish stage.
pub struct BusSubscriber {
    running: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl BusSubscriber {
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        manager: Arc<crate::manager::ContainerManager>,
    ) -> Self {
        use std::sync::atomic::Ordering;

        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = running.clone();

        let handle = std::thread::Builder::new()
            .name("ipc-subscriber".to_string())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    let Some(frame) = bus.try_recv() else {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    };
                    match decode_frame(&frame) {
                        Ok((record, _)) => match manager.get(&record.container_id) {
                            Ok(container) => {
                                if let Err(e) = container.search().write().apply_record(&record) {
                                    warn!(path = %record.path, error = %e, "failed to hydrate record");
                                }
                            }
                            Err(e) => {
                                warn!(container = %record.container_id, error = %e, "record for unknown container dropped");
                            }
                        },
                        Err(e) => warn!(error = %e, "undecodable frame dropped"),
                    }
                }
            })
            .expect("failed to spawn ipc subscriber thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BusSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}
