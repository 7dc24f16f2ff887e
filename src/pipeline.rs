//! Typed processing chain for new and changed files.
//!
//! Stages share the [`FileRecord`] carrier and are wired with one-slot
//! channels: a stage posts its successor instead of calling it, so no
//! handler ever re-enters another under a lock, and nothing holds a lock
//! across embedding inference. The standard chain is
//! Embed -> Quantize -> Compress -> Publish.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::compress::compress_bytes;
use crate::embedder::SharedEmbedder;
use crate::error::{VfsError, VfsResult};
use crate::ipc::{BusPublisher, FileRecord};
use crate::quantizer::{ProductQuantizer, ScalarQuantizer};

/// One stage of the chain. Input and output are the shared carrier type,
/// so a mismatched handler cannot be wired in at compile time.
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn handle(&self, record: FileRecord) -> VfsResult<FileRecord>;
    /// Serialisation point invoked after the stage emits, before the
    /// successor is notified.
    fn settle(&self) {}
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The provided chain: Embed -> Quantize -> Compress -> Publish.
    pub fn standard(embedder: SharedEmbedder, publisher: BusPublisher) -> Self {
        Self::with_pq_shape(embedder, publisher, 8, 256)
    }

    pub fn with_pq_shape(
        embedder: SharedEmbedder,
        publisher: BusPublisher,
        subspaces: usize,
        centroids: usize,
    ) -> Self {
        let mut pipeline = Self::new();
        pipeline.push(Arc::new(EmbedStage { embedder }));
        pipeline.push(Arc::new(QuantizeStage::new(subspaces, centroids)));
        pipeline.push(Arc::new(CompressStage));
        pipeline.push(Arc::new(PublishStage { publisher }));
        pipeline
    }

    /// Thread one carrier through every stage. Each stage runs on the
    /// blocking pool, hands its output to the successor over a one-slot
    /// channel, and all wiring is torn down before this call returns. An
    /// empty pipeline is identity. A `Transient` stage failure is retried
    /// once and then waved through with the stage's input carrier; any
    /// other failure drops the carrier and surfaces here.
    pub async fn process(&self, record: FileRecord) -> VfsResult<FileRecord> {
        if self.stages.is_empty() {
            return Ok(record);
        }

        let (entry_tx, mut rx) = mpsc::channel::<VfsResult<FileRecord>>(1);
        let mut workers = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let (next_tx, next_rx) = mpsc::channel::<VfsResult<FileRecord>>(1);
            let stage = stage.clone();
            let mut stage_rx = std::mem::replace(&mut rx, next_rx);

            workers.push(tokio::spawn(async move {
                let Some(input) = stage_rx.recv().await else {
                    return;
                };
                let output = match input {
                    Ok(carrier) => run_stage(stage, carrier).await,
                    Err(e) => Err(e),
                };
                let _ = next_tx.send(output).await;
            }));
        }

        entry_tx
            .send(Ok(record))
            .await
            .map_err(|_| VfsError::Internal("pipeline entry channel closed".to_string()))?;
        drop(entry_tx);

        let result = rx
            .recv()
            .await
            .unwrap_or_else(|| Err(VfsError::Internal("pipeline exit channel closed".to_string())));

        // Deterministic cleanup: every worker has either finished or is
        // unreachable once the exit value arrived; join them all.
        for worker in workers {
            let _ = worker.await;
        }

        result
    }
}

async fn run_stage(stage: Arc<dyn PipelineStage>, carrier: FileRecord) -> VfsResult<FileRecord> {
    let attempt = {
        let stage = stage.clone();
        let input = carrier.clone();
        tokio::task::spawn_blocking(move || stage.handle(input))
            .await
            .map_err(|e| VfsError::Internal(format!("pipeline stage panicked: {e}")))?
    };

    let output = match attempt {
        Err(VfsError::Transient(reason)) => {
            debug!(stage = stage.name(), %reason, "transient stage failure, retrying once");
            let retry = {
                let stage = stage.clone();
                let input = carrier.clone();
                tokio::task::spawn_blocking(move || stage.handle(input))
                    .await
                    .map_err(|e| VfsError::Internal(format!("pipeline stage panicked: {e}")))?
            };
            match retry {
                Ok(out) => Ok(out),
                Err(VfsError::Transient(reason)) => {
                    warn!(stage = stage.name(), %reason, "transient failure persists, continuing with original carrier");
                    Ok(carrier)
                }
                Err(other) => Err(other),
            }
        }
        other => other,
    };

    stage.settle();
    output
}

/// Embeds the lowercased content and marks the record fresh.
pub struct EmbedStage {
    pub embedder: SharedEmbedder,
}

impl PipelineStage for EmbedStage {
    fn name(&self) -> &'static str {
        "embed"
    }

    fn handle(&self, mut record: FileRecord) -> VfsResult<FileRecord> {
        let Some(content) = record.content.as_ref() else {
            return Ok(record);
        };
        if content.is_empty() {
            return Ok(record);
        }
        let text = String::from_utf8_lossy(content).to_lowercase();
        record.embedding = Some(self.embedder.embed(&text));
        record.embedding_fresh = true;
        Ok(record)
    }
}

/// Attaches quantizer codes. The quantizers train themselves once enough
/// embeddings have flowed through; records seen before that pass through
/// without codes.
pub struct QuantizeStage {
    sq: Mutex<ScalarQuantizer>,
    pq: Mutex<ProductQuantizer>,
    samples: Mutex<Vec<Vec<f32>>>,
    min_training_samples: usize,
}

impl QuantizeStage {
    pub fn new(subspaces: usize, centroids: usize) -> Self {
        // Clamp to one-byte code space so a bad config cannot poison the
        // whole chain.
        let subspaces = subspaces.max(1);
        let centroids = centroids.clamp(1, 256);
        Self {
            sq: Mutex::new(ScalarQuantizer::new()),
            pq: Mutex::new(
                ProductQuantizer::new(subspaces, centroids).expect("clamped PQ shape is valid"),
            ),
            samples: Mutex::new(Vec::new()),
            min_training_samples: 16,
        }
    }
}

impl PipelineStage for QuantizeStage {
    fn name(&self) -> &'static str {
        "quantize"
    }

    fn handle(&self, mut record: FileRecord) -> VfsResult<FileRecord> {
        let Some(embedding) = record.embedding.clone() else {
            return Ok(record);
        };
        let dim = embedding.len();

        {
            let mut samples = self.samples.lock();
            samples.push(embedding.clone());
            let enough = samples.len() >= self.min_training_samples;
            if enough {
                let mut sq = self.sq.lock();
                if !sq.is_trained() {
                    sq.train(&samples, dim)?;
                }
                let mut pq = self.pq.lock();
                if !pq.is_trained() && dim % pq.code_len() == 0 {
                    pq.train(&samples, dim)?;
                }
            }
        }

        let sq = self.sq.lock();
        if sq.is_trained() {
            record.sq_codes = sq.quantize(&embedding).ok();
        }
        let pq = self.pq.lock();
        if pq.is_trained() {
            record.pq_codes = pq.encode(&embedding).ok();
        }
        Ok(record)
    }
}

/// Replaces raw content with the block-compressed wire form.
pub struct CompressStage;

impl PipelineStage for CompressStage {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn handle(&self, mut record: FileRecord) -> VfsResult<FileRecord> {
        if let Some(content) = record.content.take() {
            record.compressed = Some(compress_bytes(&content)?);
        }
        Ok(record)
    }
}

/// Hands the finished record to the bus.
pub struct PublishStage {
    pub publisher: BusPublisher,
}

impl PipelineStage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn handle(&self, record: FileRecord) -> VfsResult<FileRecord> {
        self.publisher.publish(&record)?;
        Ok(record)
    }
}
