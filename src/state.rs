//! Process-wide state, constructed once at startup and passed by reference
//! to every component.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::AppConfig;
use crate::dispatch::MessageDispatcher;
use crate::embedder::{SharedEmbedder, build_embedder};
use crate::error::VfsResult;
use crate::fs::VectorFs;
use crate::ipc::{BusPublisher, FileRecord, InProcessBus};
use crate::manager::ContainerManager;
use crate::pipeline::Pipeline;
use crate::search::SearchEngine;

pub struct AppState {
    pub config: AppConfig,
    pub embedder: SharedEmbedder,
    pub manager: Arc<ContainerManager>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub fs: Arc<VectorFs>,
    pub pipeline: Arc<Pipeline>,
    /// Outbound bus carrying published file records.
    pub publish_bus: Arc<InProcessBus>,
}

impl AppState {
    pub fn new(config: AppConfig) -> VfsResult<Self> {
        let embedder = build_embedder(config.embedding_dim)?;
        let manager = Arc::new(ContainerManager::new(
            embedder.clone(),
            config.use_quantization,
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(manager.clone()));

        let mut root_engine = SearchEngine::new(embedder.clone(), config.use_quantization);
        root_engine.set_model_refresh_interval(Duration::from_secs(config.model_refresh_secs));
        let fs = Arc::new(VectorFs::new(root_engine, manager.clone(), 0, 0));

        let publish_bus = InProcessBus::new(1024);
        let publisher = BusPublisher::new(
            publish_bus.clone(),
            config.bus_send_retries,
            Duration::from_millis(config.bus_retry_delay_ms),
        );
        let pipeline = Arc::new(Pipeline::with_pq_shape(
            embedder.clone(),
            publisher,
            config.pq_subspaces,
            config.pq_centroids,
        ));

        info!(
            dim = embedder.dim(),
            model = embedder.model_name(),
            quantized = config.use_quantization,
            "application state initialised"
        );

        Ok(Self {
            config,
            embedder,
            manager,
            dispatcher,
            fs,
            pipeline,
            publish_bus,
        })
    }

    /// Run a file through the embed/quantize/compress/publish chain.
    pub async fn publish_file(
        &self,
        container_id: &str,
        path: &str,
        content: &[u8],
    ) -> VfsResult<FileRecord> {
        if content.len() > self.config.max_file_size_bytes {
            return Err(crate::error::VfsError::ResourceExhausted(format!(
                "{path} exceeds the {} byte publish limit",
                self.config.max_file_size_bytes
            )));
        }
        let record = FileRecord::new(container_id, path, content);
        self.pipeline.process(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::decompress_bytes;
    use crate::ipc::{MessageBus, decode_frame};

    #[test]
    fn state_builds_from_default_config() {
        let state = AppState::new(AppConfig::default()).unwrap();
        assert_eq!(state.embedder.dim(), 128);
        assert_eq!(state.manager.count(), 0);
    }

    #[tokio::test]
    async fn publish_flow_round_trips_content() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.publish_bus.subscribe();

        let content = b"container payload round trip";
        let record = state.publish_file("c1", "/wire.md", content).await.unwrap();
        assert!(record.embedding_fresh);

        let frame = state.publish_bus.try_recv().unwrap();
        let (wire, _) = decode_frame(&frame).unwrap();
        let restored = decompress_bytes(wire.compressed.as_ref().unwrap()).unwrap();
        assert_eq!(restored, content);
    }
}
