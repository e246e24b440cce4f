//! Wiring: stores, queue and ML client built from configuration.

use std::sync::Arc;
use std::time::Duration;

use closet_core::ClosetConfig;
use closet_infer::MlServiceClient;
use closet_pipeline::{register_stages, StageContext};
use closet_queue::{TaskQueue, TaskRegistry, Worker};
use closet_store::{CatalogStore, FsObjectStore, SqliteVectorStore};
use tracing::info;

pub struct App {
    pub config: ClosetConfig,
    pub store: Arc<CatalogStore>,
    pub objects: Arc<FsObjectStore>,
    pub queue: Arc<TaskQueue>,
}

impl App {
    pub fn open(config: ClosetConfig) -> anyhow::Result<Self> {
        let store = Arc::new(CatalogStore::open(&config.data_paths.db)?);
        let objects = Arc::new(FsObjectStore::new(&config.data_paths.objects));
        let queue = Arc::new(TaskQueue::open(&config.data_paths.db, config.queue.clone())?);
        Ok(Self {
            config,
            store,
            objects,
            queue,
        })
    }

    /// Build a worker with every pipeline stage registered.
    pub fn worker(&self) -> anyhow::Result<Worker> {
        let vectors = Arc::new(SqliteVectorStore::open(&self.config.data_paths.db)?);
        let client = Arc::new(MlServiceClient::new(
            &self.config.ml_service_url,
            Duration::from_secs(self.config.http_timeout_secs),
        )?);
        info!("Using ML service at {}", self.config.ml_service_url);

        let ctx = Arc::new(StageContext {
            store: self.store.clone(),
            vectors,
            objects: self.objects.clone(),
            detector: client.clone(),
            labeler: client.clone(),
            matcher: client,
            settings: self.config.pipeline.clone(),
        });
        let mut registry = TaskRegistry::new();
        register_stages(&mut registry, ctx);
        Ok(Worker::new(self.queue.clone(), Arc::new(registry)))
    }
}
