use anyhow::Context;
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

pub mod distribution;
pub mod generation;
pub mod offline_queue;
pub mod progress_store;
pub mod queue_sync_worker;
pub mod scheduler;
pub mod scoring;
pub mod session_service;
pub mod srs;
pub mod streak;

use generation::{GenerationPipeline, HttpCompletionBackend, ModelValidator, StructuredClient};
use offline_queue::{OfflineQueue, RedisQueueStorage};
use progress_store::{MongoProgressStore, ProgressStore};
use queue_sync_worker::QueueSyncWorker;
use scheduler::RateLimitScheduler;
use session_service::SessionOrchestrator;

/// Process-wide connections and the engine components shared across them.
pub struct AppState {
    pub config: Config,
    pub mongo: Database,
    pub redis: ConnectionManager,
    pub store: Arc<dyn ProgressStore>,
    pub queue: Arc<OfflineQueue>,
    pub scheduler: Arc<RateLimitScheduler>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        let mut conn = redis.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let store: Arc<dyn ProgressStore> = Arc::new(MongoProgressStore::new(mongo.clone()));
        let queue_storage = Arc::new(RedisQueueStorage::new(redis.clone(), &config.queue));
        let queue = Arc::new(
            OfflineQueue::load(queue_storage, config.queue.clone())
                .await
                .context("Failed to load offline queue")?,
        );
        let scheduler = Arc::new(RateLimitScheduler::new(config.scheduler.clone()));

        Ok(Self {
            config,
            mongo,
            redis,
            store,
            queue,
            scheduler,
        })
    }

    /// Session orchestrator talking to the configured generation service.
    pub fn orchestrator(&self) -> anyhow::Result<SessionOrchestrator> {
        let backend = HttpCompletionBackend::new(&self.config.generation)
            .context("Failed to build generation client")?;
        let client = Arc::new(StructuredClient::new(
            self.scheduler.clone(),
            Arc::new(backend),
            self.config.generation.clone(),
        ));
        let validator = Arc::new(ModelValidator::new(client.clone()));
        let pipeline = Arc::new(GenerationPipeline::new(client, validator, self.store.clone()));

        Ok(SessionOrchestrator::new(
            self.store.clone(),
            pipeline,
            self.queue.clone(),
            self.config.exam.clone(),
        ))
    }

    pub fn queue_sync_worker(&self) -> QueueSyncWorker {
        QueueSyncWorker::new(
            self.queue.clone(),
            self.store.clone(),
            Duration::from_secs(self.config.queue.sync_interval_secs),
        )
    }
}
