//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Paths to all Closet data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Relational, vector and queue databases (`data/db/`).
    pub db: PathBuf,
    /// Object storage root, one subdirectory per bucket (`data/objects/`).
    pub objects: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            objects: root.join("objects"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.db)?;
        std::fs::create_dir_all(&self.objects)?;
        Ok(())
    }
}

/// Retry schedule for transient task failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySettings {
    /// Exponential backoff: `base * 2^attempt`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    pub chord_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_interval_ms: 500,
            visibility_timeout_secs: 300,
            chord_timeout_secs: 600,
            retry: RetrySettings::default(),
        }
    }
}

/// Settings consumed by the pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Bucket holding uploads and crops.
    pub images_bucket: String,
    /// Similarity-store collection for catalog crops.
    pub collection: String,
    /// Minimum text-match score for linking a crop to a product.
    pub match_threshold: f32,
    /// Neighbors recorded per queried crop.
    pub query_top_k: usize,
    /// Expected embedding length; 0 disables the check.
    pub embedding_dim: usize,
    pub model_version: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            images_bucket: "images".to_string(),
            collection: "images_collection".to_string(),
            match_threshold: 0.7,
            query_top_k: 3,
            embedding_dim: 0,
            model_version: "yolo8-fashionCLIP".to_string(),
        }
    }
}

/// Top-level Closet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosetConfig {
    /// Base URL of the ML inference service.
    pub ml_service_url: String,
    /// Timeout for a single inference request.
    pub http_timeout_secs: u64,
    pub data_paths: DataPaths,
    pub queue: QueueSettings,
    pub pipeline: PipelineSettings,
}

impl ClosetConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let data_paths = DataPaths::new(data_dir)?;
        let queue_defaults = QueueSettings::default();
        let pipeline_defaults = PipelineSettings::default();

        let retry = RetrySettings {
            max_retries: env_or("CLOSET_MAX_RETRIES", queue_defaults.retry.max_retries),
            base_delay_ms: env_or("CLOSET_RETRY_BASE_MS", queue_defaults.retry.base_delay_ms),
            max_delay_ms: env_or("CLOSET_RETRY_MAX_MS", queue_defaults.retry.max_delay_ms),
        };

        let queue = QueueSettings {
            worker_concurrency: env_or("CLOSET_WORKERS", queue_defaults.worker_concurrency).max(1),
            poll_interval_ms: env_or("CLOSET_POLL_MS", queue_defaults.poll_interval_ms),
            visibility_timeout_secs: env_or(
                "CLOSET_VISIBILITY_TIMEOUT_SECS",
                queue_defaults.visibility_timeout_secs,
            ),
            chord_timeout_secs: env_or("CLOSET_CHORD_TIMEOUT_SECS", queue_defaults.chord_timeout_secs),
            retry,
        };

        let pipeline = PipelineSettings {
            images_bucket: env_string("CLOSET_IMAGES_BUCKET", pipeline_defaults.images_bucket),
            collection: env_string("CLOSET_COLLECTION", pipeline_defaults.collection),
            match_threshold: env_or("CLOSET_MATCH_THRESHOLD", pipeline_defaults.match_threshold),
            query_top_k: env_or("CLOSET_QUERY_TOP_K", pipeline_defaults.query_top_k).max(1),
            embedding_dim: env_or("CLOSET_EMBEDDING_DIM", pipeline_defaults.embedding_dim),
            model_version: env_string("CLOSET_MODEL_VERSION", pipeline_defaults.model_version),
        };

        Ok(Self {
            ml_service_url: env_string("ML_SERVICE_URL", "http://localhost:8001".to_string()),
            http_timeout_secs: env_or("CLOSET_HTTP_TIMEOUT_SECS", 20),
            data_paths,
            queue,
            pipeline,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}
