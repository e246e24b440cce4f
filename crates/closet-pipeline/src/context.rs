//! Shared collaborators for pipeline stages.

use std::sync::Arc;

use closet_core::{PipelineSettings, Result};
use closet_infer::{Detector, Labeler, TextMatcher};
use closet_store::{CatalogStore, JobStatus, ObjectStore, SimilarityStore, StatusUpdate};
use tracing::debug;
use uuid::Uuid;

/// Everything a stage needs. Cloned cheaply into every task handler.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<CatalogStore>,
    pub vectors: Arc<dyn SimilarityStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub detector: Arc<dyn Detector>,
    pub labeler: Arc<dyn Labeler>,
    pub matcher: Arc<dyn TextMatcher>,
    pub settings: PipelineSettings,
}

impl StageContext {
    /// Record stage progress on the job.
    ///
    /// A write dropped because a parallel sibling already moved the job
    /// further is fine. A job that has already finished halts the stage.
    pub(crate) fn progress(&self, job_id: Uuid, status: JobStatus, message: &str) -> Result<()> {
        match self.store.update_job_status(job_id, status, message)? {
            StatusUpdate::Applied => Ok(()),
            StatusUpdate::Ignored => {
                if let Some(job) = self.store.get_job(job_id)? {
                    if job.is_terminal() {
                        return Err(closet_core::Error::Validation(format!(
                            "job {} is already {}",
                            job_id, job.status
                        )));
                    }
                }
                debug!("Job {}: kept later status over '{}'", job_id, message);
                Ok(())
            }
        }
    }
}
