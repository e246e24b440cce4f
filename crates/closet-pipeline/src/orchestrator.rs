//! Job entry points: upload + job creation, submission, and the
//! orchestrator tasks that expand a job into its stage graph.

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::context::StageContext;
use crate::graph::{self, MARK_JOB_FAILED, ORCHESTRATE_INDEXING, ORCHESTRATE_QUERYING};
use closet_core::{Error, Result};
use closet_infer::sniff_image;
use closet_queue::{Signature, TaskCall, TaskQueue};
use closet_store::{CatalogStore, Job, JobStatus, JobType, NewImage, ObjectStore};

fn load_job(ctx: &StageContext, job_id: Uuid, expected: JobType) -> Result<Job> {
    let job = ctx
        .store
        .get_job(job_id)?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
    if job.job_type != expected {
        return Err(Error::Validation(format!(
            "job {} is a {} job, not {}",
            job_id, job.job_type, expected
        )));
    }
    Ok(job)
}

/// A graph is only built for a job that has not progressed past `Started`.
/// Later states mean an earlier delivery already committed its graph.
/// `Started` alone is not proof of that: the status write and the graph
/// commit land in different databases. Duplicate graphs for a started job
/// are kept out by [`submit_job`] instead.
fn needs_graph(job: &Job) -> bool {
    matches!(job.status, JobStatus::Queued | JobStatus::Started)
}

/// Expand an indexing job. Returns `None` when the job is already running.
pub fn orchestrate_indexing(ctx: &StageContext, job_id: Uuid) -> Result<Option<Signature>> {
    let job = load_job(ctx, job_id, JobType::Indexing)?;
    let product_id = job
        .input_product_id
        .ok_or_else(|| Error::Validation(format!("indexing job {} has no product", job_id)))?;
    if !needs_graph(&job) {
        info!("Job {} is already {}, not orchestrating again", job_id, job.status);
        return Ok(None);
    }

    ctx.progress(job_id, JobStatus::Started, "Job started")?;
    info!("Job {}: orchestrating indexing of image {}", job_id, job.input_image_id);
    Ok(Some(graph::indexing_graph(
        job_id,
        job.input_image_id,
        product_id,
        &ctx.settings.collection,
    )))
}

/// Expand a querying job. Returns `None` when the job is already running.
pub fn orchestrate_querying(ctx: &StageContext, job_id: Uuid) -> Result<Option<Signature>> {
    let job = load_job(ctx, job_id, JobType::Querying)?;
    if !needs_graph(&job) {
        info!("Job {} is already {}, not orchestrating again", job_id, job.status);
        return Ok(None);
    }

    ctx.progress(job_id, JobStatus::Started, "Job started")?;
    let query_result = ctx
        .store
        .get_or_create_query_result(job_id, &ctx.settings.model_version)?;
    info!("Job {}: orchestrating query of image {}", job_id, job.input_image_id);
    Ok(Some(graph::querying_graph(
        job_id,
        job.input_image_id,
        query_result.id,
        &ctx.settings.collection,
    )))
}

fn failure_link(job_id: Uuid) -> TaskCall {
    TaskCall::new(MARK_JOB_FAILED, json!({ "job_id": job_id }))
}

/// A job is submitted at most once; later submissions are no-ops.
fn submit_job(queue: &TaskQueue, entry: &str, job_id: Uuid) -> Result<()> {
    let scheduled = queue.submit_once(
        &format!("job:{}", job_id),
        &Signature::task(entry, json!({ "job_id": job_id })),
        Some(failure_link(job_id)),
    )?;
    if scheduled {
        info!("Submitted job {} to {}", job_id, entry);
    } else {
        info!("Job {} was already submitted", job_id);
    }
    Ok(())
}

/// Enqueue an indexing job. Any permanent failure marks it failed.
pub fn submit_indexing(queue: &TaskQueue, job_id: Uuid) -> Result<()> {
    submit_job(queue, ORCHESTRATE_INDEXING, job_id)
}

/// Enqueue a querying job. Any permanent failure marks it failed.
pub fn submit_querying(queue: &TaskQueue, job_id: Uuid) -> Result<()> {
    submit_job(queue, ORCHESTRATE_QUERYING, job_id)
}

/// Keep the last path component and only filename-safe characters.
fn clean_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

async fn store_upload(
    store: &CatalogStore,
    objects: &dyn ObjectStore,
    bucket: &str,
    bytes: Vec<u8>,
    filename: &str,
) -> Result<Uuid> {
    if bytes.is_empty() {
        return Err(Error::Validation("uploaded image is empty".into()));
    }
    let info = sniff_image(&bytes);
    let filename = clean_filename(filename);
    let key = format!("uploads/{}/{}", Uuid::new_v4(), filename);
    objects.put(bucket, &key, bytes).await?;
    let image = store.add_image(NewImage {
        bucket: bucket.to_string(),
        path: key,
        filename,
        width: info.map(|i| i.width),
        height: info.map(|i| i.height),
        format: info.map(|i| i.format_name().to_string()),
    })?;
    Ok(image.id)
}

/// Store an uploaded product photo and create its indexing job.
pub async fn create_indexing_job(
    store: &CatalogStore,
    objects: &dyn ObjectStore,
    bucket: &str,
    bytes: Vec<u8>,
    filename: &str,
    product_id: Uuid,
) -> Result<Job> {
    if store.get_product(product_id)?.is_none() {
        return Err(Error::NotFound(format!("product {}", product_id)));
    }
    let image_id = store_upload(store, objects, bucket, bytes, filename).await?;
    store.create_job(JobType::Indexing, image_id, Some(product_id))
}

/// Store an uploaded outfit photo and create its querying job.
pub async fn create_querying_job(
    store: &CatalogStore,
    objects: &dyn ObjectStore,
    bucket: &str,
    bytes: Vec<u8>,
    filename: &str,
) -> Result<Job> {
    let image_id = store_upload(store, objects, bucket, bytes, filename).await?;
    store.create_job(JobType::Querying, image_id, None)
}
