//! Pipeline stages.
//!
//! Every stage may run more than once for the same input. Each one checks
//! the natural key of what it writes before writing, so a redelivery finds
//! the earlier result instead of duplicating it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::StageContext;
use closet_core::{Error, Result};
use closet_infer::sniff_image;
use closet_store::{Image, JobStatus, NewImage, QueryResultProductImage, StructuredLabel};

/// A crop after labeling, as passed between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledItem {
    pub crop_id: Uuid,
    pub index: usize,
    pub label: StructuredLabel,
    pub vector: Vec<f32>,
}

impl LabeledItem {
    fn embedding(&self) -> Result<&[f32]> {
        if self.vector.is_empty() {
            return Err(Error::Validation(format!("crop {} has no embedding", self.crop_id)));
        }
        Ok(&self.vector)
    }
}

/// Object key of the `index`-th crop of an image.
pub fn crop_key(image_id: Uuid, index: usize) -> String {
    format!("crops/{}/{}.png", image_id, index)
}

fn load_image(ctx: &StageContext, image_id: Uuid) -> Result<Image> {
    ctx.store
        .get_image(image_id)?
        .ok_or_else(|| Error::NotFound(format!("image {}", image_id)))
}

fn load_crop(ctx: &StageContext, crop_id: Uuid) -> Result<Image> {
    let crop = load_image(ctx, crop_id)?;
    if !crop.is_crop() {
        return Err(Error::Validation(format!("image {} is not a crop", crop_id)));
    }
    Ok(crop)
}

/// Split an image into per-item crops. Returns crop ids in detection order.
pub async fn detect_items(ctx: &StageContext, job_id: Uuid, image_id: Uuid) -> Result<Vec<Uuid>> {
    ctx.progress(job_id, JobStatus::Detecting, "Detecting items in image")?;

    let existing = ctx.store.get_crops(image_id)?;
    if !existing.is_empty() {
        info!(
            "Job {}: image {} already has {} crops, skipping detection",
            job_id,
            image_id,
            existing.len()
        );
        return Ok(existing.iter().map(|c| c.id).collect());
    }

    let image = load_image(ctx, image_id)?;
    if image.is_crop() {
        return Err(Error::Validation(format!("image {} is itself a crop", image_id)));
    }
    let bytes = ctx.objects.get(&image.bucket, &image.path).await?;
    let crops = ctx.detector.detect(&bytes, &image.filename).await?;
    if crops.is_empty() {
        return Err(Error::NoItemsDetected(image_id.to_string()));
    }

    let bucket = &ctx.settings.images_bucket;
    let mut rows = Vec::with_capacity(crops.len());
    for (index, crop) in crops.into_iter().enumerate() {
        let key = crop_key(image_id, index);
        let info = sniff_image(&crop);
        ctx.objects.put(bucket, &key, crop).await?;
        rows.push(NewImage {
            bucket: bucket.clone(),
            path: key,
            filename: format!("{}.png", index),
            width: info.map(|i| i.width),
            height: info.map(|i| i.height),
            format: info.map(|i| i.format_name().to_string()),
        });
    }

    let created = ctx.store.add_crops(image_id, rows)?;
    let ids: Vec<Uuid> = created.iter().map(|c| c.id).collect();
    ctx.progress(
        job_id,
        JobStatus::Detecting,
        &format!("{} items detected", ids.len()),
    )?;
    info!("Job {}: detected {} items in image {}", job_id, ids.len(), image_id);
    Ok(ids)
}

/// Label one crop and persist its label and embedding.
pub async fn label_item(
    ctx: &StageContext,
    job_id: Uuid,
    crop_id: Uuid,
    index: usize,
    total: usize,
) -> Result<LabeledItem> {
    let position = index + 1;
    ctx.progress(
        job_id,
        JobStatus::Labelling,
        &format!("item {} of {} analyzing", position, total),
    )?;

    let crop = load_crop(ctx, crop_id)?;
    let bytes = ctx.objects.get(&crop.bucket, &crop.path).await?;
    let output = ctx.labeler.label(&bytes, &crop.filename).await?;

    if output.storage_vector.is_empty() {
        return Err(Error::MalformedResponse(format!(
            "empty embedding for crop {}",
            crop_id
        )));
    }
    let expected = ctx.settings.embedding_dim;
    if expected > 0 && output.storage_vector.len() != expected {
        return Err(Error::Validation(format!(
            "embedding for crop {} has {} dimensions, expected {}",
            crop_id,
            output.storage_vector.len(),
            expected
        )));
    }

    ctx.store
        .set_crop_label(crop_id, &output.label, &output.storage_vector)?;
    ctx.progress(
        job_id,
        JobStatus::Labelling,
        &format!("item {} of {} analyzed", position, total),
    )?;
    debug!("Job {}: crop {} labelled '{}'", job_id, crop_id, output.label.description());

    Ok(LabeledItem {
        crop_id,
        index,
        label: output.label,
        vector: output.storage_vector,
    })
}

/// Pick the item matching the product name, link it and store its vector.
pub async fn select_and_store(
    ctx: &StageContext,
    job_id: Uuid,
    product_id: Uuid,
    collection: &str,
    items: Vec<LabeledItem>,
) -> Result<LabeledItem> {
    ctx.progress(
        job_id,
        JobStatus::Storing,
        "Selecting the item that matches the product",
    )?;

    if items.is_empty() {
        return Err(Error::Validation(format!("job {} has no labeled items", job_id)));
    }
    let product = ctx
        .store
        .get_product(product_id)?
        .ok_or_else(|| Error::NotFound(format!("product {}", product_id)))?;

    let candidates: Vec<String> = items.iter().map(|i| i.label.description()).collect();
    let best = ctx.matcher.best_match(&candidates, &product.name).await?;
    let Some(chosen) = items.get(best.index).cloned() else {
        return Err(Error::MalformedResponse(format!(
            "match index {} out of range for {} items",
            best.index,
            items.len()
        )));
    };

    if best.score < ctx.settings.match_threshold {
        return Err(Error::LowConfidence {
            target: product.name,
            score: best.score,
            threshold: ctx.settings.match_threshold,
        });
    }

    let linked = ctx.store.link_product_image(product_id, chosen.crop_id, true)?;
    if !linked {
        debug!("Job {}: crop {} already linked to product", job_id, chosen.crop_id);
    }

    let crop_key = chosen.crop_id.to_string();
    if ctx.vectors.contains(collection, &crop_key)? {
        debug!("Job {}: crop {} already in {}", job_id, chosen.crop_id, collection);
    } else {
        let crop = load_crop(ctx, chosen.crop_id)?;
        let metadata = json!({
            "category": chosen.label.category,
            "color": chosen.label.color,
            "style": chosen.label.style,
            "pattern": chosen.label.pattern,
            "product_id": product_id,
            "original_id": crop.original_id,
        });
        ctx.vectors
            .upsert(collection, &crop_key, chosen.embedding()?, Some(&metadata))?;
    }

    ctx.progress(
        job_id,
        JobStatus::Storing,
        &format!("Stored item {} for product '{}'", chosen.index + 1, product.name),
    )?;
    info!(
        "Job {}: crop {} matched '{}' with score {:.3}",
        job_id, chosen.crop_id, product.name, best.score
    );
    Ok(chosen)
}

/// Look up the nearest catalog images for one crop and record them.
/// Returns the id of the recorded cloth.
pub async fn query_item(
    ctx: &StageContext,
    job_id: Uuid,
    query_result_id: Uuid,
    collection: &str,
    total: usize,
    item: LabeledItem,
) -> Result<Uuid> {
    let position = item.index + 1;
    ctx.progress(
        job_id,
        JobStatus::Querying,
        &format!("item {} of {} querying", position, total),
    )?;

    let neighbors = ctx
        .vectors
        .query(collection, item.embedding()?, ctx.settings.query_top_k)?;

    let mut matches = Vec::with_capacity(neighbors.len());
    for neighbor in neighbors {
        match Uuid::parse_str(&neighbor.id) {
            Ok(matched_image_id) => matches.push(QueryResultProductImage {
                matched_image_id,
                score: 1.0 - neighbor.distance,
                rank: matches.len() as u32 + 1,
            }),
            Err(_) => warn!("Skipping non-image id '{}' in {}", neighbor.id, collection),
        }
    }

    let (cloth_id, created) =
        ctx.store
            .record_cloth_matches(query_result_id, item.crop_id, Some(&item.label), &matches)?;
    if !created {
        debug!("Job {}: crop {} already queried", job_id, item.crop_id);
    }

    ctx.progress(
        job_id,
        JobStatus::Querying,
        &format!("item {} of {} queried", position, total),
    )?;
    Ok(cloth_id)
}

/// Record the indexing outcome and complete the job.
pub fn finalize_indexing(
    ctx: &StageContext,
    job_id: Uuid,
    created_crop_ids: &[Uuid],
    selected: LabeledItem,
) -> Result<Uuid> {
    let job = ctx
        .store
        .get_job(job_id)?
        .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
    match job.status {
        JobStatus::Failed => {
            return Err(Error::Validation(format!("job {} has already failed", job_id)));
        }
        JobStatus::Completed => {
            return match ctx.store.get_indexing_result(job_id)? {
                Some(existing) => Ok(existing.id),
                None => Err(Error::Validation(format!(
                    "job {} completed without an indexing result",
                    job_id
                ))),
            };
        }
        _ => {}
    }

    let result = ctx.store.get_or_create_indexing_result(
        job_id,
        selected.crop_id,
        created_crop_ids,
        &ctx.settings.model_version,
    )?;
    ctx.progress(
        job_id,
        JobStatus::Completed,
        &format!("Indexed item {} of {}", selected.index + 1, created_crop_ids.len()),
    )?;
    info!("Job {}: indexing completed", job_id);
    Ok(result.id)
}

/// Complete a querying job once every crop has been queried.
pub fn finalize_querying(ctx: &StageContext, job_id: Uuid, cloth_ids: &[Uuid]) -> Result<()> {
    ctx.progress(
        job_id,
        JobStatus::Completed,
        &format!("{} items matched", cloth_ids.len()),
    )?;
    info!("Job {}: querying completed with {} items", job_id, cloth_ids.len());
    Ok(())
}

/// Error link for every submitted job. Never fails for a missing or
/// finished job.
pub fn mark_job_failed(ctx: &StageContext, job_id: Uuid, message: &str) -> Result<()> {
    match ctx.store.update_job_status(job_id, JobStatus::Failed, message) {
        Ok(closet_store::StatusUpdate::Applied) => {
            warn!("Job {} failed: {}", job_id, message);
        }
        Ok(closet_store::StatusUpdate::Ignored) => {
            info!("Job {} already finished, ignoring failure: {}", job_id, message);
        }
        Err(Error::NotFound(_)) => {
            warn!("Cannot mark missing job {} as failed: {}", job_id, message);
        }
        Err(e) => return Err(e),
    }
    Ok(())
}
