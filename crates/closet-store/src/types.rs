//! Data types for products, images, jobs and results.

use std::fmt;
use std::str::FromStr;

use closet_core::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline flavour a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Indexing,
    Querying,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indexing => "indexing",
            Self::Querying => "querying",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexing" => Ok(Self::Indexing),
            "querying" | "query" => Ok(Self::Querying),
            other => Err(Error::Validation(format!("unknown job type '{}'", other))),
        }
    }
}

/// Job lifecycle state.
///
/// `Completed` and `Failed` are terminal. `Storing` belongs to indexing jobs
/// and `Querying` to querying jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Started,
    Detecting,
    Labelling,
    Storing,
    Querying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Detecting => "detecting",
            Self::Labelling => "labelling",
            Self::Storing => "storing",
            Self::Querying => "querying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn stage_rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Started => 1,
            Self::Detecting => 2,
            Self::Labelling => 3,
            Self::Storing | Self::Querying => 4,
            Self::Completed => 5,
            Self::Failed => 6,
        }
    }

    /// Whether a job in `self` may be moved to `next`.
    ///
    /// Same-state writes are allowed so stages can refresh their progress
    /// message; otherwise the status only moves forward, or to `Failed`.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed || next == *self {
            return true;
        }
        if matches!(
            (self, next),
            (Self::Storing, Self::Querying) | (Self::Querying, Self::Storing)
        ) {
            return false;
        }
        next.stage_rank() > self.stage_rank()
    }

    /// Whether this status can ever be held by a job of the given type.
    pub fn allowed_for(&self, job_type: JobType) -> bool {
        match self {
            Self::Storing => job_type == JobType::Indexing,
            Self::Querying => job_type == JobType::Querying,
            _ => true,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "started" => Self::Started,
            "detecting" => Self::Detecting,
            "labelling" => Self::Labelling,
            "storing" => Self::Storing,
            "querying" => Self::Querying,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => return Err(Error::Validation(format!("unknown job status '{}'", other))),
        })
    }
}

/// Outcome of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// The job was terminal or the write would have moved it backwards.
    Ignored,
}

/// A job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub input_image_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_product_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_details: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Filters for listing jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Normalized description of a clothing item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredLabel {
    pub category: String,
    pub color: String,
    pub style: String,
    pub pattern: String,
}

impl StructuredLabel {
    /// Sentence form used for text matching, e.g. "a blue plain casual jeans".
    pub fn description(&self) -> String {
        format!(
            "a {} {} {} {}",
            self.color, self.pattern, self.style, self.category
        )
    }
}

/// An image row: an upload, or a crop of one when `original_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub bucket: String,
    pub path: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<StructuredLabel>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_index: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Image {
    pub fn is_crop(&self) -> bool {
        self.original_id.is_some()
    }
}

/// Fields for a new image row (an upload or one crop).
#[derive(Debug, Clone, Default)]
pub struct NewImage {
    pub bucket: String,
    /// Object key inside the bucket.
    pub path: String,
    pub filename: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
}

/// A catalog product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewProduct {
    pub sku: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
}

/// Link between a product and one of its images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductImage {
    pub product_id: Uuid,
    pub image_id: Uuid,
    pub is_primary: bool,
}

/// Outcome record of a successful indexing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub selected_crop_id: Uuid,
    pub created_crop_ids: Vec<Uuid>,
    pub model_version: String,
    pub created_at: i64,
}

/// Parent record of a querying job's matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub model_version: String,
    pub created_at: i64,
}

/// Matches recorded for one queried crop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultCloth {
    pub id: Uuid,
    pub query_result_id: Uuid,
    pub crop_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<StructuredLabel>,
    pub matches: Vec<QueryResultProductImage>,
}

/// One ranked neighbor of a queried crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResultProductImage {
    pub matched_image_id: Uuid,
    pub score: f32,
    /// 1-based, dense within the parent cloth.
    pub rank: u32,
}
