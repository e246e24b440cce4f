//! Closet Pipeline — indexing and querying of clothing images.
//!
//! An uploaded image becomes a job. The orchestrator expands the job into a
//! stage graph on the task queue: detection, a fan-out over the detected
//! crops (labeling, then querying per crop for querying jobs), and a
//! converging stage that selects and stores the product crop (indexing) or
//! completes the job (querying). Any permanent failure marks the job failed.

pub mod context;
pub mod graph;
pub mod orchestrator;
pub mod stages;
pub mod tasks;

pub use context::StageContext;
pub use graph::fan_out;
pub use orchestrator::{
    create_indexing_job, create_querying_job, orchestrate_indexing, orchestrate_querying,
    submit_indexing, submit_querying,
};
pub use stages::LabeledItem;
pub use tasks::{register_stages, Stage};
