//! Closet Infer — the three ML collaborators the pipeline depends on.
//!
//! `Detector` finds clothing items in an image, `Labeler` produces a
//! structured label and storage vector for one crop, and `TextMatcher` picks
//! the candidate text closest to a target. `MlServiceClient` implements all
//! three against the HTTP inference service.

pub mod client;
pub mod image_info;

pub use client::MlServiceClient;
pub use image_info::{sniff_image, ImageInfo};

use async_trait::async_trait;
use closet_core::Result;
use closet_store::StructuredLabel;
use serde::{Deserialize, Serialize};

/// Label and embedding for one crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelOutput {
    #[serde(rename = "label_data")]
    pub label: StructuredLabel,
    pub storage_vector: Vec<f32>,
}

/// Best candidate for a text-matching request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextMatch {
    pub index: usize,
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Crop every detected item, in detection order. May be empty.
    async fn detect(&self, image: &[u8], filename: &str) -> Result<Vec<Vec<u8>>>;
}

#[async_trait]
pub trait Labeler: Send + Sync {
    async fn label(&self, image: &[u8], filename: &str) -> Result<LabelOutput>;
}

#[async_trait]
pub trait TextMatcher: Send + Sync {
    /// `candidates` must be non-empty.
    async fn best_match(&self, candidates: &[String], target: &str) -> Result<TextMatch>;
}
