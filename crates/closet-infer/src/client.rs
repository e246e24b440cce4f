//! HTTP client for the ML inference service.
//!
//! Endpoints:
//! - `POST /inference/image/crop_clothes` (multipart `img_file`) → base64 PNG crops
//! - `POST /inference/image/label` (multipart `img_file`) → label + storage vector
//! - `POST /inference/text/matching` (JSON `{candidates, target}`) → best candidate

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use crate::image_info::sniff_image;
use crate::{Detector, LabelOutput, Labeler, TextMatch, TextMatcher};
use closet_core::{Error, Result};

/// The service reports "no detections" as an error with this text.
const NO_ITEMS_MARKER: &str = "no clothing items found";

pub struct MlServiceClient {
    client: Client,
    base_url: String,
}

impl MlServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_image(&self, path: &str, image: &[u8], filename: &str) -> Result<(StatusCode, String)> {
        let mime = sniff_image(image)
            .map(|info| info.mime_type())
            .unwrap_or("application/octet-stream");
        let part = Part::bytes(image.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let form = Form::new().part("img_file", part);

        let url = self.url(path);
        debug!("POST {} ({} bytes)", url, image.len());
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Service(format!("Request to {} failed: {}", url, e)))?;
        read_response(&url, response).await
    }
}

async fn read_response(url: &str, response: reqwest::Response) -> Result<(StatusCode, String)> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Service(format!("Reading response from {} failed: {}", url, e)))?;
    Ok((status, body))
}

/// Map a non-success status to the error taxonomy.
fn status_error(url: &str, status: StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(300).collect();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::Service(format!("{} returned {}: {}", url, status, snippet))
    } else {
        Error::Validation(format!("{} rejected the request ({}): {}", url, status, snippet))
    }
}

fn parse_crops(body: &str) -> Result<Vec<Vec<u8>>> {
    let encoded: Vec<String> = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("crop list: {}", e)))?;
    encoded
        .iter()
        .enumerate()
        .map(|(i, b64)| {
            // Tolerate data URIs
            let raw = b64.split_once("base64,").map(|(_, rest)| rest).unwrap_or(b64);
            STANDARD
                .decode(raw.trim())
                .map_err(|e| Error::MalformedResponse(format!("crop {}: {}", i, e)))
        })
        .collect()
}

/// Crops from a detection response. The service reports an image without
/// clothing as an error whose body carries [`NO_ITEMS_MARKER`]; any other
/// failure status goes through [`status_error`].
fn detection_outcome(status: StatusCode, body: &str) -> Result<Vec<Vec<u8>>> {
    if status.is_success() {
        return parse_crops(body);
    }
    if body.to_lowercase().contains(NO_ITEMS_MARKER) {
        return Ok(Vec::new());
    }
    Err(status_error("crop_clothes", status, body))
}

fn parse_label(body: &str) -> Result<LabelOutput> {
    let output: LabelOutput = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("label response: {}", e)))?;
    if output.storage_vector.is_empty() {
        return Err(Error::MalformedResponse("empty storage_vector".into()));
    }
    Ok(output)
}

fn parse_match(body: &str, candidates: usize) -> Result<TextMatch> {
    let best: TextMatch = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("matching response: {}", e)))?;
    if best.index >= candidates {
        return Err(Error::MalformedResponse(format!(
            "match index {} out of range for {} candidates",
            best.index, candidates
        )));
    }
    Ok(best)
}

#[async_trait]
impl Detector for MlServiceClient {
    async fn detect(&self, image: &[u8], filename: &str) -> Result<Vec<Vec<u8>>> {
        let (status, body) = self
            .post_image("/inference/image/crop_clothes", image, filename)
            .await?;
        let crops = detection_outcome(status, &body)?;
        if crops.is_empty() {
            warn!("Detector found no items in {}", filename);
        }
        Ok(crops)
    }
}

#[async_trait]
impl Labeler for MlServiceClient {
    async fn label(&self, image: &[u8], filename: &str) -> Result<LabelOutput> {
        let (status, body) = self
            .post_image("/inference/image/label", image, filename)
            .await?;
        if !status.is_success() {
            return Err(status_error("label", status, &body));
        }
        parse_label(&body)
    }
}

#[async_trait]
impl TextMatcher for MlServiceClient {
    async fn best_match(&self, candidates: &[String], target: &str) -> Result<TextMatch> {
        if candidates.is_empty() {
            return Err(Error::Validation("no candidates to match".into()));
        }
        if target.trim().is_empty() {
            return Err(Error::Validation("empty matching target".into()));
        }
        let url = self.url("/inference/text/matching");
        let response = self
            .client
            .post(&url)
            .json(&json!({ "candidates": candidates, "target": target }))
            .send()
            .await
            .map_err(|e| Error::Service(format!("Request to {} failed: {}", url, e)))?;
        let (status, body) = read_response(&url, response).await?;
        if !status.is_success() {
            return Err(status_error("matching", status, &body));
        }
        parse_match(&body, candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crops() {
        let body = format!(
            r#"["{}", "data:image/png;base64,{}"]"#,
            STANDARD.encode([1u8, 2, 3]),
            STANDARD.encode([4u8])
        );
        let crops = parse_crops(&body).unwrap();
        assert_eq!(crops, vec![vec![1, 2, 3], vec![4]]);
        assert!(parse_crops("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_crops_malformed_is_retryable() {
        let err = parse_crops(r#"{"detail": "oops"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
        assert!(err.is_retryable());
        assert!(parse_crops(r#"["not base64 !!"]"#).is_err());
    }

    #[test]
    fn test_only_marked_errors_mean_no_items() {
        let no_items = r#"{"detail": "No clothing items found in image."}"#;
        assert!(detection_outcome(StatusCode::NOT_FOUND, no_items).unwrap().is_empty());
        assert!(detection_outcome(StatusCode::INTERNAL_SERVER_ERROR, no_items)
            .unwrap()
            .is_empty());

        // A route that does not exist is a configuration problem, not an empty image
        let err = detection_outcome(StatusCode::NOT_FOUND, r#"{"detail": "Not Found"}"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = detection_outcome(StatusCode::BAD_GATEWAY, "upstream down").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_label() {
        let body = r#"{
            "label_data": {"category": "jeans", "color": "blue", "style": "casual", "pattern": "plain"},
            "storage_vector": [0.1, 0.2, 0.3]
        }"#;
        let out = parse_label(body).unwrap();
        assert_eq!(out.label.category, "jeans");
        assert_eq!(out.storage_vector.len(), 3);

        let empty = r#"{"label_data": {"category": "a", "color": "b", "style": "c", "pattern": "d"}, "storage_vector": []}"#;
        assert!(matches!(parse_label(empty), Err(Error::MalformedResponse(_))));
    }

    #[test]
    fn test_parse_match_checks_index() {
        let body = r#"{"index": 1, "text": "a blue plain casual jeans", "score": 0.91}"#;
        let best = parse_match(body, 2).unwrap();
        assert_eq!(best.index, 1);
        assert!((best.score - 0.91).abs() < 1e-6);
        assert!(parse_match(body, 1).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error("x", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!status_error("x", StatusCode::BAD_REQUEST, "Invalid image format").is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        let client = MlServiceClient::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        let err = client.detect(&[0u8; 4], "x.png").await.unwrap_err();
        assert!(matches!(err, Error::Service(_)));
        let err = client.best_match(&[], "Blue Jeans").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
