//! PlateClient - ALPR Service Adapter
//!
//! ## Responsibilities
//!
//! - POST one JPEG (multipart field `upload`) to the recognition service
//! - Bounded request timeout
//! - Map any failure to "no plate"; errors are logged, never raised

use crate::error::{Error, Result};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Recognition service response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlateResponse {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

/// Single prediction; other fields from the service are ignored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub plate: Option<String>,
}

impl PlateResponse {
    /// Plate of the first prediction, if it carries a non-empty one
    pub fn first_plate(&self) -> Option<&str> {
        self.predictions
            .first()
            .and_then(|p| p.plate.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// Turns an image into a plate string (empty = nothing recognized)
pub trait PlateRecognizer: Send + Sync + 'static {
    fn recognize(&self, jpeg: Bytes) -> impl Future<Output = String> + Send;
}

/// HTTP ALPR client
pub struct AlprClient {
    client: reqwest::Client,
    url: String,
}

impl AlprClient {
    /// Create new ALPR client with a request timeout
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    /// Send one image and return the first predicted plate
    pub async fn detect(&self, jpeg: Bytes) -> Result<Option<String>> {
        let form = Form::new().part(
            "upload",
            Part::bytes(jpeg.to_vec())
                .file_name("plate.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self.client.post(&self.url).multipart(form).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Internal(format!("ALPR request failed: {} - {}", status, body)));
        }

        let result: PlateResponse = resp.json().await?;
        Ok(result.first_plate().map(str::to_string))
    }
}

impl PlateRecognizer for AlprClient {
    async fn recognize(&self, jpeg: Bytes) -> String {
        match self.detect(jpeg).await {
            Ok(Some(plate)) => plate,
            Ok(None) => {
                tracing::debug!("No plate detected");
                String::new()
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Plate recognition failed");
                String::new()
            }
        }
    }
}
