use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::InputUrls;

/// Everything the provider needs to render one profile photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationRequest {
    pub job_id: i64,
    pub prompt: String,
    pub main_image: String,
    pub prop_images: Vec<String>,
}

impl GenerationRequest {
    /// Fails with [`GenerationError::MissingMainImage`] when no face photo
    /// was uploaded, so the provider is never called without one.
    pub fn new(job_id: i64, prompt: String, input_urls: &InputUrls) -> Result<Self, GenerationError> {
        let main_image = input_urls
            .main_image()
            .filter(|url| !url.trim().is_empty())
            .ok_or(GenerationError::MissingMainImage)?;

        Ok(Self {
            job_id,
            prompt,
            main_image: main_image.to_string(),
            prop_images: input_urls.prop_images().to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub output_urls: Vec<String>,
}

/// Boundary to the image generation provider.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError>;
}

/// HTTP client for the image generation provider.
pub struct GenerationClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl GenerationClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(GenerationError::Http)?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl ImageGenerator for GenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        let request_id = Uuid::new_v4();
        tracing::debug!(
            job_id = request.job_id,
            request_id = %request_id,
            prop_images = request.prop_images.len(),
            "Calling image generation provider"
        );

        let mut builder = self
            .http
            .post(&self.endpoint)
            .header("x-request-id", request_id.to_string())
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(GenerationError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let output: GenerationOutput = response.json().await.map_err(GenerationError::Http)?;
        if output.output_urls.is_empty() {
            return Err(GenerationError::EmptyOutput);
        }

        Ok(output)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("No main image to send to the provider")]
    MissingMainImage,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Provider returned no output images")]
    EmptyOutput,
}
