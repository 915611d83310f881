use async_trait::async_trait;
use poml_config::ConverterConfig;
use poml_core::{FailureKind, PomlError, Result};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::wire::{GenerateContentRequest, GenerateContentResponse};

/// Why a single attempt failed. Only logged, never surfaced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("API call failed with status: {0}")]
    HttpStatus(u16),

    #[error("Invalid response from API")]
    MalformedResponse,

    #[error("Network error: {0}")]
    Network(String),
}

impl AttemptError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            AttemptError::HttpStatus(status) => Some(FailureKind::HttpError(*status)),
            AttemptError::MalformedResponse => Some(FailureKind::MalformedResponse),
            AttemptError::Network(_) => None,
        }
    }
}

/// One request/response exchange with the LLM endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> std::result::Result<String, AttemptError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: &ConverterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.client.timeout_secs))
            .build()
            .map_err(|e| PomlError::HttpError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.endpoint.generate_url(),
            api_key: config.endpoint.api_key.clone(),
        })
    }
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> std::result::Result<String, AttemptError> {
        let mut builder = self.client.post(&self.url).json(request);
        if !self.api_key.is_empty() {
            builder = builder.query(&[("key", self.api_key.as_str())]);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::HttpStatus(status.as_u16()));
        }

        let body: GenerateContentResponse = response.json().await.map_err(|e| {
            debug!("Unexpected API response structure: {}", e);
            AttemptError::MalformedResponse
        })?;

        body.document().ok_or(AttemptError::MalformedResponse)
    }
}
