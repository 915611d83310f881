use async_trait::async_trait;
use poml_config::{ConverterConfig, RetryPolicy};
use poml_core::{ConversionResult, FailureKind, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod prompt;
pub mod transport;
pub mod wire;

pub use prompt::build_prompt;
pub use transport::{AttemptError, HttpTransport, LlmTransport};
pub use wire::{GenerateContentRequest, GenerateContentResponse};

/// Anything that turns free-form text into a POML document.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, input_text: &str, cancel: &CancellationToken) -> ConversionResult;
}

/// Timer used between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct ConversionClient {
    transport: Arc<dyn LlmTransport>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl ConversionClient {
    pub fn new(config: &ConverterConfig) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        info!(
            "Conversion client ready for model {} ({} attempts)",
            config.endpoint.model, config.client.retry.max_attempts
        );
        Ok(Self::with_transport(
            Arc::new(transport),
            config.client.retry.clone(),
        ))
    }

    pub fn with_transport(transport: Arc<dyn LlmTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            sleeper: Arc::new(TokioSleeper),
            policy,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the retry loop. Only the final outcome is returned; per-attempt
    /// failures are logged.
    pub async fn convert(&self, input_text: &str, cancel: &CancellationToken) -> ConversionResult {
        let request = GenerateContentRequest::from_prompt(build_prompt(input_text));
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(attempt, "Conversion cancelled");
                    return ConversionResult::Failure(FailureKind::Cancelled);
                }
                outcome = self.transport.generate(&request) => outcome,
            };

            match outcome {
                Ok(document) => {
                    debug!(attempt, chars = document.len(), "Conversion attempt succeeded");
                    return ConversionResult::Success(document);
                }
                Err(e) => {
                    warn!(attempt, max_attempts, kind = ?e.kind(), "Attempt {} failed: {}", attempt, e);
                }
            }

            if let Some(delay) = self.policy.delay_after(attempt) {
                debug!("Retrying in {} ms", delay.as_millis());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(attempt, "Conversion cancelled during backoff");
                        return ConversionResult::Failure(FailureKind::Cancelled);
                    }
                    _ = self.sleeper.sleep(delay) => {}
                }
            }
        }

        error!(
            "Failed to get a valid response from the endpoint after {} attempts",
            max_attempts
        );
        ConversionResult::Failure(FailureKind::ExhaustedRetries)
    }
}

#[async_trait]
impl Converter for ConversionClient {
    async fn convert(&self, input_text: &str, cancel: &CancellationToken) -> ConversionResult {
        ConversionClient::convert(self, input_text, cancel).await
    }
}
