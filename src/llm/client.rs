//! Salesforce Einstein Models API client.

use super::{CompletionOptions, Conversation, Generator};
use crate::util::{sanitize_error_body, truncate};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rate limit retry configuration
pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff
pub(crate) const REQUEST_TIMEOUT_SECS: u64 = 60;

const JSON_ONLY_SUFFIX: &str = "IMPORTANT: Respond with valid JSON only, no additional text.";

#[derive(Debug, Clone)]
pub struct EinsteinSettings {
    /// Base URL of the models API, e.g. `https://api.salesforce.com`
    pub api_endpoint: String,
    pub access_token: String,
    pub model_id: String,
    pub timeout: Duration,
    pub initial_backoff: Duration,
}

impl EinsteinSettings {
    pub fn new(api_endpoint: &str, access_token: &str, model_id: &str) -> Self {
        Self {
            api_endpoint: api_endpoint.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            model_id: model_id.to_string(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    fn generations_url(&self) -> String {
        format!(
            "{}/einstein/platform/v1/models/{}/generations",
            self.api_endpoint, self.model_id
        )
    }
}

#[derive(Serialize)]
struct GenerationRequest {
    prompt: String,
    #[serde(rename = "maxTokens")]
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerationResponse {
    generation: Option<Generation>,
}

#[derive(Deserialize)]
struct Generation {
    #[serde(rename = "generatedText")]
    generated_text: Option<String>,
}

/// Error envelope returned by the platform on failures
#[derive(Deserialize)]
struct PlatformError {
    #[serde(alias = "errorCode")]
    error_code: Option<String>,
    message: String,
}

/// Generator backed by the Einstein generations endpoint.
pub struct EinsteinClient {
    http: reqwest::Client,
    settings: EinsteinSettings,
}

impl EinsteinClient {
    pub fn new(settings: EinsteinSettings) -> anyhow::Result<Self> {
        let http = create_http_client(settings.timeout)?;
        Ok(Self { http, settings })
    }

    /// Send a request with automatic retry on transient failures.
    ///
    /// Handles network errors (timeout, connection failures), rate limits (429)
    /// and server errors (5xx). Returns the response body on success.
    async fn send_with_retry(&self, request_body: &GenerationRequest) -> anyhow::Result<String> {
        let url = self.settings.generations_url();
        let mut retry_count = 0;

        loop {
            let response = match self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.settings.access_token))
                .header("Content-Type", "application/json")
                .header("x-sfdc-app-context", "EinsteinGPT")
                .header("x-client-feature-id", "ai-platform-models-connected-app")
                .json(request_body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        self.backoff(retry_count).await;
                        continue;
                    }
                    return Err(map_timeout_error(err));
                }
            };

            let status = response.status();
            let text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                        retry_count += 1;
                        self.backoff(retry_count).await;
                        continue;
                    }
                    return Err(map_timeout_error(err));
                }
            };

            if status.is_success() {
                return Ok(text);
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                retry_count += 1;
                tracing::warn!(
                    status = status.as_u16(),
                    retry = retry_count,
                    "models API request failed, retrying"
                );
                self.backoff(retry_count).await;
                continue;
            }

            let error_msg = match status.as_u16() {
                401 => "Models API rejected the access token (401). Refresh SF_ACCESS_TOKEN."
                    .to_string(),
                429 => format!("Rate limited by the models API after {} retries", retry_count),
                500..=599 => format!(
                    "Models API server error ({}). The service may be temporarily unavailable.",
                    status
                ),
                _ => match serde_json::from_str::<Vec<PlatformError>>(&text)
                    .ok()
                    .and_then(|errors| errors.into_iter().next())
                    .or_else(|| serde_json::from_str::<PlatformError>(&text).ok())
                {
                    Some(err) => format!(
                        "Models API error {} ({}): {}",
                        status,
                        err.error_code.unwrap_or_default(),
                        truncate(&err.message, 200)
                    ),
                    None => format!("Models API error {}: {}", status, sanitize_error_body(&text)),
                },
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }

    async fn backoff(&self, retry_count: u32) {
        tokio::time::sleep(backoff_delay(self.settings.initial_backoff, retry_count)).await;
    }
}

#[async_trait]
impl Generator for EinsteinClient {
    async fn complete(
        &self,
        conversation: &Conversation,
        options: CompletionOptions,
    ) -> anyhow::Result<String> {
        let request = GenerationRequest {
            prompt: build_prompt(conversation),
            max_tokens: options.max_output_tokens,
            temperature: options.temperature,
        };

        let text = self.send_with_retry(&request).await?;
        let parsed: GenerationResponse = serde_json::from_str(&text).with_context(|| {
            format!(
                "Failed to parse models API response: {}",
                sanitize_error_body(&text)
            )
        })?;

        parsed
            .generation
            .and_then(|g| g.generated_text)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unexpected models API response shape (missing generation.generatedText): {}",
                    sanitize_error_body(&text)
                )
            })
    }
}

/// Flatten the conversation into a role-labelled prompt; nudge towards raw JSON
/// whenever any message asks for it.
pub(crate) fn build_prompt(conversation: &Conversation) -> String {
    let mut prompt = conversation.render_prompt();
    if conversation.mentions("JSON") {
        prompt.push_str(JSON_ONLY_SUFFIX);
    }
    prompt.trim().to_string()
}

pub(crate) fn backoff_delay(initial: Duration, retry_count: u32) -> Duration {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    initial.saturating_mul(factor as u32)
}

pub(crate) fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Create a configured HTTP client
pub(crate) fn create_http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

fn map_timeout_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::anyhow!("Models API request timed out. Please try again.")
    } else if err.is_connect() {
        anyhow::anyhow!("Could not connect to the models API. Check the endpoint and network.")
    } else {
        err.into()
    }
}
