//! Remote vision-model transport.
//!
//! [`VisionTransport`] is the seam between the analysis client and the
//! network. The client owns retry policy; a transport only performs one
//! request and classifies what went wrong with a [`TransportError`].
//!
//! | Transport | Use |
//! |-----------|-----|
//! | [`GeminiTransport`] | `generateContent` REST call with inline JPEG parts |
//! | [`DisabledTransport`] | `analysis.provider = "disabled"`; every call is rejected |

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::AnalysisConfig;

/// One image embedded in a request.
#[derive(Debug, Clone, Serialize)]
pub struct ImagePart {
    pub file_name: String,
    pub mime_type: String,
    /// Base64 (standard alphabet) of the re-encoded image bytes.
    pub data: String,
}

/// A single multimodal request.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub model: String,
    pub images: Vec<ImagePart>,
    pub prompt: String,
    pub response_schema: serde_json::Value,
}

/// Failure of a single remote call.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Rate limited or server-side overload. Retried.
    #[error("model overloaded: {0}")]
    Overloaded(String),
    /// Call succeeded but carried no content. Retried.
    #[error("empty response from model")]
    EmptyResponse,
    /// Bad request, authentication failure, unknown model. Not retried.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Could not reach the service at all.
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("analysis provider is disabled")]
    Disabled,
}

impl TransportError {
    /// Whether the client should back off and try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Overloaded(_) | TransportError::EmptyResponse)
    }
}

/// Performs one remote call and returns the model's raw text answer.
#[async_trait]
pub trait VisionTransport: Send + Sync {
    async fn generate(&self, request: &VisionRequest) -> Result<String, TransportError>;
}

/// Rejects every call; used when no provider is configured.
pub struct DisabledTransport;

#[async_trait]
impl VisionTransport for DisabledTransport {
    async fn generate(&self, _request: &VisionRequest) -> Result<String, TransportError> {
        Err(TransportError::Disabled)
    }
}

/// Transport for the Gemini `generateContent` REST endpoint.
///
/// Status mapping:
/// - HTTP 429 and 5xx → [`TransportError::Overloaded`]
/// - other non-success → [`TransportError::Rejected`]
/// - timeouts → [`TransportError::Overloaded`]
/// - connection failures → [`TransportError::Network`]
/// - no candidate text → [`TransportError::EmptyResponse`]
pub struct GeminiTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GeminiTransport {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("analysis.api_key required for gemini provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl VisionTransport for GeminiTransport {
    async fn generate(&self, request: &VisionRequest) -> Result<String, TransportError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, request.model
        );
        let body = gemini_request_body(request);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Overloaded(format!("timeout: {}", e))
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(TransportError::Overloaded(format!("{}: {}", status, body_text)));
            }
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: body_text,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(TransportError::EmptyResponse);
        }
        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?;
        extract_candidate_text(&json).ok_or(TransportError::EmptyResponse)
    }
}

fn gemini_request_body(request: &VisionRequest) -> serde_json::Value {
    let mut parts: Vec<serde_json::Value> = request
        .images
        .iter()
        .map(|image| {
            serde_json::json!({
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": image.data,
                }
            })
        })
        .collect();
    parts.push(serde_json::json!({ "text": request.prompt }));

    serde_json::json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": request.response_schema,
        }
    })
}

/// Concatenated text of the first candidate, or `None` when there is none.
fn extract_candidate_text(json: &serde_json::Value) -> Option<String> {
    let parts = json
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
