//! The analysis client: one folder in, one verdict out.
//!
//! [`AnalysisClient::analyze`] prepares the folder's images, asks the vision
//! model for a strict-JSON verdict, and retries transient failures with
//! exponential backoff. It never touches the tree, the cache, or the sync
//! queue; the queue owns those.
//!
//! # Retry strategy
//!
//! - overload (HTTP 429/5xx, timeout) or an empty response → retry
//! - anything else (bad request, auth, unreachable) → fail immediately
//! - backoff: `base`, `2×base`, `4×base`, … for up to `max_retries` retries
//!   (8s, 16s, 32s, 64s, 128s with the defaults)
//! - cancellation wins over everything, including a pending backoff sleep

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{debug, info, warn};

use field_audit_core::models::{
    EquipmentMetadata, LeafFile, Verdict, MAX_SELECTED_FILES,
};

use crate::cancel::CancelSignal;
use crate::config::AnalysisConfig;
use crate::transport::{
    DisabledTransport, GeminiTransport, ImagePart, TransportError, VisionRequest, VisionTransport,
};

/// Tuning knobs for [`AnalysisClient`].
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub model: String,
    pub max_images: usize,
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

impl From<&AnalysisConfig> for AnalysisSettings {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            model: config.model.clone().unwrap_or_default(),
            max_images: config.max_images,
            max_dimension: config.max_dimension,
            jpeg_quality: config.jpeg_quality,
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
        }
    }
}

/// Everything the model needs to judge one folder.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub folder_name: String,
    /// Direct images of the folder, in tree order.
    pub images: Vec<Arc<LeafFile>>,
    pub verification_items: Vec<String>,
    pub equipment: Option<EquipmentMetadata>,
}

/// Result of [`AnalysisClient::analyze`].
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// The model answered. Safe to cache.
    Answered(Verdict),
    /// The call failed; the PENDING verdict carries the diagnostic. Not cached.
    Failed(Verdict),
    /// Aborted through the cancel signal. Not cached.
    Cancelled,
}

/// Wraps a [`VisionTransport`] with image preparation and retry policy.
pub struct AnalysisClient {
    transport: Arc<dyn VisionTransport>,
    settings: AnalysisSettings,
}

impl AnalysisClient {
    pub fn new(transport: Arc<dyn VisionTransport>, settings: AnalysisSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Build a client with the transport named by `config.provider`.
    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        let transport: Arc<dyn VisionTransport> = match config.provider.as_str() {
            "disabled" => Arc::new(DisabledTransport),
            "gemini" => Arc::new(GeminiTransport::new(config)?),
            other => return Err(anyhow!("Unknown analysis provider: {}", other)),
        };
        Ok(Self::new(transport, AnalysisSettings::from(config)))
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// Delay before retry number `retry` (1-based): `base × 2^(retry-1)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.settings.backoff_base.saturating_mul(1u32 << exp)
    }

    /// Analyze one folder.
    ///
    /// Never returns an error: failures come back as
    /// [`AnalysisOutcome::Failed`] with a PENDING verdict, and cancellation as
    /// [`AnalysisOutcome::Cancelled`].
    pub async fn analyze(&self, request: AnalysisRequest, cancel: &CancelSignal) -> AnalysisOutcome {
        if cancel.is_cancelled() {
            return AnalysisOutcome::Cancelled;
        }
        if request.images.is_empty() {
            return AnalysisOutcome::Answered(Verdict::pending("no images in folder"));
        }

        let selected: Vec<Arc<LeafFile>> = request
            .images
            .iter()
            .take(self.settings.max_images)
            .cloned()
            .collect();
        let max_dimension = self.settings.max_dimension;
        let quality = self.settings.jpeg_quality;
        let prepare =
            tokio::task::spawn_blocking(move || prepare_images(&selected, max_dimension, quality));

        let images = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AnalysisOutcome::Cancelled,
            joined = prepare => match joined {
                Ok(images) => images,
                Err(e) => {
                    return AnalysisOutcome::Failed(Verdict::pending(format!(
                        "image preparation failed: {}",
                        e
                    )))
                }
            },
        };
        if images.is_empty() {
            return AnalysisOutcome::Failed(Verdict::pending("no readable images in folder"));
        }

        let vision_request = VisionRequest {
            model: self.settings.model.clone(),
            prompt: build_prompt(&request, &images),
            images,
            response_schema: response_schema(),
        };

        let mut retries = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return AnalysisOutcome::Cancelled,
                result = self.transport.generate(&vision_request) => result,
            };

            let err = match result {
                Ok(text) if !text.trim().is_empty() => {
                    return match parse_verdict(&text) {
                        Ok(verdict) => AnalysisOutcome::Answered(verdict),
                        Err(e) => {
                            warn!(folder = %request.folder_name, error = %e, "unparseable model response");
                            AnalysisOutcome::Failed(Verdict::pending(format!(
                                "invalid model response: {}",
                                e
                            )))
                        }
                    };
                }
                Ok(_) => TransportError::EmptyResponse,
                Err(e) => e,
            };

            if !err.is_transient() {
                warn!(folder = %request.folder_name, error = %err, "analysis failed");
                return AnalysisOutcome::Failed(Verdict::pending(err.to_string()));
            }
            if retries >= self.settings.max_retries {
                warn!(
                    folder = %request.folder_name,
                    attempts = retries + 1,
                    error = %err,
                    "giving up after retries"
                );
                return AnalysisOutcome::Failed(Verdict::pending(format!(
                    "overloaded: gave up after {} attempts ({})",
                    retries + 1,
                    err
                )));
            }

            retries += 1;
            let delay = self.backoff_delay(retries);
            info!(
                folder = %request.folder_name,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient analysis failure, backing off"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return AnalysisOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Downscale and JPEG re-encode each image. Files without bytes or that
/// cannot be decoded are skipped.
pub fn prepare_images(files: &[Arc<LeafFile>], max_dimension: u32, quality: u8) -> Vec<ImagePart> {
    files
        .iter()
        .filter_map(|file| {
            let blob = file.blob.as_ref()?;
            match encode_jpeg(blob.bytes(), max_dimension, quality) {
                Ok(bytes) => Some(ImagePart {
                    file_name: file.name.clone(),
                    mime_type: "image/jpeg".to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                }),
                Err(e) => {
                    warn!(file = %file.path, error = %e, "skipping undecodable image");
                    None
                }
            }
        })
        .collect()
}

fn encode_jpeg(data: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        img
    };

    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
    debug!(bytes = out.get_ref().len(), "re-encoded image");
    Ok(out.into_inner())
}

fn build_prompt(request: &AnalysisRequest, images: &[ImagePart]) -> String {
    let mut prompt = format!(
        "You are auditing a field-inspection folder named \"{}\".\n\
         The attached photos are, in order: {}.\n",
        request.folder_name,
        images
            .iter()
            .map(|i| i.file_name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    if request.verification_items.is_empty() {
        prompt.push_str("Decide whether the photos document a finished installation.\n");
    } else {
        prompt.push_str("Check every one of these items:\n");
        for item in &request.verification_items {
            prompt.push_str("- ");
            prompt.push_str(item);
            prompt.push('\n');
        }
    }

    if let Some(described) = request.equipment.as_ref().and_then(|e| e.describe()) {
        prompt.push_str("Known equipment: ");
        prompt.push_str(&described);
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "Answer COMPLETED only if every item is clearly evidenced, PENDING otherwise. \
         Select at most {} file names that best support the answer, explain the \
         decision in `reason`, and note anything unusual in `observation`. \
         Report each sub-check you performed in `checks` with a confidence in [0, 1].",
        MAX_SELECTED_FILES
    ));
    prompt
}

/// JSON schema the model must answer with.
pub fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "OBJECT",
        "properties": {
            "status": { "type": "STRING", "enum": ["COMPLETED", "PENDING"] },
            "selectedFiles": {
                "type": "ARRAY",
                "items": { "type": "STRING" },
                "maxItems": MAX_SELECTED_FILES
            },
            "reason": { "type": "STRING" },
            "observation": { "type": "STRING" },
            "checks": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": { "type": "STRING" },
                        "confidence": { "type": "NUMBER" },
                        "note": { "type": "STRING" }
                    },
                    "required": ["name", "confidence"]
                }
            }
        },
        "required": ["status", "selectedFiles", "reason"]
    })
}

/// Parse the model's JSON answer, tolerating a surrounding code fence.
pub fn parse_verdict(text: &str) -> Result<Verdict> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let mut verdict: Verdict = serde_json::from_str(body)?;
    verdict.selected_files.truncate(MAX_SELECTED_FILES);
    if verdict
        .observation
        .as_deref()
        .is_some_and(|o| o.trim().is_empty())
    {
        verdict.observation = None;
    }
    Ok(verdict)
}
