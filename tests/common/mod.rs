//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, Rgb};
use tokio::time::Instant;

use field_audit::analysis::{AnalysisClient, AnalysisSettings};
use field_audit::transport::{TransportError, VisionRequest, VisionTransport};
use field_audit_core::models::ImportEntry;

/// A small decodable PNG whose pixels depend on `seed`.
pub fn png(seed: u8) -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(16, 16, |x, y| Rgb([seed, x as u8, y as u8]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

pub fn photo(path: &str, seed: u8) -> ImportEntry {
    ImportEntry::new(path, png(seed), "image/png", 1_700_000_000_000)
}

pub fn completed_json(files: &[&str], reason: &str) -> String {
    serde_json::json!({
        "status": "COMPLETED",
        "selectedFiles": files,
        "reason": reason,
    })
    .to_string()
}

/// Scripted [`VisionTransport`]: answers from a queue, then a default.
/// Records call count, call times and peak concurrency.
pub struct FakeTransport {
    script: Mutex<VecDeque<Result<String, TransportError>>>,
    default: String,
    latency: Duration,
    hang: bool,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    folders: Mutex<Vec<String>>,
    on_answer: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FakeTransport {
    pub fn answering(default: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: default.into(),
            latency: Duration::ZERO,
            hang: false,
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            folders: Mutex::new(Vec::new()),
            on_answer: Mutex::new(None),
        }
    }

    /// Never answers; only cancellation ends a call.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::answering("")
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn then(self, response: Result<String, TransportError>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    /// Runs `hook` right before each answer is returned.
    pub fn on_answer(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_answer.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }

    /// Folder names seen in prompts, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.folders.lock().unwrap().clone()
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VisionTransport for FakeTransport {
    async fn generate(&self, request: &VisionRequest) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.folders.lock().unwrap().push(request.prompt.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(self.in_flight.clone());
        self.peak.fetch_max(now, Ordering::SeqCst);

        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(hook) = self.on_answer.lock().unwrap().as_ref() {
            hook();
        }
        scripted.unwrap_or_else(|| Ok(self.default.clone()))
    }
}

pub fn settings() -> AnalysisSettings {
    AnalysisSettings {
        model: "test-model".into(),
        backoff_base: Duration::from_secs(8),
        ..AnalysisSettings::default()
    }
}

pub fn client(transport: Arc<FakeTransport>) -> Arc<AnalysisClient> {
    Arc::new(AnalysisClient::new(transport, settings()))
}
