//! TOML configuration.
//!
//! Every section has a `Default`, so a host application can build a
//! [`Config`] in code and skip the file entirely.
//!
//! ```toml
//! [db]
//! path = "./data/audit.sqlite"
//! max_connections = 5
//!
//! [analysis]
//! provider = "gemini"
//! model = "gemini-2.5-flash"
//! api_key = "..."
//! verification_items = ["meter", "electrical_panel"]
//!
//! [sync]
//! provider = "rest"
//! endpoint = "https://example.supabase.co"
//! api_key = "..."
//! user_id = "inspector-7"
//!
//! [session]
//! autosave_interval_ms = 2000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use field_audit_core::policy::{VerdictPolicy, DEFAULT_MIN_CONFIDENCE};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/audit.sqlite")
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_analysis_endpoint")]
    pub endpoint: String,
    /// Images sent per call (the first N direct images of the folder).
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    /// Longest edge, in pixels, after downscaling.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Retries after the first attempt, for overload/empty responses only.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Criteria the model is asked to check in every folder.
    #[serde(default)]
    pub verification_items: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: default_analysis_provider(),
            model: None,
            api_key: None,
            endpoint: default_analysis_endpoint(),
            max_images: default_max_images(),
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
            min_confidence: default_min_confidence(),
            verification_items: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn policy(&self) -> VerdictPolicy {
        VerdictPolicy::new(self.min_confidence)
    }
}

fn default_analysis_provider() -> String {
    "disabled".to_string()
}
fn default_analysis_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_max_images() -> usize {
    6
}
fn default_max_dimension() -> u32 {
    1024
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    8_000
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_min_confidence() -> f32 {
    DEFAULT_MIN_CONFIDENCE
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_sync_table")]
    pub table: String,
    #[serde(default = "default_sync_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            provider: default_sync_provider(),
            endpoint: None,
            api_key: None,
            user_id: None,
            table: default_sync_table(),
            timeout_secs: default_sync_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Configured and carrying credentials. Anything less leaves the
    /// mirror a no-op.
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled" && self.api_key.is_some() && self.user_id.is_some()
    }
}

fn default_sync_provider() -> String {
    "disabled".to_string()
}
fn default_sync_table() -> String {
    "analysis_history".to_string()
}
fn default_sync_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_autosave_interval_ms")]
    pub autosave_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_interval_ms: default_autosave_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }
}

fn default_autosave_interval_ms() -> u64 {
    2_000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let analysis = &config.analysis;

    if config.db.max_connections == 0 {
        bail!("db.max_connections must be >= 1");
    }
    if analysis.max_images == 0 {
        bail!("analysis.max_images must be >= 1");
    }
    if analysis.max_dimension == 0 {
        bail!("analysis.max_dimension must be >= 1");
    }
    if !(1..=100).contains(&analysis.jpeg_quality) {
        bail!("analysis.jpeg_quality must be in [1, 100]");
    }
    if !(0.0..=1.0).contains(&analysis.min_confidence) {
        bail!("analysis.min_confidence must be in [0.0, 1.0]");
    }

    match analysis.provider.as_str() {
        "disabled" => {}
        "gemini" => {
            if analysis.model.is_none() {
                bail!("analysis.model must be specified when provider is 'gemini'");
            }
            if analysis.api_key.is_none() {
                bail!("analysis.api_key must be specified when provider is 'gemini'");
            }
        }
        other => bail!(
            "Unknown analysis provider: '{}'. Must be disabled or gemini.",
            other
        ),
    }

    match config.sync.provider.as_str() {
        "disabled" => {}
        "rest" => {
            if config.sync.endpoint.is_none() {
                bail!("sync.endpoint must be specified when provider is 'rest'");
            }
        }
        other => bail!(
            "Unknown sync provider: '{}'. Must be disabled or rest.",
            other
        ),
    }

    if config.session.autosave_interval_ms == 0 {
        bail!("session.autosave_interval_ms must be > 0");
    }

    Ok(())
}
