//! Runtime configuration loaded from `.env` and `RECEIPT_*` environment variables.

use crate::error::ConfigError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationConfig {
    pub allowed_content_types: Vec<String>,
    pub max_upload_bytes: usize,
    /// Images with fewer pixels than this get a low-resolution warning.
    pub min_pixel_area: u64,
    pub max_image_width: u32,
    pub max_image_height: u32,
    /// Decoded images larger than this are rejected before any pixel work.
    pub max_pixel_area: u64,
    /// Allocation ceiling handed to the decoder.
    pub max_decode_bytes: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_content_types: DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_upload_bytes: 10 * 1024 * 1024,
            min_pixel_area: 500 * 500,
            max_image_width: 10_000,
            max_image_height: 10_000,
            max_pixel_area: 40_000_000,
            max_decode_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    pub corner_inset: u32,
    pub dark_background_threshold: u8,
    pub blur_sigma: f32,
    pub contrast_gain: f32,
    pub gamma: f32,
    pub upscale_factor: u32,
    /// The upscale factor is lowered until the output fits in this many pixels.
    pub max_output_pixels: u64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            corner_inset: 10,
            dark_background_threshold: 128,
            blur_sigma: 1.0,
            contrast_gain: 1.5,
            gamma: 0.8,
            upscale_factor: 2,
            max_output_pixels: 64_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Tesseract,
    Azure,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tesseract" => Ok(EngineKind::Tesseract),
            "azure" => Ok(EngineKind::Azure),
            other => Err(format!("expected tesseract or azure, got {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    pub engine: EngineKind,
    /// Tesseract language codes, joined with `+` on the command line.
    pub languages: Vec<String>,
    /// Tesseract page segmentation mode; 6 = single uniform block.
    pub page_segmentation_mode: u8,
    pub timeout: Duration,
    pub tesseract_bin: String,
    pub tesseract_data_path: Option<PathBuf>,
    pub azure_key: Option<String>,
    pub azure_endpoint: Option<String>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Tesseract,
            languages: vec!["eng".to_string(), "chi_tra".to_string()],
            page_segmentation_mode: 6,
            timeout: Duration::from_secs(60),
            tesseract_bin: "tesseract".to_string(),
            tesseract_data_path: None,
            azure_key: None,
            azure_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceConfig {
    pub baseline: f64,
    pub manual_review_threshold: f64,
    pub low_resolution_penalty: f64,
    pub unkeyworded_amount_penalty: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            baseline: 0.8,
            manual_review_threshold: 0.5,
            low_resolution_penalty: 0.2,
            unkeyworded_amount_penalty: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScannerConfig {
    pub validation: ValidationConfig,
    pub preprocess: PreprocessConfig,
    pub recognition: RecognitionConfig,
    pub confidence: ConfidenceConfig,
    /// `None` means the default location under the user data directory.
    pub database_path: Option<PathBuf>,
    /// When set, every preprocessed image is dumped here as PNG.
    pub diagnostics_dir: Option<PathBuf>,
}

/// Load `.env` from the working directory, then from the app data directory so
/// installed users can keep credentials there.
pub fn load_env() {
    let _ = dotenvy::dotenv();
    if let Some(dir) = app_data_dir() {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }
    }
}

pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("receipt-scanner"))
}

impl ScannerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_env();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut cfg = ScannerConfig::default();

        if let Some(v) = get("RECEIPT_MAX_UPLOAD_BYTES") {
            cfg.validation.max_upload_bytes = parse_var("RECEIPT_MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = get("RECEIPT_MIN_PIXEL_AREA") {
            cfg.validation.min_pixel_area = parse_var("RECEIPT_MIN_PIXEL_AREA", &v)?;
        }
        if let Some(v) = get("RECEIPT_MAX_IMAGE_PIXELS") {
            cfg.validation.max_pixel_area = parse_var("RECEIPT_MAX_IMAGE_PIXELS", &v)?;
        }
        if let Some(v) = get("RECEIPT_OCR_ENGINE") {
            cfg.recognition.engine = parse_var("RECEIPT_OCR_ENGINE", &v)?;
        }
        if let Some(v) = get("RECEIPT_OCR_LANGUAGES") {
            let langs: Vec<String> = v
                .split(['+', ','])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if langs.is_empty() {
                return Err(invalid("RECEIPT_OCR_LANGUAGES", &v, "no language codes"));
            }
            cfg.recognition.languages = langs;
        }
        if let Some(v) = get("RECEIPT_OCR_PSM") {
            let psm: u8 = parse_var("RECEIPT_OCR_PSM", &v)?;
            if psm > 13 {
                return Err(invalid("RECEIPT_OCR_PSM", &v, "must be 0-13"));
            }
            cfg.recognition.page_segmentation_mode = psm;
        }
        if let Some(v) = get("RECEIPT_OCR_TIMEOUT_SECS") {
            let secs: u64 = parse_var("RECEIPT_OCR_TIMEOUT_SECS", &v)?;
            if secs == 0 {
                return Err(invalid("RECEIPT_OCR_TIMEOUT_SECS", &v, "must be positive"));
            }
            cfg.recognition.timeout = Duration::from_secs(secs);
        }
        if let Some(v) = get("TESSERACT_BIN") {
            cfg.recognition.tesseract_bin = v;
        }
        cfg.recognition.tesseract_data_path = get("TESSERACT_DATA_PATH").map(PathBuf::from);
        cfg.recognition.azure_key = get("AZURE_OCR_KEY");
        cfg.recognition.azure_endpoint = get("AZURE_OCR_ENDPOINT");

        if let Some(v) = get("RECEIPT_BASELINE_CONFIDENCE") {
            cfg.confidence.baseline = parse_unit("RECEIPT_BASELINE_CONFIDENCE", &v)?;
        }
        if let Some(v) = get("RECEIPT_REVIEW_THRESHOLD") {
            cfg.confidence.manual_review_threshold = parse_unit("RECEIPT_REVIEW_THRESHOLD", &v)?;
        }
        cfg.database_path = get("RECEIPT_DB_PATH").map(PathBuf::from);
        cfg.diagnostics_dir = get("RECEIPT_DIAGNOSTICS_DIR").map(PathBuf::from);
        Ok(cfg)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            app_data_dir()
                .unwrap_or_else(|| Path::new(".").to_path_buf())
                .join("receipt_scanner.db")
        })
    }

    /// "configured" when the selected engine has what it needs to run.
    pub fn engine_status(&self) -> &'static str {
        match self.recognition.engine {
            EngineKind::Tesseract => "configured",
            EngineKind::Azure => {
                let rc = &self.recognition;
                match (&rc.azure_key, &rc.azure_endpoint) {
                    (Some(k), Some(e)) if !k.is_empty() && !e.is_empty() => "configured",
                    _ => "not_configured",
                }
            }
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.parse::<T>().map_err(|e| invalid(var, value, e.to_string()))
}

fn parse_unit(var: &'static str, value: &str) -> Result<f64, ConfigError> {
    let v: f64 = parse_var(var, value)?;
    if !(0.0..=1.0).contains(&v) {
        return Err(invalid(var, value, "must be within 0..=1"));
    }
    Ok(v)
}
