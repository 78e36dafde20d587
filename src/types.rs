use chrono::NaiveDate;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Uploaded receipt as received from the caller.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub filename: String,
}

impl RawImage {
    pub fn new(
        bytes: Vec<u8>,
        content_type: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
            filename: filename.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Decoded image that passed every fatal validation check.
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    pub image: DynamicImage,
    pub filename: String,
    /// Advisory findings carried forward to the result (e.g. low resolution).
    pub warnings: Vec<ReceiptWarning>,
}

/// Single-channel, upscaled pixel buffer handed to the recognition engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessedImage {
    pixels: GrayImage,
}

impl PreprocessedImage {
    pub fn new(pixels: GrayImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> GrayImage {
        self.pixels
    }

    /// Lossless PNG encoding, the format both engine adapters accept.
    pub fn to_png_bytes(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Vec::new();
        self.pixels
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
        Ok(out)
    }
}

/// Engine output in the engine's own line order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizedText {
    lines: Vec<String>,
}

impl RecognizedText {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// Split raw engine output into lines, dropping carriage returns.
    pub fn from_raw(raw: &str) -> Self {
        Self {
            lines: raw
                .split('\n')
                .map(|l| l.trim_end_matches('\r').to_string())
                .collect(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    pub fn as_text(&self) -> String {
        self.lines.join("\n")
    }
}

impl<S: Into<String>> FromIterator<S> for RecognizedText {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            lines: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Non-negative monetary value with two-decimal precision, held in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount {
    cents: u64,
}

impl Amount {
    pub const fn from_cents(cents: u64) -> Self {
        Self { cents }
    }

    pub fn cents(&self) -> u64 {
        self.cents
    }

    /// Parse `"1,234.56"` style text; anything other than digits and one `.` is ignored.
    pub fn parse_decimal(text: &str) -> Option<Self> {
        let cleaned: String = text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let (whole, frac) = cleaned.split_once('.')?;
        if whole.is_empty() || frac.len() != 2 {
            return None;
        }
        let whole: u64 = whole.parse().ok()?;
        let frac: u64 = frac.parse().ok()?;
        whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .map(Self::from_cents)
    }

    pub fn as_f64(&self) -> f64 {
        self.cents as f64 / 100.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

/// Advisory findings attached to a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReceiptWarning {
    LowResolution,
    MissingAmount,
    AmountWithoutTotalKeyword,
}

impl ReceiptWarning {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptWarning::LowResolution => "low-resolution",
            ReceiptWarning::MissingAmount => "missing-amount",
            ReceiptWarning::AmountWithoutTotalKeyword => "amount-without-total-keyword",
        }
    }

    /// Warnings about the input itself rather than about what was parsed from it.
    pub fn degrades_input(&self) -> bool {
        matches!(self, ReceiptWarning::LowResolution)
    }
}

impl fmt::Display for ReceiptWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedFields {
    pub merchant: String,
    pub date: Option<NaiveDate>,
    pub amount: Option<Amount>,
    /// Reserved for line-item extraction; always empty today.
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResult {
    #[serde(flatten)]
    pub fields: ParsedFields,
    pub confidence: f64,
    pub warnings: Vec<ReceiptWarning>,
    pub requires_manual_review: bool,
}

/// Body returned to the caller when no result could be produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptFailure {
    pub warnings: Vec<String>,
    pub requires_manual_review: bool,
    pub error: String,
}

/// Audit record written once per processed upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub input_image_name: String,
    pub processing_time_ms: u64,
    pub engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
}

/// A persisted log entry with its store id.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    #[serde(flatten)]
    pub entry: ProcessingLogEntry,
}
