use crate::config::ScannerConfig;
use crate::db::LogStore;
use crate::pipeline::{failure_response, ReceiptPipeline};
use crate::types::{HistoryRecord, RawImage, ReceiptFailure, ReceiptResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

/// Response body for one scan: either a result (possibly flagged for review) or a failure.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ScanOutcome {
    Success(ReceiptResult),
    Failure(ReceiptFailure),
}

impl ScanOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ScanOutcome::Success(_))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub engine: String,
    pub status: &'static str,
    pub database_path: String,
}

/// Content type implied by a file extension; unknown extensions get `application/octet-stream`.
pub fn content_type_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub fn load_raw_image(file_path: &str) -> Result<RawImage, String> {
    let path = Path::new(file_path);
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            "File not found.".to_string()
        } else {
            format!("Could not read file: {}", e)
        }
    })?;
    Ok(RawImage::new(bytes, content_type_for_path(path), file_name(path)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|o| o.to_str())
        .unwrap_or("")
        .to_string()
}

/// Build a `RawImage` from a base64 upload body (e.g. a JSON API payload).
pub fn raw_image_from_base64(
    base64_content: &str,
    content_type: &str,
    filename: &str,
) -> Result<RawImage, String> {
    let bytes = BASE64
        .decode(base64_content.trim())
        .map_err(|e| format!("Invalid base64: {}", e))?;
    Ok(RawImage::new(bytes, content_type, filename))
}

pub fn scan_receipt(pipeline: &ReceiptPipeline, raw: RawImage) -> ScanOutcome {
    match pipeline.process(raw) {
        Ok(result) => ScanOutcome::Success(result),
        Err(e) => ScanOutcome::Failure(failure_response(&e)),
    }
}

/// Scan a file on disk. Unreadable files fail and are logged like any other invalid upload.
pub fn scan_receipt_file(pipeline: &ReceiptPipeline, file_path: &str) -> ScanOutcome {
    let started = Instant::now();
    match load_raw_image(file_path) {
        Ok(raw) => scan_receipt(pipeline, raw),
        Err(error) => {
            pipeline.record_rejected(&file_name(Path::new(file_path)), &error, started);
            ScanOutcome::Failure(ReceiptFailure {
                warnings: Vec::new(),
                requires_manual_review: true,
                error,
            })
        }
    }
}

pub fn get_history(store: &LogStore, limit: usize) -> Result<Vec<HistoryRecord>, String> {
    store.recent(limit).map_err(|e| e.to_string())
}

pub fn get_engine_status(config: &ScannerConfig) -> EngineStatus {
    EngineStatus {
        engine: format!("{:?}", config.recognition.engine).to_lowercase(),
        status: config.engine_status(),
        database_path: config.database_path().display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryLogSink;
    use crate::error::RecognitionEngineError;
    use crate::ocr::{RecognitionEngine, RecognitionRequest};
    use crate::types::{PreprocessedImage, RecognizedText};
    use std::sync::Arc;

    struct Unused;

    impl RecognitionEngine for Unused {
        fn name(&self) -> &str {
            "unused"
        }
        fn recognize(
            &self,
            _image: &PreprocessedImage,
            _request: &RecognitionRequest,
        ) -> Result<RecognizedText, RecognitionEngineError> {
            panic!("engine must not run for unreadable files")
        }
    }

    #[test]
    fn content_type_follows_extension_case_insensitively() {
        assert_eq!(content_type_for_path(Path::new("a/B.JPG")), "image/jpeg");
        assert_eq!(content_type_for_path(Path::new("r.webp")), "image/webp");
        assert_eq!(content_type_for_path(Path::new("scan.gif")), "image/gif");
        assert_eq!(content_type_for_path(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn missing_file_reports_not_found() {
        let err = load_raw_image("/definitely/not/here.png").unwrap_err();
        assert_eq!(err, "File not found.");
    }

    #[test]
    fn base64_upload_decodes() {
        let raw = raw_image_from_base64("aGVsbG8=", "image/png", "x.png").unwrap();
        assert_eq!(raw.bytes, b"hello");
        assert!(raw_image_from_base64("***", "image/png", "x.png").is_err());
    }

    #[test]
    fn engine_status_reports_selected_engine() {
        let status = get_engine_status(&ScannerConfig::default());
        assert_eq!(status.engine, "tesseract");
        assert_eq!(status.status, "configured");
    }

    #[test]
    fn unreadable_file_is_answered_and_logged() {
        let sink = Arc::new(MemoryLogSink::new());
        let pipeline =
            ReceiptPipeline::new(&ScannerConfig::default(), Arc::new(Unused), sink.clone());

        let outcome = scan_receipt_file(&pipeline, "/no/such/dir/receipt.png");

        match outcome {
            ScanOutcome::Failure(f) => {
                assert_eq!(f.error, "File not found.");
                assert!(f.requires_manual_review);
            }
            ScanOutcome::Success(r) => panic!("expected failure, got {:?}", r),
        }
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].successful);
        assert_eq!(entries[0].input_image_name, "receipt.png");
        assert_eq!(entries[0].engine, "unused");
        assert_eq!(entries[0].error_message.as_deref(), Some("File not found."));
    }
}
