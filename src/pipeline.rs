//! End-to-end receipt processing: validate, preprocess, recognize, parse, log.

use crate::config::{ConfidenceConfig, ScannerConfig};
use crate::db::ProcessingLogSink;
use crate::error::ReceiptError;
use crate::ocr::{recognize_with_timeout, RecognitionEngine, RecognitionRequest};
use crate::parse::{parse_merchant, scan_amount, AmountMatch};
use crate::preprocess::{DiagnosticHook, ImagePreprocessor};
use crate::types::{
    ParsedFields, ProcessingLogEntry, RawImage, ReceiptFailure, ReceiptResult, ReceiptWarning,
    RecognizedText,
};
use crate::validate::ImageValidator;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a request is in its one-way trip through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Preprocessed,
    Recognized,
    Parsed,
}

pub struct ReceiptPipeline {
    validator: ImageValidator,
    preprocessor: ImagePreprocessor,
    engine: Arc<dyn RecognitionEngine>,
    request: RecognitionRequest,
    timeout: Duration,
    confidence: ConfidenceConfig,
    log_sink: Arc<dyn ProcessingLogSink>,
}

impl ReceiptPipeline {
    pub fn new(
        config: &ScannerConfig,
        engine: Arc<dyn RecognitionEngine>,
        log_sink: Arc<dyn ProcessingLogSink>,
    ) -> Self {
        Self {
            validator: ImageValidator::new(config.validation.clone()),
            preprocessor: ImagePreprocessor::new(config.preprocess.clone()),
            engine,
            request: RecognitionRequest::from_config(&config.recognition),
            timeout: config.recognition.timeout,
            confidence: config.confidence.clone(),
            log_sink,
        }
    }

    pub fn with_diagnostics(mut self, hook: Arc<dyn DiagnosticHook>) -> Self {
        self.preprocessor = self.preprocessor.with_diagnostics(hook);
        self
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Process one upload. Exactly one log entry is emitted whatever the outcome.
    pub fn process(&self, raw: RawImage) -> Result<ReceiptResult, ReceiptError> {
        let started = Instant::now();
        let filename = raw.filename.clone();
        let span = tracing::info_span!("receipt", file = %filename, engine = self.engine.name());
        let _guard = span.enter();

        let outcome = self.run(raw);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let entry = match &outcome {
            Ok((result, text)) => {
                tracing::info!(
                    elapsed_ms,
                    confidence = result.confidence,
                    manual_review = result.requires_manual_review,
                    "receipt processed"
                );
                ProcessingLogEntry {
                    input_image_name: filename,
                    processing_time_ms: elapsed_ms,
                    engine: self.engine.name().to_string(),
                    detected_text: Some(text.as_text()),
                    confidence: Some(result.confidence),
                    successful: true,
                    error_message: None,
                    created_at: chrono::Utc::now().to_rfc3339(),
                }
            }
            Err((stage, err)) => {
                tracing::warn!(elapsed_ms, ?stage, error = %err, "receipt processing failed");
                self.failure_entry(filename, elapsed_ms, err.to_string())
            }
        };
        self.append(&entry);

        outcome.map(|(result, _)| result).map_err(|(_, err)| err)
    }

    /// Log an upload that never made it into `process`, e.g. an unreadable file.
    pub fn record_rejected(&self, filename: &str, reason: &str, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::warn!(file = %filename, elapsed_ms, error = %reason, "receipt upload rejected");
        self.append(&self.failure_entry(filename.to_string(), elapsed_ms, reason.to_string()));
    }

    fn failure_entry(
        &self,
        filename: String,
        elapsed_ms: u64,
        message: String,
    ) -> ProcessingLogEntry {
        ProcessingLogEntry {
            input_image_name: filename,
            processing_time_ms: elapsed_ms,
            engine: self.engine.name().to_string(),
            detected_text: None,
            confidence: None,
            successful: false,
            error_message: Some(message),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn append(&self, entry: &ProcessingLogEntry) {
        if let Err(e) = self.log_sink.append(entry) {
            tracing::error!(error = %e, "could not record processing log entry");
        }
    }

    fn run(
        &self,
        raw: RawImage,
    ) -> Result<(ReceiptResult, RecognizedText), (Stage, ReceiptError)> {
        let validated = self
            .validator
            .validate(&raw)
            .map_err(|e| (Stage::Received, ReceiptError::from(e)))?;
        drop(raw);
        tracing::debug!(stage = ?Stage::Validated, warnings = validated.warnings.len());

        let preprocessed = self.preprocessor.preprocess(&validated);
        tracing::debug!(
            stage = ?Stage::Preprocessed,
            width = preprocessed.width(),
            height = preprocessed.height()
        );

        let text = recognize_with_timeout(
            Arc::clone(&self.engine),
            preprocessed,
            self.request.clone(),
            self.timeout,
        )
        .map_err(|e| (Stage::Preprocessed, ReceiptError::from(e)))?;
        tracing::debug!(stage = ?Stage::Recognized, text = %text.as_text(), "recognized text");

        let result = assemble(
            parse_merchant(&text),
            scan_amount(&text),
            validated.warnings,
            &self.confidence,
        );
        tracing::debug!(stage = ?Stage::Parsed, merchant = %result.fields.merchant);
        Ok((result, text))
    }
}

/// Combine parsed fields and upstream warnings into the caller-facing result.
pub fn assemble(
    merchant: String,
    amount: Option<AmountMatch>,
    mut warnings: Vec<ReceiptWarning>,
    config: &ConfidenceConfig,
) -> ReceiptResult {
    let mut confidence = config.baseline;

    if warnings.contains(&ReceiptWarning::LowResolution) {
        confidence -= config.low_resolution_penalty;
    }
    match &amount {
        None => warnings.push(ReceiptWarning::MissingAmount),
        Some(m) if !m.keyworded => {
            warnings.push(ReceiptWarning::AmountWithoutTotalKeyword);
            confidence -= config.unkeyworded_amount_penalty;
        }
        Some(_) => {}
    }
    let confidence = confidence.clamp(0.0, 1.0);

    let requires_manual_review = amount.is_none()
        || confidence < config.manual_review_threshold
        || warnings.iter().any(ReceiptWarning::degrades_input);

    ReceiptResult {
        fields: ParsedFields {
            merchant,
            date: None,
            amount: amount.map(|m| m.amount),
            items: Vec::new(),
        },
        confidence,
        warnings,
        requires_manual_review,
    }
}

/// Caller-facing failure body; never carries engine internals.
pub fn failure_response(err: &ReceiptError) -> ReceiptFailure {
    ReceiptFailure {
        warnings: Vec::new(),
        requires_manual_review: true,
        error: err.caller_message(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Amount;

    fn keyworded(cents: u64) -> Option<AmountMatch> {
        Some(AmountMatch {
            amount: Amount::from_cents(cents),
            keyworded: true,
            line_index: 0,
        })
    }

    #[test]
    fn clean_receipt_is_auto_fillable() {
        let r = assemble("SHOP".into(), keyworded(1_100), vec![], &ConfidenceConfig::default());
        assert_eq!(r.confidence, 0.8);
        assert!(r.warnings.is_empty());
        assert!(!r.requires_manual_review);
        assert_eq!(r.fields.amount, Some(Amount::from_cents(1_100)));
        assert!(r.fields.items.is_empty());
        assert!(r.fields.date.is_none());
    }

    #[test]
    fn missing_amount_forces_review() {
        let r = assemble("SHOP".into(), None, vec![], &ConfidenceConfig::default());
        assert_eq!(r.warnings, vec![ReceiptWarning::MissingAmount]);
        assert!(r.requires_manual_review);
        assert!((0.0..=1.0).contains(&r.confidence));
    }

    #[test]
    fn low_resolution_forces_review_even_with_amount() {
        let r = assemble(
            "SHOP".into(),
            keyworded(500),
            vec![ReceiptWarning::LowResolution],
            &ConfidenceConfig::default(),
        );
        assert!(r.requires_manual_review);
        assert!((r.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn unkeyworded_amount_lowers_confidence_but_stays_above_threshold() {
        let amount = Some(AmountMatch {
            amount: Amount::from_cents(4_500),
            keyworded: false,
            line_index: 1,
        });
        let r = assemble("SHOP".into(), amount, vec![], &ConfidenceConfig::default());
        assert_eq!(r.warnings, vec![ReceiptWarning::AmountWithoutTotalKeyword]);
        assert!((r.confidence - 0.7).abs() < 1e-9);
        assert!(!r.requires_manual_review);
    }

    #[test]
    fn confidence_below_threshold_forces_review() {
        let config = ConfidenceConfig {
            baseline: 0.4,
            ..ConfidenceConfig::default()
        };
        let r = assemble("SHOP".into(), keyworded(100), vec![], &config);
        assert!(r.requires_manual_review);
    }

    #[test]
    fn confidence_is_clamped() {
        let config = ConfidenceConfig {
            baseline: 0.1,
            low_resolution_penalty: 0.5,
            ..ConfidenceConfig::default()
        };
        let r = assemble("SHOP".into(), None, vec![ReceiptWarning::LowResolution], &config);
        assert_eq!(r.confidence, 0.0);
    }
}
