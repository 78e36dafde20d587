//! Adapters around external text-recognition engines.
//!
//! The pipeline only sees [`RecognitionEngine`]. Adapters carry configuration,
//! never per-request state, so one instance can be shared across threads.

use crate::config::{EngineKind, RecognitionConfig};
use crate::error::RecognitionEngineError;
use crate::types::{PreprocessedImage, RecognizedText};
use reqwest::blocking::Client;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Fixed set of language codes the engine should recognize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSet(Vec<String>);

impl LanguageSet {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(codes.into_iter().map(Into::into).collect())
    }

    pub fn codes(&self) -> &[String] {
        &self.0
    }

    /// Tesseract `-l` form, e.g. `eng+chi_tra`.
    pub fn joined(&self) -> String {
        self.0.join("+")
    }
}

/// Page segmentation strategy, expressed as Tesseract PSM values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentationMode {
    Auto,
    SingleColumn,
    /// Single uniform block of text; works best for mixed receipt layouts.
    SingleBlock,
    SparseText,
    Other(u8),
}

impl SegmentationMode {
    pub fn from_psm(psm: u8) -> Self {
        match psm {
            3 => SegmentationMode::Auto,
            4 => SegmentationMode::SingleColumn,
            6 => SegmentationMode::SingleBlock,
            11 => SegmentationMode::SparseText,
            n => SegmentationMode::Other(n),
        }
    }

    pub fn psm(&self) -> u8 {
        match self {
            SegmentationMode::Auto => 3,
            SegmentationMode::SingleColumn => 4,
            SegmentationMode::SingleBlock => 6,
            SegmentationMode::SparseText => 11,
            SegmentationMode::Other(n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionRequest {
    pub languages: LanguageSet,
    pub mode: SegmentationMode,
    /// Budget for one call. Adapters that start processes or connections must
    /// release them once it runs out.
    pub timeout: Duration,
}

impl RecognitionRequest {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self {
            languages: LanguageSet::new(config.languages.iter().cloned()),
            mode: SegmentationMode::from_psm(config.page_segmentation_mode),
            timeout: config.timeout,
        }
    }
}

pub trait RecognitionEngine: Send + Sync {
    /// Identifier recorded in the processing log.
    fn name(&self) -> &str;

    fn recognize(
        &self,
        image: &PreprocessedImage,
        request: &RecognitionRequest,
    ) -> Result<RecognizedText, RecognitionEngineError>;
}

/// Run `engine` on a worker thread and give up after `timeout`.
///
/// The engine sees the same budget through `request.timeout` and is expected to
/// clean up after itself; a late result is dropped.
pub fn recognize_with_timeout(
    engine: Arc<dyn RecognitionEngine>,
    image: PreprocessedImage,
    request: RecognitionRequest,
    timeout: Duration,
) -> Result<RecognizedText, RecognitionEngineError> {
    let request = RecognitionRequest { timeout, ..request };
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("ocr-engine".to_string())
        .spawn(move || {
            let _ = tx.send(engine.recognize(&image, &request));
        })
        .map_err(|e| {
            RecognitionEngineError::Unavailable(format!(
                "could not start recognition worker: {}",
                e
            ))
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(RecognitionEngineError::Timeout {
            millis: timeout.as_millis() as u64,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(RecognitionEngineError::Engine(
            "recognition worker exited without a result".to_string(),
        )),
    }
}

/// Build the adapter selected by configuration.
pub fn engine_from_config(
    config: &RecognitionConfig,
) -> Result<Arc<dyn RecognitionEngine>, RecognitionEngineError> {
    match config.engine {
        EngineKind::Tesseract => Ok(Arc::new(TesseractEngine::new(
            config.tesseract_bin.clone(),
            config.tesseract_data_path.clone(),
        ))),
        EngineKind::Azure => {
            let key = config.azure_key.clone().ok_or_else(|| {
                RecognitionEngineError::Unavailable("AZURE_OCR_KEY not set in .env".into())
            })?;
            let endpoint = config.azure_endpoint.clone().ok_or_else(|| {
                RecognitionEngineError::Unavailable("AZURE_OCR_ENDPOINT not set in .env".into())
            })?;
            Ok(Arc::new(AzureReadEngine::new(&endpoint, key, config.timeout)?))
        }
    }
}

/// Local Tesseract via its command line: PNG on stdin, text on stdout.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: String,
    data_path: Option<PathBuf>,
}

impl TesseractEngine {
    /// LSTM-only engine mode.
    const OCR_ENGINE_MODE: &'static str = "1";
    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    pub fn new(binary: impl Into<String>, data_path: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            data_path,
        }
    }

    fn command(&self, request: &RecognitionRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(request.languages.joined())
            .arg("--oem")
            .arg(Self::OCR_ENGINE_MODE)
            .arg("--psm")
            .arg(request.mode.psm().to_string());
        if let Some(dir) = &self.data_path {
            cmd.arg("--tessdata-dir").arg(dir);
        }
        cmd
    }
}

impl RecognitionEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    /// The child is killed and reaped once `request.timeout` has passed.
    fn recognize(
        &self,
        image: &PreprocessedImage,
        request: &RecognitionRequest,
    ) -> Result<RecognizedText, RecognitionEngineError> {
        let png = image.to_png_bytes().map_err(|e| {
            RecognitionEngineError::Engine(format!("could not encode image: {}", e))
        })?;

        let deadline = Instant::now() + request.timeout;
        let mut child = self
            .command(request)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    RecognitionEngineError::Unavailable(format!(
                        "{} not found on PATH",
                        self.binary
                    ))
                } else {
                    RecognitionEngineError::Unavailable(format!(
                        "could not start {}: {}",
                        self.binary, e
                    ))
                }
            })?;

        // Pipes are serviced off-thread so a stalled child cannot block the deadline check.
        let stdin = child.stdin.take();
        let writer = thread::spawn(move || -> io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&png)?;
            }
            Ok(())
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(
                        binary = %self.binary,
                        pid = child.id(),
                        "recognition process killed after timeout"
                    );
                    return Err(RecognitionEngineError::Timeout {
                        millis: request.timeout.as_millis() as u64,
                    });
                }
                Ok(None) => thread::sleep(Self::POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RecognitionEngineError::Engine(e.to_string()));
                }
            }
        };

        let written = writer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(RecognitionEngineError::Engine(format!(
                "{} exited with {}: {}",
                self.binary,
                status,
                stderr.trim()
            )));
        }
        if let Err(e) = written {
            return Err(RecognitionEngineError::Engine(format!("could not send image: {}", e)));
        }
        Ok(RecognizedText::from_raw(&String::from_utf8_lossy(&stdout)))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Azure Document Intelligence `prebuilt-read` model over REST.
pub struct AzureReadEngine {
    analyze_url: String,
    key: String,
    client: Client,
    timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
}

impl AzureReadEngine {
    const API_VERSION: &'static str = "2024-11-30";

    pub fn new(
        endpoint: &str,
        key: String,
        timeout: Duration,
    ) -> Result<Self, RecognitionEngineError> {
        let endpoint = endpoint.trim_end_matches('/');
        let analyze_url = format!(
            "{}/documentintelligence/documentModels/prebuilt-read:analyze?api-version={}",
            endpoint,
            Self::API_VERSION
        );
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognitionEngineError::Unavailable(e.to_string()))?;
        Ok(Self {
            analyze_url,
            key,
            client,
            timeout,
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
        })
    }

    pub fn analyze_url(&self) -> &str {
        &self.analyze_url
    }

    fn transport_error(&self, e: reqwest::Error) -> RecognitionEngineError {
        if e.is_timeout() {
            RecognitionEngineError::Timeout {
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            RecognitionEngineError::Unavailable(format!("network error: {}", e))
        }
    }
}

impl RecognitionEngine for AzureReadEngine {
    fn name(&self) -> &str {
        "azure-prebuilt-read"
    }

    fn recognize(
        &self,
        image: &PreprocessedImage,
        request: &RecognitionRequest,
    ) -> Result<RecognizedText, RecognitionEngineError> {
        let png = image.to_png_bytes().map_err(|e| {
            RecognitionEngineError::Engine(format!("could not encode image: {}", e))
        })?;
        let deadline = Instant::now() + request.timeout;

        // prebuilt-read detects scripts itself; languages only serve as a locale hint.
        let mut url = self.analyze_url.clone();
        if let Some(first) = request.languages.codes().first() {
            if let Some(locale) = azure_locale(first) {
                url.push_str("&locale=");
                url.push_str(locale);
            }
        }

        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/octet-stream")
            .body(png)
            .send()
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RecognitionEngineError::Engine(format!(
                "analyze request failed ({}): {}",
                status,
                if body.is_empty() { "Invalid key or endpoint?" } else { body.as_str() }
            )));
        }

        let result_url = response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RecognitionEngineError::InvalidResponse("no Operation-Location in response".into())
            })?
            .to_string();

        for _ in 0..self.max_polls {
            if Instant::now() + self.poll_interval > deadline {
                break;
            }
            thread::sleep(self.poll_interval);
            let poll: serde_json::Value = self
                .client
                .get(&result_url)
                .header("Ocp-Apim-Subscription-Key", &self.key)
                .send()
                .map_err(|e| self.transport_error(e))?
                .json()
                .map_err(|e| {
                    RecognitionEngineError::InvalidResponse(format!("invalid JSON: {}", e))
                })?;
            match poll.get("status").and_then(|s| s.as_str()).unwrap_or("") {
                "succeeded" => {
                    let result = poll.get("analyzeResult").ok_or_else(|| {
                        RecognitionEngineError::InvalidResponse("no analyzeResult".into())
                    })?;
                    return Ok(lines_from_analyze_result(result));
                }
                "failed" => {
                    let message = poll
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("Unknown error");
                    return Err(RecognitionEngineError::Engine(format!(
                        "analysis failed: {}",
                        message
                    )));
                }
                _ => {}
            }
        }
        Err(RecognitionEngineError::Timeout {
            millis: request.timeout.as_millis() as u64,
        })
    }
}

/// Flatten `analyzeResult.pages[*].lines[*].content` in page order.
pub fn lines_from_analyze_result(result: &serde_json::Value) -> RecognizedText {
    result
        .get("pages")
        .and_then(|p| p.as_array())
        .into_iter()
        .flatten()
        .flat_map(|page| {
            page.get("lines")
                .and_then(|l| l.as_array())
                .into_iter()
                .flatten()
        })
        .map(|line| {
            line.get("content")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string()
        })
        .collect()
}

fn azure_locale(tesseract_code: &str) -> Option<&'static str> {
    match tesseract_code {
        "eng" => Some("en-US"),
        "chi_tra" => Some("zh-Hant"),
        "chi_sim" => Some("zh-Hans"),
        "deu" => Some("de"),
        "fra" => Some("fr"),
        "jpn" => Some("ja"),
        _ => None,
    }
}
