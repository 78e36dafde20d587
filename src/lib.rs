pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod ocr;
pub mod parse;
pub mod pipeline;
pub mod preprocess;
pub mod types;
pub mod validate;

use config::ScannerConfig;
use db::LogStore;
use pipeline::ReceiptPipeline;
use preprocess::DirectoryDump;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Console logging on stderr; `RUST_LOG` overrides `default_level`.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Open the history store and wire the configured engine into a pipeline.
pub fn build_pipeline(config: &ScannerConfig) -> Result<(ReceiptPipeline, Arc<LogStore>), String> {
    let store = Arc::new(LogStore::open(&config.database_path()).map_err(|e| e.to_string())?);
    let engine = ocr::engine_from_config(&config.recognition).map_err(|e| e.to_string())?;
    let mut pipeline = ReceiptPipeline::new(config, engine, store.clone());
    if let Some(dir) = &config.diagnostics_dir {
        tracing::info!(dir = %dir.display(), "diagnostic image dump enabled");
        pipeline = pipeline.with_diagnostics(Arc::new(DirectoryDump::new(dir)));
    }
    Ok((pipeline, store))
}
