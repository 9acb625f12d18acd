//! Dicomview study loader
//!
//! Loads every frame descriptor of a study directory, reports the resulting
//! series structure, and optionally imports and exports annotations.
//!
//! # Architecture
//!
//! ```text
//! frames_dir -> DirectoryFrameStore -> StudyViewer -> annotations document
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with VIEWER__)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use dicomview_viewer::config::{LoggingConfig, ViewerConfig};
use dicomview_viewer::{AnnotationDocument, DirectoryFrameStore, HeadlessViewport, StudyViewer};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "dicomview",
        version = env!("CARGO_PKG_VERSION"),
        frames_dir = %config.source.frames_dir.display(),
        "Starting study loader"
    );

    // Validate configuration
    config.validate()?;

    match run(config).await {
        Ok(()) => {
            info!("Study loader completed successfully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Study loader failed");
            Err(e)
        }
    }
}

/// Load configuration.
fn load_config() -> anyhow::Result<ViewerConfig> {
    // Try loading from files first, fall back to environment
    let config = ViewerConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        ViewerConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("dicomview={}", level).parse()?)
        .add_directive(format!("dicomview_viewer={}", level).parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

async fn run(config: ViewerConfig) -> anyhow::Result<()> {
    let store = Arc::new(DirectoryFrameStore::new(
        config.source.frames_dir.clone(),
        config.source.extension.clone(),
    ));
    let identities = store
        .list_identities()
        .await
        .with_context(|| format!("listing {}", config.source.frames_dir.display()))?;

    let mut viewer = StudyViewer::new(store, HeadlessViewport::new(), config.ingest.settings());
    viewer.load(identities, config.ingest.image_limit());
    let progress = viewer.wait_until_loaded().await;

    for (index, series) in viewer.series().iter().enumerate() {
        info!(
            index,
            series_id = %series.series_id,
            series_number = ?series.series_number,
            description = series.series_description.as_deref().unwrap_or(""),
            images = series.image_count(),
            "Series"
        );
    }
    for failure in viewer.failures() {
        warn!(
            identity = %failure.identity,
            attempts = failure.attempts,
            error = %failure.error,
            "Frame not loaded"
        );
    }

    let stats = viewer.stats();
    info!(
        loaded = progress.loaded,
        failed = progress.failed,
        more_available = progress.more_available(),
        series = viewer.series().len(),
        retries = stats.retries,
        avg_fetch_latency_ms = format!("{:.2}", stats.avg_fetch_latency_ms),
        "Study loaded"
    );

    if let Some(path) = &config.annotations.import_path {
        let document = AnnotationDocument::read_from_path(path)?;
        let report = viewer.import_annotations(&document)?;
        info!(
            path = %path.display(),
            applied = report.records_applied,
            measurements_added = report.measurements_added,
            images_updated = report.images_updated,
            unmatched = report.unmatched.len(),
            warnings = report.warnings.len(),
            "Annotations imported"
        );
        if !report.is_clean() {
            warn!("{}", report);
        }
    }

    if let Some(path) = &config.annotations.export_path {
        let document = viewer.export_annotations()?;
        document.write_to_path(path, config.annotations.pretty)?;
        info!(path = %path.display(), records = document.len(), "Annotations exported");
    }

    Ok(())
}
