//! Dicomview Viewer - study ingestion and annotation exchange core
//!
//! This library loads the frames of an imaging study from a frame store,
//! organizes them into ordered series as they arrive, and moves per-image
//! annotations in and out of the viewer as a portable document. It handles:
//!
//! - Bounded concurrent fetching with retry and load generations
//! - Incremental Study -> Series -> Image ordering under out-of-order arrival
//! - Traversal position that survives bulk walks over the study
//! - Annotation export/import keyed by SOP instance UID
//!
//! # Architecture
//!
//! ```text
//! FrameStore -> IngestionController -> SeriesAggregator -> TraversalCursor -> Viewport
//!                                                                 ^
//!                                                          AnnotationStore
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use dicomview_viewer::{DirectoryFrameStore, HeadlessViewport, IngestSettings, StudyViewer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(DirectoryFrameStore::new("/data/study", "json"));
//!     let identities = store.list_identities().await?;
//!
//!     let mut viewer = StudyViewer::new(store, HeadlessViewport::new(), IngestSettings::default());
//!     viewer.load(identities, None);
//!     viewer.wait_until_loaded().await;
//!
//!     let document = viewer.export_annotations()?;
//!     println!("{}", document.to_json_string(true)?);
//!     Ok(())
//! }
//! ```

pub mod annotations;
pub mod config;
pub mod cursor;
pub mod frame;
pub mod frame_store;
pub mod ingestion;
pub mod series;
pub mod tools;
pub mod viewer;
pub mod viewport;

// Re-export main types
pub use annotations::{
    AnnotationDocument, AnnotationError, AnnotationKind, AnnotationRecord, AnnotationStore,
    HandlePoint, ImportReport, ImportWarning, Measurement,
};
pub use config::{ConfigValidationError, ViewerConfig};
pub use cursor::{TraversalCursor, TraversalError, TraversalPosition};
pub use frame::{DescriptorError, Frame, FrameDescriptor, ImageId};
pub use frame_store::{DirectoryFrameStore, FetchError, FrameStore, MemoryFrameStore};
pub use ingestion::{
    IngestEvent, IngestProgress, IngestSettings, IngestStats, IngestionController,
    IngestionFailure, RetryPolicy,
};
pub use series::{FrameSink, Series, SeriesAggregator};
pub use tools::{ActiveTool, ToolController};
pub use viewer::StudyViewer;
pub use viewport::{HeadlessViewport, Viewport};
