//! The control object owning a study's ingestion, hierarchy and view state.
//!
//! Everything here runs on the control task. Fetches happen elsewhere and
//! only their completions reach this object, one at a time, through
//! [`StudyViewer::next_event`].

use crate::annotations::{AnnotationDocument, AnnotationError, AnnotationKind, AnnotationStore, ImportReport};
use crate::cursor::{TraversalCursor, TraversalError, TraversalPosition};
use crate::frame::{Frame, ImageId};
use crate::frame_store::FrameStore;
use crate::ingestion::{IngestEvent, IngestProgress, IngestSettings, IngestStats, IngestionController, IngestionFailure};
use crate::series::{Series, SeriesAggregator};
use crate::tools::{ActiveTool, ToolController};
use crate::viewport::Viewport;
use std::sync::Arc;
use tracing::{debug, info};

pub struct StudyViewer<S: FrameStore + 'static, V: Viewport> {
    ingestion: IngestionController<S>,
    aggregator: SeriesAggregator,
    cursor: TraversalCursor<V>,
    annotations: AnnotationStore,
    tools: ToolController,
}

impl<S: FrameStore + 'static, V: Viewport> StudyViewer<S, V> {
    pub fn new(store: Arc<S>, viewport: V, settings: IngestSettings) -> Self {
        Self {
            ingestion: IngestionController::new(store, settings),
            aggregator: SeriesAggregator::new(),
            cursor: TraversalCursor::new(viewport),
            annotations: AnnotationStore::default(),
            tools: ToolController::new(),
        }
    }

    /// Track only `kinds` on export and import.
    pub fn with_annotation_kinds(mut self, kinds: Vec<AnnotationKind>) -> Self {
        self.annotations = AnnotationStore::new(kinds);
        self
    }

    /// Discard the current study and start loading `identities`.
    pub fn load(&mut self, identities: Vec<ImageId>, limit: Option<usize>) -> u64 {
        self.aggregator.clear();
        self.cursor.reset();
        self.tools.reset();
        self.ingestion.load(identities, limit)
    }

    /// Apply the next completion of the current load.
    ///
    /// Returns `None` once the load has settled.
    pub async fn next_event(&mut self) -> Option<IngestEvent> {
        let event = self.ingestion.next_event(&mut self.aggregator).await?;

        if let IngestEvent::Loaded { series_index, .. } = &event {
            if *series_index <= self.cursor.current_series_index() {
                self.cursor.refresh_series(self.aggregator.series());
            }
            self.tools.ensure_default(self.aggregator.image_count());
        }
        Some(event)
    }

    /// Drive the current load until every fetch has settled.
    pub async fn wait_until_loaded(&mut self) -> IngestProgress {
        while let Some(event) = self.next_event().await {
            debug!(event = ?event, "Ingest event");
        }
        self.ingestion.progress()
    }

    pub fn is_loading(&self) -> bool {
        self.ingestion.is_loading()
    }

    pub fn progress(&self) -> IngestProgress {
        self.ingestion.progress()
    }

    pub fn failures(&self) -> &[IngestionFailure] {
        self.ingestion.failures()
    }

    pub fn stats(&self) -> &IngestStats {
        self.ingestion.stats()
    }

    pub fn series(&self) -> &[Series] {
        self.aggregator.series()
    }

    /// Images across every series.
    pub fn image_count(&self) -> usize {
        self.aggregator.image_count()
    }

    pub fn current_image(&self) -> Option<&Frame> {
        self.cursor.current_image(self.aggregator.series())
    }

    pub fn position(&self) -> TraversalPosition {
        self.cursor.position()
    }

    pub fn select_series(&mut self, index: usize) -> Result<(), TraversalError> {
        self.cursor.select_series(self.aggregator.series(), index)
    }

    pub fn step_forward(&mut self) -> bool {
        self.cursor.step_forward()
    }

    pub fn step_backward(&mut self) -> bool {
        self.cursor.step_backward()
    }

    pub fn seek(&mut self, index: usize) -> Result<(), TraversalError> {
        self.cursor.seek(index)
    }

    pub fn save_state(&self) -> TraversalPosition {
        self.cursor.save_state()
    }

    pub fn restore_state(&mut self, position: TraversalPosition) -> Result<(), TraversalError> {
        self.cursor.restore_state(self.aggregator.series(), position)
    }

    pub fn active_tool(&self) -> ActiveTool {
        self.tools.active()
    }

    pub fn activate_tool(&mut self, tool: ActiveTool) -> bool {
        self.tools.activate(tool, self.aggregator.image_count())
    }

    /// Remove every annotation of the most recently activated kind.
    pub fn undo_annotation(&mut self) -> Option<AnnotationKind> {
        self.tools.undo_last(self.cursor.viewport_mut())
    }

    pub fn clear_all_annotations(&mut self) {
        if self.aggregator.image_count() == 0 {
            return;
        }
        let kinds = self.annotations.kinds().to_vec();
        self.tools.clear_all(self.cursor.viewport_mut(), &kinds);
    }

    pub fn export_annotations(&mut self) -> Result<AnnotationDocument, AnnotationError> {
        if self.ingestion.is_loading() {
            return Err(AnnotationError::Busy);
        }
        self.annotations
            .export_all(self.aggregator.series(), &mut self.cursor)
    }

    pub fn import_annotations(
        &mut self,
        document: &AnnotationDocument,
    ) -> Result<ImportReport, AnnotationError> {
        if self.ingestion.is_loading() {
            return Err(AnnotationError::Busy);
        }
        self.annotations
            .import_all(document, self.aggregator.series(), &mut self.cursor)
    }

    /// Abandon any load and empty the study, the view and the frame cache.
    pub fn clear(&mut self) {
        self.ingestion.reset();
        self.aggregator.clear();
        self.cursor.reset();
        self.tools.reset();
        info!("Viewer cleared");
    }

    pub fn viewport(&self) -> &V {
        self.cursor.viewport()
    }

    pub fn viewport_mut(&mut self) -> &mut V {
        self.cursor.viewport_mut()
    }
}
