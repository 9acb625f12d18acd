//! Traversal position over the loaded series.

use crate::frame::Frame;
use crate::series::Series;
use crate::viewport::Viewport;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors that can occur while moving the cursor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TraversalError {
    #[error("No series loaded")]
    NoSeries,

    #[error("Series index {index} out of range ({count} series loaded)")]
    SeriesOutOfRange { index: usize, count: usize },

    #[error("Image index {index} out of range ({count} images in series)")]
    ImageOutOfRange { index: usize, count: usize },
}

/// A (series, image) coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalPosition {
    pub series_index: usize,
    pub image_index: usize,
}

impl TraversalPosition {
    pub fn new(series_index: usize, image_index: usize) -> Self {
        Self {
            series_index,
            image_index,
        }
    }

    /// Whether the position addresses an image of `series`, or is the
    /// origin of an empty study.
    pub fn is_valid_for(&self, series: &[Series]) -> bool {
        if series.is_empty() {
            return self.series_index == 0 && self.image_index == 0;
        }
        series
            .get(self.series_index)
            .map(|s| self.image_index < s.image_count())
            .unwrap_or(false)
    }
}

/// Current series/image position, mirrored onto the viewport.
///
/// The series index lives here; the image index is owned by the viewport
/// and read back from it.
pub struct TraversalCursor<V> {
    viewport: V,
    series_index: usize,
    image_count: usize,
}

impl<V: Viewport> TraversalCursor<V> {
    pub fn new(viewport: V) -> Self {
        Self {
            viewport,
            series_index: 0,
            image_count: 0,
        }
    }

    pub fn viewport(&self) -> &V {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut V {
        &mut self.viewport
    }

    pub fn current_series_index(&self) -> usize {
        self.series_index
    }

    pub fn current_image_index(&self) -> usize {
        self.viewport.current_index()
    }

    /// Images in the selected series.
    pub fn image_count(&self) -> usize {
        self.image_count
    }

    pub fn position(&self) -> TraversalPosition {
        TraversalPosition::new(self.series_index, self.current_image_index())
    }

    /// The frame under the cursor.
    pub fn current_image<'a>(&self, series: &'a [Series]) -> Option<&'a Frame> {
        series
            .get(self.series_index)
            .and_then(|s| s.images().get(self.current_image_index()))
    }

    /// Make `index` the current series and show its first image.
    pub fn select_series(&mut self, series: &[Series], index: usize) -> Result<(), TraversalError> {
        if series.is_empty() {
            return Err(TraversalError::NoSeries);
        }
        let selected = series.get(index).ok_or(TraversalError::SeriesOutOfRange {
            index,
            count: series.len(),
        })?;

        self.series_index = index;
        self.image_count = selected.image_count();
        self.viewport.select_series(selected.images());
        trace!(series_index = index, images = self.image_count, "Series selected");
        Ok(())
    }

    /// Re-publish the current series after its images changed, staying on
    /// the displayed image wherever it moved to. Falls back to the current
    /// index when that image is gone, and to the first image when the
    /// index is out of range.
    pub fn refresh_series(&mut self, series: &[Series]) {
        let Some(current) = series.get(self.series_index) else {
            return;
        };
        let index = self.viewport.current_index();
        let displayed = self.viewport.displayed().map(str::to_string);

        self.image_count = current.image_count();
        self.viewport.select_series(current.images());

        let target = displayed
            .and_then(|id| current.images().iter().position(|f| f.image_identity == id))
            .unwrap_or(if index < self.image_count { index } else { 0 });
        if target > 0 {
            self.viewport.display_image(target);
        }
    }

    /// Move one image forward. Returns false at the last image.
    pub fn step_forward(&mut self) -> bool {
        let index = self.viewport.current_index();
        if index + 1 >= self.image_count {
            return false;
        }
        self.viewport.display_image(index + 1);
        true
    }

    /// Move one image back. Returns false at the first image.
    pub fn step_backward(&mut self) -> bool {
        let index = self.viewport.current_index();
        if index == 0 || self.image_count == 0 {
            return false;
        }
        self.viewport.display_image(index - 1);
        true
    }

    /// Jump straight to an image of the current series.
    pub fn seek(&mut self, index: usize) -> Result<(), TraversalError> {
        if index >= self.image_count {
            return Err(TraversalError::ImageOutOfRange {
                index,
                count: self.image_count,
            });
        }
        self.viewport.display_image(index);
        Ok(())
    }

    pub fn save_state(&self) -> TraversalPosition {
        self.position()
    }

    /// Return to a saved position by direct seek.
    pub fn restore_state(
        &mut self,
        series: &[Series],
        position: TraversalPosition,
    ) -> Result<(), TraversalError> {
        if series.is_empty() && position == TraversalPosition::default() {
            return Ok(());
        }
        self.select_series(series, position.series_index)?;
        if position.image_index > 0 {
            self.seek(position.image_index)?;
        }
        Ok(())
    }

    /// Return to the origin with nothing displayed and no tool state.
    pub fn reset(&mut self) {
        self.series_index = 0;
        self.image_count = 0;
        self.viewport.reset();
    }
}
