//! Study/series/image hierarchy built incrementally from arriving frames.
//!
//! Frames arrive in arbitrary order. The aggregator keeps two orderings
//! at all times:
//!
//! - series ascending by series number, ties in order of first arrival
//! - images within a series ascending by instance number, ties in arrival order
//!
//! Absent numbers sort after every present number.

use crate::frame::Frame;
use tracing::debug;

/// Sort key placing absent numbers last.
fn order_key(number: Option<i32>) -> (bool, i32) {
    (number.is_none(), number.unwrap_or(0))
}

/// An ordered group of frames sharing a series UID.
#[derive(Debug, Clone)]
pub struct Series {
    pub series_id: String,
    pub series_number: Option<i32>,
    pub study_id: String,
    pub study_description: Option<String>,
    pub series_description: Option<String>,
    images: Vec<Frame>,
}

impl Series {
    fn from_first_frame(frame: Frame) -> Self {
        Self {
            series_id: frame.series_id.clone(),
            series_number: frame.series_number,
            study_id: frame.study_id.clone(),
            study_description: frame.study_description.clone(),
            series_description: frame.series_description.clone(),
            images: vec![frame],
        }
    }

    /// Images in display order.
    pub fn images(&self) -> &[Frame] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn push(&mut self, frame: Frame) {
        self.images.push(frame);
        // sort_by_key is stable, so equal instance numbers keep arrival order
        self.images.sort_by_key(|image| order_key(image.instance_number));
    }
}

/// Receives frames as ingestion completes them.
pub trait FrameSink {
    /// Classify one frame and return the index of its series.
    fn absorb(&mut self, frame: Frame) -> usize;
}

/// Maintains the sorted series list of the loaded study.
///
/// Precondition: a `sop_instance_uid` appears at most once per series.
/// Duplicates are kept as separate images and are not detected.
#[derive(Debug, Default)]
pub struct SeriesAggregator {
    series: Vec<Series>,
}

impl SeriesAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a frame into its series, keeping both orderings.
    pub fn absorb(&mut self, frame: Frame) -> usize {
        if let Some(index) = self.position_of(&frame.series_id) {
            self.series[index].push(frame);
            return index;
        }

        let key = order_key(frame.series_number);
        // After every series with an equal key: ties keep first-arrival order
        let index = self
            .series
            .partition_point(|existing| order_key(existing.series_number) <= key);

        debug!(
            series_id = %frame.series_id,
            series_number = ?frame.series_number,
            series_index = index,
            "New series"
        );

        self.series.insert(index, Series::from_first_frame(frame));
        index
    }

    /// Index of a series by UID.
    pub fn position_of(&self, series_id: &str) -> Option<usize> {
        self.series.iter().position(|s| s.series_id == series_id)
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn get(&self, index: usize) -> Option<&Series> {
        self.series.get(index)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Total number of images across all series.
    pub fn image_count(&self) -> usize {
        self.series.iter().map(Series::image_count).sum()
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

impl FrameSink for SeriesAggregator {
    fn absorb(&mut self, frame: Frame) -> usize {
        SeriesAggregator::absorb(self, frame)
    }
}
