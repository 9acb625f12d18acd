//! Render surface and tool-state collaborator.
//!
//! The viewer core drives the render surface through [`Viewport`] and
//! never mutates it from anywhere but the control task.

use crate::annotations::{AnnotationKind, Measurement};
use crate::frame::{Frame, ImageId};
use std::collections::{BTreeMap, HashMap};

/// The active render surface plus its per-image tool state.
pub trait Viewport {
    /// Replace the displayed stack with `images` and show the first one.
    fn select_series(&mut self, images: &[Frame]);

    /// Show the image at `index` of the current stack.
    fn display_image(&mut self, index: usize);

    /// Index of the displayed image within the current stack.
    fn current_index(&self) -> usize;

    /// Identity of the displayed image, if any.
    fn displayed(&self) -> Option<&str>;

    /// Measurements of one kind attached to an image, if any.
    fn annotations(&self, image: &str, kind: AnnotationKind) -> Option<Vec<Measurement>>;

    /// Attach measurements of one kind to an image, replacing that kind.
    fn set_annotations(&mut self, image: &str, kind: AnnotationKind, measurements: Vec<Measurement>);

    /// Remove every measurement of one kind from every image.
    fn clear_annotations(&mut self, kind: AnnotationKind);

    /// Redraw the displayed image.
    fn refresh(&mut self);

    /// Drop the displayed stack and the tool state of every image.
    fn reset(&mut self);
}

/// In-memory viewport without a display.
///
/// Tool state is keyed by image identity and survives series changes.
#[derive(Debug, Default)]
pub struct HeadlessViewport {
    stack: Vec<ImageId>,
    current: usize,
    tool_state: HashMap<ImageId, BTreeMap<AnnotationKind, Vec<Measurement>>>,
    refresh_count: u64,
    selections: u64,
}

impl HeadlessViewport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities of the displayed stack.
    pub fn stack(&self) -> &[ImageId] {
        &self.stack
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    /// Number of times a stack has been loaded.
    pub fn selections(&self) -> u64 {
        self.selections
    }

    /// Number of images carrying at least one measurement.
    pub fn annotated_images(&self) -> usize {
        self.tool_state
            .values()
            .filter(|kinds| kinds.values().any(|m| !m.is_empty()))
            .count()
    }
}

impl Viewport for HeadlessViewport {
    fn select_series(&mut self, images: &[Frame]) {
        self.stack = images.iter().map(|f| f.image_identity.clone()).collect();
        self.current = 0;
        self.selections += 1;
    }

    fn display_image(&mut self, index: usize) {
        if index < self.stack.len() {
            self.current = index;
        }
    }

    fn current_index(&self) -> usize {
        self.current
    }

    fn displayed(&self) -> Option<&str> {
        self.stack.get(self.current).map(String::as_str)
    }

    fn annotations(&self, image: &str, kind: AnnotationKind) -> Option<Vec<Measurement>> {
        self.tool_state
            .get(image)
            .and_then(|kinds| kinds.get(&kind))
            .filter(|measurements| !measurements.is_empty())
            .cloned()
    }

    fn set_annotations(&mut self, image: &str, kind: AnnotationKind, measurements: Vec<Measurement>) {
        self.tool_state
            .entry(image.to_string())
            .or_default()
            .insert(kind, measurements);
    }

    fn clear_annotations(&mut self, kind: AnnotationKind) {
        for kinds in self.tool_state.values_mut() {
            kinds.remove(&kind);
        }
        self.tool_state.retain(|_, kinds| !kinds.is_empty());
    }

    fn refresh(&mut self) {
        self.refresh_count += 1;
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.current = 0;
        self.tool_state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(identity: &str) -> Frame {
        Frame {
            image_identity: identity.to_string(),
            study_id: "s".to_string(),
            series_id: "se".to_string(),
            series_number: None,
            instance_number: None,
            sop_instance_uid: format!("sop-{}", identity),
            study_description: None,
            series_description: None,
        }
    }

    #[test]
    fn test_select_and_display() {
        let mut viewport = HeadlessViewport::new();
        viewport.select_series(&[frame("a"), frame("b")]);
        assert_eq!(viewport.displayed(), Some("a"));

        viewport.display_image(1);
        assert_eq!(viewport.current_index(), 1);

        // Out of range is ignored
        viewport.display_image(5);
        assert_eq!(viewport.current_index(), 1);

        viewport.select_series(&[frame("c")]);
        assert_eq!(viewport.current_index(), 0);
        assert_eq!(viewport.selections(), 2);
    }

    #[test]
    fn test_tool_state_survives_series_change() {
        let mut viewport = HeadlessViewport::new();
        let line = Measurement::from_points([("start", 0.0, 0.0), ("end", 3.0, 4.0)]);

        viewport.select_series(&[frame("a")]);
        viewport.set_annotations("a", AnnotationKind::Length, vec![line.clone()]);
        viewport.select_series(&[frame("b")]);

        assert_eq!(
            viewport.annotations("a", AnnotationKind::Length),
            Some(vec![line])
        );
        assert_eq!(viewport.annotations("a", AnnotationKind::Rectangle), None);
    }

    #[test]
    fn test_clear_kind_across_images() {
        let mut viewport = HeadlessViewport::new();
        let line = Measurement::from_points([("start", 0.0, 0.0), ("end", 1.0, 1.0)]);
        let probe = Measurement::from_points([("end", 2.0, 2.0)]);

        viewport.set_annotations("a", AnnotationKind::Length, vec![line.clone()]);
        viewport.set_annotations("b", AnnotationKind::Length, vec![line]);
        viewport.set_annotations("b", AnnotationKind::Probe, vec![probe]);
        assert_eq!(viewport.annotated_images(), 2);

        viewport.clear_annotations(AnnotationKind::Length);
        assert_eq!(viewport.annotations("a", AnnotationKind::Length), None);
        assert!(viewport.annotations("b", AnnotationKind::Probe).is_some());
        assert_eq!(viewport.annotated_images(), 1);
    }

    #[test]
    fn test_reset_drops_stack_and_tool_state() {
        let mut viewport = HeadlessViewport::new();
        viewport.select_series(&[frame("a"), frame("b")]);
        viewport.display_image(1);
        viewport.set_annotations("a", AnnotationKind::Probe, vec![Measurement::from_points([("end", 1.0, 1.0)])]);

        viewport.reset();

        assert!(viewport.stack().is_empty());
        assert_eq!(viewport.current_index(), 0);
        assert_eq!(viewport.displayed(), None);
        assert_eq!(viewport.annotated_images(), 0);
    }
}
