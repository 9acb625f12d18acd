//! Active tool state and coarse annotation undo.

use crate::annotations::AnnotationKind;
use crate::viewport::Viewport;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// The interaction tool bound to the primary pointer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActiveTool {
    #[default]
    None,
    Pan,
    Zoom,
    Windowing,
    Scroll,
    Length,
    Rectangle,
}

impl ActiveTool {
    /// The annotation kind this tool draws, if it draws one.
    pub fn annotation_kind(&self) -> Option<AnnotationKind> {
        match self {
            ActiveTool::Length => Some(AnnotationKind::Length),
            ActiveTool::Rectangle => Some(AnnotationKind::Rectangle),
            _ => None,
        }
    }
}

impl fmt::Display for ActiveTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActiveTool::None => "none",
            ActiveTool::Pan => "pan",
            ActiveTool::Zoom => "zoom",
            ActiveTool::Windowing => "windowing",
            ActiveTool::Scroll => "scroll",
            ActiveTool::Length => "length",
            ActiveTool::Rectangle => "rectangle",
        };
        f.write_str(name)
    }
}

/// Holds the active tool and the order annotation tools were activated in.
///
/// Undo is coarse: it removes every annotation of the most recently
/// activated kind across all loaded images, not the last drawn shape.
#[derive(Debug, Clone, Default)]
pub struct ToolController {
    active: ActiveTool,
    history: Vec<AnnotationKind>,
}

impl ToolController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> ActiveTool {
        self.active
    }

    /// Annotation kinds in activation order, oldest first.
    pub fn history(&self) -> &[AnnotationKind] {
        &self.history
    }

    /// Make `tool` active. Does nothing and returns false while no image
    /// is loaded.
    pub fn activate(&mut self, tool: ActiveTool, image_count: usize) -> bool {
        if image_count == 0 {
            debug!(tool = %tool, "Tool activation ignored, no images loaded");
            return false;
        }
        if let Some(kind) = tool.annotation_kind() {
            self.history.push(kind);
        }
        self.active = tool;
        debug!(tool = %tool, "Tool activated");
        true
    }

    /// Fall back to panning once images are available and nothing is active.
    pub fn ensure_default(&mut self, image_count: usize) {
        if self.active == ActiveTool::None {
            self.activate(ActiveTool::Pan, image_count);
        }
    }

    /// Remove every annotation of the most recently activated kind.
    pub fn undo_last<V: Viewport>(&mut self, viewport: &mut V) -> Option<AnnotationKind> {
        let kind = self.history.pop()?;
        viewport.clear_annotations(kind);
        viewport.refresh();
        info!(kind = %kind, "Annotations of last used kind removed");
        Some(kind)
    }

    /// Remove every annotation of every given kind.
    pub fn clear_all<V: Viewport>(&mut self, viewport: &mut V, kinds: &[AnnotationKind]) {
        for kind in kinds {
            viewport.clear_annotations(*kind);
        }
        viewport.refresh();
        info!(kinds = kinds.len(), "All annotations cleared");
    }

    pub fn reset(&mut self) {
        self.active = ActiveTool::None;
        self.history.clear();
    }
}
