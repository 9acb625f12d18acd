//! Annotation kinds and the geometry captured by measurement tools.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kinds of annotation tracked per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationKind {
    Length,
    Rectangle,
    Angle,
    Probe,
    EllipticalRoi,
}

impl AnnotationKind {
    /// Every tracked kind, in document order.
    pub const ALL: [AnnotationKind; 5] = [
        AnnotationKind::Length,
        AnnotationKind::Rectangle,
        AnnotationKind::Angle,
        AnnotationKind::Probe,
        AnnotationKind::EllipticalRoi,
    ];

    /// Key used in annotation documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Length => "length",
            AnnotationKind::Rectangle => "rectangle",
            AnnotationKind::Angle => "angle",
            AnnotationKind::Probe => "probe",
            AnnotationKind::EllipticalRoi => "ellipticalRoi",
        }
    }

    /// Parse a document key, accepting legacy spellings.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "length" | "lengthData" => Some(AnnotationKind::Length),
            "rectangle" | "rectangleData" => Some(AnnotationKind::Rectangle),
            "angle" | "angleData" => Some(AnnotationKind::Angle),
            "probe" | "probeData" => Some(AnnotationKind::Probe),
            "ellipticalRoi" | "ellipticalRoiData" => Some(AnnotationKind::EllipticalRoi),
            _ => None,
        }
    }

    /// Handles a measurement of this kind must carry.
    pub fn required_handles(&self) -> &'static [&'static str] {
        match self {
            AnnotationKind::Length | AnnotationKind::Rectangle | AnnotationKind::EllipticalRoi => {
                &["start", "end"]
            }
            AnnotationKind::Angle => &["start", "middle", "end"],
            AnnotationKind::Probe => &["end"],
        }
    }
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point handle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct HandlePoint {
    pub x: f64,
    pub y: f64,
}

/// One measurement drawn by a tool on one image.
///
/// Fields other than `handles` are tool bookkeeping (visibility, cached
/// statistics, text box placement) and are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub handles: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Measurement {
    /// A measurement with only point handles.
    pub fn from_points<'a>(points: impl IntoIterator<Item = (&'a str, f64, f64)>) -> Self {
        let handles = points
            .into_iter()
            .map(|(name, x, y)| {
                let mut point = Map::new();
                point.insert("x".to_string(), Value::from(x));
                point.insert("y".to_string(), Value::from(y));
                (name.to_string(), Value::Object(point))
            })
            .collect();

        Self {
            handles,
            extra: Map::new(),
        }
    }

    /// Read a point handle by name.
    pub fn point(&self, name: &str) -> Option<HandlePoint> {
        self.handles
            .get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Check the handles required by `kind` are finite points.
    pub fn validate(&self, kind: AnnotationKind) -> Result<(), String> {
        for name in kind.required_handles() {
            match self.point(name) {
                Some(p) if p.x.is_finite() && p.y.is_finite() => {}
                Some(_) => return Err(format!("{} handle '{}' is not finite", kind, name)),
                None => return Err(format!("{} handle '{}' is missing or not a point", kind, name)),
            }
        }
        Ok(())
    }
}

/// Parse and validate one kind's payload from a document.
pub(crate) fn parse_measurements(
    kind: AnnotationKind,
    payload: &Value,
) -> Result<Vec<Measurement>, String> {
    let measurements: Vec<Measurement> =
        serde_json::from_value(payload.clone()).map_err(|e| format!("{}: {}", kind, e))?;
    for measurement in &measurements {
        measurement.validate(kind)?;
    }
    Ok(measurements)
}
