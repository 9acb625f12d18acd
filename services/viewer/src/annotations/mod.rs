//! Export and import of per-image annotations.
//!
//! Annotations live in the viewport's tool state, keyed by image identity.
//! Export walks every image of every series and collects them into an
//! [`AnnotationDocument`] keyed by SOP instance UID, which survives
//! re-fetching. Import walks the study again and adds whatever the document
//! holds for each image to what the image already carries. Both walks move the cursor and put it
//! back where it was before returning.

mod document;
mod geometry;

pub use document::{AnnotationDocument, AnnotationRecord};
pub use geometry::{AnnotationKind, HandlePoint, Measurement};

use crate::cursor::{TraversalCursor, TraversalError};
use crate::series::Series;
use crate::viewport::Viewport;
use geometry::parse_measurements;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors surfaced by annotation export and import.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("Images are still loading; retry once loading has finished")]
    Busy,

    #[error("No images loaded")]
    EmptyState,

    #[error("Invalid annotation document: {0}")]
    Validation(String),

    #[error("Failed to read annotation document {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write annotation document {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize annotation document: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Traversal failed: {0}")]
    Traversal(#[from] TraversalError),
}

/// A record that was imported only partly, or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportWarning {
    /// Position of the record in the document
    pub record: usize,
    pub sop_instance_uid: String,
    pub message: String,
    /// Whether the whole record was skipped
    pub skipped: bool,
}

impl fmt::Display for ImportWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} ({}): {}{}",
            self.record,
            self.sop_instance_uid,
            self.message,
            if self.skipped { " [skipped]" } else { "" }
        )
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Records in the document
    pub records: usize,
    /// Distinct records that matched a loaded image
    pub records_applied: usize,
    /// Images that received at least one new measurement
    pub images_updated: usize,
    /// Measurements appended across every image
    pub measurements_added: usize,
    /// SOP instance UIDs in the document with no loaded image
    pub unmatched: Vec<String>,
    /// Records superseded by a later record with the same UID
    pub duplicates: usize,
    pub warnings: Vec<ImportWarning>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn skipped_records(&self) -> usize {
        self.warnings.iter().filter(|w| w.skipped).count()
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Imported {} of {} record(s), {} measurement(s) added to {} image(s)",
            self.records_applied, self.records, self.measurements_added, self.images_updated
        )?;
        if !self.unmatched.is_empty() {
            writeln!(f, "  {} record(s) matched no loaded image", self.unmatched.len())?;
        }
        if self.duplicates > 0 {
            writeln!(f, "  {} duplicate record(s) superseded", self.duplicates)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning)?;
        }
        Ok(())
    }
}

type ParsedAnnotations = BTreeMap<AnnotationKind, Vec<Measurement>>;

/// Exports and imports annotations for the tracked kinds.
#[derive(Debug, Clone)]
pub struct AnnotationStore {
    kinds: Vec<AnnotationKind>,
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new(AnnotationKind::ALL.to_vec())
    }
}

impl AnnotationStore {
    pub fn new(kinds: Vec<AnnotationKind>) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &[AnnotationKind] {
        &self.kinds
    }

    /// Collect the annotations of every image into a document.
    ///
    /// Only images with at least one tracked kind present get a record.
    #[instrument(skip_all, fields(series = series.len()))]
    pub fn export_all<V: Viewport>(
        &self,
        series: &[Series],
        cursor: &mut TraversalCursor<V>,
    ) -> Result<AnnotationDocument, AnnotationError> {
        let saved = cursor.save_state();
        let mut records = Vec::new();

        for (series_index, current) in series.iter().enumerate() {
            cursor.select_series(series, series_index)?;

            for (image_index, image) in current.images().iter().enumerate() {
                cursor.seek(image_index)?;

                let mut annotations = Map::new();
                let mut present = false;
                for kind in &self.kinds {
                    let payload = match cursor.viewport().annotations(&image.image_identity, *kind) {
                        Some(measurements) if !measurements.is_empty() => {
                            present = true;
                            serde_json::to_value(measurements).map_err(AnnotationError::Serialize)?
                        }
                        _ => Value::Null,
                    };
                    annotations.insert(kind.as_str().to_string(), payload);
                }

                if present {
                    records.push(AnnotationRecord {
                        study_id: image.study_id.clone(),
                        series_id: image.series_id.clone(),
                        sop_instance_uid: image.sop_instance_uid.clone(),
                        annotations,
                    });
                }
            }
        }

        cursor.restore_state(series, saved)?;

        info!(
            records = records.len(),
            images = series.iter().map(Series::image_count).sum::<usize>(),
            "Annotations exported"
        );
        Ok(AnnotationDocument::new(records))
    }

    /// Add a document's annotations to the loaded images.
    ///
    /// Images whose UID is not in the document are left untouched. Within a
    /// matched image, imported measurements are appended to the existing
    /// ones of their kind, skipping any the image already carries, so
    /// importing the same document twice adds nothing the second time.
    #[instrument(skip_all, fields(records = document.len()))]
    pub fn import_all<V: Viewport>(
        &self,
        document: &AnnotationDocument,
        series: &[Series],
        cursor: &mut TraversalCursor<V>,
    ) -> Result<ImportReport, AnnotationError> {
        if series.iter().all(Series::is_empty) {
            return Err(AnnotationError::EmptyState);
        }

        let mut report = ImportReport {
            records: document.len(),
            ..ImportReport::default()
        };
        let by_uid = self.index_records(document, &mut report);

        let saved = cursor.save_state();
        let mut matched = HashSet::new();

        for (series_index, current) in series.iter().enumerate() {
            cursor.select_series(series, series_index)?;

            for (image_index, image) in current.images().iter().enumerate() {
                cursor.seek(image_index)?;

                let Some(parsed) = by_uid.get(image.sop_instance_uid.as_str()) else {
                    continue;
                };
                matched.insert(image.sop_instance_uid.as_str());

                let mut added = 0;
                for (kind, measurements) in parsed {
                    let mut merged = cursor
                        .viewport()
                        .annotations(&image.image_identity, *kind)
                        .unwrap_or_default();
                    let existing = merged.len();
                    for measurement in measurements {
                        if !merged[..existing].contains(measurement) {
                            merged.push(measurement.clone());
                        }
                    }
                    if merged.len() > existing {
                        added += merged.len() - existing;
                        cursor
                            .viewport_mut()
                            .set_annotations(&image.image_identity, *kind, merged);
                    }
                }
                if added == 0 {
                    continue;
                }
                report.images_updated += 1;
                report.measurements_added += added;
                debug!(
                    sop_instance_uid = %image.sop_instance_uid,
                    added,
                    "Annotations attached"
                );
            }
        }

        cursor.restore_state(series, saved)?;
        cursor.viewport_mut().refresh();

        report.records_applied = matched.len();
        let mut unmatched: Vec<String> = by_uid
            .keys()
            .filter(|uid| !matched.contains(*uid))
            .map(|uid| uid.to_string())
            .collect();
        unmatched.sort();
        report.unmatched = unmatched;

        info!(
            records = report.records,
            applied = report.records_applied,
            images_updated = report.images_updated,
            unmatched = report.unmatched.len(),
            warnings = report.warnings.len(),
            "Annotations imported"
        );
        Ok(report)
    }

    /// Parse every record's payloads and index them by UID. Later records
    /// win over earlier ones; malformed records are skipped with a warning.
    fn index_records<'d>(
        &self,
        document: &'d AnnotationDocument,
        report: &mut ImportReport,
    ) -> HashMap<&'d str, ParsedAnnotations> {
        let mut by_uid = HashMap::new();

        for (index, record) in document.records().iter().enumerate() {
            match self.parse_record(index, record, &mut report.warnings) {
                Some(parsed) => {
                    if by_uid
                        .insert(record.sop_instance_uid.as_str(), parsed)
                        .is_some()
                    {
                        report.duplicates += 1;
                    }
                }
                None => {
                    if let Some(last) = report.warnings.last() {
                        warn!(warning = %last, "Annotation record skipped");
                    }
                }
            }
        }

        by_uid
    }

    fn parse_record(
        &self,
        index: usize,
        record: &AnnotationRecord,
        warnings: &mut Vec<ImportWarning>,
    ) -> Option<ParsedAnnotations> {
        let mut parsed = ParsedAnnotations::new();
        let mut seen = HashSet::new();

        for (key, payload) in &record.annotations {
            let Some(kind) = AnnotationKind::from_key(key) else {
                warn!(
                    record = index,
                    sop_instance_uid = %record.sop_instance_uid,
                    kind = %key,
                    "Unknown annotation kind ignored"
                );
                warnings.push(ImportWarning {
                    record: index,
                    sop_instance_uid: record.sop_instance_uid.clone(),
                    message: format!("unknown annotation kind '{}' ignored", key),
                    skipped: false,
                });
                continue;
            };
            if !self.kinds.contains(&kind) || payload.is_null() {
                continue;
            }
            // The first key for a kind wins; "length" sorts before "lengthData"
            if !seen.insert(kind) {
                warn!(
                    record = index,
                    sop_instance_uid = %record.sop_instance_uid,
                    kind = %kind,
                    key = %key,
                    "Annotation kind given more than once"
                );
                warnings.push(ImportWarning {
                    record: index,
                    sop_instance_uid: record.sop_instance_uid.clone(),
                    message: format!("annotation kind '{}' given more than once; '{}' ignored", kind, key),
                    skipped: false,
                });
                continue;
            }

            match parse_measurements(kind, payload) {
                Ok(measurements) if measurements.is_empty() => {}
                Ok(measurements) => {
                    parsed.insert(kind, measurements);
                }
                Err(message) => {
                    warnings.push(ImportWarning {
                        record: index,
                        sop_instance_uid: record.sop_instance_uid.clone(),
                        message,
                        skipped: true,
                    });
                    return None;
                }
            }
        }

        Some(parsed)
    }
}
