//! Portable annotation document.
//!
//! The document is a bare JSON array of records, one per annotated image:
//!
//! ```json
//! [
//!   {
//!     "studyId": "1.2.840...",
//!     "seriesId": "1.2.840...",
//!     "sopInstanceUid": "1.2.840...",
//!     "annotations": { "length": [ ... ], "rectangle": null }
//!   }
//! ]
//! ```
//!
//! Parsing is the validation step for import: anything that is not a
//! sequence of records keyed by a non-empty `sopInstanceUid` is rejected
//! before the viewer is touched. Geometry payloads stay raw JSON here and
//! are checked record by record during import.

use super::AnnotationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Annotations of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationRecord {
    #[serde(alias = "studyID", default)]
    pub study_id: String,

    #[serde(alias = "seriesID", default)]
    pub series_id: String,

    #[serde(alias = "SOPInstanceUID")]
    pub sop_instance_uid: String,

    /// Kind key to measurement list, or null when that kind is absent
    #[serde(default)]
    pub annotations: Map<String, Value>,
}

/// Ordered sequence of annotation records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationDocument {
    records: Vec<AnnotationRecord>,
}

impl AnnotationDocument {
    pub fn new(records: Vec<AnnotationRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[AnnotationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<AnnotationRecord> {
        self.records
    }

    /// Parse and validate a document.
    pub fn from_json_str(json: &str) -> Result<Self, AnnotationError> {
        let document: AnnotationDocument = serde_json::from_str(json)
            .map_err(|e| AnnotationError::Validation(e.to_string()))?;
        document.check()?;
        Ok(document)
    }

    /// Read and validate a document file.
    pub fn read_from_path(path: &Path) -> Result<Self, AnnotationError> {
        let file = File::open(path).map_err(|source| AnnotationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);

        let document: AnnotationDocument = serde_json::from_reader(reader).map_err(|e| {
            AnnotationError::Validation(format!("{}: {}", path.display(), e))
        })?;
        document.check()?;
        Ok(document)
    }

    pub fn to_json_string(&self, pretty: bool) -> Result<String, AnnotationError> {
        let result = if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        };
        result.map_err(AnnotationError::Serialize)
    }

    /// Write the document to a file.
    pub fn write_to_path(&self, path: &Path, pretty: bool) -> Result<(), AnnotationError> {
        let file = File::create(path).map_err(|source| AnnotationError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        let writer = BufWriter::new(file);

        let result = if pretty {
            serde_json::to_writer_pretty(writer, self)
        } else {
            serde_json::to_writer(writer, self)
        };
        result.map_err(AnnotationError::Serialize)
    }

    fn check(&self) -> Result<(), AnnotationError> {
        for (index, record) in self.records.iter().enumerate() {
            if record.sop_instance_uid.trim().is_empty() {
                return Err(AnnotationError::Validation(format!(
                    "record {} has an empty sopInstanceUid",
                    index
                )));
            }
        }
        Ok(())
    }
}
