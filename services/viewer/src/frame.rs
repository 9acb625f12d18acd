//! Frame model and the JSON frame descriptor format.
//!
//! A frame is one decoded imaging unit. Only the identity and ordering
//! attributes are modelled here; pixel data is handled by the render
//! surface and never passes through the viewer core.

use serde::{Deserialize, Deserializer, Serialize};

/// Opaque key used to fetch a frame from a [`FrameStore`](crate::FrameStore)
/// and to address its tool state on the render surface.
pub type ImageId = String;

/// One decoded imaging unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Store key this frame was fetched with
    pub image_identity: ImageId,

    /// Study instance UID
    pub study_id: String,

    /// Series instance UID
    pub series_id: String,

    /// Series number, used to order series within the study
    pub series_number: Option<i32>,

    /// Instance number, used to order images within a series
    pub instance_number: Option<i32>,

    /// SOP instance UID; stable across re-fetches, keys annotations
    pub sop_instance_uid: String,

    /// Study description
    pub study_description: Option<String>,

    /// Series description
    pub series_description: Option<String>,
}

impl Frame {
    /// Build a frame from a parsed descriptor.
    pub fn from_descriptor(identity: impl Into<ImageId>, descriptor: FrameDescriptor) -> Self {
        Self {
            image_identity: identity.into(),
            study_id: descriptor.study_instance_uid,
            series_id: descriptor.series_instance_uid,
            series_number: descriptor.series_number,
            instance_number: descriptor.instance_number,
            sop_instance_uid: descriptor.sop_instance_uid,
            study_description: descriptor.study_description,
            series_description: descriptor.series_description,
        }
    }
}

/// Errors raised while reading a frame descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Malformed frame descriptor: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame descriptor is missing {0}")]
    MissingField(&'static str),
}

/// On-disk description of a frame's identity attributes.
///
/// Keys are camelCase; the DICOM keywords are accepted as aliases.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDescriptor {
    #[serde(alias = "StudyInstanceUID", default)]
    pub study_instance_uid: String,

    #[serde(alias = "SeriesInstanceUID", default)]
    pub series_instance_uid: String,

    #[serde(alias = "SeriesNumber", default, deserialize_with = "integer_string")]
    pub series_number: Option<i32>,

    #[serde(alias = "InstanceNumber", default, deserialize_with = "integer_string")]
    pub instance_number: Option<i32>,

    #[serde(alias = "SOPInstanceUID", default)]
    pub sop_instance_uid: String,

    #[serde(alias = "StudyDescription", default)]
    pub study_description: Option<String>,

    #[serde(alias = "SeriesDescription", default)]
    pub series_description: Option<String>,
}

impl FrameDescriptor {
    /// Parse and check a descriptor from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let descriptor: FrameDescriptor = serde_json::from_slice(bytes)?;
        descriptor.check()?;
        Ok(descriptor)
    }

    fn check(&self) -> Result<(), DescriptorError> {
        if self.sop_instance_uid.trim().is_empty() {
            return Err(DescriptorError::MissingField("sopInstanceUid"));
        }
        if self.study_instance_uid.trim().is_empty() {
            return Err(DescriptorError::MissingField("studyInstanceUid"));
        }
        if self.series_instance_uid.trim().is_empty() {
            return Err(DescriptorError::MissingField("seriesInstanceUid"));
        }
        Ok(())
    }
}

/// Accepts a JSON integer or a DICOM IS string ("  12 ").
fn integer_string<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => i32::try_from(n)
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("integer {} out of range", n))),
        Some(Raw::Text(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i32>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("'{}' is not an integer string", s)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_camel_case() {
        let json = br#"{
            "studyInstanceUid": "1.2.3",
            "seriesInstanceUid": "1.2.3.4",
            "seriesNumber": 2,
            "instanceNumber": 7,
            "sopInstanceUid": "1.2.3.4.7",
            "seriesDescription": "AX T1"
        }"#;

        let descriptor = FrameDescriptor::from_slice(json).unwrap();
        let frame = Frame::from_descriptor("img-7.json", descriptor);

        assert_eq!(frame.image_identity, "img-7.json");
        assert_eq!(frame.series_number, Some(2));
        assert_eq!(frame.instance_number, Some(7));
        assert_eq!(frame.series_description.as_deref(), Some("AX T1"));
        assert_eq!(frame.study_description, None);
    }

    #[test]
    fn test_descriptor_dicom_keywords_and_is_strings() {
        let json = br#"{
            "StudyInstanceUID": "1.2",
            "SeriesInstanceUID": "1.2.5",
            "SeriesNumber": " 5 ",
            "InstanceNumber": "",
            "SOPInstanceUID": "1.2.5.1"
        }"#;

        let descriptor = FrameDescriptor::from_slice(json).unwrap();
        assert_eq!(descriptor.series_number, Some(5));
        assert_eq!(descriptor.instance_number, None);
    }

    #[test]
    fn test_descriptor_rejects_bad_integer() {
        let json = br#"{
            "studyInstanceUid": "1",
            "seriesInstanceUid": "1.1",
            "sopInstanceUid": "1.1.1",
            "instanceNumber": "twelve"
        }"#;

        assert!(matches!(
            FrameDescriptor::from_slice(json),
            Err(DescriptorError::Malformed(_))
        ));
    }

    #[test]
    fn test_descriptor_requires_sop_instance_uid() {
        let json = br#"{"studyInstanceUid": "1", "seriesInstanceUid": "1.1"}"#;

        assert!(matches!(
            FrameDescriptor::from_slice(json),
            Err(DescriptorError::MissingField("sopInstanceUid"))
        ));
    }
}
