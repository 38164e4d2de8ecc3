//! Header-field extraction for admission: a side read of the stored object
//! that never touches the bytes written to the scratch file. Runs on a
//! blocking thread since `dicom-object` parsing is synchronous.

use std::path::PathBuf;

use dicom_dictionary_std::tags;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("I/O error reading stored object: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse DICOM header: {0}")]
    Parse(#[from] dicom_object::ReadError),
    #[error("failed to read required element {0}: {1}")]
    Element(&'static str, String),
    #[error("blocking task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The small, enumerated projection Admit and the forwarding rule need,
/// read straight off the object's dataset and file meta group.
pub struct ExtractedMetadata {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub modality: Option<String>,
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
}

/// Parses the object at `path` off the async runtime and extracts the
/// fields Admit needs. Does not mutate or re-encode anything; the scratch
/// file on disk is untouched.
pub async fn extract(path: PathBuf) -> Result<ExtractedMetadata, MetadataError> {
    tokio::task::spawn_blocking(move || extract_blocking(&path)).await?
}

fn extract_blocking(path: &std::path::Path) -> Result<ExtractedMetadata, MetadataError> {
    let obj = dicom_object::open_file(path)?;

    let required = |tag, name: &'static str| -> Result<String, MetadataError> {
        obj.element(tag)
            .map_err(|e| MetadataError::Element(name, e.to_string()))?
            .to_str()
            .map(|s| s.trim_end_matches('\0').to_string())
            .map_err(|e| MetadataError::Element(name, e.to_string()))
    };

    let optional = |tag| -> Option<String> {
        obj.element_opt(tag)
            .ok()
            .flatten()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches('\0').to_string())
            .filter(|s| !s.is_empty())
    };

    Ok(ExtractedMetadata {
        study_uid: required(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
        series_uid: required(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
        sop_instance_uid: required(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
        sop_class_uid: required(tags::SOP_CLASS_UID, "SOPClassUID")?,
        transfer_syntax_uid: obj.meta().transfer_syntax().trim_end_matches('\0').to_string(),
        modality: optional(tags::MODALITY),
        patient_id: optional(tags::PATIENT_ID),
        accession_number: optional(tags::ACCESSION_NUMBER),
    })
}
