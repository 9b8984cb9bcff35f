//! Study domain model.
//!
//! A study is one imaging case tracked by the runner, mirroring a record in
//! the external imaging archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StudyId;

/// An imaging study known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Study {
    /// Store id.
    pub id: StudyId,
    /// Identifier of the study in the imaging archive.
    pub archive_id: String,
    /// Classified study type (e.g. `Frontal_CXR`); `None` until classified.
    pub study_type: Option<String>,
    /// DICOM modality reported by the archive.
    pub modality: Option<String>,
    /// DICOM patient id.
    pub patient_id: Option<String>,
    /// DICOM study instance UID.
    pub study_uid: Option<String>,
    /// Excluded from evaluation.
    pub failed: bool,
    /// Set once the study has been purged from the archive.
    pub deleted_from_archive: bool,
    /// Arrival time; selection is oldest first.
    pub date_added: DateTime<Utc>,
}

impl Study {
    /// Whether classification has assigned a type yet.
    pub const fn is_classified(&self) -> bool {
        self.study_type.is_some()
    }

    /// Whether a model accepting `input_type` may evaluate this study.
    pub fn accepts(&self, input_type: &str) -> bool {
        !self.failed
            && !self.deleted_from_archive
            && self.study_type.as_deref() == Some(input_type)
    }
}

/// Descriptive tags the archive reports for a study.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyMetadata {
    /// DICOM modality, e.g. `CT`.
    pub modality: Option<String>,
    /// DICOM patient id.
    pub patient_id: Option<String>,
    /// DICOM study instance UID.
    pub study_uid: Option<String>,
}

/// Values written when a study is first seen in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStudy {
    /// Archive-side id.
    pub archive_id: String,
    /// Tags read from the archive.
    pub metadata: StudyMetadata,
}

impl NewStudy {
    /// Study with empty metadata.
    pub fn new(archive_id: impl Into<String>) -> Self {
        Self {
            archive_id: archive_id.into(),
            metadata: StudyMetadata::default(),
        }
    }

    /// Set the modality.
    pub fn with_modality(mut self, modality: impl Into<String>) -> Self {
        self.metadata.modality = Some(modality.into());
        self
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: StudyMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}
