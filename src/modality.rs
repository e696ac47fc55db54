//! Modality inference for study identifiers.
//!
//! Everything that needs to know whether a study is a cross-sectional DICOM
//! series or a whole-slide pathology image goes through [`derive_modality`].

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{ImagingError, Result};

const PATHOLOGY_MARKER: &str = "WSI_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Modality {
    Dicom,
    Pathology,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Dicom => "dicom",
            Modality::Pathology => "pathology",
        }
    }

    /// Suffix shown next to the activity name on the course page.
    pub fn display_label(&self) -> &'static str {
        match self {
            Modality::Dicom => " (DICOM Study)",
            Modality::Pathology => " (Pathology Slide)",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UID containing `WSI_` anywhere is a pathology slide; anything else is DICOM.
pub fn derive_modality(uid: &str) -> Modality {
    if uid.contains(PATHOLOGY_MARKER) {
        Modality::Pathology
    } else {
        Modality::Dicom
    }
}

/// Accepts dotted numeric DICOM UIDs and `WSI_`-prefixed slide identifiers.
pub fn validate_study_uid(uid: &str) -> Result<()> {
    let dotted_numeric = !uid.is_empty() && uid.chars().all(|c| c.is_ascii_digit() || c == '.');
    if dotted_numeric || uid.starts_with(PATHOLOGY_MARKER) {
        Ok(())
    } else {
        Err(ImagingError::InvalidStudyUid(uid.to_string()))
    }
}

/// Launch parameters for the unified viewer frame.
#[derive(Debug, Clone)]
pub struct ViewerLaunch {
    pub modality: Modality,
    pub study_uid: String,
    pub course_module_id: i64,
}

impl ViewerLaunch {
    pub fn new(study_uid: impl Into<String>, course_module_id: i64) -> Self {
        let study_uid = study_uid.into();
        Self {
            modality: derive_modality(&study_uid),
            study_uid,
            course_module_id,
        }
    }

    pub fn url(&self, viewer_base: &str) -> Result<Url> {
        let mut url = Url::parse(viewer_base)
            .map_err(|err| ImagingError::Config(format!("invalid viewer url '{viewer_base}': {err}")))?;
        url.query_pairs_mut()
            .append_pair("type", self.modality.as_str())
            .append_pair("study", &self.study_uid)
            .append_pair("cmid", &self.course_module_id.to_string());
        Ok(url)
    }
}
