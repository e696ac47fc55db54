//! Study metadata as returned by the archive and as handed to callers.

use serde::{Deserialize, Serialize};

use crate::modality::{derive_modality, Modality};

const NO_DESCRIPTION: &str = "No description";
const UNKNOWN_PATIENT: &str = "Unknown";

/// Normalized catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StudyRecord {
    /// Archive-local identifier.
    pub id: String,
    /// StudyInstanceUID; unique across the catalog.
    pub uid: String,
    pub modality: Modality,
    pub description: String,
    pub acquisition_date: String,
    pub patient_label: String,
}

impl StudyRecord {
    /// Builds a record from a detail response. Returns `None` when the response
    /// lacks a usable `StudyInstanceUID`.
    pub fn from_detail(archive_id: &str, detail: StudyDetail) -> Option<Self> {
        let uid = detail
            .main_dicom_tags
            .study_instance_uid
            .map(|uid| uid.trim().to_string())
            .filter(|uid| !uid.is_empty())?;

        Some(Self {
            id: archive_id.to_string(),
            modality: derive_modality(&uid),
            uid,
            description: detail
                .main_dicom_tags
                .study_description
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| NO_DESCRIPTION.to_string()),
            acquisition_date: detail.main_dicom_tags.study_date.unwrap_or_default(),
            patient_label: detail
                .patient_main_dicom_tags
                .patient_name
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| UNKNOWN_PATIENT.to_string()),
        })
    }

    /// Label used by the study selector in the authoring form.
    pub fn option_label(&self) -> String {
        format!("{} ({})", self.description, self.patient_label)
    }
}

/// `GET {endpoint}/studies/{id}` body. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudyDetail {
    #[serde(rename = "MainDicomTags", default)]
    pub main_dicom_tags: StudyTags,
    #[serde(rename = "PatientMainDicomTags", default)]
    pub patient_main_dicom_tags: PatientTags,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StudyTags {
    #[serde(rename = "StudyInstanceUID")]
    pub study_instance_uid: Option<String>,
    #[serde(rename = "StudyDescription")]
    pub study_description: Option<String>,
    #[serde(rename = "StudyDate")]
    pub study_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatientTags {
    #[serde(rename = "PatientName")]
    pub patient_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn detail(json: &str) -> StudyDetail {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn full_detail_normalizes() {
        let record = StudyRecord::from_detail(
            "abc-1",
            detail(
                r#"{
                    "ID": "abc-1",
                    "MainDicomTags": {
                        "StudyInstanceUID": "1.2.840.113619.2.55",
                        "StudyDescription": "CT CHEST",
                        "StudyDate": "20240115"
                    },
                    "PatientMainDicomTags": {"PatientName": "DOE^JANE"}
                }"#,
            ),
        )
        .unwrap();

        assert_eq!(
            record,
            StudyRecord {
                id: "abc-1".into(),
                uid: "1.2.840.113619.2.55".into(),
                modality: Modality::Dicom,
                description: "CT CHEST".into(),
                acquisition_date: "20240115".into(),
                patient_label: "DOE^JANE".into(),
            }
        );
        assert_eq!(record.option_label(), "CT CHEST (DOE^JANE)");
    }

    #[test]
    fn optional_tags_fall_back() {
        let record = StudyRecord::from_detail(
            "slide",
            detail(r#"{"MainDicomTags": {"StudyInstanceUID": "WSI_0042"}}"#),
        )
        .unwrap();

        assert_eq!(record.modality, Modality::Pathology);
        assert_eq!(record.description, "No description");
        assert_eq!(record.acquisition_date, "");
        assert_eq!(record.patient_label, "Unknown");
    }

    #[test]
    fn missing_uid_is_dropped() {
        assert!(StudyRecord::from_detail("x", detail(r#"{"MainDicomTags": {}}"#)).is_none());
        assert!(StudyRecord::from_detail("x", detail("{}")).is_none());
        assert!(StudyRecord::from_detail(
            "x",
            detail(r#"{"MainDicomTags": {"StudyInstanceUID": "  "}}"#)
        )
        .is_none());
    }
}
