use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::Deserializer, Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::config::Tenancy;
use crate::sequence::{CaseService, LabId, Partition};
use crate::store::PgCaseStore;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub cases: Arc<CaseService<PgCaseStore>>,
    pub tenancy: Tenancy,
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

/* -------------------------
   Case Models
--------------------------*/

/// Descriptive payload of a case. The sequencing core never looks inside.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CaseDetails {
    pub patient_name: String,
    pub patient_age: Option<i32>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub referring_doctor: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

const GENDERS: [&str; 3] = ["male", "female", "other"];

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl CaseDetails {
    /// Trim text fields, validate ranges and normalize categories to a sorted set.
    pub fn normalized(self) -> Result<Self, String> {
        let patient_name = self.patient_name.trim().to_string();
        if patient_name.is_empty() {
            return Err("patient_name is required".into());
        }
        if patient_name.len() > 200 {
            return Err("patient_name is too long (max 200)".into());
        }

        if let Some(age) = self.patient_age {
            if !(0..=150).contains(&age) {
                return Err("patient_age must be between 0 and 150".into());
            }
        }

        let gender = trimmed(self.gender).map(|g| g.to_lowercase());
        if let Some(g) = gender.as_deref() {
            if !GENDERS.contains(&g) {
                return Err("gender must be male, female or other".into());
            }
        }

        let categories: BTreeSet<String> = self
            .categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            patient_name,
            patient_age: self.patient_age,
            gender,
            phone: trimmed(self.phone),
            referring_doctor: trimmed(self.referring_doctor),
            notes: trimmed(self.notes),
            categories: categories.into_iter().collect(),
        })
    }
}

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Only called when the field is present: null => Some(None), value => Some(Some(v)).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

/// Field-wise edit of [`CaseDetails`]. A missing field keeps the stored
/// value; an explicit `null` clears it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CaseDetailsPatch {
    pub patient_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub patient_age: Option<Option<i32>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub gender: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub referring_doctor: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
    pub categories: Option<Vec<String>>,
}

impl CaseDetailsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge_into(self, existing: CaseDetails) -> CaseDetails {
        CaseDetails {
            patient_name: self.patient_name.unwrap_or(existing.patient_name),
            patient_age: self.patient_age.unwrap_or(existing.patient_age),
            gender: self.gender.unwrap_or(existing.gender),
            phone: self.phone.unwrap_or(existing.phone),
            referring_doctor: self.referring_doctor.unwrap_or(existing.referring_doctor),
            notes: self.notes.unwrap_or(existing.notes),
            categories: self.categories.unwrap_or(existing.categories),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct CaseRecord {
    pub case_id: Uuid,
    pub lab_id: LabId,
    pub visit_date: NaiveDate,
    pub daily_id: i32,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub details: CaseDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn partition(&self) -> Partition {
        Partition::new(self.lab_id, self.visit_date)
    }
}

#[derive(Debug, Clone)]
pub struct NewCase {
    pub partition: Partition,
    pub daily_id: i32,
    pub details: CaseDetails,
}

/// Partial update of one row. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct CasePatch {
    pub visit_date: Option<NaiveDate>,
    pub daily_id: Option<i32>,
    pub details: Option<CaseDetails>,
}

impl CasePatch {
    pub fn number(daily_id: i32) -> Self {
        Self {
            daily_id: Some(daily_id),
            ..Self::default()
        }
    }

    pub fn relocate(visit_date: NaiveDate, daily_id: i32) -> Self {
        Self {
            visit_date: Some(visit_date),
            daily_id: Some(daily_id),
            details: None,
        }
    }

    pub fn details(details: CaseDetails) -> Self {
        Self {
            details: Some(details),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, record: &mut CaseRecord) {
        if let Some(visit_date) = self.visit_date {
            record.visit_date = visit_date;
        }
        if let Some(daily_id) = self.daily_id {
            record.daily_id = daily_id;
        }
        if let Some(details) = &self.details {
            record.details = details.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_categories_as_a_set() {
        let details = CaseDetails {
            patient_name: "  Jane Roe ".into(),
            gender: Some(" Female".into()),
            phone: Some("   ".into()),
            categories: vec!["CBC".into(), " lipids".into(), "CBC".into(), "".into()],
            ..CaseDetails::default()
        }
        .normalized()
        .unwrap();

        assert_eq!(details.patient_name, "Jane Roe");
        assert_eq!(details.gender.as_deref(), Some("female"));
        assert_eq!(details.phone, None);
        assert_eq!(details.categories, vec!["CBC".to_string(), "lipids".to_string()]);
    }

    #[test]
    fn rejects_bad_details() {
        let missing_name = CaseDetails::default().normalized();
        assert!(missing_name.is_err());

        let bad_age = CaseDetails {
            patient_name: "A".into(),
            patient_age: Some(200),
            ..CaseDetails::default()
        }
        .normalized();
        assert!(bad_age.is_err());

        let bad_gender = CaseDetails {
            patient_name: "A".into(),
            gender: Some("robot".into()),
            ..CaseDetails::default()
        }
        .normalized();
        assert!(bad_gender.is_err());
    }

    #[test]
    fn patch_distinguishes_null_from_missing() {
        let patch: CaseDetailsPatch =
            serde_json::from_str(r#"{"phone": null, "notes": "fasting"}"#).unwrap();
        assert!(!patch.is_empty());

        let existing = CaseDetails {
            patient_name: "Jane Roe".into(),
            phone: Some("555-0100".into()),
            referring_doctor: Some("Dr. Lee".into()),
            ..CaseDetails::default()
        };
        let merged = patch.merge_into(existing);

        assert_eq!(merged.phone, None);
        assert_eq!(merged.notes.as_deref(), Some("fasting"));
        assert_eq!(merged.referring_doctor.as_deref(), Some("Dr. Lee"));
        assert_eq!(merged.patient_name, "Jane Roe");
    }
}
