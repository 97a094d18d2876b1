use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BursaryError, BursaryResult};
use crate::status::{Actor, ApplicationStatus};

pub const ID_SEQUENCE_WIDTH: usize = 5;
pub const MAX_ID_SEQUENCE: u64 = 9_999_999_999;
const MAX_TEXT_LEN: usize = 200;
const MAX_NOTE_LEN: usize = 2_000;

/// `{jurisdiction}/{year}/{zero-padded sequence}`, e.g. `KIB/2026/00042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(String);

impl ApplicationId {
    pub fn compose(jurisdiction: &str, year: i32, sequence: u64) -> Self {
        ApplicationId(format!(
            "{jurisdiction}/{year}/{sequence:0width$}",
            width = ID_SEQUENCE_WIDTH
        ))
    }

    pub fn parse(value: &str) -> BursaryResult<Self> {
        let value = value.trim();
        let parts: Vec<&str> = value.split('/').collect();
        let [jurisdiction, year, sequence] = parts.as_slice() else {
            return Err(BursaryError::validation(
                "id",
                "expected jurisdiction/year/sequence",
            ));
        };
        validate_jurisdiction(jurisdiction)?;
        if year.len() != 4 || !year.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(BursaryError::validation("id", "year must be four digits"));
        }
        if sequence.is_empty() || !sequence.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(BursaryError::validation("id", "sequence must be numeric"));
        }
        let year: i32 = year
            .parse()
            .map_err(|_| BursaryError::validation("id", "year must be four digits"))?;
        let sequence = sequence
            .parse::<u64>()
            .ok()
            .filter(|sequence| (1..=MAX_ID_SEQUENCE).contains(sequence))
            .ok_or_else(|| {
                BursaryError::validation("id", "sequence must be between 1 and 9999999999")
            })?;
        // `KIB/2026/1` and `KIB/2026/00001` name the same application.
        Ok(ApplicationId::compose(jurisdiction, year, sequence))
    }

    pub fn sequence(&self) -> Option<u64> {
        self.0.rsplit('/').next()?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

pub fn validate_jurisdiction(code: &str) -> BursaryResult<()> {
    let len_ok = (2..=8).contains(&code.len());
    let chars_ok = code
        .chars()
        .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit());
    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(BursaryError::validation(
            "jurisdiction",
            "must be 2-8 uppercase letters or digits",
        ))
    }
}

/// Where a record came from. Set once at creation and never inferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOrigin {
    #[default]
    Real,
    Seed,
    Test,
}

impl RecordOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordOrigin::Real => "real",
            RecordOrigin::Seed => "seed",
            RecordOrigin::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalDetails {
    pub full_name: String,
    pub id_number: String,
    pub gender: String,
    pub date_of_birth: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationDetails {
    pub sub_region: String,
    pub ward: String,
    pub village: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EducationDetails {
    pub institution: String,
    pub admission_number: String,
    pub course: String,
    pub year_of_study: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinancialDetails {
    pub total_fees: u64,
    pub fees_paid: u64,
    pub other_support: u64,
}

impl FinancialDetails {
    pub fn fee_balance(&self) -> u64 {
        self.total_fees
            .saturating_sub(self.fees_paid)
            .saturating_sub(self.other_support)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamilyDetails {
    pub guardian_name: String,
    pub guardian_phone: String,
    pub parental_status: String,
    pub siblings_in_school: u32,
    pub household_income: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardMetadata {
    pub amount: u64,
    pub serial_number: u64,
    pub awarded_at: DateTime<Utc>,
    pub awarded_by: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionMetadata {
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
    pub rejected_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: ApplicationId,
    pub status: ApplicationStatus,
    #[serde(default)]
    pub origin: RecordOrigin,
    pub requested_amount: u64,
    #[serde(default)]
    pub is_final_submission: bool,
    #[serde(default)]
    pub personal: PersonalDetails,
    #[serde(default)]
    pub location: LocationDetails,
    #[serde(default)]
    pub education: EducationDetails,
    #[serde(default)]
    pub financial: FinancialDetails,
    #[serde(default)]
    pub family: FamilyDetails,
    #[serde(default)]
    pub award: Option<AwardMetadata>,
    #[serde(default)]
    pub rejection: Option<RejectionMetadata>,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationRecord {
    pub fn awarded_amount(&self) -> Option<u64> {
        match self.status {
            ApplicationStatus::Awarded => self.award.as_ref().map(|award| award.amount),
            _ => None,
        }
    }

    pub fn is_awarded(&self) -> bool {
        self.status == ApplicationStatus::Awarded
    }

    pub fn validate(&self) -> BursaryResult<()> {
        if self.personal.full_name.is_empty() {
            return Err(BursaryError::validation("personal.full_name", "is required"));
        }
        if self.personal.id_number.is_empty() {
            return Err(BursaryError::validation("personal.id_number", "is required"));
        }
        if self.is_awarded() != self.award.is_some() {
            return Err(BursaryError::validation(
                "award",
                "must be present exactly when the status is Awarded",
            ));
        }
        if self.rejection.is_some() && self.status != ApplicationStatus::Rejected {
            return Err(BursaryError::validation(
                "rejection",
                "only allowed on rejected applications",
            ));
        }
        Ok(())
    }
}

/// Applicant submission. A missing id is assigned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationDraft {
    pub id: Option<String>,
    pub origin: RecordOrigin,
    pub status: Option<ApplicationStatus>,
    pub requested_amount: i64,
    pub is_final_submission: bool,
    pub personal: PersonalDetails,
    pub location: LocationDetails,
    pub education: EducationDetails,
    pub financial: FinancialDetails,
    pub family: FamilyDetails,
}

/// Details attached to a status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMetadata {
    pub actor: Actor,
    #[serde(default)]
    pub performed_by: String,
    #[serde(default)]
    pub awarded_amount: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl TransitionMetadata {
    pub fn administrator(performed_by: impl Into<String>) -> Self {
        TransitionMetadata {
            actor: Actor::Administrator,
            performed_by: performed_by.into(),
            awarded_amount: None,
            reason: None,
            note: None,
        }
    }

    pub fn applicant() -> Self {
        TransitionMetadata {
            actor: Actor::Applicant,
            performed_by: String::new(),
            awarded_amount: None,
            reason: None,
            note: None,
        }
    }

    pub fn with_award(mut self, amount: u64) -> Self {
        self.awarded_amount = Some(amount);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ApplicationStatus,
    pub metadata: TransitionMetadata,
}

/// Sections present in a patch replace the stored section as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationPatch {
    pub requested_amount: Option<i64>,
    pub is_final_submission: Option<bool>,
    pub personal: Option<PersonalDetails>,
    pub location: Option<LocationDetails>,
    pub education: Option<EducationDetails>,
    pub financial: Option<FinancialDetails>,
    pub family: Option<FamilyDetails>,
    pub status: Option<StatusUpdate>,
}

impl ApplicationPatch {
    /// First field a final submission refuses to have edited.
    pub fn locked_field(&self) -> Option<&'static str> {
        if self.requested_amount.is_some() {
            return Some("requested_amount");
        }
        if self.is_final_submission == Some(false) {
            return Some("is_final_submission");
        }
        if self.personal.is_some() {
            return Some("personal");
        }
        if self.location.is_some() {
            return Some("location");
        }
        if self.education.is_some() {
            return Some("education");
        }
        if self.financial.is_some() {
            return Some("financial");
        }
        if self.family.is_some() {
            return Some("family");
        }
        None
    }
}

pub fn checked_amount(field: &'static str, value: i64) -> BursaryResult<u64> {
    u64::try_from(value).map_err(|_| BursaryError::validation(field, "must not be negative"))
}

pub fn clamp_string(value: &str, max_len: usize) -> String {
    let out: String = value
        .trim()
        .chars()
        .filter(|ch| {
            let code = *ch as u32;
            code >= 32 && code != 127
        })
        .take(max_len)
        .collect();
    out
}

pub fn clamp_note(value: Option<&str>) -> Option<String> {
    value
        .map(|text| clamp_string(text, MAX_NOTE_LEN))
        .filter(|text| !text.is_empty())
}

impl PersonalDetails {
    pub fn sanitized(self) -> Self {
        PersonalDetails {
            full_name: clamp_string(&self.full_name, MAX_TEXT_LEN),
            id_number: clamp_string(&self.id_number, MAX_TEXT_LEN),
            gender: clamp_string(&self.gender, MAX_TEXT_LEN),
            date_of_birth: clamp_string(&self.date_of_birth, MAX_TEXT_LEN),
            phone: clamp_string(&self.phone, MAX_TEXT_LEN),
            email: clamp_string(&self.email, MAX_TEXT_LEN),
        }
    }
}

impl LocationDetails {
    pub fn sanitized(self) -> Self {
        LocationDetails {
            sub_region: clamp_string(&self.sub_region, MAX_TEXT_LEN),
            ward: clamp_string(&self.ward, MAX_TEXT_LEN),
            village: clamp_string(&self.village, MAX_TEXT_LEN),
        }
    }
}

impl EducationDetails {
    pub fn sanitized(self) -> Self {
        EducationDetails {
            institution: clamp_string(&self.institution, MAX_TEXT_LEN),
            admission_number: clamp_string(&self.admission_number, MAX_TEXT_LEN),
            course: clamp_string(&self.course, MAX_TEXT_LEN),
            year_of_study: self.year_of_study,
        }
    }
}

impl FamilyDetails {
    pub fn sanitized(self) -> Self {
        FamilyDetails {
            guardian_name: clamp_string(&self.guardian_name, MAX_TEXT_LEN),
            guardian_phone: clamp_string(&self.guardian_phone, MAX_TEXT_LEN),
            parental_status: clamp_string(&self.parental_status, MAX_TEXT_LEN),
            siblings_in_school: self.siblings_in_school,
            household_income: self.household_income,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_pads_the_sequence() {
        let id = ApplicationId::compose("KIB", 2026, 42);
        assert_eq!(id.as_str(), "KIB/2026/00042");
        assert_eq!(id.sequence(), Some(42));
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(ApplicationId::parse("KIB/2026/00042").is_ok());
        assert!(ApplicationId::parse("KIB-2026-00042").is_err());
        assert!(ApplicationId::parse("kib/2026/00042").is_err());
        assert!(ApplicationId::parse("KIB/26/00042").is_err());
        assert!(ApplicationId::parse("KIB/2026/00x42").is_err());
        assert!(ApplicationId::parse("KIB/2026/00000").is_err());
        assert!(ApplicationId::parse("KIB/2026/18446744073709551615").is_err());
        assert!(ApplicationId::parse("KIB/2026/10000000000").is_err());
    }

    #[test]
    fn parse_pads_short_sequences() {
        let short = ApplicationId::parse("KIB/2026/1").expect("short");
        let padded = ApplicationId::parse(" KIB/2026/00001 ").expect("padded");
        assert_eq!(short, padded);
        assert_eq!(short.as_str(), "KIB/2026/00001");
        assert_eq!(
            ApplicationId::parse("KIB/2026/000042").expect("wide").as_str(),
            "KIB/2026/00042"
        );
        let largest = ApplicationId::parse("KIB/2026/9999999999").expect("largest");
        assert_eq!(largest.sequence(), Some(MAX_ID_SEQUENCE));
    }

    #[test]
    fn negative_amounts_are_validation_errors() {
        assert_eq!(checked_amount("requested_amount", 10).ok(), Some(10));
        let err = checked_amount("requested_amount", -1).unwrap_err();
        assert!(matches!(
            err,
            BursaryError::Validation {
                field: "requested_amount",
                ..
            }
        ));
    }

    #[test]
    fn clamp_string_strips_control_characters() {
        assert_eq!(clamp_string("  Jane\u{7}\tDoe  ", 50), "JaneDoe");
        assert_eq!(clamp_string("abcdef", 3), "abc");
    }

    #[test]
    fn locked_field_ignores_status_only_patches() {
        let patch = ApplicationPatch {
            status: Some(StatusUpdate {
                status: ApplicationStatus::Rejected,
                metadata: TransitionMetadata::administrator("admin"),
            }),
            is_final_submission: Some(true),
            ..ApplicationPatch::default()
        };
        assert_eq!(patch.locked_field(), None);

        let patch = ApplicationPatch {
            financial: Some(FinancialDetails::default()),
            ..ApplicationPatch::default()
        };
        assert_eq!(patch.locked_field(), Some("financial"));
    }

    #[test]
    fn fee_balance_saturates() {
        let financial = FinancialDetails {
            total_fees: 50_000,
            fees_paid: 30_000,
            other_support: 25_000,
        };
        assert_eq!(financial.fee_balance(), 0);
    }
}
