//! Domain model shared by every achievement ledger crate.
//!
//! An achievement lives in two places: its free-form content is a document in
//! a [`DocumentStore`], and its workflow status, ownership and audit anchor is
//! a compact [`AchievementReference`] row in a [`ReferenceStore`]. Everything
//! in this crate is storage-agnostic; adapters live in
//! `achievement-ledger-store-sqlite` and orchestration in
//! `achievement-ledger-engine`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod details;
pub mod model;
pub mod ports;
pub mod scope;

pub use details::{
    AchievementDetails, CertificationFields, CommonFields, CompetitionFields, DetailsFacet,
    OrganizationFields, Period, PublicationFields,
};
pub use model::{
    AchievementDocument, AchievementFields, AchievementPatch, AchievementReference,
    AchievementStatistics, AchievementView, Actor, AggregateBucket, AggregateDimension,
    AggregateFilter, Attachment, AttachmentDescriptor, AuditEntry, ConsistencyIssue,
    ConsistencyReport, IssueSeverity, NewAchievement, NewDocument, Page, PageRequest,
    PeriodCount, Role, StatusDrift, StoredBlob, StudentProfile, StudentStatistics, TopStudent,
};
pub use ports::{AttachmentBlobStore, AuditLog, DocumentStore, IdentityProvider, ReferenceStore};
pub use scope::RequestScope;

pub const CONSISTENCY_CONTRACT_VERSION: &str = "consistency_report.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AchievementError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl AchievementError {
    /// Stable machine code used by the CLI and HTTP error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidState(_) => "invalid_state",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AchievementStatus {
    Draft,
    Submitted,
    Verified,
    Rejected,
}

impl AchievementStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "verified" => Some(Self::Verified),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Edges of the workflow graph. There is no path back to `draft`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Submitted)
                | (Self::Submitted, Self::Verified)
                | (Self::Submitted, Self::Rejected)
        )
    }
}

impl Display for AchievementStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AchievementType {
    Academic,
    Competition,
    Organization,
    Publication,
    Certification,
    Other,
}

impl AchievementType {
    pub const ALL: [Self; 6] = [
        Self::Academic,
        Self::Competition,
        Self::Organization,
        Self::Publication,
        Self::Certification,
        Self::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Academic => "academic",
            Self::Competition => "competition",
            Self::Organization => "organization",
            Self::Publication => "publication",
            Self::Certification => "certification",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "academic" => Some(Self::Academic),
            "competition" => Some(Self::Competition),
            "organization" => Some(Self::Organization),
            "publication" => Some(Self::Publication),
            "certification" => Some(Self::Certification),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Parses a caller-supplied type tag.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] when the tag is empty or not
    /// one of the six enumerated types.
    pub fn parse_required(value: &str) -> Result<Self, AchievementError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AchievementError::Validation(
                "achievement_type MUST be provided".to_string(),
            ));
        }
        Self::parse(trimmed).ok_or_else(|| {
            AchievementError::Validation(format!(
                "invalid achievement_type `{trimmed}`; expected one of: {}",
                Self::ALL.map(Self::as_str).join(", ")
            ))
        })
    }
}

impl Display for AchievementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionLevel {
    International,
    National,
    Regional,
    Local,
}

impl CompetitionLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::International => "international",
            Self::National => "national",
            Self::Regional => "regional",
            Self::Local => "local",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "international" => Some(Self::International),
            "national" => Some(Self::National),
            "regional" => Some(Self::Regional),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublicationType {
    Journal,
    Conference,
    Book,
}

impl PublicationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Journal => "journal",
            Self::Conference => "conference",
            Self::Book => "book",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "journal" => Some(Self::Journal),
            "conference" => Some(Self::Conference),
            "book" => Some(Self::Book),
            _ => None,
        }
    }
}

/// Role identifier resolved once at the identity boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Student,
    Advisor,
    Admin,
}

impl RoleKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Advisor => "advisor",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(Self::Student),
            "advisor" => Some(Self::Advisor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

macro_rules! ulid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`AchievementError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, AchievementError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    AchievementError::Validation(format!(
                        "invalid {} `{raw}`: {err}",
                        stringify!($name)
                    ))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_identifier!(
    /// Login identity; the actor recorded on audit entries.
    UserId
);
ulid_identifier!(
    /// Student entity; the owner of achievements.
    StudentId
);
ulid_identifier!(LecturerId);
ulid_identifier!(ReferenceId);
ulid_identifier!(AuditEntryId);

/// Native identifier of the document store. Only string equality is assumed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AchievementError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AchievementError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AchievementError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AchievementError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AchievementError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AchievementError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AchievementError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// `YYYY-MM` bucket used by the per-period statistics.
#[must_use]
pub fn month_bucket(value: OffsetDateTime) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    format!("{:04}-{:02}", utc.year(), u8::from(utc.month()))
}
