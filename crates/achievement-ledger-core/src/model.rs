use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::details::AchievementDetails;
use crate::{
    AchievementError, AchievementStatus, AchievementType, AuditEntryId, DocumentId, LecturerId,
    ReferenceId, RoleKind, StudentId, UserId,
};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub file_url: String,
    pub file_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
}

/// What the blob store hands back after persisting the bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: String,
    pub content_type: String,
}

/// Attachment metadata recorded by `AttachFile`; the engine stamps the upload time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentDescriptor {
    pub file_name: String,
    pub file_url: String,
    pub file_type: String,
}

impl AttachmentDescriptor {
    #[must_use]
    pub fn from_blob(file_name: impl Into<String>, blob: StoredBlob) -> Self {
        Self {
            file_name: file_name.into(),
            file_url: blob.url,
            file_type: blob.content_type,
        }
    }

    /// # Errors
    /// Returns [`AchievementError::Validation`] when name or URL is blank.
    pub fn validate(&self) -> Result<(), AchievementError> {
        if self.file_name.trim().is_empty() {
            return Err(AchievementError::Validation(
                "file_name MUST be provided".to_string(),
            ));
        }
        if self.file_url.trim().is_empty() {
            return Err(AchievementError::Validation(
                "file_url MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// The full mutable field set of a document; `replace_fields` overwrites all of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AchievementFields {
    pub achievement_type: AchievementType,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub details: AchievementDetails,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub points: f64,
    pub status: AchievementStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDocument {
    pub owner_id: StudentId,
    pub fields: AchievementFields,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AchievementDocument {
    pub document_id: DocumentId,
    pub owner_id: StudentId,
    #[serde(flatten)]
    pub fields: AchievementFields,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub deleted_at: Option<OffsetDateTime>,
}

impl AchievementDocument {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AchievementReference {
    pub reference_id: ReferenceId,
    pub owner_id: StudentId,
    pub document_id: DocumentId,
    pub status: AchievementStatus,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub submitted_at: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub verified_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub entry_id: AuditEntryId,
    pub reference_id: ReferenceId,
    pub document_id: DocumentId,
    pub prior_status: Option<AchievementStatus>,
    pub new_status: AchievementStatus,
    pub actor_id: UserId,
    pub note: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Role {
    Student(StudentId),
    Advisor(LecturerId),
    Admin,
}

impl Role {
    #[must_use]
    pub fn kind(self) -> RoleKind {
        match self {
            Self::Student(_) => RoleKind::Student,
            Self::Advisor(_) => RoleKind::Advisor,
            Self::Admin => RoleKind::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn student_id(&self) -> Option<StudentId> {
        match self.role {
            Role::Student(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudentProfile {
    pub student_id: StudentId,
    pub user_id: UserId,
    pub student_number: String,
    pub full_name: String,
    pub program_study: String,
    pub academic_year: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisor_id: Option<LecturerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAchievement {
    pub achievement_type: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub details: AchievementDetails,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub points: Option<f64>,
}

impl NewAchievement {
    /// Checks required fields and produces the draft field set.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] when title or description is
    /// blank, the type tag is not enumerated, or points are negative.
    pub fn into_draft_fields(self) -> Result<AchievementFields, AchievementError> {
        if self.title.trim().is_empty() || self.description.trim().is_empty() {
            return Err(AchievementError::Validation(
                "title and description MUST be provided".to_string(),
            ));
        }
        let achievement_type = AchievementType::parse_required(&self.achievement_type)?;
        let points = self.points.unwrap_or(0.0);
        validate_points(points)?;

        Ok(AchievementFields {
            achievement_type,
            title: self.title,
            description: self.description,
            details: self.details,
            attachments: Vec::new(),
            tags: self.tags,
            points,
            status: AchievementStatus::Draft,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AchievementPatch {
    #[serde(default)]
    pub achievement_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub details: Option<AchievementDetails>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub points: Option<f64>,
}

impl AchievementPatch {
    /// Validates the present fields without touching any store.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] for a blank title or
    /// description, an unknown type tag, or invalid points.
    pub fn validate(&self) -> Result<(), AchievementError> {
        if let Some(title) = &self.title {
            if title.trim().is_empty() {
                return Err(AchievementError::Validation(
                    "title cannot be blank".to_string(),
                ));
            }
        }
        if let Some(description) = &self.description {
            if description.trim().is_empty() {
                return Err(AchievementError::Validation(
                    "description cannot be blank".to_string(),
                ));
            }
        }
        if let Some(raw) = &self.achievement_type {
            AchievementType::parse_required(raw)?;
        }
        if let Some(points) = self.points {
            validate_points(points)?;
        }
        Ok(())
    }

    /// Applies the patch on top of `fields`. Status and attachments are untouched.
    ///
    /// # Errors
    /// Returns [`AchievementError::Validation`] when [`Self::validate`] fails.
    pub fn apply(self, fields: &mut AchievementFields) -> Result<(), AchievementError> {
        self.validate()?;
        if let Some(raw) = self.achievement_type {
            fields.achievement_type = AchievementType::parse_required(&raw)?;
        }
        if let Some(title) = self.title {
            fields.title = title;
        }
        if let Some(description) = self.description {
            fields.description = description;
        }
        if let Some(details) = self.details {
            fields.details.merge(details);
        }
        if let Some(tags) = self.tags {
            fields.tags = tags;
        }
        if let Some(points) = self.points {
            fields.points = points;
        }
        Ok(())
    }
}

fn validate_points(points: f64) -> Result<(), AchievementError> {
    if !points.is_finite() || points < 0.0 {
        return Err(AchievementError::Validation(
            "points MUST be a finite number >= 0".to_string(),
        ));
    }
    Ok(())
}

/// Document status and reference status disagree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusDrift {
    pub document_status: AchievementStatus,
    pub reference_status: AchievementStatus,
}

/// Document joined with its reference and owner, as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AchievementView {
    #[serde(flatten)]
    pub document: AchievementDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<AchievementReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<StudentProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_drift: Option<StatusDrift>,
}

impl AchievementView {
    #[must_use]
    pub fn compose(
        document: AchievementDocument,
        reference: Option<AchievementReference>,
        owner: Option<StudentProfile>,
    ) -> Self {
        let status_drift = reference.as_ref().and_then(|reference| {
            (reference.status != document.fields.status).then_some(StatusDrift {
                document_status: document.fields.status,
                reference_status: reference.status,
            })
        });
        Self {
            document,
            reference,
            owner,
            status_drift,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    /// Clamps raw caller input: `page < 1` becomes 1, `page_size < 1` becomes
    /// the default, and sizes above the cap are capped.
    #[must_use]
    pub fn new(page: i64, page_size: i64) -> Self {
        let page = u32::try_from(page.max(1)).unwrap_or(u32::MAX);
        let page_size = if page_size < 1 {
            DEFAULT_PAGE_SIZE
        } else {
            u32::try_from(page_size.min(i64::from(MAX_PAGE_SIZE))).unwrap_or(MAX_PAGE_SIZE)
        };
        Self { page, page_size }
    }

    #[must_use]
    pub fn offset(self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    #[must_use]
    pub fn total_pages(self, total: u64) -> u64 {
        total.div_ceil(u64::from(self.page_size))
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, i64::from(DEFAULT_PAGE_SIZE))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    #[must_use]
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            page: request.page,
            page_size: request.page_size,
            total: 0,
            total_pages: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFilter {
    pub owners: Vec<StudentId>,
    pub achievement_type: Option<AchievementType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateDimension {
    Type,
    /// `YYYY-MM` of creation, newest month first.
    Month,
    /// Owners ranked by summed points, highest first.
    Owner { limit: usize },
    /// Only documents whose details carry a competition level.
    CompetitionLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateBucket {
    pub key: String,
    pub count: u64,
    pub total_points: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeriodCount {
    pub period: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopStudent {
    pub owner_id: StudentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub total_points: f64,
    pub achievement_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AchievementStatistics {
    pub total_by_type: BTreeMap<String, u64>,
    pub total_by_period: Vec<PeriodCount>,
    pub top_students: Vec<TopStudent>,
    pub competition_level_distribution: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudentStatistics {
    pub student: StudentProfile,
    pub total_points: f64,
    pub total_achievements: u64,
    pub statistics: AchievementStatistics,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub document_id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<ReferenceId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub contract_version: String,
    pub healthy: bool,
    pub checked_owners: usize,
    pub checked_references: usize,
    pub checked_documents: usize,
    pub issues: Vec<ConsistencyIssue>,
}
