//! Collaborator seams consumed by the lifecycle engine.
//!
//! Adapters return `anyhow::Result`; the engine maps any `Err` to
//! `StoreUnavailable` and a missing row (`Ok(None)`, `Ok(false)`) to
//! `NotFound`.

use anyhow::Result;

use crate::model::{
    AchievementDocument, AchievementFields, AchievementReference, Actor, AggregateBucket,
    AggregateDimension, AggregateFilter, AuditEntry, NewDocument, PageRequest, StoredBlob,
    StudentProfile,
};
use crate::{DocumentId, LecturerId, ReferenceId, StudentId};

/// Schema-flexible store for achievement content.
///
/// Reads skip soft-deleted documents, except [`DocumentStore::get_by_id`]
/// which returns them with `deleted_at` set so callers can reconcile.
pub trait DocumentStore: Send + Sync {
    /// Assigns the document id and stamps both timestamps.
    #[allow(clippy::missing_errors_doc)]
    fn insert(&self, document: &NewDocument) -> Result<AchievementDocument>;

    #[allow(clippy::missing_errors_doc)]
    fn get_by_id(&self, document_id: &DocumentId) -> Result<Option<AchievementDocument>>;

    /// Batch lookup of live documents; missing ids are simply absent.
    #[allow(clippy::missing_errors_doc)]
    fn get_many(&self, document_ids: &[DocumentId]) -> Result<Vec<AchievementDocument>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_by_owner(&self, owner_id: StudentId) -> Result<Vec<AchievementDocument>>;

    /// Overwrites the full mutable field set and refreshes `updated_at`.
    /// Returns `false` when no live document has that id.
    #[allow(clippy::missing_errors_doc)]
    fn replace_fields(&self, document_id: &DocumentId, fields: &AchievementFields)
        -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn soft_delete(&self, document_id: &DocumentId) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn aggregate(
        &self,
        filter: &AggregateFilter,
        dimension: AggregateDimension,
    ) -> Result<Vec<AggregateBucket>>;
}

/// Relational system of record for status and ownership.
pub trait ReferenceStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn insert(&self, reference: &AchievementReference) -> Result<AchievementReference>;

    /// Single-row update; returns `false` when the row is gone.
    #[allow(clippy::missing_errors_doc)]
    fn update(&self, reference: &AchievementReference) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn get_by_id(&self, reference_id: ReferenceId) -> Result<Option<AchievementReference>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_by_document_id(&self, document_id: &DocumentId)
        -> Result<Option<AchievementReference>>;

    /// Newest-created first, paginated at the store. Returns the page and the
    /// total row count across all pages.
    #[allow(clippy::missing_errors_doc)]
    fn list_by_owners(
        &self,
        owners: &[StudentId],
        page: PageRequest,
    ) -> Result<(Vec<AchievementReference>, u64)>;

    #[allow(clippy::missing_errors_doc)]
    fn delete(&self, reference_id: ReferenceId) -> Result<bool>;
}

/// Append-only transition log.
pub trait AuditLog: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Newest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_by_reference(&self, reference_id: ReferenceId) -> Result<Vec<AuditEntry>>;
}

pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` for an unknown credential.
    #[allow(clippy::missing_errors_doc)]
    fn resolve_actor(&self, credential: &str) -> Result<Option<Actor>>;

    #[allow(clippy::missing_errors_doc)]
    fn is_advisor_of(&self, advisor_id: LecturerId, student_id: StudentId) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn advisees(&self, advisor_id: LecturerId) -> Result<Vec<StudentId>>;

    #[allow(clippy::missing_errors_doc)]
    fn all_students(&self) -> Result<Vec<StudentId>>;

    #[allow(clippy::missing_errors_doc)]
    fn student_profiles(&self, student_ids: &[StudentId]) -> Result<Vec<StudentProfile>>;
}

pub trait AttachmentBlobStore: Send + Sync {
    /// Persists `bytes` and reports where they went and the detected content type.
    #[allow(clippy::missing_errors_doc)]
    fn put(&self, file_name: &str, bytes: &[u8]) -> Result<StoredBlob>;
}
