//! Lifecycle engine for achievements split across a document store and a
//! relational reference store.
//!
//! There is no transaction spanning the two stores. Every multi-step
//! operation writes the document first and the reference last, so the
//! externally visible status flips only once both writes are done. A failure
//! in between leaves drift that [`LifecycleEngine::consistency_check`] can
//! report; the one compensation is the soft delete of an orphan document when
//! `create` cannot insert its reference.
//!
//! Every store call goes through the request's [`RequestScope`]; once the
//! scope is cancelled or past its deadline no further store call is issued.

#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use achievement_ledger_core::{
    now_utc, AchievementDocument, AchievementError, AchievementFields, AchievementPatch,
    AchievementReference, AchievementStatus, AchievementView, Actor, Attachment,
    AttachmentBlobStore, AttachmentDescriptor, AuditEntry, AuditEntryId, AuditLog, DocumentId,
    DocumentStore, IdentityProvider, NewAchievement, NewDocument, Page, PageRequest,
    ReferenceId, ReferenceStore, RequestScope, Role, StudentId, StudentProfile, UserId,
};
use time::OffsetDateTime;

mod consistency;
mod visibility;

pub const NOTE_CREATED: &str = "achievement created";
pub const NOTE_SUBMITTED: &str = "submitted for verification";
pub const NOTE_VERIFIED: &str = "verified";

/// Runs one store call under `scope`, mapping adapter failures to
/// [`AchievementError::StoreUnavailable`].
pub(crate) fn store_call<T>(
    scope: &RequestScope,
    operation: &str,
    call: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, AchievementError> {
    scope.checkpoint(operation)?;
    call().map_err(|err| AchievementError::StoreUnavailable(format!("{operation}: {err:#}")))
}

#[derive(Clone)]
pub struct LifecycleEngine {
    documents: Arc<dyn DocumentStore>,
    references: Arc<dyn ReferenceStore>,
    audit: Arc<dyn AuditLog>,
    identity: Arc<dyn IdentityProvider>,
}

struct Loaded {
    document: AchievementDocument,
    reference: AchievementReference,
}

struct Transition {
    operation: &'static str,
    to: AchievementStatus,
    note: String,
}

impl LifecycleEngine {
    #[must_use]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        references: Arc<dyn ReferenceStore>,
        audit: Arc<dyn AuditLog>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            documents,
            references,
            audit,
            identity,
        }
    }

    pub fn resolve_actor(
        &self,
        scope: &RequestScope,
        credential: &str,
    ) -> Result<Actor, AchievementError> {
        if credential.trim().is_empty() {
            return Err(AchievementError::Forbidden(
                "credential MUST be provided".to_string(),
            ));
        }
        store_call(scope, "resolve actor", || self.identity.resolve_actor(credential))?
            .ok_or_else(|| AchievementError::Forbidden("unknown credential".to_string()))
    }

    pub fn create(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        request: NewAchievement,
    ) -> Result<AchievementView, AchievementError> {
        let owner_id = require_student(actor, "create")?;
        let new_document = NewDocument {
            owner_id,
            fields: request.into_draft_fields()?,
        };

        let document = store_call(scope, "insert document", || {
            self.documents.insert(&new_document)
        })?;

        let now = now_utc();
        let reference = AchievementReference {
            reference_id: ReferenceId::new(),
            owner_id,
            document_id: document.document_id.clone(),
            status: AchievementStatus::Draft,
            submitted_at: None,
            verified_at: None,
            verified_by: None,
            rejection_note: None,
            created_at: now,
            updated_at: now,
        };
        let reference = match store_call(scope, "insert reference", || {
            self.references.insert(&reference)
        }) {
            Ok(reference) => reference,
            Err(err) => {
                self.compensate_create(&document, &err);
                return Err(err);
            }
        };

        self.append_audit(
            scope,
            &reference,
            None,
            actor.user_id,
            NOTE_CREATED.to_string(),
        );
        tracing::info!(
            document_id = %document.document_id,
            reference_id = %reference.reference_id,
            to = AchievementStatus::Draft.as_str(),
            actor = %actor.user_id,
            "achievement created"
        );

        let owner = self.owner_profile(scope, owner_id);
        Ok(AchievementView::compose(document, Some(reference), owner))
    }

    pub fn get(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
    ) -> Result<AchievementView, AchievementError> {
        let Loaded {
            document,
            reference,
        } = self.load(scope, document_id)?;
        self.authorize_read(scope, actor, reference.owner_id)?;
        let owner = self.owner_profile(scope, reference.owner_id);
        Ok(AchievementView::compose(document, Some(reference), owner))
    }

    pub fn update(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
        patch: AchievementPatch,
    ) -> Result<AchievementView, AchievementError> {
        let Loaded {
            mut document,
            reference,
        } = self.load_owned(scope, actor, document_id, "update")?;
        require_draft(&document, "update")?;

        let mut fields = document.fields.clone();
        patch.apply(&mut fields)?;
        self.replace_fields(scope, "update document", &document.document_id, &fields)?;
        document.fields = fields;

        Ok(self.reload_view(scope, document, reference))
    }

    pub fn delete(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
    ) -> Result<(), AchievementError> {
        let Loaded {
            document,
            reference,
        } = self.load_owned(scope, actor, document_id, "delete")?;
        require_draft(&document, "delete")?;

        if !store_call(scope, "soft delete document", || {
            self.documents.soft_delete(&document.document_id)
        })? {
            return Err(document_not_found(&document.document_id));
        }

        match store_call(scope, "delete reference", || {
            self.references.delete(reference.reference_id)
        }) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                document_id = %document.document_id,
                reference_id = %reference.reference_id,
                operation = "delete",
                "reference already absent after document soft delete"
            ),
            Err(err) => tracing::warn!(
                document_id = %document.document_id,
                reference_id = %reference.reference_id,
                operation = "delete",
                error = %err,
                "document soft-deleted but reference removal failed"
            ),
        }

        tracing::info!(
            document_id = %document.document_id,
            actor = %actor.user_id,
            "achievement deleted"
        );
        Ok(())
    }

    pub fn submit(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
    ) -> Result<AchievementView, AchievementError> {
        let loaded = self.load_owned(scope, actor, document_id, "submit")?;
        self.transition(
            scope,
            actor,
            loaded,
            Transition {
                operation: "submit",
                to: AchievementStatus::Submitted,
                note: NOTE_SUBMITTED.to_string(),
            },
            |reference, now| reference.submitted_at = Some(now),
        )
    }

    pub fn verify(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
    ) -> Result<AchievementView, AchievementError> {
        let loaded = self.load_for_review(scope, actor, document_id, "verify")?;
        let verifier = actor.user_id;
        self.transition(
            scope,
            actor,
            loaded,
            Transition {
                operation: "verify",
                to: AchievementStatus::Verified,
                note: NOTE_VERIFIED.to_string(),
            },
            |reference, now| {
                reference.verified_at = Some(now);
                reference.verified_by = Some(verifier);
            },
        )
    }

    pub fn reject(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
        note: &str,
    ) -> Result<AchievementView, AchievementError> {
        let loaded = self.load_for_review(scope, actor, document_id, "reject")?;
        let note = note.trim();
        if note.is_empty() {
            return Err(AchievementError::Validation(
                "rejection note MUST be provided".to_string(),
            ));
        }

        let rejection_note = note.to_string();
        self.transition(
            scope,
            actor,
            loaded,
            Transition {
                operation: "reject",
                to: AchievementStatus::Rejected,
                note: format!("rejected: {note}"),
            },
            move |reference, _| reference.rejection_note = Some(rejection_note),
        )
    }

    /// Appends one descriptor; existing attachments are kept.
    pub fn attach_file(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
        descriptor: AttachmentDescriptor,
    ) -> Result<AchievementView, AchievementError> {
        descriptor.validate()?;
        let loaded = self.load_owned(scope, actor, document_id, "attach file")?;
        require_draft(&loaded.document, "attach file")?;
        self.append_attachment(scope, loaded, descriptor)
    }

    /// Stores the bytes through `blobs`, then records the returned descriptor.
    /// Preconditions are checked before any bytes are written.
    pub fn upload_attachment(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
        file_name: &str,
        bytes: &[u8],
        blobs: &dyn AttachmentBlobStore,
    ) -> Result<AchievementView, AchievementError> {
        if file_name.trim().is_empty() {
            return Err(AchievementError::Validation(
                "file_name MUST be provided".to_string(),
            ));
        }
        if bytes.is_empty() {
            return Err(AchievementError::Validation(
                "attachment upload is empty".to_string(),
            ));
        }

        let loaded = self.load_owned(scope, actor, document_id, "attach file")?;
        require_draft(&loaded.document, "attach file")?;

        let blob = store_call(scope, "store attachment bytes", || {
            blobs.put(file_name, bytes)
        })?;
        self.append_attachment(
            scope,
            loaded,
            AttachmentDescriptor::from_blob(file_name, blob),
        )
    }

    /// One page of the achievements visible to `actor`, newest first.
    ///
    /// Documents that vanished between the reference page and the document
    /// lookup are skipped. A status filter is applied to the joined page and
    /// `total` then counts only the matching items.
    pub fn list(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        page: PageRequest,
        status: Option<AchievementStatus>,
    ) -> Result<Page<AchievementView>, AchievementError> {
        let owners = self.visible_owners(scope, actor)?;
        if owners.is_empty() {
            return Ok(Page::empty(page));
        }

        let (references, total) = store_call(scope, "list references", || {
            self.references.list_by_owners(&owners, page)
        })?;

        let mut items = Vec::with_capacity(references.len());
        if !references.is_empty() {
            let document_ids: Vec<DocumentId> = references
                .iter()
                .map(|reference| reference.document_id.clone())
                .collect();
            let mut documents: HashMap<DocumentId, AchievementDocument> =
                store_call(scope, "load documents", || {
                    self.documents.get_many(&document_ids)
                })?
                .into_iter()
                .map(|document| (document.document_id.clone(), document))
                .collect();

            let page_owners: Vec<StudentId> = references
                .iter()
                .map(|reference| reference.owner_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let profiles = self.owner_profiles(scope, &page_owners);

            for reference in references {
                let Some(document) = documents.remove(&reference.document_id) else {
                    tracing::debug!(
                        document_id = %reference.document_id,
                        reference_id = %reference.reference_id,
                        "skipping reference whose document is gone"
                    );
                    continue;
                };
                let owner = profiles.get(&reference.owner_id).cloned();
                let view = AchievementView::compose(document, Some(reference), owner);
                log_drift(&view, "list");
                items.push(view);
            }
        }

        let total = match status {
            Some(status) => {
                items.retain(|view| {
                    view.reference
                        .as_ref()
                        .is_some_and(|reference| reference.status == status)
                });
                u64::try_from(items.len()).unwrap_or(u64::MAX)
            }
            None => total,
        };

        Ok(Page {
            items,
            page: page.page,
            page_size: page.page_size,
            total,
            total_pages: page.total_pages(total),
        })
    }

    /// Audit trail of one achievement, newest first.
    pub fn history(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
    ) -> Result<Vec<AuditEntry>, AchievementError> {
        let Loaded { reference, .. } = self.load(scope, document_id)?;
        self.authorize_read(scope, actor, reference.owner_id)?;
        store_call(scope, "list audit entries", || {
            self.audit.list_by_reference(reference.reference_id)
        })
    }

    fn transition(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        loaded: Loaded,
        transition: Transition,
        stamp: impl FnOnce(&mut AchievementReference, OffsetDateTime),
    ) -> Result<AchievementView, AchievementError> {
        let Loaded {
            mut document,
            mut reference,
        } = loaded;
        let from = document.fields.status;
        let to = transition.to;
        if !from.can_transition_to(to) {
            return Err(AchievementError::InvalidState(format!(
                "cannot {} achievement {} in status {from}",
                transition.operation, document.document_id
            )));
        }

        let mut fields = document.fields.clone();
        fields.status = to;
        self.replace_fields(scope, "write document status", &document.document_id, &fields)?;
        document.fields = fields;

        let now = now_utc();
        reference.status = to;
        reference.updated_at = now;
        stamp(&mut reference, now);
        let written = store_call(scope, "write reference status", || {
            self.references.update(&reference)
        })
        .and_then(|updated| {
            if updated {
                Ok(())
            } else {
                Err(AchievementError::NotFound(format!(
                    "reference {} disappeared during {}",
                    reference.reference_id, transition.operation
                )))
            }
        });
        if let Err(err) = written {
            tracing::warn!(
                document_id = %document.document_id,
                reference_id = %reference.reference_id,
                operation = transition.operation,
                document_status = to.as_str(),
                error = %err,
                "reference write failed after document write; status drift left in place"
            );
            return Err(err);
        }

        self.append_audit(scope, &reference, Some(from), actor.user_id, transition.note);
        tracing::info!(
            document_id = %document.document_id,
            from = from.as_str(),
            to = to.as_str(),
            actor = %actor.user_id,
            "achievement status changed"
        );

        Ok(self.reload_view(scope, document, reference))
    }

    fn append_attachment(
        &self,
        scope: &RequestScope,
        loaded: Loaded,
        descriptor: AttachmentDescriptor,
    ) -> Result<AchievementView, AchievementError> {
        let Loaded {
            mut document,
            reference,
        } = loaded;
        let mut fields = document.fields.clone();
        fields.attachments.push(Attachment {
            file_name: descriptor.file_name,
            file_url: descriptor.file_url,
            file_type: descriptor.file_type,
            uploaded_at: now_utc(),
        });
        self.replace_fields(scope, "append attachment", &document.document_id, &fields)?;
        document.fields = fields;
        Ok(self.reload_view(scope, document, reference))
    }

    fn load(
        &self,
        scope: &RequestScope,
        document_id: &DocumentId,
    ) -> Result<Loaded, AchievementError> {
        let document = store_call(scope, "load document", || {
            self.documents.get_by_id(document_id)
        })?
        .filter(|document| !document.is_deleted())
        .ok_or_else(|| document_not_found(document_id))?;

        let reference = store_call(scope, "load reference", || {
            self.references.get_by_document_id(document_id)
        })?
        .ok_or_else(|| {
            AchievementError::NotFound(format!("reference for achievement {document_id} not found"))
        })?;

        if reference.status != document.fields.status {
            tracing::warn!(
                document_id = %document_id,
                reference_id = %reference.reference_id,
                document_status = document.fields.status.as_str(),
                reference_status = reference.status.as_str(),
                "status drift observed on read"
            );
        }
        Ok(Loaded {
            document,
            reference,
        })
    }

    fn load_owned(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
        operation: &str,
    ) -> Result<Loaded, AchievementError> {
        let student_id = require_student(actor, operation)?;
        let loaded = self.load(scope, document_id)?;
        if loaded.reference.owner_id != student_id {
            return Err(AchievementError::Forbidden(format!(
                "achievement {document_id} is not owned by the acting student"
            )));
        }
        Ok(loaded)
    }

    /// Only the assigned advisor of the owning student passes, whatever the status.
    fn load_for_review(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        document_id: &DocumentId,
        operation: &str,
    ) -> Result<Loaded, AchievementError> {
        let Role::Advisor(advisor_id) = actor.role else {
            return Err(AchievementError::Forbidden(format!(
                "only the assigned advisor may {operation} an achievement"
            )));
        };
        let loaded = self.load(scope, document_id)?;
        let owner_id = loaded.reference.owner_id;
        if !store_call(scope, "check advisor", || {
            self.identity.is_advisor_of(advisor_id, owner_id)
        })? {
            return Err(AchievementError::Forbidden(format!(
                "advisor is not assigned to the owner of achievement {document_id}"
            )));
        }
        Ok(loaded)
    }

    fn authorize_read(
        &self,
        scope: &RequestScope,
        actor: &Actor,
        owner_id: StudentId,
    ) -> Result<(), AchievementError> {
        let allowed = match actor.role {
            Role::Student(student_id) => student_id == owner_id,
            Role::Advisor(advisor_id) => store_call(scope, "check advisor", || {
                self.identity.is_advisor_of(advisor_id, owner_id)
            })?,
            Role::Admin => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(AchievementError::Forbidden(
                "achievement is outside the actor's visibility".to_string(),
            ))
        }
    }

    fn replace_fields(
        &self,
        scope: &RequestScope,
        operation: &str,
        document_id: &DocumentId,
        fields: &AchievementFields,
    ) -> Result<(), AchievementError> {
        if store_call(scope, operation, || {
            self.documents.replace_fields(document_id, fields)
        })? {
            Ok(())
        } else {
            Err(document_not_found(document_id))
        }
    }

    /// Re-reads the document after a write; falls back to the locally
    /// patched copy when the read fails.
    fn reload_view(
        &self,
        scope: &RequestScope,
        fallback: AchievementDocument,
        reference: AchievementReference,
    ) -> AchievementView {
        let document = match store_call(scope, "reload document", || {
            self.documents.get_by_id(&fallback.document_id)
        }) {
            Ok(Some(document)) => document,
            Ok(None) => fallback,
            Err(err) => {
                tracing::warn!(
                    document_id = %fallback.document_id,
                    operation = "reload document",
                    error = %err,
                    "returning locally patched view"
                );
                fallback
            }
        };
        let owner = self.owner_profile(scope, reference.owner_id);
        AchievementView::compose(document, Some(reference), owner)
    }

    fn compensate_create(&self, document: &AchievementDocument, cause: &AchievementError) {
        // Runs even when the scope is already cancelled.
        match self.documents.soft_delete(&document.document_id) {
            Ok(true) => tracing::warn!(
                document_id = %document.document_id,
                operation = "create",
                error = %cause,
                "reference insert failed; orphan document soft-deleted"
            ),
            Ok(false) => tracing::warn!(
                document_id = %document.document_id,
                operation = "create",
                error = %cause,
                "reference insert failed; orphan document was already gone"
            ),
            Err(err) => tracing::warn!(
                document_id = %document.document_id,
                operation = "create",
                error = %format!("{err:#}"),
                cause = %cause,
                "compensating soft delete failed; orphan document remains"
            ),
        }
    }

    /// Audit failures are logged and never undo the transition.
    fn append_audit(
        &self,
        scope: &RequestScope,
        reference: &AchievementReference,
        prior_status: Option<AchievementStatus>,
        actor_id: UserId,
        note: String,
    ) {
        let entry = AuditEntry {
            entry_id: AuditEntryId::new(),
            reference_id: reference.reference_id,
            document_id: reference.document_id.clone(),
            prior_status,
            new_status: reference.status,
            actor_id,
            note,
            created_at: now_utc(),
        };
        if let Err(err) = store_call(scope, "append audit entry", || self.audit.append(&entry)) {
            tracing::warn!(
                document_id = %entry.document_id,
                reference_id = %entry.reference_id,
                operation = "append audit entry",
                error = %err,
                "audit entry dropped"
            );
        }
    }

    fn owner_profile(&self, scope: &RequestScope, owner_id: StudentId) -> Option<StudentProfile> {
        self.owner_profiles(scope, &[owner_id]).remove(&owner_id)
    }

    /// Best-effort; an empty map when the directory is unreachable.
    fn owner_profiles(
        &self,
        scope: &RequestScope,
        owners: &[StudentId],
    ) -> HashMap<StudentId, StudentProfile> {
        match store_call(scope, "load owner profiles", || {
            self.identity.student_profiles(owners)
        }) {
            Ok(profiles) => profiles
                .into_iter()
                .map(|profile| (profile.student_id, profile))
                .collect(),
            Err(err) => {
                tracing::warn!(
                    operation = "load owner profiles",
                    owners = owners.len(),
                    error = %err,
                    "owner lookup failed; views omit owner"
                );
                HashMap::new()
            }
        }
    }
}

fn require_student(actor: &Actor, operation: &str) -> Result<StudentId, AchievementError> {
    actor.student_id().ok_or_else(|| {
        AchievementError::Forbidden(format!("only students may {operation} achievements"))
    })
}

fn require_draft(document: &AchievementDocument, operation: &str) -> Result<(), AchievementError> {
    if document.fields.status == AchievementStatus::Draft {
        Ok(())
    } else {
        Err(AchievementError::InvalidState(format!(
            "cannot {operation} achievement {} in status {}",
            document.document_id, document.fields.status
        )))
    }
}

fn document_not_found(document_id: &DocumentId) -> AchievementError {
    AchievementError::NotFound(format!("achievement {document_id} not found"))
}

fn log_drift(view: &AchievementView, operation: &str) {
    if let Some(drift) = view.status_drift {
        tracing::warn!(
            document_id = %view.document.document_id,
            operation,
            document_status = drift.document_status.as_str(),
            reference_status = drift.reference_status.as_str(),
            "status drift observed on read"
        );
    }
}
