use std::collections::BTreeSet;

use achievement_ledger_core::model::MAX_PAGE_SIZE;
use achievement_ledger_core::{
    AchievementError, AchievementReference, Actor, ConsistencyIssue, ConsistencyReport,
    DocumentId, IssueSeverity, PageRequest, RequestScope, Role, StudentId,
    CONSISTENCY_CONTRACT_VERSION,
};

use crate::{store_call, LifecycleEngine};

impl LifecycleEngine {
    /// Read-only comparison of both stores for every student.
    pub fn consistency_check(
        &self,
        scope: &RequestScope,
        actor: &Actor,
    ) -> Result<ConsistencyReport, AchievementError> {
        if actor.role != Role::Admin {
            return Err(AchievementError::Forbidden(
                "consistency check requires the admin role".to_string(),
            ));
        }

        let owners = store_call(scope, "list students", || self.identity.all_students())?;
        let mut issues = Vec::new();
        let mut checked_references = 0;
        let mut checked_documents = 0;

        for owner_id in &owners {
            let references = self.all_references(scope, *owner_id)?;
            let documents = store_call(scope, "list owner documents", || {
                self.documents.list_by_owner(*owner_id)
            })?;
            checked_references += references.len();
            checked_documents += documents.len();

            let referenced: BTreeSet<&DocumentId> = references
                .iter()
                .map(|reference| &reference.document_id)
                .collect();

            for reference in &references {
                let document = documents
                    .iter()
                    .find(|document| document.document_id == reference.document_id);
                match document {
                    None => issues.push(ConsistencyIssue {
                        code: "document_missing".to_string(),
                        severity: IssueSeverity::Error,
                        document_id: reference.document_id.clone(),
                        reference_id: Some(reference.reference_id),
                        message: "reference points at an absent or soft-deleted document"
                            .to_string(),
                    }),
                    Some(document) if document.fields.status != reference.status => {
                        issues.push(ConsistencyIssue {
                            code: "status_mismatch".to_string(),
                            severity: IssueSeverity::Error,
                            document_id: reference.document_id.clone(),
                            reference_id: Some(reference.reference_id),
                            message: format!(
                                "document status {} differs from reference status {}",
                                document.fields.status, reference.status
                            ),
                        });
                    }
                    Some(_) => {}
                }
            }

            for document in &documents {
                if !referenced.contains(&document.document_id) {
                    issues.push(ConsistencyIssue {
                        code: "reference_missing".to_string(),
                        severity: IssueSeverity::Warning,
                        document_id: document.document_id.clone(),
                        reference_id: None,
                        message: "live document has no reference row".to_string(),
                    });
                }
            }
        }

        let report = ConsistencyReport {
            contract_version: CONSISTENCY_CONTRACT_VERSION.to_string(),
            healthy: issues.is_empty(),
            checked_owners: owners.len(),
            checked_references,
            checked_documents,
            issues,
        };
        if !report.healthy {
            tracing::warn!(
                issues = report.issues.len(),
                checked_owners = report.checked_owners,
                "consistency check found drift"
            );
        }
        Ok(report)
    }

    fn all_references(
        &self,
        scope: &RequestScope,
        owner_id: StudentId,
    ) -> Result<Vec<AchievementReference>, AchievementError> {
        let mut collected = Vec::new();
        let mut page = 1;
        loop {
            let request = PageRequest::new(page, i64::from(MAX_PAGE_SIZE));
            let (batch, total) = store_call(scope, "list references", || {
                self.references.list_by_owners(&[owner_id], request)
            })?;
            let exhausted = batch.is_empty();
            collected.extend(batch);
            if exhausted || u64::try_from(collected.len()).unwrap_or(u64::MAX) >= total {
                return Ok(collected);
            }
            page += 1;
        }
    }
}
