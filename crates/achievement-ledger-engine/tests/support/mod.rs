//! In-memory collaborators with call recording and fault injection.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use achievement_ledger_core::{
    month_bucket, now_utc, AchievementDocument, AchievementError, AchievementFields,
    AchievementReference, AchievementType, Actor, AggregateBucket, AggregateDimension,
    AggregateFilter, AttachmentBlobStore, AuditEntry, AuditLog, DocumentId, DocumentStore,
    IdentityProvider, LecturerId, NewAchievement, NewDocument, PageRequest, ReferenceId,
    ReferenceStore, RequestScope, Role, StoredBlob, StudentId, StudentProfile, UserId,
};
use achievement_ledger_engine::LifecycleEngine;
use anyhow::{anyhow, Result};
use ulid::Ulid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn must<T>(result: Result<T, AchievementError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("unexpected engine error: {err}"),
    }
}

pub fn scope() -> RequestScope {
    RequestScope::with_timeout(Duration::from_secs(30))
}

/// Shared call log and failure switchboard. Operation names look like
/// `references.insert`.
#[derive(Default)]
pub struct Faults {
    failing: Mutex<BTreeSet<&'static str>>,
    calls: Mutex<Vec<&'static str>>,
    cancel_on: Mutex<Option<(&'static str, Arc<AtomicBool>)>>,
}

impl Faults {
    pub fn fail(&self, operation: &'static str) {
        lock(&self.failing).insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        lock(&self.failing).remove(operation);
    }

    /// Raises `flag` while `operation` runs; the call itself still succeeds.
    pub fn cancel_during(&self, operation: &'static str, flag: Arc<AtomicBool>) {
        *lock(&self.cancel_on) = Some((operation, flag));
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| **call == operation)
            .count()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    fn enter(&self, operation: &'static str) -> Result<()> {
        lock(&self.calls).push(operation);
        if let Some((target, flag)) = lock(&self.cancel_on).as_ref() {
            if *target == operation {
                flag.store(true, Ordering::SeqCst);
            }
        }
        if lock(&self.failing).contains(operation) {
            return Err(anyhow!("injected failure in {operation}"));
        }
        Ok(())
    }
}

pub struct MemoryDocuments {
    faults: Arc<Faults>,
    rows: Mutex<Vec<AchievementDocument>>,
}

impl MemoryDocuments {
    pub fn raw(&self, document_id: &DocumentId) -> Option<AchievementDocument> {
        lock(&self.rows)
            .iter()
            .find(|document| &document.document_id == document_id)
            .cloned()
    }
}

impl DocumentStore for MemoryDocuments {
    fn insert(&self, document: &NewDocument) -> Result<AchievementDocument> {
        self.faults.enter("documents.insert")?;
        let now = now_utc();
        let stored = AchievementDocument {
            document_id: DocumentId::new(Ulid::new().to_string()),
            owner_id: document.owner_id,
            fields: document.fields.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        lock(&self.rows).push(stored.clone());
        Ok(stored)
    }

    fn get_by_id(&self, document_id: &DocumentId) -> Result<Option<AchievementDocument>> {
        self.faults.enter("documents.get_by_id")?;
        Ok(self.raw(document_id))
    }

    fn get_many(&self, document_ids: &[DocumentId]) -> Result<Vec<AchievementDocument>> {
        self.faults.enter("documents.get_many")?;
        Ok(lock(&self.rows)
            .iter()
            .filter(|document| {
                !document.is_deleted() && document_ids.contains(&document.document_id)
            })
            .cloned()
            .collect())
    }

    fn list_by_owner(&self, owner_id: StudentId) -> Result<Vec<AchievementDocument>> {
        self.faults.enter("documents.list_by_owner")?;
        Ok(lock(&self.rows)
            .iter()
            .filter(|document| !document.is_deleted() && document.owner_id == owner_id)
            .cloned()
            .collect())
    }

    fn replace_fields(&self, document_id: &DocumentId, fields: &AchievementFields) -> Result<bool> {
        self.faults.enter("documents.replace_fields")?;
        let mut rows = lock(&self.rows);
        let Some(document) = rows
            .iter_mut()
            .find(|document| &document.document_id == document_id && !document.is_deleted())
        else {
            return Ok(false);
        };
        document.fields = fields.clone();
        document.updated_at = now_utc();
        Ok(true)
    }

    fn soft_delete(&self, document_id: &DocumentId) -> Result<bool> {
        self.faults.enter("documents.soft_delete")?;
        let mut rows = lock(&self.rows);
        let Some(document) = rows
            .iter_mut()
            .find(|document| &document.document_id == document_id && !document.is_deleted())
        else {
            return Ok(false);
        };
        let now = now_utc();
        document.deleted_at = Some(now);
        document.updated_at = now;
        Ok(true)
    }

    fn aggregate(
        &self,
        filter: &AggregateFilter,
        dimension: AggregateDimension,
    ) -> Result<Vec<AggregateBucket>> {
        self.faults.enter("documents.aggregate")?;
        let rows = lock(&self.rows);
        let mut buckets: BTreeMap<String, (u64, f64)> = BTreeMap::new();
        for document in rows.iter().filter(|document| {
            !document.is_deleted()
                && filter.owners.contains(&document.owner_id)
                && match filter.achievement_type {
                    Some(kind) => kind == document.fields.achievement_type,
                    None => true,
                }
        }) {
            let key = match dimension {
                AggregateDimension::Type => {
                    Some(document.fields.achievement_type.as_str().to_string())
                }
                AggregateDimension::Month => Some(month_bucket(document.created_at)),
                AggregateDimension::Owner { .. } => Some(document.owner_id.to_string()),
                AggregateDimension::CompetitionLevel => document
                    .fields
                    .details
                    .competition
                    .competition_level
                    .map(|level| level.as_str().to_string()),
            };
            if let Some(key) = key {
                let entry = buckets.entry(key).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += document.fields.points;
            }
        }

        let mut out: Vec<AggregateBucket> = buckets
            .into_iter()
            .map(|(key, (count, total_points))| AggregateBucket {
                key,
                count,
                total_points,
            })
            .collect();
        match dimension {
            AggregateDimension::Month => out.reverse(),
            AggregateDimension::Owner { limit } => {
                out.sort_by(|left, right| right.total_points.total_cmp(&left.total_points));
                out.truncate(limit);
            }
            AggregateDimension::Type | AggregateDimension::CompetitionLevel => {}
        }
        Ok(out)
    }
}

pub struct MemoryReferences {
    faults: Arc<Faults>,
    rows: Mutex<Vec<AchievementReference>>,
}

impl MemoryReferences {
    pub fn raw_by_document(&self, document_id: &DocumentId) -> Option<AchievementReference> {
        lock(&self.rows)
            .iter()
            .find(|reference| &reference.document_id == document_id)
            .cloned()
    }

    pub fn row_count(&self) -> usize {
        lock(&self.rows).len()
    }
}

impl ReferenceStore for MemoryReferences {
    fn insert(&self, reference: &AchievementReference) -> Result<AchievementReference> {
        self.faults.enter("references.insert")?;
        let mut rows = lock(&self.rows);
        if rows
            .iter()
            .any(|existing| existing.document_id == reference.document_id)
        {
            return Err(anyhow!("UNIQUE constraint failed: document_id"));
        }
        rows.push(reference.clone());
        Ok(reference.clone())
    }

    fn update(&self, reference: &AchievementReference) -> Result<bool> {
        self.faults.enter("references.update")?;
        let mut rows = lock(&self.rows);
        let Some(existing) = rows
            .iter_mut()
            .find(|existing| existing.reference_id == reference.reference_id)
        else {
            return Ok(false);
        };
        *existing = reference.clone();
        Ok(true)
    }

    fn get_by_id(&self, reference_id: ReferenceId) -> Result<Option<AchievementReference>> {
        self.faults.enter("references.get_by_id")?;
        Ok(lock(&self.rows)
            .iter()
            .find(|reference| reference.reference_id == reference_id)
            .cloned())
    }

    fn get_by_document_id(&self, document_id: &DocumentId) -> Result<Option<AchievementReference>> {
        self.faults.enter("references.get_by_document_id")?;
        Ok(self.raw_by_document(document_id))
    }

    fn list_by_owners(
        &self,
        owners: &[StudentId],
        page: PageRequest,
    ) -> Result<(Vec<AchievementReference>, u64)> {
        self.faults.enter("references.list_by_owners")?;
        let rows = lock(&self.rows);
        let matching: Vec<&AchievementReference> = rows
            .iter()
            .rev()
            .filter(|reference| owners.contains(&reference.owner_id))
            .collect();
        let total = u64::try_from(matching.len()).unwrap_or(u64::MAX);
        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        let size = usize::try_from(page.page_size).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(size)
            .cloned()
            .collect();
        Ok((items, total))
    }

    fn delete(&self, reference_id: ReferenceId) -> Result<bool> {
        self.faults.enter("references.delete")?;
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|reference| reference.reference_id != reference_id);
        Ok(rows.len() < before)
    }
}

pub struct MemoryAudit {
    faults: Arc<Faults>,
    rows: Mutex<Vec<AuditEntry>>,
}

impl MemoryAudit {
    pub fn row_count(&self) -> usize {
        lock(&self.rows).len()
    }
}

impl AuditLog for MemoryAudit {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.faults.enter("audit.append")?;
        lock(&self.rows).push(entry.clone());
        Ok(())
    }

    fn list_by_reference(&self, reference_id: ReferenceId) -> Result<Vec<AuditEntry>> {
        self.faults.enter("audit.list_by_reference")?;
        Ok(lock(&self.rows)
            .iter()
            .rev()
            .filter(|entry| entry.reference_id == reference_id)
            .cloned()
            .collect())
    }
}

pub struct MemoryIdentity {
    faults: Arc<Faults>,
    actors: Mutex<HashMap<String, Actor>>,
    students: Mutex<Vec<StudentProfile>>,
}

impl IdentityProvider for MemoryIdentity {
    fn resolve_actor(&self, credential: &str) -> Result<Option<Actor>> {
        self.faults.enter("identity.resolve_actor")?;
        Ok(lock(&self.actors).get(credential).copied())
    }

    fn is_advisor_of(&self, advisor_id: LecturerId, student_id: StudentId) -> Result<bool> {
        self.faults.enter("identity.is_advisor_of")?;
        Ok(lock(&self.students).iter().any(|profile| {
            profile.student_id == student_id && profile.advisor_id == Some(advisor_id)
        }))
    }

    fn advisees(&self, advisor_id: LecturerId) -> Result<Vec<StudentId>> {
        self.faults.enter("identity.advisees")?;
        Ok(lock(&self.students)
            .iter()
            .filter(|profile| profile.advisor_id == Some(advisor_id))
            .map(|profile| profile.student_id)
            .collect())
    }

    fn all_students(&self) -> Result<Vec<StudentId>> {
        self.faults.enter("identity.all_students")?;
        Ok(lock(&self.students)
            .iter()
            .map(|profile| profile.student_id)
            .collect())
    }

    fn student_profiles(&self, student_ids: &[StudentId]) -> Result<Vec<StudentProfile>> {
        self.faults.enter("identity.student_profiles")?;
        Ok(lock(&self.students)
            .iter()
            .filter(|profile| student_ids.contains(&profile.student_id))
            .cloned()
            .collect())
    }
}

pub struct MemoryBlobs {
    pub puts: Mutex<Vec<(String, usize)>>,
}

impl AttachmentBlobStore for MemoryBlobs {
    fn put(&self, file_name: &str, bytes: &[u8]) -> Result<StoredBlob> {
        lock(&self.puts).push((file_name.to_string(), bytes.len()));
        Ok(StoredBlob {
            url: format!("/uploads/{}_{file_name}", Ulid::new()),
            content_type: "application/pdf".to_string(),
        })
    }
}

pub struct Harness {
    pub engine: LifecycleEngine,
    pub faults: Arc<Faults>,
    pub documents: Arc<MemoryDocuments>,
    pub references: Arc<MemoryReferences>,
    pub audit: Arc<MemoryAudit>,
    pub identity: Arc<MemoryIdentity>,
}

impl Harness {
    pub fn new() -> Self {
        let faults = Arc::new(Faults::default());
        let documents = Arc::new(MemoryDocuments {
            faults: Arc::clone(&faults),
            rows: Mutex::new(Vec::new()),
        });
        let references = Arc::new(MemoryReferences {
            faults: Arc::clone(&faults),
            rows: Mutex::new(Vec::new()),
        });
        let audit = Arc::new(MemoryAudit {
            faults: Arc::clone(&faults),
            rows: Mutex::new(Vec::new()),
        });
        let identity = Arc::new(MemoryIdentity {
            faults: Arc::clone(&faults),
            actors: Mutex::new(HashMap::new()),
            students: Mutex::new(Vec::new()),
        });
        let engine = LifecycleEngine::new(
            documents.clone(),
            references.clone(),
            audit.clone(),
            identity.clone(),
        );
        Self {
            engine,
            faults,
            documents,
            references,
            audit,
            identity,
        }
    }

    fn register(&self, credential: &str, role: Role) -> Actor {
        let actor = Actor {
            user_id: UserId::new(),
            role,
        };
        lock(&self.identity.actors).insert(credential.to_string(), actor);
        actor
    }

    pub fn advisor(&self, credential: &str) -> Actor {
        self.register(credential, Role::Advisor(LecturerId::new()))
    }

    pub fn admin(&self, credential: &str) -> Actor {
        self.register(credential, Role::Admin)
    }

    pub fn student(&self, credential: &str, advisor: Option<&Actor>) -> Actor {
        let student_id = StudentId::new();
        let actor = self.register(credential, Role::Student(student_id));
        let advisor_id = advisor.and_then(|advisor| match advisor.role {
            Role::Advisor(lecturer_id) => Some(lecturer_id),
            _ => None,
        });
        lock(&self.identity.students).push(StudentProfile {
            student_id,
            user_id: actor.user_id,
            student_number: format!("S-{credential}"),
            full_name: format!("Student {credential}"),
            program_study: "Informatics".to_string(),
            academic_year: "2024".to_string(),
            advisor_id,
        });
        actor
    }
}

pub fn competition(title: &str) -> NewAchievement {
    NewAchievement {
        achievement_type: AchievementType::Competition.as_str().to_string(),
        title: title.to_string(),
        description: format!("{title} final round"),
        details: Default::default(),
        tags: vec!["robotics".to_string()],
        points: None,
    }
}
