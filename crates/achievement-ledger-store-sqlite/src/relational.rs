use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use achievement_ledger_core::{
    AchievementReference, AchievementStatus, AuditEntry, AuditEntryId, AuditLog, DocumentId,
    PageRequest, ReferenceId, ReferenceStore, StudentId, UserId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::directory::SqliteDirectory;
use crate::{
    apply_schema, collect_rows, id_list_json, open_connection, parse_optional_timestamp_column,
    parse_status_column, parse_timestamp_column, parse_ulid_column, schema_status,
    timestamp_to_sql, SchemaStatus,
};

const RELATIONAL_SCHEMA_VERSION: i64 = 1;

const SCHEMA_RELATIONAL_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  credential TEXT NOT NULL UNIQUE,
  full_name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('student', 'advisor', 'admin')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lecturers (
  lecturer_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL UNIQUE,
  lecturer_number TEXT NOT NULL UNIQUE,
  department TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE TABLE IF NOT EXISTS students (
  student_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL UNIQUE,
  student_number TEXT NOT NULL UNIQUE,
  program_study TEXT NOT NULL,
  academic_year TEXT NOT NULL,
  advisor_id TEXT,
  FOREIGN KEY (user_id) REFERENCES users(user_id),
  FOREIGN KEY (advisor_id) REFERENCES lecturers(lecturer_id)
);

CREATE INDEX IF NOT EXISTS idx_students_advisor ON students(advisor_id);

CREATE TABLE IF NOT EXISTS achievement_references (
  ref_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  reference_id TEXT NOT NULL UNIQUE,
  owner_id TEXT NOT NULL,
  document_id TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL CHECK (status IN ('draft', 'submitted', 'verified', 'rejected')),
  submitted_at TEXT,
  verified_at TEXT,
  verified_by TEXT,
  rejection_note TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES students(student_id),
  FOREIGN KEY (verified_by) REFERENCES users(user_id)
);

CREATE INDEX IF NOT EXISTS idx_achievement_references_owner_seq
  ON achievement_references(owner_id, ref_seq);

CREATE TABLE IF NOT EXISTS achievement_audit_entries (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  reference_id TEXT NOT NULL,
  document_id TEXT NOT NULL,
  prior_status TEXT CHECK (
    prior_status IN ('draft', 'submitted', 'verified', 'rejected') OR prior_status IS NULL
  ),
  new_status TEXT NOT NULL CHECK (new_status IN ('draft', 'submitted', 'verified', 'rejected')),
  actor_id TEXT NOT NULL,
  note TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_achievement_audit_entries_no_update
BEFORE UPDATE ON achievement_audit_entries
BEGIN
  SELECT RAISE(FAIL, 'achievement_audit_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_achievement_audit_entries_no_delete
BEFORE DELETE ON achievement_audit_entries
BEGIN
  SELECT RAISE(FAIL, 'achievement_audit_entries is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_achievement_audit_entries_reference_seq
  ON achievement_audit_entries(reference_id, entry_seq);
";

const REFERENCE_COLUMNS: &str = "reference_id, owner_id, document_id, status, submitted_at, \
     verified_at, verified_by, rejection_note, created_at, updated_at";

/// One connection to the relational database, shared by the reference
/// store, the audit log and the directory.
#[derive(Clone)]
pub struct RelationalDb {
    conn: Arc<Mutex<Connection>>,
}

impl RelationalDb {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = open_connection(path, busy_timeout)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        apply_schema(&conn, RELATIONAL_SCHEMA_VERSION, SCHEMA_RELATIONAL_V1)
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock()?;
        schema_status(&conn, RELATIONAL_SCHEMA_VERSION)
    }

    #[must_use]
    pub fn references(&self) -> SqliteReferenceStore {
        SqliteReferenceStore { db: self.clone() }
    }

    #[must_use]
    pub fn audit_log(&self) -> SqliteAuditLog {
        SqliteAuditLog { db: self.clone() }
    }

    #[must_use]
    pub fn directory(&self) -> SqliteDirectory {
        SqliteDirectory::new(self.clone())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("relational store connection lock poisoned"))
    }
}

pub struct SqliteReferenceStore {
    db: RelationalDb,
}

impl ReferenceStore for SqliteReferenceStore {
    fn insert(&self, reference: &AchievementReference) -> Result<AchievementReference> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO achievement_references(
                reference_id, owner_id, document_id, status, submitted_at,
                verified_at, verified_by, rejection_note, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                reference.reference_id.to_string(),
                reference.owner_id.to_string(),
                reference.document_id.as_str(),
                reference.status.as_str(),
                reference.submitted_at.map(timestamp_to_sql).transpose()?,
                reference.verified_at.map(timestamp_to_sql).transpose()?,
                reference.verified_by.map(|id| id.to_string()),
                reference.rejection_note,
                timestamp_to_sql(reference.created_at)?,
                timestamp_to_sql(reference.updated_at)?,
            ],
        )
        .context("failed to insert achievement reference")?;
        Ok(reference.clone())
    }

    fn update(&self, reference: &AchievementReference) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                "UPDATE achievement_references
                 SET status = ?1, submitted_at = ?2, verified_at = ?3, verified_by = ?4,
                     rejection_note = ?5, updated_at = ?6
                 WHERE reference_id = ?7",
                params![
                    reference.status.as_str(),
                    reference.submitted_at.map(timestamp_to_sql).transpose()?,
                    reference.verified_at.map(timestamp_to_sql).transpose()?,
                    reference.verified_by.map(|id| id.to_string()),
                    reference.rejection_note,
                    timestamp_to_sql(reference.updated_at)?,
                    reference.reference_id.to_string(),
                ],
            )
            .context("failed to update achievement reference")?;
        Ok(changed > 0)
    }

    fn get_by_id(&self, reference_id: ReferenceId) -> Result<Option<AchievementReference>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!(
                "SELECT {REFERENCE_COLUMNS} FROM achievement_references WHERE reference_id = ?1"
            ),
            params![reference_id.to_string()],
            parse_reference_row,
        )
        .optional()
        .context("failed to load achievement reference")
    }

    fn get_by_document_id(&self, document_id: &DocumentId) -> Result<Option<AchievementReference>> {
        let conn = self.db.lock()?;
        conn.query_row(
            &format!(
                "SELECT {REFERENCE_COLUMNS} FROM achievement_references WHERE document_id = ?1"
            ),
            params![document_id.as_str()],
            parse_reference_row,
        )
        .optional()
        .context("failed to load achievement reference by document id")
    }

    fn list_by_owners(
        &self,
        owners: &[StudentId],
        page: PageRequest,
    ) -> Result<(Vec<AchievementReference>, u64)> {
        if owners.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let owner_list = id_list_json(owners)?;
        let conn = self.db.lock()?;

        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM achievement_references
                 WHERE owner_id IN (SELECT value FROM json_each(?1))",
                params![owner_list],
                |row| row.get(0),
            )
            .context("failed to count achievement references")?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {REFERENCE_COLUMNS} FROM achievement_references
             WHERE owner_id IN (SELECT value FROM json_each(?1))
             ORDER BY ref_seq DESC
             LIMIT {} OFFSET {}",
            page.page_size,
            page.offset()
        ))?;
        let rows = stmt.query_map(params![owner_list], parse_reference_row)?;
        let references = collect_rows(rows).context("failed to list achievement references")?;

        let total = u64::try_from(total).map_err(|_| anyhow!("negative reference count"))?;
        Ok((references, total))
    }

    fn delete(&self, reference_id: ReferenceId) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM achievement_references WHERE reference_id = ?1",
                params![reference_id.to_string()],
            )
            .context("failed to delete achievement reference")?;
        Ok(changed > 0)
    }
}

pub struct SqliteAuditLog {
    db: RelationalDb,
}

impl AuditLog for SqliteAuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO achievement_audit_entries(
                entry_id, reference_id, document_id, prior_status, new_status,
                actor_id, note, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.entry_id.to_string(),
                entry.reference_id.to_string(),
                entry.document_id.as_str(),
                entry.prior_status.map(AchievementStatus::as_str),
                entry.new_status.as_str(),
                entry.actor_id.to_string(),
                entry.note,
                timestamp_to_sql(entry.created_at)?,
            ],
        )
        .context("failed to append audit entry")?;
        Ok(())
    }

    fn list_by_reference(&self, reference_id: ReferenceId) -> Result<Vec<AuditEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, reference_id, document_id, prior_status, new_status,
                    actor_id, note, created_at
             FROM achievement_audit_entries
             WHERE reference_id = ?1
             ORDER BY entry_seq DESC",
        )?;
        let rows = stmt.query_map(params![reference_id.to_string()], parse_audit_row)?;
        collect_rows(rows).context("failed to list audit entries")
    }
}

fn parse_reference_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AchievementReference> {
    let reference_raw: String = row.get(0)?;
    let owner_raw: String = row.get(1)?;
    let status_raw: String = row.get(3)?;
    let submitted_raw: Option<String> = row.get(4)?;
    let verified_raw: Option<String> = row.get(5)?;
    let verified_by_raw: Option<String> = row.get(6)?;
    let created_raw: String = row.get(8)?;
    let updated_raw: String = row.get(9)?;

    Ok(AchievementReference {
        reference_id: ReferenceId(parse_ulid_column(0, &reference_raw)?),
        owner_id: StudentId(parse_ulid_column(1, &owner_raw)?),
        document_id: DocumentId::new(row.get::<_, String>(2)?),
        status: parse_status_column(3, &status_raw)?,
        submitted_at: parse_optional_timestamp_column(4, submitted_raw.as_deref())?,
        verified_at: parse_optional_timestamp_column(5, verified_raw.as_deref())?,
        verified_by: verified_by_raw
            .as_deref()
            .map(|raw| parse_ulid_column(6, raw).map(UserId))
            .transpose()?,
        rejection_note: row.get(7)?,
        created_at: parse_timestamp_column(8, &created_raw)?,
        updated_at: parse_timestamp_column(9, &updated_raw)?,
    })
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let entry_raw: String = row.get(0)?;
    let reference_raw: String = row.get(1)?;
    let prior_raw: Option<String> = row.get(3)?;
    let new_raw: String = row.get(4)?;
    let actor_raw: String = row.get(5)?;
    let created_raw: String = row.get(7)?;

    Ok(AuditEntry {
        entry_id: AuditEntryId(parse_ulid_column(0, &entry_raw)?),
        reference_id: ReferenceId(parse_ulid_column(1, &reference_raw)?),
        document_id: DocumentId::new(row.get::<_, String>(2)?),
        prior_status: prior_raw
            .as_deref()
            .map(|raw| parse_status_column(3, raw))
            .transpose()?,
        new_status: parse_status_column(4, &new_raw)?,
        actor_id: UserId(parse_ulid_column(5, &actor_raw)?),
        note: row.get(6)?,
        created_at: parse_timestamp_column(7, &created_raw)?,
    })
}
