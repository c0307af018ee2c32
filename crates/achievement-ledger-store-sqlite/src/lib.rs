//! `SQLite` adapters for the achievement ledger.
//!
//! Documents and the relational side live in two separate database files so
//! that, as in production, no transaction can span both stores:
//!
//! - [`SqliteDocumentStore`] owns `achievement_documents`.
//! - [`RelationalDb`] owns references, the audit log and the identity
//!   directory, and hands out [`SqliteReferenceStore`], [`SqliteAuditLog`]
//!   and [`SqliteDirectory`] handles sharing one connection.
//! - [`FsAttachmentStore`] keeps attachment bytes on the filesystem.

#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use achievement_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AchievementStatus, AchievementType, DocumentId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use time::OffsetDateTime;
use ulid::Ulid;

pub mod blob;
mod directory;
mod documents;
mod relational;

pub use blob::{content_type_for, FsAttachmentStore};
pub use directory::{NewUser, SqliteDirectory, UserRecord};
pub use documents::SqliteDocumentStore;
pub use relational::{RelationalDb, SqliteAuditLog, SqliteReferenceStore};

pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2500;

/// Largest busy timeout `SQLite` accepts, in milliseconds (`i32::MAX`).
pub const MAX_STORE_TIMEOUT_MS: u64 = 2_147_483_647;

/// Locations and limits shared by the CLI and the HTTP service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub document_db: PathBuf,
    pub reference_db: PathBuf,
    pub upload_dir: PathBuf,
    pub store_timeout: Duration,
}

impl StoreConfig {
    #[must_use]
    pub fn new(
        document_db: impl Into<PathBuf>,
        reference_db: impl Into<PathBuf>,
        upload_dir: impl Into<PathBuf>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            document_db: document_db.into(),
            reference_db: reference_db.into(),
            upload_dir: upload_dir.into(),
            store_timeout,
        }
    }
}

/// Every adapter a process needs, opened and migrated.
pub struct LedgerStores {
    pub documents: SqliteDocumentStore,
    pub relational: RelationalDb,
    pub attachments: FsAttachmentStore,
}

/// Applied and expected schema version of one database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    pub current_version: Option<i64>,
    pub target_version: i64,
}

impl SchemaStatus {
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.current_version == Some(self.target_version)
    }
}

/// Schema state of both databases before and after a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub document_before: SchemaStatus,
    pub document_after: SchemaStatus,
    pub reference_before: SchemaStatus,
    pub reference_after: SchemaStatus,
}

impl LedgerStores {
    /// Opens and migrates both databases.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let stores = Self::connect(config)?;
        stores.migrate()?;
        Ok(stores)
    }

    /// Opens both databases without touching their schema.
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        let documents = SqliteDocumentStore::open(&config.document_db, config.store_timeout)?;
        let relational = RelationalDb::open(&config.reference_db, config.store_timeout)?;
        let attachments = FsAttachmentStore::new(&config.upload_dir);
        Ok(Self {
            documents,
            relational,
            attachments,
        })
    }

    pub fn migrate(&self) -> Result<MigrationReport> {
        let document_before = self.documents.schema_status()?;
        let reference_before = self.relational.schema_status()?;
        self.documents.migrate()?;
        self.relational.migrate()?;
        Ok(MigrationReport {
            document_before,
            document_after: self.documents.schema_status()?,
            reference_before,
            reference_after: self.relational.schema_status()?,
        })
    }
}

pub(crate) fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if busy_timeout.as_millis() > u128::from(MAX_STORE_TIMEOUT_MS) {
        return Err(anyhow!(
            "sqlite busy timeout of {}ms exceeds the {MAX_STORE_TIMEOUT_MS}ms limit",
            busy_timeout.as_millis()
        ));
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )
    .context("failed to configure sqlite pragmas")?;
    conn.busy_timeout(busy_timeout)
        .context("failed to configure sqlite busy timeout")?;

    Ok(conn)
}

pub(crate) fn apply_schema(conn: &Connection, version: i64, schema: &str) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    conn.execute_batch(schema)
        .with_context(|| format!("failed to apply schema version {version}"))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, timestamp_to_sql(now_utc())?],
    )
    .context("failed to register schema migration")?;

    tracing::debug!(version, "schema migration applied");
    Ok(())
}

pub(crate) fn schema_status(conn: &Connection, target_version: i64) -> Result<SchemaStatus> {
    let has_table: bool = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'
             )",
            [],
            |row| row.get(0),
        )
        .context("failed to inspect schema_migrations")?;
    let current_version = if has_table {
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("failed to read schema version")?
    } else {
        None
    };
    Ok(SchemaStatus {
        current_version,
        target_version,
    })
}

pub(crate) fn timestamp_to_sql(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

pub(crate) fn new_document_id() -> DocumentId {
    DocumentId::new(Ulid::new().to_string())
}

pub(crate) fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

pub(crate) fn parse_ulid_column(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| conversion_error(column, format!("invalid ULID: {raw}")))
}

pub(crate) fn parse_status_column(column: usize, raw: &str) -> rusqlite::Result<AchievementStatus> {
    AchievementStatus::parse(raw)
        .ok_or_else(|| conversion_error(column, format!("invalid status: {raw}")))
}

pub(crate) fn parse_type_column(column: usize, raw: &str) -> rusqlite::Result<AchievementType> {
    AchievementType::parse(raw)
        .ok_or_else(|| conversion_error(column, format!("invalid achievement_type: {raw}")))
}

pub(crate) fn parse_timestamp_column(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| conversion_error(column, err.to_string()))
}

pub(crate) fn parse_optional_timestamp_column(
    column: usize,
    raw: Option<&str>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.map(|value| parse_timestamp_column(column, value))
        .transpose()
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

/// Binds an id set as one JSON array parameter, expanded in SQL with
/// `IN (SELECT value FROM json_each(?N))`, so the set size is not capped by
/// the bound-variable limit.
pub(crate) fn id_list_json<T: ToString>(ids: &[T]) -> Result<String> {
    let values: Vec<String> = ids.iter().map(ToString::to_string).collect();
    serde_json::to_string(&values).context("failed to encode id list")
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use ulid::Ulid;

    pub fn must<T>(result: anyhow::Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    pub fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("achievement-{label}-{}.sqlite3", Ulid::new()))
    }
}
