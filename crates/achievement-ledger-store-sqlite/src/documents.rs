use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use achievement_ledger_core::{
    now_utc, AchievementDocument, AchievementFields, AggregateBucket, AggregateDimension,
    AggregateFilter, DocumentId, DocumentStore, NewDocument, StudentId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::{
    apply_schema, collect_rows, conversion_error, id_list_json, new_document_id, open_connection,
    parse_optional_timestamp_column, parse_timestamp_column, parse_ulid_column, schema_status,
    timestamp_to_sql, SchemaStatus,
};

const DOCUMENT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_DOCUMENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS achievement_documents (
  doc_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  document_id TEXT NOT NULL UNIQUE,
  owner_id TEXT NOT NULL,
  achievement_type TEXT NOT NULL CHECK (
    achievement_type IN (
      'academic',
      'competition',
      'organization',
      'publication',
      'certification',
      'other'
    )
  ),
  status TEXT NOT NULL CHECK (status IN ('draft', 'submitted', 'verified', 'rejected')),
  points REAL NOT NULL DEFAULT 0 CHECK (points >= 0),
  body_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_achievement_documents_owner
  ON achievement_documents(owner_id, deleted_at);
CREATE INDEX IF NOT EXISTS idx_achievement_documents_type
  ON achievement_documents(achievement_type, deleted_at);
";

const DOCUMENT_COLUMNS: &str =
    "document_id, owner_id, body_json, created_at, updated_at, deleted_at";

/// Content store. `body_json` is authoritative; the `achievement_type`,
/// `status` and `points` columns are copies kept for indexing and grouping.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = open_connection(path, busy_timeout)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        apply_schema(&conn, DOCUMENT_SCHEMA_VERSION, SCHEMA_DOCUMENTS_V1)
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock()?;
        schema_status(&conn, DOCUMENT_SCHEMA_VERSION)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("document store connection lock poisoned"))
    }

    #[cfg(test)]
    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> T) -> T {
        match self.conn.lock() {
            Ok(conn) => op(&conn),
            Err(err) => panic!("lock poisoned: {err}"),
        }
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn insert(&self, document: &NewDocument) -> Result<AchievementDocument> {
        let document_id = new_document_id();
        let now = now_utc();
        let body = serde_json::to_string(&document.fields)
            .context("failed to serialize achievement body")?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO achievement_documents(
                document_id, owner_id, achievement_type, status, points,
                body_json, created_at, updated_at, deleted_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, NULL)",
            params![
                document_id.as_str(),
                document.owner_id.to_string(),
                document.fields.achievement_type.as_str(),
                document.fields.status.as_str(),
                document.fields.points,
                body,
                timestamp_to_sql(now)?,
            ],
        )
        .context("failed to insert achievement document")?;

        Ok(AchievementDocument {
            document_id,
            owner_id: document.owner_id,
            fields: document.fields.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    fn get_by_id(&self, document_id: &DocumentId) -> Result<Option<AchievementDocument>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM achievement_documents WHERE document_id = ?1"),
            params![document_id.as_str()],
            parse_document_row,
        )
        .optional()
        .context("failed to load achievement document")
    }

    fn get_many(&self, document_ids: &[DocumentId]) -> Result<Vec<AchievementDocument>> {
        if document_ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_list = id_list_json(document_ids)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM achievement_documents
             WHERE deleted_at IS NULL
               AND document_id IN (SELECT value FROM json_each(?1))"
        ))?;
        let rows = stmt.query_map(params![id_list], parse_document_row)?;
        collect_rows(rows).context("failed to load achievement documents")
    }

    fn list_by_owner(&self, owner_id: StudentId) -> Result<Vec<AchievementDocument>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM achievement_documents
             WHERE owner_id = ?1 AND deleted_at IS NULL
             ORDER BY doc_seq DESC"
        ))?;
        let rows = stmt.query_map(params![owner_id.to_string()], parse_document_row)?;
        collect_rows(rows).context("failed to list achievement documents by owner")
    }

    fn replace_fields(&self, document_id: &DocumentId, fields: &AchievementFields) -> Result<bool> {
        let body =
            serde_json::to_string(fields).context("failed to serialize achievement body")?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE achievement_documents
                 SET achievement_type = ?1, status = ?2, points = ?3, body_json = ?4, updated_at = ?5
                 WHERE document_id = ?6 AND deleted_at IS NULL",
                params![
                    fields.achievement_type.as_str(),
                    fields.status.as_str(),
                    fields.points,
                    body,
                    timestamp_to_sql(now_utc())?,
                    document_id.as_str(),
                ],
            )
            .context("failed to replace achievement document fields")?;
        Ok(changed > 0)
    }

    fn soft_delete(&self, document_id: &DocumentId) -> Result<bool> {
        let now = timestamp_to_sql(now_utc())?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE achievement_documents SET deleted_at = ?1, updated_at = ?1
                 WHERE document_id = ?2 AND deleted_at IS NULL",
                params![now, document_id.as_str()],
            )
            .context("failed to soft-delete achievement document")?;
        Ok(changed > 0)
    }

    fn aggregate(
        &self,
        filter: &AggregateFilter,
        dimension: AggregateDimension,
    ) -> Result<Vec<AggregateBucket>> {
        if filter.owners.is_empty() {
            return Ok(Vec::new());
        }

        let mut values = vec![id_list_json(&filter.owners)?];
        let mut predicate =
            String::from("deleted_at IS NULL AND owner_id IN (SELECT value FROM json_each(?1))");
        if let Some(kind) = filter.achievement_type {
            values.push(kind.as_str().to_string());
            predicate.push_str(" AND achievement_type = ?2");
        }

        let query = match dimension {
            AggregateDimension::Type => format!(
                "SELECT achievement_type, COUNT(*), COALESCE(SUM(points), 0.0)
                 FROM achievement_documents WHERE {predicate}
                 GROUP BY achievement_type ORDER BY achievement_type ASC"
            ),
            AggregateDimension::Month => format!(
                "SELECT substr(created_at, 1, 7) AS period, COUNT(*), COALESCE(SUM(points), 0.0)
                 FROM achievement_documents WHERE {predicate}
                 GROUP BY period ORDER BY period DESC"
            ),
            AggregateDimension::Owner { limit } => format!(
                "SELECT owner_id, COUNT(*), COALESCE(SUM(points), 0.0) AS total_points
                 FROM achievement_documents WHERE {predicate}
                 GROUP BY owner_id ORDER BY total_points DESC, COUNT(*) DESC, owner_id ASC
                 LIMIT {limit}"
            ),
            AggregateDimension::CompetitionLevel => format!(
                "SELECT json_extract(body_json, '$.details.competition_level') AS level,
                        COUNT(*), COALESCE(SUM(points), 0.0)
                 FROM achievement_documents
                 WHERE {predicate}
                   AND json_extract(body_json, '$.details.competition_level') IS NOT NULL
                 GROUP BY level ORDER BY level ASC"
            ),
        };

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            let count: i64 = row.get(1)?;
            Ok(AggregateBucket {
                key: row.get(0)?,
                count: u64::try_from(count)
                    .map_err(|_| conversion_error(1, format!("invalid count: {count}")))?,
                total_points: row.get(2)?,
            })
        })?;
        collect_rows(rows).context("failed to aggregate achievement documents")
    }
}

fn parse_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AchievementDocument> {
    let owner_raw: String = row.get(1)?;
    let body_raw: String = row.get(2)?;
    let created_raw: String = row.get(3)?;
    let updated_raw: String = row.get(4)?;
    let deleted_raw: Option<String> = row.get(5)?;

    let fields: AchievementFields = serde_json::from_str(&body_raw)
        .map_err(|err| conversion_error(2, format!("invalid stored body_json: {err}")))?;

    Ok(AchievementDocument {
        document_id: DocumentId::new(row.get::<_, String>(0)?),
        owner_id: StudentId(parse_ulid_column(1, &owner_raw)?),
        fields,
        created_at: parse_timestamp_column(3, &created_raw)?,
        updated_at: parse_timestamp_column(4, &updated_raw)?,
        deleted_at: parse_optional_timestamp_column(5, deleted_raw.as_deref())?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::test_support::must;
    use achievement_ledger_core::{
        AchievementDetails, AchievementStatus, AchievementType, CompetitionLevel,
    };
    use serde_json::json;

    fn fixture_store() -> SqliteDocumentStore {
        let store = must(SqliteDocumentStore::open(
            Path::new(":memory:"),
            Duration::from_millis(500),
        ));
        must(store.migrate());
        store
    }

    fn fixture_fields(kind: AchievementType, points: f64) -> AchievementFields {
        AchievementFields {
            achievement_type: kind,
            title: format!("{kind} achievement"),
            description: "fixture".to_string(),
            details: AchievementDetails::default(),
            attachments: Vec::new(),
            tags: Vec::new(),
            points,
            status: AchievementStatus::Draft,
        }
    }

    fn insert(store: &SqliteDocumentStore, owner: StudentId, fields: AchievementFields) -> DocumentId {
        must(store.insert(&NewDocument {
            owner_id: owner,
            fields,
        }))
        .document_id
    }

    #[test]
    fn insert_assigns_id_and_round_trips_extension_map() {
        let store = fixture_store();
        let owner = StudentId::new();
        let mut fields = fixture_fields(AchievementType::Competition, 0.0);
        fields.details.competition.rank = Some(1);
        fields
            .details
            .custom_fields
            .insert("judges".to_string(), json!({"panel": ["a", "b"], "blind": true}));

        let created = must(store.insert(&NewDocument {
            owner_id: owner,
            fields: fields.clone(),
        }));
        assert!(!created.document_id.as_str().is_empty());

        let loaded = match must(store.get_by_id(&created.document_id)) {
            Some(value) => value,
            None => panic!("inserted document missing"),
        };
        assert_eq!(loaded.owner_id, owner);
        assert_eq!(loaded.fields, fields);
        assert_eq!(loaded.created_at, created.created_at);
    }

    #[test]
    fn soft_delete_hides_document_from_listing_but_not_direct_lookup() {
        let store = fixture_store();
        let owner = StudentId::new();
        let kept = insert(&store, owner, fixture_fields(AchievementType::Academic, 1.0));
        let removed = insert(&store, owner, fixture_fields(AchievementType::Other, 2.0));

        assert!(must(store.soft_delete(&removed)));
        assert!(!must(store.soft_delete(&removed)));

        let listed = must(store.list_by_owner(owner));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].document_id, kept);

        let many = must(store.get_many(&[kept.clone(), removed.clone()]));
        assert_eq!(many.len(), 1);

        let direct = match must(store.get_by_id(&removed)) {
            Some(value) => value,
            None => panic!("soft-deleted document should stay readable by id"),
        };
        assert!(direct.is_deleted());
        assert!(!must(store.replace_fields(
            &removed,
            &fixture_fields(AchievementType::Other, 3.0)
        )));
    }

    #[test]
    fn replace_fields_overwrites_body_and_refreshes_timestamp() {
        let store = fixture_store();
        let owner = StudentId::new();
        let id = insert(&store, owner, fixture_fields(AchievementType::Academic, 1.0));
        let before = match must(store.get_by_id(&id)) {
            Some(value) => value,
            None => panic!("missing document"),
        };

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut next = before.fields.clone();
        next.status = AchievementStatus::Submitted;
        next.points = 7.5;
        assert!(must(store.replace_fields(&id, &next)));

        let after = match must(store.get_by_id(&id)) {
            Some(value) => value,
            None => panic!("missing document"),
        };
        assert_eq!(after.fields.status, AchievementStatus::Submitted);
        assert_eq!(after.fields.points, 7.5);
        assert!(after.updated_at > before.updated_at);

        let column_status: String = store.with_connection(|conn| {
            match conn.query_row(
                "SELECT status FROM achievement_documents WHERE document_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            ) {
                Ok(value) => value,
                Err(err) => panic!("failed to read status column: {err}"),
            }
        });
        assert_eq!(column_status, "submitted");
    }

    #[test]
    fn aggregate_groups_by_every_dimension() {
        let store = fixture_store();
        let alice = StudentId::new();
        let bob = StudentId::new();
        let outsider = StudentId::new();

        let mut national = fixture_fields(AchievementType::Competition, 30.0);
        national.details.competition.competition_level = Some(CompetitionLevel::National);
        insert(&store, alice, national);
        let mut local = fixture_fields(AchievementType::Competition, 5.0);
        local.details.competition.competition_level = Some(CompetitionLevel::Local);
        insert(&store, bob, local);
        insert(&store, bob, fixture_fields(AchievementType::Competition, 1.0));
        insert(&store, bob, fixture_fields(AchievementType::Publication, 10.0));
        insert(&store, outsider, fixture_fields(AchievementType::Academic, 100.0));
        let deleted = insert(&store, alice, fixture_fields(AchievementType::Academic, 50.0));
        must(store.soft_delete(&deleted));

        let filter = AggregateFilter {
            owners: vec![alice, bob],
            achievement_type: None,
        };

        let by_type = must(store.aggregate(&filter, AggregateDimension::Type));
        let pairs: Vec<(String, u64)> = by_type.iter().map(|b| (b.key.clone(), b.count)).collect();
        assert_eq!(
            pairs,
            vec![("competition".to_string(), 3), ("publication".to_string(), 1)]
        );

        let by_month = must(store.aggregate(&filter, AggregateDimension::Month));
        assert_eq!(by_month.len(), 1);
        assert_eq!(by_month[0].count, 4);
        assert_eq!(by_month[0].key.len(), 7);

        let top = must(store.aggregate(&filter, AggregateDimension::Owner { limit: 1 }));
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].key, alice.to_string());
        assert_eq!(top[0].total_points, 30.0);

        let levels = must(store.aggregate(
            &AggregateFilter {
                owners: vec![alice, bob],
                achievement_type: Some(AchievementType::Competition),
            },
            AggregateDimension::CompetitionLevel,
        ));
        let pairs: Vec<(String, u64)> = levels.iter().map(|b| (b.key.clone(), b.count)).collect();
        assert_eq!(
            pairs,
            vec![("local".to_string(), 1), ("national".to_string(), 1)]
        );

        let empty = must(store.aggregate(
            &AggregateFilter {
                owners: Vec::new(),
                achievement_type: None,
            },
            AggregateDimension::Type,
        ));
        assert!(empty.is_empty());
    }

    #[test]
    fn large_owner_sets_aggregate_and_load_in_one_query() {
        let store = fixture_store();
        let alice = StudentId::new();
        let kept = insert(&store, alice, fixture_fields(AchievementType::Academic, 4.0));

        let mut owners: Vec<StudentId> = (0..40_000).map(|_| StudentId::new()).collect();
        owners.push(alice);
        let filter = AggregateFilter {
            owners,
            achievement_type: Some(AchievementType::Academic),
        };
        let by_type = must(store.aggregate(&filter, AggregateDimension::Type));
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].count, 1);

        let mut ids: Vec<DocumentId> = (0..40_000)
            .map(|index| DocumentId::new(format!("missing-{index}")))
            .collect();
        ids.push(kept.clone());
        let loaded = must(store.get_many(&ids));
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].document_id, kept);
    }

    #[test]
    fn corrupt_body_is_reported_clearly() {
        let store = fixture_store();
        let id = insert(
            &store,
            StudentId::new(),
            fixture_fields(AchievementType::Other, 0.0),
        );
        store.with_connection(|conn| {
            if let Err(err) = conn.execute(
                "UPDATE achievement_documents SET body_json = 'not-json' WHERE document_id = ?1",
                params![id.as_str()],
            ) {
                panic!("failed to corrupt fixture: {err}");
            }
        });

        let err = match store.get_by_id(&id) {
            Ok(_) => panic!("expected corrupt body failure"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("invalid stored body_json"));
    }
}
