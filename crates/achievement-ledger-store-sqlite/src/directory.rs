use achievement_ledger_core::{
    now_utc, Actor, IdentityProvider, LecturerId, Role, RoleKind, StudentId, StudentProfile,
    UserId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::relational::RelationalDb;
use crate::{collect_rows, conversion_error, id_list_json, parse_ulid_column, timestamp_to_sql};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewUser {
    pub credential: String,
    pub full_name: String,
    pub role: RoleKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub full_name: String,
    pub role: RoleKind,
}

/// Users, students, lecturers and advisor assignments.
pub struct SqliteDirectory {
    db: RelationalDb,
}

impl SqliteDirectory {
    pub(crate) fn new(db: RelationalDb) -> Self {
        Self { db }
    }

    pub fn register_user(&self, user: &NewUser) -> Result<UserRecord> {
        if user.credential.trim().is_empty() {
            return Err(anyhow!("credential must not be empty"));
        }
        if user.full_name.trim().is_empty() {
            return Err(anyhow!("full_name must not be empty"));
        }

        let user_id = UserId::new();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO users(user_id, credential, full_name, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id.to_string(),
                user.credential,
                user.full_name,
                user.role.as_str(),
                timestamp_to_sql(now_utc())?,
            ],
        )
        .context("failed to insert user")?;

        Ok(UserRecord {
            user_id,
            full_name: user.full_name.clone(),
            role: user.role,
        })
    }

    pub fn register_lecturer(
        &self,
        user_id: UserId,
        lecturer_number: &str,
        department: &str,
    ) -> Result<LecturerId> {
        self.require_role(user_id, RoleKind::Advisor)?;

        let lecturer_id = LecturerId::new();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO lecturers(lecturer_id, user_id, lecturer_number, department)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                lecturer_id.to_string(),
                user_id.to_string(),
                lecturer_number,
                department,
            ],
        )
        .context("failed to insert lecturer")?;
        Ok(lecturer_id)
    }

    pub fn register_student(
        &self,
        user_id: UserId,
        student_number: &str,
        program_study: &str,
        academic_year: &str,
        advisor_id: Option<LecturerId>,
    ) -> Result<StudentId> {
        self.require_role(user_id, RoleKind::Student)?;

        let student_id = StudentId::new();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO students(
                student_id, user_id, student_number, program_study, academic_year, advisor_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                student_id.to_string(),
                user_id.to_string(),
                student_number,
                program_study,
                academic_year,
                advisor_id.map(|id| id.to_string()),
            ],
        )
        .context("failed to insert student")?;
        Ok(student_id)
    }

    pub fn assign_advisor(&self, student_id: StudentId, advisor_id: LecturerId) -> Result<()> {
        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                "UPDATE students SET advisor_id = ?1 WHERE student_id = ?2",
                params![advisor_id.to_string(), student_id.to_string()],
            )
            .context("failed to assign advisor")?;
        if changed == 0 {
            return Err(anyhow!("student {student_id} not found"));
        }
        Ok(())
    }

    fn require_role(&self, user_id: UserId, expected: RoleKind) -> Result<()> {
        let conn = self.db.lock()?;
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM users WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load user role")?;

        match role.as_deref().and_then(RoleKind::parse) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(anyhow!(
                "user {user_id} has role {}, expected {}",
                actual.as_str(),
                expected.as_str()
            )),
            None => Err(anyhow!("user {user_id} not found")),
        }
    }
}

impl IdentityProvider for SqliteDirectory {
    fn resolve_actor(&self, credential: &str) -> Result<Option<Actor>> {
        let conn = self.db.lock()?;
        let user: Option<(String, String)> = conn
            .query_row(
                "SELECT user_id, role FROM users WHERE credential = ?1",
                params![credential],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to resolve credential")?;
        let Some((user_raw, role_raw)) = user else {
            return Ok(None);
        };

        let user_id = UserId(parse_ulid_column(0, &user_raw)?);
        let role = match RoleKind::parse(&role_raw) {
            Some(RoleKind::Admin) => Some(Role::Admin),
            Some(RoleKind::Student) => conn
                .query_row(
                    "SELECT student_id FROM students WHERE user_id = ?1",
                    params![user_raw],
                    |row| {
                        let raw: String = row.get(0)?;
                        parse_ulid_column(0, &raw)
                    },
                )
                .optional()
                .context("failed to load student profile")?
                .map(|id| Role::Student(StudentId(id))),
            Some(RoleKind::Advisor) => conn
                .query_row(
                    "SELECT lecturer_id FROM lecturers WHERE user_id = ?1",
                    params![user_raw],
                    |row| {
                        let raw: String = row.get(0)?;
                        parse_ulid_column(0, &raw)
                    },
                )
                .optional()
                .context("failed to load lecturer profile")?
                .map(|id| Role::Advisor(LecturerId(id))),
            None => return Err(conversion_error(1, format!("invalid role: {role_raw}")).into()),
        };

        if role.is_none() {
            tracing::warn!(
                user_id = %user_id,
                role = %role_raw,
                "credential resolved to a user without a role profile"
            );
        }
        Ok(role.map(|role| Actor { user_id, role }))
    }

    fn is_advisor_of(&self, advisor_id: LecturerId, student_id: StudentId) -> Result<bool> {
        let conn = self.db.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM students WHERE student_id = ?1 AND advisor_id = ?2",
                params![student_id.to_string(), advisor_id.to_string()],
                |row| row.get(0),
            )
            .context("failed to check advisor relationship")?;
        Ok(count > 0)
    }

    fn advisees(&self, advisor_id: LecturerId) -> Result<Vec<StudentId>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT student_id FROM students WHERE advisor_id = ?1 ORDER BY student_number",
        )?;
        let rows = stmt.query_map(params![advisor_id.to_string()], parse_student_id_row)?;
        collect_rows(rows).context("failed to list advisees")
    }

    fn all_students(&self) -> Result<Vec<StudentId>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare("SELECT student_id FROM students ORDER BY student_number")?;
        let rows = stmt.query_map([], parse_student_id_row)?;
        collect_rows(rows).context("failed to list students")
    }

    fn student_profiles(&self, student_ids: &[StudentId]) -> Result<Vec<StudentProfile>> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_list = id_list_json(student_ids)?;
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.student_id, s.user_id, s.student_number, u.full_name,
                    s.program_study, s.academic_year, s.advisor_id
             FROM students s
             JOIN users u ON u.user_id = s.user_id
             WHERE s.student_id IN (SELECT value FROM json_each(?1))
             ORDER BY s.student_number",
        )?;
        let rows = stmt.query_map(params![id_list], parse_profile_row)?;
        collect_rows(rows).context("failed to load student profiles")
    }
}

fn parse_student_id_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StudentId> {
    let raw: String = row.get(0)?;
    Ok(StudentId(parse_ulid_column(0, &raw)?))
}

fn parse_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StudentProfile> {
    let student_raw: String = row.get(0)?;
    let user_raw: String = row.get(1)?;
    let advisor_raw: Option<String> = row.get(6)?;

    Ok(StudentProfile {
        student_id: StudentId(parse_ulid_column(0, &student_raw)?),
        user_id: UserId(parse_ulid_column(1, &user_raw)?),
        student_number: row.get(2)?,
        full_name: row.get(3)?,
        program_study: row.get(4)?,
        academic_year: row.get(5)?,
        advisor_id: advisor_raw
            .as_deref()
            .map(|raw| parse_ulid_column(6, raw).map(LecturerId))
            .transpose()?,
    })
}
