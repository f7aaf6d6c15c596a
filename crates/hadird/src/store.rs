//! SQLite persistence for classes, students, face templates and attendance.
//!
//! The `(student_id, date)` uniqueness of attendance is enforced by the
//! schema; a violating insert comes back as [`InsertOutcome::Duplicate`].

use chrono::{DateTime, Local, NaiveDate};
use hadir_core::FaceTemplate;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS classes (
    id   TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS students (
    id             TEXT PRIMARY KEY,
    class_id       TEXT NOT NULL REFERENCES classes(id),
    full_name      TEXT NOT NULL,
    student_number TEXT NOT NULL,
    gender         TEXT NOT NULL,
    face_embedding TEXT,
    face_image_url TEXT
);

CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id);

CREATE TABLE IF NOT EXISTS attendance (
    id            TEXT PRIMARY KEY,
    student_id    TEXT NOT NULL REFERENCES students(id),
    class_id      TEXT NOT NULL REFERENCES classes(id),
    date          TEXT NOT NULL,
    status        TEXT NOT NULL,
    check_in_time TEXT NOT NULL,
    UNIQUE (student_id, date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_class_date ON attendance(class_id, date);
";

const STUDENT_COLUMNS: &str = "s.id, s.class_id, c.name, s.full_name, s.student_number, s.gender,
     s.face_embedding, s.face_image_url";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("template encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub id: String,
    pub name: String,
}

/// Administrative student fields, as imported from the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentRecord {
    pub id: String,
    pub class_id: String,
    pub full_name: String,
    pub student_number: String,
    pub gender: String,
}

/// A student with their resolved face template.
#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub class_id: String,
    pub class_name: Option<String>,
    pub full_name: String,
    pub student_number: String,
    pub gender: String,
    pub template: Option<FaceTemplate>,
    pub face_image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Sick,
    Permit,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
            AttendanceStatus::Sick => "SICK",
            AttendanceStatus::Permit => "PERMIT",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown attendance status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for AttendanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRESENT" => Ok(AttendanceStatus::Present),
            "ABSENT" => Ok(AttendanceStatus::Absent),
            "SICK" => Ok(AttendanceStatus::Sick),
            "PERMIT" => Ok(AttendanceStatus::Permit),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub check_in_time: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(AttendanceRecord),
    /// A record for this student and day already exists.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCounts {
    pub classes: u64,
    pub students: u64,
    pub enrolled: u64,
}

/// Clone-safe handle to the database thread.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn upsert_class(&self, class: ClassRecord) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO classes (id, name) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                    params![class.id, class.name],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Insert or update a student's administrative fields. Face data is
    /// left untouched.
    pub async fn upsert_student(&self, student: StudentRecord) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (id, class_id, full_name, student_number, gender)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        class_id = excluded.class_id,
                        full_name = excluded.full_name,
                        student_number = excluded.student_number,
                        gender = excluded.gender",
                    params![
                        student.id,
                        student.class_id,
                        student.full_name,
                        student.student_number,
                        student.gender
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn find_class(&self, id: &str) -> Result<Option<ClassRecord>, StoreError> {
        let id = id.to_string();
        let class = self
            .conn
            .call(move |conn| {
                let class = conn
                    .query_row("SELECT id, name FROM classes WHERE id = ?1", [id], |row| {
                        Ok(ClassRecord {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    })
                    .optional()?;
                Ok(class)
            })
            .await?;
        Ok(class)
    }

    pub async fn find_student(&self, id: &str) -> Result<Option<Student>, StoreError> {
        let id = id.to_string();
        let student = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {STUDENT_COLUMNS} FROM students s
                     LEFT JOIN classes c ON c.id = s.class_id
                     WHERE s.id = ?1"
                );
                let student = conn.query_row(&sql, [id], student_from_row).optional()?;
                Ok(student)
            })
            .await?;
        Ok(student)
    }

    /// Every student of a class, ordered by name.
    pub async fn class_roster(&self, class_id: &str) -> Result<Vec<Student>, StoreError> {
        let class_id = class_id.to_string();
        let students = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {STUDENT_COLUMNS} FROM students s
                     LEFT JOIN classes c ON c.id = s.class_id
                     WHERE s.class_id = ?1
                     ORDER BY s.full_name ASC, s.id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([class_id], student_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(students)
    }

    /// Replace a student's template wholesale, and their photo when one is
    /// given. Returns the stored photo URL, or `None` if the student does
    /// not exist.
    pub async fn save_face(
        &self,
        student_id: &str,
        template: &FaceTemplate,
        face_image_url: Option<String>,
    ) -> Result<Option<Option<String>>, StoreError> {
        let student_id = student_id.to_string();
        let encoded = serde_json::to_string(template)?;
        let saved = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE students
                     SET face_embedding = ?2,
                         face_image_url = COALESCE(?3, face_image_url)
                     WHERE id = ?1",
                    params![student_id, encoded, face_image_url],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                let url: Option<String> = tx.query_row(
                    "SELECT face_image_url FROM students WHERE id = ?1",
                    [&student_id],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok(Some(url))
            })
            .await?;
        Ok(saved)
    }

    pub async fn find_attendance(
        &self,
        student_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let student_id = student_id.to_string();
        let record = self
            .conn
            .call(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT id, student_id, class_id, date, status, check_in_time
                         FROM attendance WHERE student_id = ?1 AND date = ?2",
                        params![student_id, date],
                        attendance_from_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    /// Insert an attendance record unless one exists for the same student
    /// and day.
    pub async fn insert_attendance(
        &self,
        record: AttendanceRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let outcome = self
            .conn
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO attendance (id, student_id, class_id, date, status, check_in_time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.id,
                        record.student_id,
                        record.class_id,
                        record.date,
                        record.status.as_str(),
                        record.check_in_time
                    ],
                );
                match inserted {
                    Ok(_) => Ok(InsertOutcome::Created(record)),
                    Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        Ok(outcome)
    }

    /// Attendance records of a class on one day.
    pub async fn class_attendance(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let class_id = class_id.to_string();
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, student_id, class_id, date, status, check_in_time
                     FROM attendance WHERE class_id = ?1 AND date = ?2",
                )?;
                let rows = stmt.query_map(params![class_id, date], attendance_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(records)
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let counts = self
            .conn
            .call(|conn| {
                let counts = conn.query_row(
                    "SELECT
                        (SELECT COUNT(*) FROM classes),
                        (SELECT COUNT(*) FROM students),
                        (SELECT COUNT(*) FROM students WHERE face_embedding IS NOT NULL)",
                    [],
                    |row| {
                        Ok(StoreCounts {
                            classes: row.get(0)?,
                            students: row.get(1)?,
                            enrolled: row.get(2)?,
                        })
                    },
                )?;
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let id: String = row.get(0)?;
    let raw_template: Option<String> = row.get(6)?;
    let template = raw_template.and_then(|raw| match serde_json::from_str(&raw) {
        Ok(value) => {
            let template = FaceTemplate::resolve(&value);
            if template.is_none() {
                tracing::warn!(student = %id, "stored face template has no usable vectors");
            }
            template
        }
        Err(e) => {
            tracing::warn!(student = %id, error = %e, "stored face template is not valid JSON");
            None
        }
    });

    Ok(Student {
        id,
        class_id: row.get(1)?,
        class_name: row.get(2)?,
        full_name: row.get(3)?,
        student_number: row.get(4)?,
        gender: row.get(5)?,
        template,
        face_image_url: row.get(7)?,
    })
}

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status: String = row.get(4)?;
    let status = status.parse::<AttendanceStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        class_id: row.get(2)?,
        date: row.get(3)?,
        status,
        check_in_time: row.get(5)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}
