//! rollcall-store — SQLite persistence for the attendance domain.
//!
//! Holds the student roster, classes, attendance sessions and attendance
//! records. Session resolution is idempotent per (class, date, shift) and
//! records are unique per (session, student); both are enforced by UNIQUE
//! constraints, not just application logic.

pub mod normalize;

pub use normalize::normalize_name;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored timestamp is not parseable: {0}")]
    BadTimestamp(String),
    #[error("session row missing after insert")]
    SessionVanished,
}

/// Attendance status written by check-in or derived by reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "late" => AttendanceStatus::Late,
            "absent" => AttendanceStatus::Absent,
            _ => AttendanceStatus::Present,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: i64,
    pub student_code: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    pub id: i64,
    pub class_code: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: i64,
    pub class_id: i64,
    pub session_date: NaiveDate,
    pub shift: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub session_id: i64,
    pub student_id: i64,
    pub status: AttendanceStatus,
    pub check_in_time: NaiveDateTime,
    pub confidence: Option<f32>,
}

/// One row of a per-session roster report. Enrolled students with no record
/// appear with status `absent` and no check-in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub student_id: i64,
    pub student_code: String,
    pub full_name: String,
    pub status: AttendanceStatus,
    pub check_in_time: Option<NaiveDateTime>,
    pub confidence: Option<f32>,
}

/// Synchronous SQLite store. Callers on async runtimes wrap operations in
/// `spawn_blocking`.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.apply_schema()?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.apply_schema()?;
        Ok(store)
    }

    fn apply_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS students (
                 id           INTEGER PRIMARY KEY,
                 student_code TEXT NOT NULL UNIQUE,
                 full_name    TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS classes (
                 id         INTEGER PRIMARY KEY,
                 class_code TEXT NOT NULL UNIQUE,
                 class_name TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS class_students (
                 class_id   INTEGER NOT NULL REFERENCES classes(id),
                 student_id INTEGER NOT NULL REFERENCES students(id),
                 UNIQUE(class_id, student_id)
             );
             CREATE TABLE IF NOT EXISTS attendance_sessions (
                 id           INTEGER PRIMARY KEY,
                 class_id     INTEGER NOT NULL REFERENCES classes(id),
                 session_date TEXT NOT NULL,
                 shift        TEXT NOT NULL,
                 start_time   TEXT NOT NULL,
                 end_time     TEXT NOT NULL,
                 UNIQUE(class_id, session_date, shift)
             );
             CREATE TABLE IF NOT EXISTS attendance_records (
                 id            INTEGER PRIMARY KEY,
                 session_id    INTEGER NOT NULL REFERENCES attendance_sessions(id),
                 student_id    INTEGER NOT NULL REFERENCES students(id),
                 status        TEXT NOT NULL,
                 check_in_time TEXT NOT NULL,
                 confidence    REAL,
                 UNIQUE(session_id, student_id)
             );",
        )?;
        Ok(())
    }

    // --- Roster ---

    pub fn add_student(&self, student_code: &str, full_name: &str) -> Result<Student, StoreError> {
        self.conn.execute(
            "INSERT INTO students (student_code, full_name) VALUES (?1, ?2)",
            params![student_code, full_name],
        )?;
        Ok(Student {
            id: self.conn.last_insert_rowid(),
            student_code: student_code.to_string(),
            full_name: full_name.to_string(),
        })
    }

    pub fn add_class(&self, class_code: &str, class_name: &str) -> Result<Class, StoreError> {
        self.conn.execute(
            "INSERT INTO classes (class_code, class_name) VALUES (?1, ?2)",
            params![class_code, class_name],
        )?;
        Ok(Class {
            id: self.conn.last_insert_rowid(),
            class_code: class_code.to_string(),
            class_name: class_name.to_string(),
        })
    }

    pub fn enroll(&self, class_id: i64, student_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO class_students (class_id, student_id) VALUES (?1, ?2)",
            params![class_id, student_id],
        )?;
        Ok(())
    }

    pub fn first_class(&self) -> Result<Option<Class>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, class_code, class_name FROM classes ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok(Class {
                        id: row.get(0)?,
                        class_code: row.get(1)?,
                        class_name: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Resolve a recognized label against the roster by normalized-name
    /// comparison. Diacritics, spacing, underscores and case are ignored on
    /// both sides.
    pub fn find_student_by_normalized_name(
        &self,
        name: &str,
    ) -> Result<Option<Student>, StoreError> {
        let wanted = normalize_name(name);

        let mut stmt = self
            .conn
            .prepare("SELECT id, student_code, full_name FROM students")?;
        let students = stmt.query_map([], |row| {
            Ok(Student {
                id: row.get(0)?,
                student_code: row.get(1)?,
                full_name: row.get(2)?,
            })
        })?;

        for student in students {
            let student = student?;
            if normalize_name(&student.full_name) == wanted {
                return Ok(Some(student));
            }
        }
        Ok(None)
    }

    // --- Sessions ---

    /// Resolve or create the attendance session for (class, date, shift).
    ///
    /// Idempotent: a second call with the same key returns the existing row.
    /// The UNIQUE constraint backs this up against concurrent writers.
    pub fn get_or_create_session(
        &self,
        class_id: i64,
        date: NaiveDate,
        shift: &str,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<AttendanceSession, StoreError> {
        let date_s = date.format(DATE_FORMAT).to_string();

        if let Some(existing) = self.find_session(class_id, date, shift)? {
            return Ok(existing);
        }

        self.conn.execute(
            "INSERT OR IGNORE INTO attendance_sessions
                 (class_id, session_date, shift, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                class_id,
                date_s,
                shift,
                start_time.format(TIME_FORMAT).to_string(),
                end_time.format(TIME_FORMAT).to_string(),
            ],
        )?;

        self.find_session(class_id, date, shift)?
            .ok_or(StoreError::SessionVanished)
    }

    fn find_session(
        &self,
        class_id: i64,
        date: NaiveDate,
        shift: &str,
    ) -> Result<Option<AttendanceSession>, StoreError> {
        let date_s = date.format(DATE_FORMAT).to_string();
        let row = self
            .conn
            .query_row(
                "SELECT id, class_id, session_date, shift, start_time, end_time
                 FROM attendance_sessions
                 WHERE class_id = ?1 AND session_date = ?2 AND shift = ?3",
                params![class_id, date_s, shift],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, class_id, date_s, shift, start_s, end_s)| {
            Ok(AttendanceSession {
                id,
                class_id,
                session_date: parse_date(&date_s)?,
                shift,
                start_time: parse_time(&start_s)?,
                end_time: parse_time(&end_s)?,
            })
        })
        .transpose()
    }

    // --- Records ---

    pub fn find_record(
        &self,
        session_id: i64,
        student_id: i64,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, session_id, student_id, status, check_in_time, confidence
                 FROM attendance_records
                 WHERE session_id = ?1 AND student_id = ?2",
                params![session_id, student_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, session_id, student_id, status, checkin_s, confidence)| {
            Ok(AttendanceRecord {
                id,
                session_id,
                student_id,
                status: AttendanceStatus::parse(&status),
                check_in_time: parse_datetime(&checkin_s)?,
                confidence: confidence.map(|c| c as f32),
            })
        })
        .transpose()
    }

    pub fn insert_record(
        &self,
        session_id: i64,
        student_id: i64,
        status: AttendanceStatus,
        check_in_time: NaiveDateTime,
        confidence: Option<f32>,
    ) -> Result<AttendanceRecord, StoreError> {
        self.conn.execute(
            "INSERT INTO attendance_records
                 (session_id, student_id, status, check_in_time, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                student_id,
                status.as_str(),
                check_in_time.format(DATETIME_FORMAT).to_string(),
                confidence.map(|c| c as f64),
            ],
        )?;
        Ok(AttendanceRecord {
            id: self.conn.last_insert_rowid(),
            session_id,
            student_id,
            status,
            check_in_time,
            confidence,
        })
    }

    /// Per-session roster report: every student enrolled in the session's
    /// class, with `absent` as the default for students without a record.
    pub fn session_report(&self, session_id: i64) -> Result<Vec<ReportEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.student_code, s.full_name,
                    r.status, r.check_in_time, r.confidence
             FROM attendance_sessions sess
             JOIN class_students cs ON cs.class_id = sess.class_id
             JOIN students s ON s.id = cs.student_id
             LEFT JOIN attendance_records r
                    ON r.session_id = sess.id AND r.student_id = s.id
             WHERE sess.id = ?1
             ORDER BY s.student_code",
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<f64>>(5)?,
            ))
        })?;

        let mut report = Vec::new();
        for row in rows {
            let (student_id, student_code, full_name, status, checkin_s, confidence) = row?;
            let check_in_time = checkin_s.as_deref().map(parse_datetime).transpose()?;
            report.push(ReportEntry {
                student_id,
                student_code,
                full_name,
                status: status
                    .as_deref()
                    .map(AttendanceStatus::parse)
                    .unwrap_or(AttendanceStatus::Absent),
                check_in_time,
                confidence: confidence.map(|c| c as f32),
            });
        }
        Ok(report)
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| StoreError::BadTimestamp(s.to_string()))
}

fn parse_time(s: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT).map_err(|_| StoreError::BadTimestamp(s.to_string()))
}

fn parse_datetime(s: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .map_err(|_| StoreError::BadTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn seeded_store() -> (Store, Class, Student) {
        let store = Store::open_in_memory().unwrap();
        let class = store.add_class("SE101", "Software Engineering").unwrap();
        let student = store.add_student("SV001", "Nguyễn Văn A").unwrap();
        store.enroll(class.id, student.id).unwrap();
        (store, class, student)
    }

    #[test]
    fn test_normalized_roster_lookup() {
        let (store, _, student) = seeded_store();

        let found = store
            .find_student_by_normalized_name("nguyen van a")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, student.id);

        let found = store
            .find_student_by_normalized_name("Nguyen_Van_A")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, student.id);

        assert!(store
            .find_student_by_normalized_name("tran thi b")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_session_creation_is_idempotent() {
        let (store, class, _) = seeded_store();
        let d = date(2026, 3, 2);

        let a = store
            .get_or_create_session(class.id, d, "shift1", time(7, 0), time(10, 0))
            .unwrap();
        let b = store
            .get_or_create_session(class.id, d, "shift1", time(7, 0), time(10, 0))
            .unwrap();
        assert_eq!(a.id, b.id);

        // Different shift on the same day is a different session
        let c = store
            .get_or_create_session(class.id, d, "shift2", time(10, 15), time(13, 15))
            .unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_record_unique_per_session_and_student() {
        let (store, class, student) = seeded_store();
        let session = store
            .get_or_create_session(class.id, date(2026, 3, 2), "shift1", time(7, 0), time(10, 0))
            .unwrap();

        let now = date(2026, 3, 2).and_time(time(7, 5));
        store
            .insert_record(session.id, student.id, AttendanceStatus::Present, now, Some(0.93))
            .unwrap();

        // Second insert violates the UNIQUE constraint
        let err = store.insert_record(
            session.id,
            student.id,
            AttendanceStatus::Present,
            now,
            Some(0.93),
        );
        assert!(err.is_err());

        let found = store.find_record(session.id, student.id).unwrap().unwrap();
        assert_eq!(found.status, AttendanceStatus::Present);
        assert_eq!(found.check_in_time, now);
        assert!((found.confidence.unwrap() - 0.93).abs() < 1e-6);
    }

    #[test]
    fn test_report_defaults_to_absent() {
        let (store, class, student) = seeded_store();
        let other = store.add_student("SV002", "Trần Thị B").unwrap();
        store.enroll(class.id, other.id).unwrap();

        let session = store
            .get_or_create_session(class.id, date(2026, 3, 2), "shift1", time(7, 0), time(10, 0))
            .unwrap();
        let now = date(2026, 3, 2).and_time(time(7, 20));
        store
            .insert_record(session.id, student.id, AttendanceStatus::Late, now, Some(0.8))
            .unwrap();

        let report = store.session_report(session.id).unwrap();
        assert_eq!(report.len(), 2);

        let marked = report.iter().find(|e| e.student_id == student.id).unwrap();
        assert_eq!(marked.status, AttendanceStatus::Late);
        assert_eq!(marked.check_in_time, Some(now));

        let missing = report.iter().find(|e| e.student_id == other.id).unwrap();
        assert_eq!(missing.status, AttendanceStatus::Absent);
        assert!(missing.check_in_time.is_none());
        assert!(missing.confidence.is_none());
    }

    #[test]
    fn test_open_reports_unwritable_parent() {
        let dir = std::env::temp_dir().join(format!("rollcall-store-open-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        // A plain file where a directory component is needed
        std::fs::write(dir.join("blocker"), b"x").unwrap();

        let err = Store::open(&dir.join("blocker/nested/attendance.db")).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)), "got {err:?}");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_corrupt_stored_time_is_a_timestamp_error() {
        let (store, class, _) = seeded_store();
        store
            .conn
            .execute(
                "INSERT INTO attendance_sessions
                     (class_id, session_date, shift, start_time, end_time)
                 VALUES (?1, '2026-03-02', 'shift1', 'not-a-time', '10:00:00')",
                params![class.id],
            )
            .unwrap();

        let err = store
            .get_or_create_session(class.id, date(2026, 3, 2), "shift1", time(7, 0), time(10, 0))
            .unwrap_err();
        assert!(matches!(err, StoreError::BadTimestamp(_)), "got {err:?}");
    }

    #[test]
    fn test_first_class() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.first_class().unwrap().is_none());
        let a = store.add_class("A", "First").unwrap();
        store.add_class("B", "Second").unwrap();
        assert_eq!(store.first_class().unwrap().unwrap().id, a.id);
    }
}
