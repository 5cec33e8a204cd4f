//! Attendance reconciliation.
//!
//! Takes a recognized identity label plus a time context and turns it into
//! at most one attendance record. Idempotence is layered: the session lookup
//! is keyed by (class, date, shift) and the record lookup by (session,
//! student), both backed by UNIQUE constraints in the store.

use crate::shifts::{current_shift, Shift};
use chrono::{Duration, NaiveDateTime, NaiveTime};
use rollcall_store::{AttendanceRecord, AttendanceStatus, Store, StoreError, Student};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Result of reconciling one recognized check-in.
#[derive(Debug)]
pub enum MarkOutcome {
    /// A new record was written.
    Marked {
        student: Student,
        record: AttendanceRecord,
    },
    /// A record for this (session, student) already exists; nothing written.
    AlreadyMarked { student: Student },
    /// Recognized, but no shift window is active right now; nothing written.
    NoActiveWindow { student: Student },
    /// The recognized label matches no roster entry.
    IdentityNotFound { label: String },
}

/// Compute the attendance status for a check-in against a session start.
///
/// Exactly at `start + grace` is already late; strictly before is present.
/// `absent` is never produced here — it is the reporting-side default for
/// students with no record.
pub fn status_for(check_in: NaiveTime, session_start: NaiveTime, grace: Duration) -> AttendanceStatus {
    if check_in < session_start {
        return AttendanceStatus::Present;
    }
    if check_in - session_start >= grace {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Present
    }
}

/// Reconcile a recognized identity into the attendance tables.
///
/// Repeated calls for the same physical check-in produce exactly one record;
/// later calls return [`MarkOutcome::AlreadyMarked`].
pub fn mark_attendance(
    store: &Store,
    shifts: &[Shift],
    grace: Duration,
    class_id: i64,
    label: &str,
    confidence: f32,
    now: NaiveDateTime,
) -> Result<MarkOutcome, AttendanceError> {
    let Some(student) = store.find_student_by_normalized_name(label)? else {
        tracing::warn!(label, "recognized label has no roster entry");
        return Ok(MarkOutcome::IdentityNotFound {
            label: label.to_string(),
        });
    };

    let Some(shift) = current_shift(shifts, now.time()) else {
        tracing::info!(student = %student.student_code, "check-in outside all shift windows");
        return Ok(MarkOutcome::NoActiveWindow { student });
    };

    let session = store.get_or_create_session(
        class_id,
        now.date(),
        shift.id,
        shift.start,
        shift.end,
    )?;

    if store.find_record(session.id, student.id)?.is_some() {
        return Ok(MarkOutcome::AlreadyMarked { student });
    }

    let status = status_for(now.time(), session.start_time, grace);
    let record = store.insert_record(session.id, student.id, status, now, Some(confidence))?;
    tracing::info!(
        student = %student.student_code,
        session = session.id,
        status = status.as_str(),
        confidence,
        "attendance marked"
    );

    Ok(MarkOutcome::Marked { student, record })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shifts::default_shifts;
    use chrono::NaiveDate;

    const GRACE: i64 = 15;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_time(t(h, m))
    }

    fn seeded() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let class = store.add_class("SE101", "Software Engineering").unwrap();
        let s = store.add_student("SV001", "Nguyễn Văn A").unwrap();
        store.enroll(class.id, s.id).unwrap();
        (store, class.id)
    }

    fn mark(store: &Store, class_id: i64, label: &str, now: NaiveDateTime) -> MarkOutcome {
        mark_attendance(
            store,
            &default_shifts(),
            Duration::minutes(GRACE),
            class_id,
            label,
            0.91,
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_status_boundary_around_grace() {
        let grace = Duration::minutes(GRACE);
        let start = t(7, 0);
        assert_eq!(status_for(t(7, 14), start, grace), AttendanceStatus::Present);
        assert_eq!(status_for(t(7, 15), start, grace), AttendanceStatus::Late);
        assert_eq!(status_for(t(7, 16), start, grace), AttendanceStatus::Late);
    }

    #[test]
    fn test_status_early_checkin_is_present() {
        let grace = Duration::minutes(GRACE);
        assert_eq!(status_for(t(6, 0), t(7, 0), grace), AttendanceStatus::Present);
    }

    #[test]
    fn test_mark_present_within_grace() {
        let (store, class_id) = seeded();
        match mark(&store, class_id, "nguyen van a", at(7, 5)) {
            MarkOutcome::Marked { record, student } => {
                assert_eq!(record.status, AttendanceStatus::Present);
                assert_eq!(student.student_code, "SV001");
                assert!((record.confidence.unwrap() - 0.91).abs() < 1e-6);
            }
            other => panic!("expected Marked, got {other:?}"),
        }
    }

    #[test]
    fn test_mark_late_after_grace() {
        let (store, class_id) = seeded();
        match mark(&store, class_id, "nguyen van a", at(7, 30)) {
            MarkOutcome::Marked { record, .. } => assert_eq!(record.status, AttendanceStatus::Late),
            other => panic!("expected Marked, got {other:?}"),
        }
    }

    #[test]
    fn test_second_mark_is_idempotent() {
        let (store, class_id) = seeded();
        assert!(matches!(
            mark(&store, class_id, "nguyen van a", at(7, 5)),
            MarkOutcome::Marked { .. }
        ));
        assert!(matches!(
            mark(&store, class_id, "Nguyễn Văn A", at(7, 40)),
            MarkOutcome::AlreadyMarked { .. }
        ));

        // Exactly one record exists for the session
        let session = store
            .get_or_create_session(class_id, at(7, 5).date(), "shift1", t(7, 0), t(10, 0))
            .unwrap();
        let report = store.session_report(session.id).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].status, AttendanceStatus::Present);
    }

    #[test]
    fn test_unknown_label() {
        let (store, class_id) = seeded();
        assert!(matches!(
            mark(&store, class_id, "le van x", at(7, 5)),
            MarkOutcome::IdentityNotFound { .. }
        ));
    }

    #[test]
    fn test_outside_shift_windows_writes_nothing() {
        let (store, class_id) = seeded();
        assert!(matches!(
            mark(&store, class_id, "nguyen van a", at(21, 0)),
            MarkOutcome::NoActiveWindow { .. }
        ));
        // Marking later the same day still creates the first record
        assert!(matches!(
            mark(&store, class_id, "nguyen van a", at(7, 5)),
            MarkOutcome::Marked { .. }
        ));
    }

    #[test]
    fn test_normalized_label_from_training_directory() {
        let (store, class_id) = seeded();
        // Training directory labels use underscores and no diacritics
        assert!(matches!(
            mark(&store, class_id, "Nguyen_Van_A", at(7, 5)),
            MarkOutcome::Marked { .. }
        ));
    }
}
