//! Daily teaching shifts.
//!
//! Attendance sessions are keyed by (class, date, shift). Each shift owns a
//! scheduled window; for "which shift is active now" the lookup is
//! gap-tolerant: each shift's span stays open until the next one starts,
//! so a check-in at 10:05 still lands in shift 1 even though teaching
//! ended at 10:00. Nothing is active after the last window closes.

use chrono::NaiveTime;

#[derive(Debug, Clone)]
pub struct Shift {
    pub id: &'static str,
    pub name: &'static str,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("static shift time")
}

/// The four fixed daily shifts.
pub fn default_shifts() -> Vec<Shift> {
    vec![
        Shift { id: "shift1", name: "Ca 1", start: t(7, 0), end: t(10, 0) },
        Shift { id: "shift2", name: "Ca 2", start: t(10, 15), end: t(13, 15) },
        Shift { id: "shift3", name: "Ca 3", start: t(13, 30), end: t(16, 30) },
        Shift { id: "shift4", name: "Ca 4", start: t(16, 45), end: t(19, 45) },
    ]
}

/// Resolve the shift a check-in at `now` belongs to.
///
/// Active ranges: [07:00, 10:15), [10:15, 13:30), [13:30, 16:45),
/// [16:45, 20:00). Outside those, no shift is active.
pub fn current_shift(shifts: &[Shift], now: NaiveTime) -> Option<&Shift> {
    if now < t(7, 0) || now >= t(20, 0) {
        return None;
    }
    shifts.iter().filter(|s| now >= s.start).next_back()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_window_starts() {
        let shifts = default_shifts();
        assert_eq!(current_shift(&shifts, t(7, 0)).unwrap().id, "shift1");
        assert_eq!(current_shift(&shifts, t(9, 59)).unwrap().id, "shift1");
        assert_eq!(current_shift(&shifts, t(10, 15)).unwrap().id, "shift2");
        assert_eq!(current_shift(&shifts, t(13, 30)).unwrap().id, "shift3");
        assert_eq!(current_shift(&shifts, t(16, 45)).unwrap().id, "shift4");
    }

    #[test]
    fn test_break_belongs_to_previous_window() {
        let shifts = default_shifts();
        // 10:05 falls in the break between shifts; shift1's span stays open
        // until shift2 starts.
        assert_eq!(current_shift(&shifts, t(10, 5)).unwrap().id, "shift1");
        assert_eq!(current_shift(&shifts, t(13, 20)).unwrap().id, "shift2");
    }

    #[test]
    fn test_no_shift_outside_hours() {
        let shifts = default_shifts();
        assert!(current_shift(&shifts, t(6, 59)).is_none());
        assert!(current_shift(&shifts, t(20, 0)).is_none());
        assert!(current_shift(&shifts, t(23, 30)).is_none());
        // Last window runs until 20:00 even though teaching ends 19:45
        assert_eq!(current_shift(&shifts, t(19, 59)).unwrap().id, "shift4");
    }
}
