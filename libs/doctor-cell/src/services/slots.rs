// libs/doctor-cell/src/services/slots.rs
//
// Pure slot arithmetic. Everything here works on local clock times or
// absolute instants handed in by the caller; no store access, no timezone
// conversion.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::models::BookedWindow;

/// Candidate slot start times: stepping by `slot_minutes` from `start_time`
/// up to but excluding `end_time`. Deterministic and stateless.
pub fn generate_slots(start_time: NaiveTime, end_time: NaiveTime, slot_minutes: i32) -> Vec<NaiveTime> {
    if slot_minutes <= 0 || start_time >= end_time {
        return Vec::new();
    }

    let step = Duration::minutes(slot_minutes as i64);
    let mut slots = Vec::new();
    let mut current = start_time;

    while current < end_time {
        slots.push(current);
        // NaiveTime arithmetic wraps at midnight; overflowing_add_signed
        // exposes the wrap so the loop can stop instead of cycling.
        let (next, wrapped) = current.overflowing_add_signed(step);
        if wrapped != 0 {
            break;
        }
        current = next;
    }

    slots
}

/// Whether the candidate window collides with any existing booking: the
/// slot starting inside a booking, ending inside one, or swallowing one
/// whole. Half-open intervals, so back-to-back slots do not collide.
pub fn slot_is_booked(
    slot_start: DateTime<Utc>,
    slot_end: DateTime<Utc>,
    existing: &[BookedWindow],
) -> bool {
    existing
        .iter()
        .any(|window| slot_start < window.end_time() && window.scheduled_at < slot_end)
}
