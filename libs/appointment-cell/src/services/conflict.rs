// libs/appointment-cell/src/services/conflict.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::store::StoreClient;

use crate::models::{Appointment, AppointmentError};

/// Statuses that block a new booking for the same doctor. Payment-pending
/// holds are deliberately absent: an abandoned payment must not deadlock the
/// calendar, so those rows only hide slots from the availability listing
/// (see doctor-cell) until they expire or settle.
const BOOKING_BLOCKING_STATUSES: &str = "scheduled,confirmed";

/// Upper bound on appointment length, used to bound the overlap scan:
/// any booking overlapping the candidate window must start within this
/// many minutes before it.
const MAX_APPOINTMENT_MINUTES: i64 = 240;

pub struct ConflictDetectionService {
    store: Arc<StoreClient>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self { store }
    }

    /// Find the first existing booking that overlaps the candidate window,
    /// in either direction. Returns the conflicting window so callers can
    /// tell the user *which* booking is in the way.
    pub async fn find_booking_conflict(
        &self,
        doctor_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
        auth_token: Option<&str>,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, AppointmentError> {
        debug!(
            "Checking booking conflicts for doctor {} from {} to {}",
            doctor_id, start_time, end_time
        );

        let scan_floor = start_time - Duration::minutes(MAX_APPOINTMENT_MINUTES);

        let mut query_parts = vec![
            format!("doctor_id=eq.{}", doctor_id),
            format!("status=in.({})", BOOKING_BLOCKING_STATUSES),
            format!("scheduled_at=gte.{}", urlencoding::encode(&scan_floor.to_rfc3339())),
            format!("scheduled_at=lt.{}", urlencoding::encode(&end_time.to_rfc3339())),
        ];

        if let Some(exclude_id) = exclude_appointment_id {
            query_parts.push(format!("id=neq.{}", exclude_id));
        }

        let path = format!(
            "/rest/v1/appointments?{}&order=scheduled_at.asc",
            query_parts.join("&")
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, auth_token, None)
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        let candidates: Vec<Appointment> = result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Appointment>, _>>()
            .map_err(|e| AppointmentError::Store(format!("Failed to parse appointments: {}", e)))?;

        for existing in candidates {
            if intervals_overlap(start_time, end_time, existing.scheduled_at, existing.end_time()) {
                warn!(
                    "Conflict detected for doctor {}: candidate [{}, {}) overlaps appointment {}",
                    doctor_id, start_time, end_time, existing.id
                );
                return Ok(Some((existing.scheduled_at, existing.end_time())));
            }
        }

        Ok(None)
    }
}

/// Half-open interval overlap: `[start1, end1)` intersects `[start2, end2)`.
pub fn intervals_overlap(
    start1: DateTime<Utc>,
    end1: DateTime<Utc>,
    start2: DateTime<Utc>,
    end2: DateTime<Utc>,
) -> bool {
    start1 < end2 && start2 < end1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn partial_overlaps_in_both_directions() {
        assert!(intervals_overlap(at(10, 0), at(10, 30), at(10, 15), at(10, 45)));
        assert!(intervals_overlap(at(10, 15), at(10, 45), at(10, 0), at(10, 30)));
    }

    #[test]
    fn containment_counts_as_overlap() {
        assert!(intervals_overlap(at(10, 0), at(11, 0), at(10, 15), at(10, 30)));
        assert!(intervals_overlap(at(10, 15), at(10, 30), at(10, 0), at(11, 0)));
    }

    #[test]
    fn back_to_back_windows_do_not_overlap() {
        assert!(!intervals_overlap(at(10, 0), at(10, 30), at(10, 30), at(11, 0)));
        assert!(!intervals_overlap(at(10, 30), at(11, 0), at(10, 0), at(10, 30)));
    }

    #[test]
    fn disjoint_windows_do_not_overlap() {
        assert!(!intervals_overlap(at(9, 0), at(9, 30), at(10, 0), at(10, 30)));
    }
}
