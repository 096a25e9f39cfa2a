use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use shared_config::{AppConfig, DEFAULT_CLINIC_UTC_OFFSET_MINUTES};
use shared_database::store::StoreClient;
use shared_utils::time::{system_clock, Clock};

use crate::models::{
    AvailabilityError, AvailableSlot, BookedWindow, Doctor, DoctorAvailability,
    SetAvailabilityRequest,
};
use crate::services::slots::{generate_slots, slot_is_booked};

/// Appointment statuses that hide a slot from the listing. Broader than the
/// booking-time conflict set on purpose: the listing never advertises a slot
/// that might not be bookable, while booking itself tolerates payment-pending
/// soft holds expiring.
const DISPLAY_BLOCKING_STATUSES: &str = "payment_pending,scheduled,confirmed,in_progress";

pub struct AvailabilityService {
    store: Arc<StoreClient>,
    clock: Arc<dyn Clock>,
    clinic_offset: FixedOffset,
}

impl AvailabilityService {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let clinic_offset = FixedOffset::east_opt(config.clinic_utc_offset_minutes * 60)
            .unwrap_or_else(|| {
                warn!(
                    "Invalid CLINIC_UTC_OFFSET_MINUTES {}, falling back to default",
                    config.clinic_utc_offset_minutes
                );
                FixedOffset::east_opt(DEFAULT_CLINIC_UTC_OFFSET_MINUTES * 60).unwrap()
            });

        Self {
            store: Arc::new(StoreClient::new(config)),
            clock,
            clinic_offset,
        }
    }

    /// Declare (or re-declare) the bookable window for one calendar date.
    /// One record per (doctor, date): an existing record is updated in place.
    pub async fn set_availability(
        &self,
        doctor_id: Uuid,
        request: SetAvailabilityRequest,
        auth_token: &str,
    ) -> Result<DoctorAvailability, AvailabilityError> {
        debug!("Setting availability for doctor {} on {}", doctor_id, request.date);

        if request.start_time >= request.end_time {
            return Err(AvailabilityError::Validation(
                "Start time must be before end time".to_string(),
            ));
        }
        if request.slot_minutes <= 0 {
            return Err(AvailabilityError::Validation(
                "Slot duration must be positive".to_string(),
            ));
        }

        let existing = self
            .get_availability_for_date(doctor_id, request.date, auth_token)
            .await?;

        let now = self.clock.now();

        if let Some(current) = existing {
            let patch = json!({
                "start_time": request.start_time.format("%H:%M:%S").to_string(),
                "end_time": request.end_time.format("%H:%M:%S").to_string(),
                "slot_minutes": request.slot_minutes,
                "is_available": request.is_available.unwrap_or(true),
                "updated_at": now.to_rfc3339(),
            });

            let filter = format!("id=eq.{}", current.id);
            let updated: Vec<DoctorAvailability> = self
                .store
                .update_where("doctor_availability", &filter, patch, Some(auth_token))
                .await
                .map_err(|e| AvailabilityError::Store(e.to_string()))?;

            return updated
                .into_iter()
                .next()
                .ok_or(AvailabilityError::NotFound);
        }

        let row = json!({
            "doctor_id": doctor_id,
            "date": request.date,
            "start_time": request.start_time.format("%H:%M:%S").to_string(),
            "end_time": request.end_time.format("%H:%M:%S").to_string(),
            "slot_minutes": request.slot_minutes,
            "is_available": request.is_available.unwrap_or(true),
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let created: Vec<DoctorAvailability> = self
            .store
            .insert("doctor_availability", row, Some(auth_token))
            .await
            .map_err(|e| AvailabilityError::Store(e.to_string()))?;

        created
            .into_iter()
            .next()
            .ok_or_else(|| AvailabilityError::Store("Failed to create availability".to_string()))
    }

    pub async fn get_availability(
        &self,
        doctor_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        auth_token: &str,
    ) -> Result<Vec<DoctorAvailability>, AvailabilityError> {
        let mut path = format!(
            "/rest/v1/doctor_availability?doctor_id=eq.{}&order=date.asc",
            doctor_id
        );
        if let Some(from) = from {
            path.push_str(&format!("&date=gte.{}", from));
        }
        if let Some(to) = to {
            path.push_str(&format!("&date=lte.{}", to));
        }

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AvailabilityError::Store(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<DoctorAvailability>, _>>()
            .map_err(|e| AvailabilityError::Store(format!("Failed to parse availability: {}", e)))
    }

    pub async fn delete_availability(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        auth_token: &str,
    ) -> Result<(), AvailabilityError> {
        debug!("Deleting availability for doctor {} on {}", doctor_id, date);

        let path = format!(
            "/rest/v1/doctor_availability?doctor_id=eq.{}&date=eq.{}",
            doctor_id, date
        );
        self.store
            .delete(&path, Some(auth_token))
            .await
            .map_err(|e| AvailabilityError::Store(e.to_string()))
    }

    /// Candidate slots for one date, each marked bookable or not. Slot
    /// times stay in the clinic's local clock; only the collision check
    /// against stored appointments anchors them to absolute instants.
    pub async fn list_available_slots(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        auth_token: &str,
    ) -> Result<Vec<AvailableSlot>, AvailabilityError> {
        debug!("Listing slots for doctor {} on {}", doctor_id, date);

        let availability = match self
            .get_availability_for_date(doctor_id, date, auth_token)
            .await?
        {
            Some(a) if a.is_available => a,
            _ => return Ok(Vec::new()),
        };

        let booked = self.get_booked_windows(doctor_id, date, auth_token).await?;
        let now = self.clock.now();

        let slot_minutes = availability.slot_minutes;
        let slots = generate_slots(availability.start_time, availability.end_time, slot_minutes)
            .into_iter()
            .map(|slot_time| {
                let slot_start = self.local_instant(date, slot_time);
                let slot_end = slot_start + Duration::minutes(slot_minutes as i64);

                let available =
                    slot_start > now && !slot_is_booked(slot_start, slot_end, &booked);

                AvailableSlot {
                    time: slot_time.format("%H:%M").to_string(),
                    display_time: slot_time.format("%I:%M %p").to_string(),
                    available,
                }
            })
            .collect();

        Ok(slots)
    }

    pub async fn get_doctor(
        &self,
        doctor_id: Uuid,
        auth_token: &str,
    ) -> Result<Doctor, AvailabilityError> {
        let path = format!("/rest/v1/doctors?id=eq.{}", doctor_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AvailabilityError::Store(e.to_string()))?;

        let Some(row) = result.into_iter().next() else {
            return Err(AvailabilityError::DoctorNotFound);
        };

        serde_json::from_value(row)
            .map_err(|e| AvailabilityError::Store(format!("Failed to parse doctor: {}", e)))
    }

    // Private helpers

    /// Anchor a local clinic clock time to an absolute instant. This is the
    /// single place the regional offset is applied.
    fn local_instant(&self, date: NaiveDate, time: chrono::NaiveTime) -> DateTime<Utc> {
        match self
            .clinic_offset
            .from_local_datetime(&date.and_time(time))
            .single()
        {
            Some(local) => local.with_timezone(&Utc),
            // Unreachable for a fixed offset, but don't panic on it.
            None => Utc.from_utc_datetime(&date.and_time(time)),
        }
    }

    async fn get_availability_for_date(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        auth_token: &str,
    ) -> Result<Option<DoctorAvailability>, AvailabilityError> {
        let path = format!(
            "/rest/v1/doctor_availability?doctor_id=eq.{}&date=eq.{}",
            doctor_id, date
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AvailabilityError::Store(e.to_string()))?;

        result
            .into_iter()
            .next()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AvailabilityError::Store(format!("Failed to parse availability: {}", e)))
    }

    async fn get_booked_windows(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        auth_token: &str,
    ) -> Result<Vec<BookedWindow>, AvailabilityError> {
        let day_start = self.local_instant(date, chrono::NaiveTime::MIN);
        let day_end = day_start + Duration::days(1);

        let path = format!(
            "/rest/v1/appointments?doctor_id=eq.{}&scheduled_at=gte.{}&scheduled_at=lt.{}&status=in.({})&select=scheduled_at,duration_minutes&order=scheduled_at.asc",
            doctor_id,
            urlencoding::encode(&day_start.to_rfc3339()),
            urlencoding::encode(&day_end.to_rfc3339()),
            DISPLAY_BLOCKING_STATUSES,
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AvailabilityError::Store(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<BookedWindow>, _>>()
            .map_err(|e| AvailabilityError::Store(format!("Failed to parse appointments: {}", e)))
    }
}
