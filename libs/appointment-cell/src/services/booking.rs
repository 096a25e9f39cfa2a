// libs/appointment-cell/src/services/booking.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use doctor_cell::services::availability::AvailabilityService;
use doctor_cell::models::AvailabilityError;
use shared_config::AppConfig;
use shared_database::store::StoreClient;
use shared_models::auth::User;
use shared_utils::time::{system_clock, Clock};

use crate::models::{
    Appointment, AppointmentError, AppointmentSearchQuery, AppointmentStatus,
    BookAppointmentRequest, CancelledBy, PaymentStatus,
};
use crate::services::conflict::ConflictDetectionService;
use crate::services::lifecycle::AppointmentLifecycleService;

const LOCK_RETRY_ATTEMPTS: u32 = 3;

pub struct AppointmentBookingService {
    store: Arc<StoreClient>,
    conflict_service: ConflictDetectionService,
    lifecycle_service: AppointmentLifecycleService,
    doctor_service: AvailabilityService,
    clock: Arc<dyn Clock>,
}

impl AppointmentBookingService {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(StoreClient::new(config));

        Self {
            conflict_service: ConflictDetectionService::new(Arc::clone(&store)),
            lifecycle_service: AppointmentLifecycleService::new(),
            doctor_service: AvailabilityService::with_clock(config, Arc::clone(&clock)),
            store,
            clock,
        }
    }

    /// Book a consultation. The conflict check and the insert run under a
    /// per-slot lock so two concurrent requests cannot both pass the check
    /// and double-book the doctor.
    pub async fn book_appointment(
        &self,
        request: BookAppointmentRequest,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        info!(
            "Booking appointment for patient {} with doctor {} at {}",
            request.patient_id, request.doctor_id, request.scheduled_at
        );

        let now = self.clock.now();
        self.lifecycle_service
            .validate_booking_timing(request.scheduled_at, request.duration_minutes, now)?;

        if request.patient_id == request.doctor_id {
            return Err(AppointmentError::Validation(
                "Patient and doctor must be different users".to_string(),
            ));
        }

        // Approval is checked at booking time only; de-approval later never
        // cascades into existing appointments.
        let doctor = self
            .doctor_service
            .get_doctor(request.doctor_id, auth_token)
            .await
            .map_err(|e| match e {
                AvailabilityError::DoctorNotFound => AppointmentError::DoctorNotFound,
                other => AppointmentError::Store(other.to_string()),
            })?;

        if !doctor.is_approved() {
            return Err(AppointmentError::DoctorNotApproved);
        }

        let end_time = request.scheduled_at + Duration::minutes(request.duration_minutes as i64);
        let lock_key = format!(
            "slot_{}_{}",
            request.doctor_id,
            request.scheduled_at.timestamp()
        );

        if !self
            .acquire_lock_with_retry(&lock_key, request.doctor_id, auth_token)
            .await?
        {
            // Another booking holds this exact slot right now; from the
            // caller's point of view the slot is taken.
            return Err(AppointmentError::SlotConflict {
                conflict_start: request.scheduled_at,
                conflict_end: end_time,
            });
        }

        let result = self
            .create_under_lock(&request, doctor.consultation_fee, end_time, now, auth_token)
            .await;

        if let Err(e) = self.store.release_slot_lock(&lock_key, Some(auth_token)).await {
            warn!("Failed to release slot lock {}: {}", lock_key, e);
        }

        result
    }

    async fn create_under_lock(
        &self,
        request: &BookAppointmentRequest,
        fee: f64,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        if let Some((conflict_start, conflict_end)) = self
            .conflict_service
            .find_booking_conflict(
                request.doctor_id,
                request.scheduled_at,
                end_time,
                None,
                Some(auth_token),
            )
            .await?
        {
            return Err(AppointmentError::SlotConflict {
                conflict_start,
                conflict_end,
            });
        }

        // Free consultations skip the payment leg entirely.
        let (status, payment_status) = if fee > 0.0 {
            (AppointmentStatus::PaymentPending, PaymentStatus::Pending)
        } else {
            (AppointmentStatus::Scheduled, PaymentStatus::Completed)
        };

        let row = json!({
            "id": Uuid::new_v4(),
            "patient_id": request.patient_id,
            "doctor_id": request.doctor_id,
            "scheduled_at": request.scheduled_at.to_rfc3339(),
            "duration_minutes": request.duration_minutes,
            "status": status,
            "payment_status": payment_status,
            "amount": fee,
            "notes": request.notes,
            "cancellation_reason": null,
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        });

        let created: Vec<Appointment> = self
            .store
            .insert("appointments", row, Some(auth_token))
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        let appointment = created
            .into_iter()
            .next()
            .ok_or_else(|| AppointmentError::Store("Appointment creation returned no row".to_string()))?;

        info!(
            "Appointment {} booked ({} with fee {})",
            appointment.id, appointment.status, appointment.amount
        );
        Ok(appointment)
    }

    async fn acquire_lock_with_retry(
        &self,
        lock_key: &str,
        doctor_id: Uuid,
        auth_token: &str,
    ) -> Result<bool, AppointmentError> {
        for attempt in 1..=LOCK_RETRY_ATTEMPTS {
            match self
                .store
                .acquire_slot_lock(lock_key, doctor_id, Some(auth_token))
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) if attempt < LOCK_RETRY_ATTEMPTS => {
                    debug!(
                        "Slot lock {} contended, retrying {}/{}",
                        lock_key, attempt, LOCK_RETRY_ATTEMPTS
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(100 * attempt as u64)).await;
                }
                Ok(false) => return Ok(false),
                Err(e) => return Err(AppointmentError::Store(e.to_string())),
            }
        }
        Ok(false)
    }

    /// Apply a manual status transition. Idempotent at the boundary:
    /// re-requesting the current status returns the appointment unchanged.
    pub async fn transition_status(
        &self,
        appointment_id: Uuid,
        actor: &User,
        target: AppointmentStatus,
        notes: Option<String>,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get_appointment(appointment_id, auth_token).await?;

        // Re-requesting an applied transition is a no-op success, with one
        // carve-out: cancelling an already-cancelled appointment is a real
        // rejection, handled by the cancellation guard below.
        if appointment.status == target && target != AppointmentStatus::Cancelled {
            debug!(
                "Appointment {} already {}, treating transition as no-op",
                appointment_id, target
            );
            return Ok(appointment);
        }

        self.authorize_transition(&appointment, actor, target)?;
        if target == AppointmentStatus::Cancelled {
            self.lifecycle_service
                .validate_cancellation(&appointment, self.clock.now())?;
        }
        self.lifecycle_service
            .validate_transition(&appointment.status, &target)?;

        let mut patch = json!({
            "status": target,
            "updated_at": self.clock.now().to_rfc3339(),
        });
        if let Some(notes) = notes {
            patch["notes"] = json!(notes);
        }
        if target == AppointmentStatus::Scheduled {
            // Reaching Scheduled from PaymentPending means payment settled.
            patch["payment_status"] = json!(PaymentStatus::Completed);
        }

        self.apply_status_update(&appointment, target, patch, auth_token)
            .await
    }

    /// Cancel an appointment. Synchronous and immediate; gated only by the
    /// participant check and the cancellation cutoff.
    pub async fn cancel_appointment(
        &self,
        appointment_id: Uuid,
        actor: &User,
        reason: Option<String>,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get_appointment(appointment_id, auth_token).await?;

        let cancelled_by = self.classify_canceller(&appointment, actor)?;
        self.lifecycle_service
            .validate_cancellation(&appointment, self.clock.now())?;

        let cancellation_note = format!(
            "Cancelled by {}: {}",
            cancelled_by,
            reason.as_deref().unwrap_or("no reason given")
        );

        let patch = json!({
            "status": AppointmentStatus::Cancelled,
            "cancellation_reason": cancellation_note,
            "updated_at": self.clock.now().to_rfc3339(),
        });

        let cancelled = self
            .apply_status_update(&appointment, AppointmentStatus::Cancelled, patch, auth_token)
            .await?;

        info!("Appointment {} cancelled by {}", appointment_id, cancelled_by);
        Ok(cancelled)
    }

    /// Payment collaborator seam: the capture succeeded, advance the
    /// soft hold to a real booking.
    pub async fn mark_payment_captured(
        &self,
        appointment_id: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get_appointment(appointment_id, auth_token).await?;

        if appointment.status == AppointmentStatus::Scheduled
            && appointment.payment_status == PaymentStatus::Completed
        {
            return Ok(appointment);
        }

        if appointment.status != AppointmentStatus::PaymentPending {
            return Err(AppointmentError::IllegalTransition {
                from: appointment.status,
                to: AppointmentStatus::Scheduled,
            });
        }

        let patch = json!({
            "status": AppointmentStatus::Scheduled,
            "payment_status": PaymentStatus::Completed,
            "updated_at": self.clock.now().to_rfc3339(),
        });

        self.apply_status_update(&appointment, AppointmentStatus::Scheduled, patch, auth_token)
            .await
    }

    pub async fn update_notes(
        &self,
        appointment_id: Uuid,
        actor: &User,
        notes: String,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self.get_appointment(appointment_id, auth_token).await?;

        self.ensure_participant(&appointment, actor)?;
        if appointment.status.is_terminal() {
            return Err(AppointmentError::AlreadyTerminal(appointment.status));
        }

        let patch = json!({
            "notes": notes,
            "updated_at": self.clock.now().to_rfc3339(),
        });

        let filter = format!("id=eq.{}", appointment_id);
        let updated: Vec<Appointment> = self
            .store
            .update_where("appointments", &filter, patch, Some(auth_token))
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        updated.into_iter().next().ok_or(AppointmentError::NotFound)
    }

    pub async fn get_appointment(
        &self,
        appointment_id: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        debug!("Fetching appointment: {}", appointment_id);

        let path = format!("/rest/v1/appointments?id=eq.{}", appointment_id);
        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        let Some(row) = result.into_iter().next() else {
            return Err(AppointmentError::NotFound);
        };

        serde_json::from_value(row)
            .map_err(|e| AppointmentError::Store(format!("Failed to parse appointment: {}", e)))
    }

    pub async fn search_appointments(
        &self,
        query: AppointmentSearchQuery,
        auth_token: &str,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        debug!("Searching appointments with filters: {:?}", query);

        let mut query_parts = Vec::new();

        if let Some(patient_id) = query.patient_id {
            query_parts.push(format!("patient_id=eq.{}", patient_id));
        }
        if let Some(doctor_id) = query.doctor_id {
            query_parts.push(format!("doctor_id=eq.{}", doctor_id));
        }
        if let Some(status) = query.status {
            query_parts.push(format!("status=eq.{}", status));
        }
        if let Some(from_date) = query.from_date {
            query_parts.push(format!(
                "scheduled_at=gte.{}",
                urlencoding::encode(&from_date.to_rfc3339())
            ));
        }
        if let Some(to_date) = query.to_date {
            query_parts.push(format!(
                "scheduled_at=lte.{}",
                urlencoding::encode(&to_date.to_rfc3339())
            ));
        }
        query_parts.push(format!("limit={}", query.limit.unwrap_or(50)));
        query_parts.push(format!("offset={}", query.offset.unwrap_or(0)));

        let path = format!(
            "/rest/v1/appointments?{}&order=scheduled_at.asc",
            query_parts.join("&")
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Appointment>, _>>()
            .map_err(|e| AppointmentError::Store(format!("Failed to parse appointments: {}", e)))
    }

    /// The caller's appointments in the next `hours_ahead` hours, as either
    /// participant role.
    pub async fn get_upcoming_for_user(
        &self,
        user_id: Uuid,
        hours_ahead: i64,
        auth_token: &str,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        let now = self.clock.now();
        let horizon = now + Duration::hours(hours_ahead);

        let path = format!(
            "/rest/v1/appointments?or=(patient_id.eq.{id},doctor_id.eq.{id})&scheduled_at=gte.{from}&scheduled_at=lte.{to}&status=in.(payment_pending,scheduled,confirmed,in_progress)&order=scheduled_at.asc",
            id = user_id,
            from = urlencoding::encode(&now.to_rfc3339()),
            to = urlencoding::encode(&horizon.to_rfc3339()),
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        result
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Appointment>, _>>()
            .map_err(|e| AppointmentError::Store(format!("Failed to parse appointments: {}", e)))
    }

    // ==============================================================================
    // PRIVATE HELPER METHODS
    // ==============================================================================

    /// Compare-and-set the status against the previously observed one.
    /// A failed precondition is re-read and resolved per the idempotency
    /// rules: someone else already applied the same transition -> success;
    /// the appointment reached a terminal state -> report that state.
    async fn apply_status_update(
        &self,
        observed: &Appointment,
        target: AppointmentStatus,
        patch: Value,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
        let filter = format!("id=eq.{}&status=eq.{}", observed.id, observed.status);

        let updated: Vec<Appointment> = self
            .store
            .update_where("appointments", &filter, patch, Some(auth_token))
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        if let Some(appointment) = updated.into_iter().next() {
            return Ok(appointment);
        }

        // Lost the race: someone changed the status since we read it.
        let fresh = self.get_appointment(observed.id, auth_token).await?;
        if fresh.status == target {
            return Ok(fresh);
        }
        match fresh.status {
            AppointmentStatus::Cancelled => Err(AppointmentError::AlreadyCancelled),
            AppointmentStatus::Completed => {
                Err(AppointmentError::AlreadyTerminal(AppointmentStatus::Completed))
            }
            other => Err(AppointmentError::IllegalTransition { from: other, to: target }),
        }
    }

    fn ensure_participant(
        &self,
        appointment: &Appointment,
        actor: &User,
    ) -> Result<(), AppointmentError> {
        let actor_id = Uuid::parse_str(&actor.id)
            .map_err(|_| AppointmentError::AccessDenied)?;

        if appointment.is_participant(actor_id) || actor.is_admin() {
            Ok(())
        } else {
            Err(AppointmentError::AccessDenied)
        }
    }

    fn classify_canceller(
        &self,
        appointment: &Appointment,
        actor: &User,
    ) -> Result<CancelledBy, AppointmentError> {
        let actor_id = Uuid::parse_str(&actor.id)
            .map_err(|_| AppointmentError::AccessDenied)?;

        if actor_id == appointment.patient_id {
            Ok(CancelledBy::Patient)
        } else if actor_id == appointment.doctor_id {
            Ok(CancelledBy::Doctor)
        } else if actor.is_admin() {
            Ok(CancelledBy::System)
        } else {
            Err(AppointmentError::AccessDenied)
        }
    }

    fn authorize_transition(
        &self,
        appointment: &Appointment,
        actor: &User,
        target: AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        let actor_id = Uuid::parse_str(&actor.id)
            .map_err(|_| AppointmentError::AccessDenied)?;
        let is_assigned_doctor = actor_id == appointment.doctor_id;

        match target {
            // Confirming and starting a consultation are doctor actions.
            AppointmentStatus::Confirmed | AppointmentStatus::InProgress => {
                if is_assigned_doctor || actor.is_admin() {
                    Ok(())
                } else {
                    Err(AppointmentError::AccessDenied)
                }
            }
            AppointmentStatus::Completed => {
                if is_assigned_doctor || actor.is_admin() {
                    Ok(())
                } else {
                    Err(AppointmentError::AccessDenied)
                }
            }
            // Settling payment is the payment collaborator's job, surfaced
            // through mark_payment_captured; only admins may force it here.
            AppointmentStatus::Scheduled => {
                if actor.is_admin() {
                    Ok(())
                } else {
                    Err(AppointmentError::AccessDenied)
                }
            }
            // Cancellation carries its own guard set.
            AppointmentStatus::Cancelled => {
                self.classify_canceller(appointment, actor).map(|_| ())
            }
            AppointmentStatus::PaymentPending => Err(AppointmentError::IllegalTransition {
                from: appointment.status,
                to: target,
            }),
        }
    }
}
