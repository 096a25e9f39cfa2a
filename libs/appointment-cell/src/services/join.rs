// libs/appointment-cell/src/services/join.rs
//
// Join-window evaluation: can this participant enter the live session right
// now, and if not, why and when. Evaluated fresh on every poll; never
// mutates anything.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::store::StoreClient;
use shared_utils::time::{system_clock, Clock};

use crate::models::{Appointment, AppointmentError, AppointmentStatus, JoinAttempt};

/// Grace period on both sides of the nominal appointment window.
pub const JOIN_BUFFER_MINUTES: i64 = 5;

/// Whole-minute countdown from `from` to `to`, rounded up, floored at zero.
fn whole_minutes_until(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    let seconds = (to - from).num_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + 59) / 60
    }
}

/// Gates 1-3: status, participant, time window. Pure; the caller layers the
/// doctor-exclusivity check on top when the requester is the doctor.
pub fn evaluate_gates(appointment: &Appointment, user_id: Uuid, now: DateTime<Utc>) -> JoinAttempt {
    let buffer = Duration::minutes(JOIN_BUFFER_MINUTES);
    let buffer_start = appointment.scheduled_at - buffer;
    let buffer_end = appointment.end_time() + buffer;

    let time_until_start = whole_minutes_until(now, appointment.scheduled_at);
    let time_until_end = whole_minutes_until(now, appointment.end_time());

    let refuse = |reason: String| JoinAttempt {
        can_join: false,
        reason: Some(reason),
        time_until_start_minutes: time_until_start,
        time_until_end_minutes: time_until_end,
    };

    if !matches!(
        appointment.status,
        AppointmentStatus::Confirmed | AppointmentStatus::InProgress
    ) {
        return refuse(format!(
            "Appointment is {} and cannot be joined",
            appointment.status
        ));
    }

    if !appointment.is_participant(user_id) {
        return refuse("Not a participant in this appointment".to_string());
    }

    if now < buffer_start {
        let minutes_until_joinable = whole_minutes_until(now, buffer_start);
        return refuse(format!(
            "Too early to join: the session opens in {} minute{}",
            minutes_until_joinable,
            if minutes_until_joinable == 1 { "" } else { "s" }
        ));
    }

    if now > buffer_end {
        return refuse("Appointment has ended".to_string());
    }

    JoinAttempt {
        can_join: true,
        reason: None,
        time_until_start_minutes: time_until_start,
        time_until_end_minutes: time_until_end,
    }
}

pub struct JoinWindowService {
    store: Arc<StoreClient>,
    clock: Arc<dyn Clock>,
}

impl JoinWindowService {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(StoreClient::new(config)),
            clock,
        }
    }

    /// Evaluate join eligibility for (appointment, user, now). At most one
    /// store query beyond the appointment fetch: the doctor-exclusivity
    /// check, and only when the requester is the doctor and everything else
    /// already passed.
    pub async fn evaluate_join(
        &self,
        appointment_id: Uuid,
        user_id: Uuid,
        auth_token: &str,
    ) -> Result<JoinAttempt, AppointmentError> {
        let appointment = self.get_appointment(appointment_id, auth_token).await?;
        let now = self.clock.now();

        let attempt = evaluate_gates(&appointment, user_id, now);
        if !attempt.can_join {
            return Ok(attempt);
        }

        // One live consultation per doctor at any instant.
        if user_id == appointment.doctor_id
            && self
                .doctor_has_other_live_session(&appointment, auth_token)
                .await?
        {
            debug!(
                "Doctor {} blocked from joining {}: another consultation is live",
                appointment.doctor_id, appointment.id
            );
            return Ok(JoinAttempt {
                can_join: false,
                reason: Some("Doctor is in another consultation".to_string()),
                ..attempt
            });
        }

        Ok(attempt)
    }

    async fn get_appointment(
        &self,
        appointment_id: Uuid,
        auth_token: &str,
    ) -> Result<Appointment, AppointmentError> {
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

    async fn doctor_has_other_live_session(
        &self,
        appointment: &Appointment,
        auth_token: &str,
    ) -> Result<bool, AppointmentError> {
        let path = format!(
            "/rest/v1/appointments?doctor_id=eq.{}&status=eq.{}&id=neq.{}&select=id&limit=1",
            appointment.doctor_id,
            AppointmentStatus::InProgress,
            appointment.id
        );

        let result: Vec<Value> = self
            .store
            .request(Method::GET, &path, Some(auth_token), None)
            .await
            .map_err(|e| AppointmentError::Store(e.to_string()))?;

        Ok(!result.is_empty())
    }
}
