// libs/appointment-cell/src/services/lifecycle.rs
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::models::{Appointment, AppointmentError, AppointmentStatus, AppointmentValidationRules};

/// The appointment state machine. Every status change in the system, manual
/// or reconciler-driven, is validated here; the transition table lives in
/// [`AppointmentLifecycleService::valid_transitions`] and nowhere else.
pub struct AppointmentLifecycleService {
    rules: AppointmentValidationRules,
}

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self {
            rules: AppointmentValidationRules::default(),
        }
    }

    pub fn with_rules(rules: AppointmentValidationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &AppointmentValidationRules {
        &self.rules
    }

    /// All legal next statuses for a given current status.
    pub fn valid_transitions(&self, current: &AppointmentStatus) -> Vec<AppointmentStatus> {
        match current {
            AppointmentStatus::PaymentPending => vec![
                AppointmentStatus::Scheduled,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::Scheduled => vec![
                AppointmentStatus::Confirmed,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::Confirmed => vec![
                AppointmentStatus::InProgress,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::InProgress => vec![AppointmentStatus::Completed],
            // Terminal states - no transitions allowed
            AppointmentStatus::Completed => vec![],
            AppointmentStatus::Cancelled => vec![],
        }
    }

    pub fn validate_transition(
        &self,
        current: &AppointmentStatus,
        target: &AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        debug!("Validating status transition from {} to {}", current, target);

        if !self.valid_transitions(current).contains(target) {
            warn!("Invalid status transition attempted: {} -> {}", current, target);
            return Err(AppointmentError::IllegalTransition {
                from: *current,
                to: *target,
            });
        }

        Ok(())
    }

    /// The instant after which cancellation is no longer accepted.
    pub fn cancellation_cutoff(&self, scheduled_at: DateTime<Utc>) -> DateTime<Utc> {
        scheduled_at - Duration::hours(self.rules.cancellation_cutoff_hours)
    }

    /// Whether `appointment` may be cancelled at `now`. Terminal statuses
    /// are reported as such; in-progress consultations cannot be cancelled.
    pub fn validate_cancellation(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        match appointment.status {
            AppointmentStatus::Cancelled => return Err(AppointmentError::AlreadyCancelled),
            AppointmentStatus::Completed => {
                return Err(AppointmentError::AlreadyTerminal(AppointmentStatus::Completed))
            }
            AppointmentStatus::InProgress => {
                return Err(AppointmentError::IllegalTransition {
                    from: AppointmentStatus::InProgress,
                    to: AppointmentStatus::Cancelled,
                })
            }
            AppointmentStatus::PaymentPending
            | AppointmentStatus::Scheduled
            | AppointmentStatus::Confirmed => {}
        }

        let cutoff = self.cancellation_cutoff(appointment.scheduled_at);
        if now >= cutoff {
            return Err(AppointmentError::CancellationWindowClosed { cutoff });
        }

        Ok(())
    }

    /// The transition the reconciler should apply right now, if any, purely
    /// as a function of elapsed time.
    pub fn automatic_transition(
        &self,
        appointment: &Appointment,
        now: DateTime<Utc>,
    ) -> Option<AppointmentStatus> {
        match appointment.status {
            AppointmentStatus::Confirmed => {
                if now >= appointment.scheduled_at {
                    return Some(AppointmentStatus::InProgress);
                }
            }
            AppointmentStatus::InProgress => {
                let completion_threshold = appointment.end_time()
                    + Duration::minutes(self.rules.completion_buffer_minutes);
                if now > completion_threshold {
                    return Some(AppointmentStatus::Completed);
                }
            }
            AppointmentStatus::PaymentPending => {
                let payment_deadline =
                    appointment.created_at + Duration::hours(self.rules.payment_timeout_hours);
                if now > payment_deadline {
                    return Some(AppointmentStatus::Cancelled);
                }
            }
            _ => {}
        }

        None
    }

    /// Booking-time validation of the requested window.
    pub fn validate_booking_timing(
        &self,
        scheduled_at: DateTime<Utc>,
        duration_minutes: i32,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        if duration_minutes < self.rules.min_duration_minutes
            || duration_minutes > self.rules.max_duration_minutes
        {
            return Err(AppointmentError::Validation(format!(
                "Duration must be between {} and {} minutes",
                self.rules.min_duration_minutes, self.rules.max_duration_minutes
            )));
        }

        if scheduled_at <= now {
            return Err(AppointmentError::Validation(
                "Appointment must be scheduled for a future time".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for AppointmentLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentStatus;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn service() -> AppointmentLifecycleService {
        AppointmentLifecycleService::new()
    }

    fn appointment(status: AppointmentStatus) -> Appointment {
        let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        Appointment {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            doctor_id: Uuid::new_v4(),
            scheduled_at,
            duration_minutes: 30,
            status,
            payment_status: PaymentStatus::Completed,
            amount: 35.0,
            notes: None,
            cancellation_reason: None,
            created_at: scheduled_at - Duration::days(1),
            updated_at: scheduled_at - Duration::days(1),
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        let svc = service();
        let path = [
            (AppointmentStatus::PaymentPending, AppointmentStatus::Scheduled),
            (AppointmentStatus::Scheduled, AppointmentStatus::Confirmed),
            (AppointmentStatus::Confirmed, AppointmentStatus::InProgress),
            (AppointmentStatus::InProgress, AppointmentStatus::Completed),
        ];
        for (from, to) in path {
            assert!(svc.validate_transition(&from, &to).is_ok(), "{} -> {}", from, to);
        }
    }

    #[test]
    fn cancellation_reachable_only_before_session_starts() {
        let svc = service();
        for from in [
            AppointmentStatus::PaymentPending,
            AppointmentStatus::Scheduled,
            AppointmentStatus::Confirmed,
        ] {
            assert!(svc
                .validate_transition(&from, &AppointmentStatus::Cancelled)
                .is_ok());
        }

        assert_matches!(
            svc.validate_transition(&AppointmentStatus::InProgress, &AppointmentStatus::Cancelled),
            Err(AppointmentError::IllegalTransition { .. })
        );
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        let svc = service();
        for terminal in [AppointmentStatus::Completed, AppointmentStatus::Cancelled] {
            assert!(svc.valid_transitions(&terminal).is_empty());
            for target in [
                AppointmentStatus::PaymentPending,
                AppointmentStatus::Scheduled,
                AppointmentStatus::Confirmed,
                AppointmentStatus::InProgress,
                AppointmentStatus::Completed,
                AppointmentStatus::Cancelled,
            ] {
                assert_matches!(
                    svc.validate_transition(&terminal, &target),
                    Err(AppointmentError::IllegalTransition { .. })
                );
            }
        }
    }

    #[test]
    fn skipping_states_is_illegal() {
        let svc = service();
        assert_matches!(
            svc.validate_transition(&AppointmentStatus::Scheduled, &AppointmentStatus::InProgress),
            Err(AppointmentError::IllegalTransition { .. })
        );
        assert_matches!(
            svc.validate_transition(&AppointmentStatus::PaymentPending, &AppointmentStatus::Confirmed),
            Err(AppointmentError::IllegalTransition { .. })
        );
    }

    #[test]
    fn cancellation_rejected_inside_two_hour_cutoff() {
        let svc = service();
        let appt = appointment(AppointmentStatus::Confirmed);

        // 1h59m before start: inside the window, rejected
        let late = appt.scheduled_at - Duration::minutes(119);
        assert_matches!(
            svc.validate_cancellation(&appt, late),
            Err(AppointmentError::CancellationWindowClosed { .. })
        );

        // exactly at the cutoff: rejected
        let at_cutoff = appt.scheduled_at - Duration::hours(2);
        assert_matches!(
            svc.validate_cancellation(&appt, at_cutoff),
            Err(AppointmentError::CancellationWindowClosed { .. })
        );

        // 2h01m before start: allowed
        let early = appt.scheduled_at - Duration::minutes(121);
        assert!(svc.validate_cancellation(&appt, early).is_ok());
    }

    #[test]
    fn cancelling_cancelled_or_completed_reports_terminal_state() {
        let svc = service();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();

        assert_matches!(
            svc.validate_cancellation(&appointment(AppointmentStatus::Cancelled), now),
            Err(AppointmentError::AlreadyCancelled)
        );
        assert_matches!(
            svc.validate_cancellation(&appointment(AppointmentStatus::Completed), now),
            Err(AppointmentError::AlreadyTerminal(AppointmentStatus::Completed))
        );
    }

    #[test]
    fn confirmed_auto_starts_once_scheduled_time_arrives() {
        let svc = service();
        let appt = appointment(AppointmentStatus::Confirmed);

        assert_eq!(
            svc.automatic_transition(&appt, appt.scheduled_at - Duration::seconds(1)),
            None
        );
        assert_eq!(
            svc.automatic_transition(&appt, appt.scheduled_at),
            Some(AppointmentStatus::InProgress)
        );
    }

    #[test]
    fn in_progress_auto_completes_after_buffer() {
        let svc = service();
        let appt = appointment(AppointmentStatus::InProgress);
        let threshold = appt.end_time() + Duration::minutes(5);

        assert_eq!(svc.automatic_transition(&appt, threshold), None);
        assert_eq!(
            svc.automatic_transition(&appt, threshold + Duration::seconds(1)),
            Some(AppointmentStatus::Completed)
        );
    }

    #[test]
    fn payment_pending_auto_cancels_after_two_hours() {
        let svc = service();
        let appt = appointment(AppointmentStatus::PaymentPending);

        // 1h59m after creation: untouched
        assert_eq!(
            svc.automatic_transition(&appt, appt.created_at + Duration::minutes(119)),
            None
        );
        // 2h01m after creation: cancelled
        assert_eq!(
            svc.automatic_transition(&appt, appt.created_at + Duration::minutes(121)),
            Some(AppointmentStatus::Cancelled)
        );
    }

    #[test]
    fn scheduled_has_no_automatic_transition() {
        let svc = service();
        let appt = appointment(AppointmentStatus::Scheduled);
        let far_future = appt.scheduled_at + Duration::days(30);
        assert_eq!(svc.automatic_transition(&appt, far_future), None);
    }

    #[test]
    fn booking_timing_must_be_future_and_bounded() {
        let svc = service();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();

        assert!(svc
            .validate_booking_timing(now + Duration::hours(3), 30, now)
            .is_ok());
        assert_matches!(
            svc.validate_booking_timing(now, 30, now),
            Err(AppointmentError::Validation(_))
        );
        assert_matches!(
            svc.validate_booking_timing(now + Duration::hours(3), 0, now),
            Err(AppointmentError::Validation(_))
        );
        assert_matches!(
            svc.validate_booking_timing(now + Duration::hours(3), 500, now),
            Err(AppointmentError::Validation(_))
        );
    }
}
