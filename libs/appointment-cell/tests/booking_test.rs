use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use appointment_cell::models::{
    AppointmentError, AppointmentStatus, BookAppointmentRequest, PaymentStatus,
};
use appointment_cell::services::booking::AppointmentBookingService;
use shared_utils::test_utils::{MockStoreResponses, TestConfig, TestUser};
use shared_utils::time::FixedClock;

fn service_for(server: &MockServer, now: DateTime<Utc>) -> AppointmentBookingService {
    let config = TestConfig::with_store_url(&server.uri()).to_app_config();
    AppointmentBookingService::with_clock(&config, Arc::new(FixedClock::at(now)))
}

fn appointment_json(
    id: Uuid,
    patient_id: Uuid,
    doctor_id: Uuid,
    status: &str,
    scheduled_at: DateTime<Utc>,
) -> serde_json::Value {
    json!({
        "id": id,
        "patient_id": patient_id,
        "doctor_id": doctor_id,
        "scheduled_at": scheduled_at.to_rfc3339(),
        "duration_minutes": 30,
        "status": status,
        "payment_status": if status == "payment_pending" { "pending" } else { "completed" },
        "amount": 35.0,
        "notes": null,
        "cancellation_reason": null,
        "created_at": (scheduled_at - Duration::days(1)).to_rfc3339(),
        "updated_at": (scheduled_at - Duration::days(1)).to_rfc3339(),
    })
}

/// Slot locks: sweeps and releases are DELETEs, acquisition is a POST.
async fn mount_lock_mocks(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .mount(server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/slot_locks"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

#[tokio::test]
async fn booking_an_open_slot_creates_a_payment_pending_hold() {
    let server = MockServer::start().await;
    let now = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();

    let patient_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();
    let appointment_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/doctors"))
        .and(query_param("id", format!("eq.{}", doctor_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::doctor_row(doctor_id, "approved", 35.0)
        ])))
        .mount(&server)
        .await;

    mount_lock_mocks(&server).await;

    // No existing bookings collide.
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "payment_pending", scheduled_at)
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let appointment = service
        .book_appointment(
            BookAppointmentRequest {
                patient_id,
                doctor_id,
                scheduled_at,
                duration_minutes: 30,
                notes: None,
            },
            "token",
        )
        .await
        .unwrap();

    assert_eq!(appointment.status, AppointmentStatus::PaymentPending);
    assert_eq!(appointment.payment_status, PaymentStatus::Pending);
    assert_eq!(appointment.amount, 35.0);
}

#[tokio::test]
async fn overlapping_booking_is_rejected_with_the_conflicting_window() {
    let server = MockServer::start().await;
    let now = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
    // Existing booking 10:00-10:30; candidate 10:15-10:45.
    let existing_start = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let candidate_start = Utc.with_ymd_and_hms(2026, 3, 10, 10, 15, 0).unwrap();

    let patient_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/doctors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::doctor_row(doctor_id, "approved", 35.0)
        ])))
        .mount(&server)
        .await;

    mount_lock_mocks(&server).await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(Uuid::new_v4(), Uuid::new_v4(), doctor_id, "scheduled", existing_start)
        ])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let result = service
        .book_appointment(
            BookAppointmentRequest {
                patient_id,
                doctor_id,
                scheduled_at: candidate_start,
                duration_minutes: 30,
                notes: None,
            },
            "token",
        )
        .await;

    assert_matches!(
        result,
        Err(AppointmentError::SlotConflict { conflict_start, conflict_end })
            if conflict_start == existing_start
                && conflict_end == existing_start + Duration::minutes(30)
    );
}

#[tokio::test]
async fn unapproved_doctor_cannot_be_booked() {
    let server = MockServer::start().await;
    let now = Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/doctors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockStoreResponses::doctor_row(doctor_id, "pending_approval", 35.0)
        ])))
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let result = service
        .book_appointment(
            BookAppointmentRequest {
                patient_id: Uuid::new_v4(),
                doctor_id,
                scheduled_at: now + Duration::days(1),
                duration_minutes: 30,
                notes: None,
            },
            "token",
        )
        .await;

    assert_matches!(result, Err(AppointmentError::DoctorNotApproved));
}

#[tokio::test]
async fn cancellation_is_refused_inside_the_two_hour_window() {
    let server = MockServer::start().await;
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let now = scheduled_at - Duration::minutes(119);

    let appointment_id = Uuid::new_v4();
    let patient = TestUser::patient("patient@example.com");
    let patient_id = Uuid::parse_str(&patient.id).unwrap();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "confirmed", scheduled_at)
        ])))
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let result = service
        .cancel_appointment(appointment_id, &patient.to_user(), None, "token")
        .await;

    assert_matches!(
        result,
        Err(AppointmentError::CancellationWindowClosed { cutoff })
            if cutoff == scheduled_at - Duration::hours(2)
    );
}

#[tokio::test]
async fn cancellation_before_the_cutoff_succeeds() {
    let server = MockServer::start().await;
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let now = scheduled_at - Duration::minutes(121);

    let appointment_id = Uuid::new_v4();
    let patient = TestUser::patient("patient@example.com");
    let patient_id = Uuid::parse_str(&patient.id).unwrap();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "confirmed", scheduled_at)
        ])))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .and(query_param("status", "eq.confirmed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "cancelled", scheduled_at)
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let cancelled = service
        .cancel_appointment(
            appointment_id,
            &patient.to_user(),
            Some("Feeling better".to_string()),
            "token",
        )
        .await
        .unwrap();

    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn strangers_cannot_cancel_someone_elses_appointment() {
    let server = MockServer::start().await;
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let now = scheduled_at - Duration::hours(5);

    let appointment_id = Uuid::new_v4();
    let stranger = TestUser::patient("stranger@example.com");

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, Uuid::new_v4(), Uuid::new_v4(), "confirmed", scheduled_at)
        ])))
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let result = service
        .cancel_appointment(appointment_id, &stranger.to_user(), None, "token")
        .await;

    assert_matches!(result, Err(AppointmentError::AccessDenied));
}

#[tokio::test]
async fn re_requesting_an_applied_transition_is_a_no_op_success() {
    let server = MockServer::start().await;
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let now = scheduled_at - Duration::days(1);

    let appointment_id = Uuid::new_v4();
    let doctor = TestUser::doctor("doctor@example.com");
    let doctor_id = Uuid::parse_str(&doctor.id).unwrap();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, Uuid::new_v4(), doctor_id, "confirmed", scheduled_at)
        ])))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let appointment = service
        .transition_status(
            appointment_id,
            &doctor.to_user(),
            AppointmentStatus::Confirmed,
            None,
            "token",
        )
        .await
        .unwrap();

    assert_eq!(appointment.status, AppointmentStatus::Confirmed);
}

#[tokio::test]
async fn losing_a_transition_race_resolves_to_the_winners_state() {
    let server = MockServer::start().await;
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let now = scheduled_at - Duration::days(1);

    let appointment_id = Uuid::new_v4();
    let doctor = TestUser::doctor("doctor@example.com");
    let doctor_id = Uuid::parse_str(&doctor.id).unwrap();
    let patient_id = Uuid::new_v4();

    // First read sees Scheduled; by the time the update lands, the
    // reconciler (or another request) has already confirmed it.
    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "scheduled", scheduled_at)
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("status", "eq.scheduled"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "confirmed", scheduled_at)
        ])))
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let appointment = service
        .transition_status(
            appointment_id,
            &doctor.to_user(),
            AppointmentStatus::Confirmed,
            None,
            "token",
        )
        .await
        .unwrap();

    // The same target was already applied by the race winner: no-op success.
    assert_eq!(appointment.status, AppointmentStatus::Confirmed);
}

#[tokio::test]
async fn cancelling_an_already_cancelled_appointment_is_rejected() {
    let server = MockServer::start().await;
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let now = scheduled_at - Duration::days(1);

    let appointment_id = Uuid::new_v4();
    let patient = TestUser::patient("patient@example.com");
    let patient_id = Uuid::parse_str(&patient.id).unwrap();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, Uuid::new_v4(), "cancelled", scheduled_at)
        ])))
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let result = service
        .cancel_appointment(appointment_id, &patient.to_user(), None, "token")
        .await;

    assert_matches!(result, Err(AppointmentError::AlreadyCancelled));
}

#[tokio::test]
async fn payment_capture_advances_the_soft_hold() {
    let server = MockServer::start().await;
    let scheduled_at = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
    let now = scheduled_at - Duration::days(1);

    let appointment_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();
    let doctor_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "payment_pending", scheduled_at)
        ])))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("status", "eq.payment_pending"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment_json(appointment_id, patient_id, doctor_id, "scheduled", scheduled_at)
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let service = service_for(&server, now);
    let appointment = service
        .mark_payment_captured(appointment_id, "token")
        .await
        .unwrap();

    assert_eq!(appointment.status, AppointmentStatus::Scheduled);
    assert_eq!(appointment.payment_status, PaymentStatus::Completed);
}
