// libs/doctor-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use axum_extra::TypedHeader;
use chrono::NaiveDate;
use headers::{authorization::Bearer, Authorization};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::models::{AvailabilityError, SetAvailabilityRequest};
use crate::services::availability::AvailabilityService;

#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRangeQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

fn map_error(e: AvailabilityError) -> AppError {
    match e {
        AvailabilityError::DoctorNotFound => AppError::NotFound("Doctor not found".to_string()),
        AvailabilityError::NotFound => AppError::NotFound("Availability not found".to_string()),
        AvailabilityError::Validation(msg) => AppError::ValidationError(msg),
        AvailabilityError::Store(msg) => AppError::Database(msg),
    }
}

/// Only the doctor themselves (or an admin) may manage their availability.
fn ensure_owns_schedule(user: &User, doctor_id: Uuid) -> Result<(), AppError> {
    if user.id == doctor_id.to_string() || user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Not authorized to manage this doctor's availability".to_string(),
        ))
    }
}

#[axum::debug_handler]
pub async fn get_doctor(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(doctor_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let service = AvailabilityService::new(&state);
    let doctor = service
        .get_doctor(doctor_id, auth.token())
        .await
        .map_err(map_error)?;

    Ok(Json(json!({ "doctor": doctor })))
}

#[axum::debug_handler]
pub async fn set_availability(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(doctor_id): Path<Uuid>,
    Json(request): Json<SetAvailabilityRequest>,
) -> Result<Json<Value>, AppError> {
    ensure_owns_schedule(&user, doctor_id)?;

    let service = AvailabilityService::new(&state);
    let availability = service
        .set_availability(doctor_id, request, auth.token())
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "success": true,
        "availability": availability
    })))
}

#[axum::debug_handler]
pub async fn get_availability(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(doctor_id): Path<Uuid>,
    Query(range): Query<AvailabilityRangeQuery>,
) -> Result<Json<Value>, AppError> {
    let service = AvailabilityService::new(&state);
    let availability = service
        .get_availability(doctor_id, range.from, range.to, auth.token())
        .await
        .map_err(map_error)?;

    Ok(Json(json!({ "availability": availability })))
}

#[axum::debug_handler]
pub async fn delete_availability(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path((doctor_id, date)): Path<(Uuid, NaiveDate)>,
) -> Result<Json<Value>, AppError> {
    ensure_owns_schedule(&user, doctor_id)?;

    let service = AvailabilityService::new(&state);
    service
        .delete_availability(doctor_id, date, auth.token())
        .await
        .map_err(map_error)?;

    Ok(Json(json!({ "success": true })))
}

#[axum::debug_handler]
pub async fn list_slots(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(doctor_id): Path<Uuid>,
    Query(query): Query<SlotQuery>,
) -> Result<Json<Value>, AppError> {
    let service = AvailabilityService::new(&state);
    let slots = service
        .list_available_slots(doctor_id, query.date, auth.token())
        .await
        .map_err(map_error)?;

    Ok(Json(json!({
        "date": query.date,
        "slots": slots
    })))
}
