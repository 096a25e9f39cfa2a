// libs/doctor-cell/src/models.rs
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub specialty: Option<String>,
    pub status: DoctorStatus,
    pub consultation_fee: f64,
}

impl Doctor {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_approved(&self) -> bool {
        self.status == DoctorStatus::Approved
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DoctorStatus {
    PendingApproval,
    Approved,
    Suspended,
}

impl fmt::Display for DoctorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoctorStatus::PendingApproval => write!(f, "pending_approval"),
            DoctorStatus::Approved => write!(f, "approved"),
            DoctorStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// A doctor's declared bookable window for one calendar date.
/// At most one record exists per (doctor, date); saving again upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorAvailability {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_minutes: i32,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAvailabilityRequest {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_minutes: i32,
    pub is_available: Option<bool>,
}

/// One candidate slot in an availability listing. `time` is the local
/// clock time; `display_time` is the same instant formatted for the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSlot {
    pub time: String,
    pub display_time: String,
    pub available: bool,
}

/// Minimal appointment projection used when marking slots: only the
/// occupied window matters here, not the full record.
#[derive(Debug, Clone, Deserialize)]
pub struct BookedWindow {
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
}

impl BookedWindow {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.scheduled_at + chrono::Duration::minutes(self.duration_minutes as i64)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AvailabilityError {
    #[error("Doctor not found")]
    DoctorNotFound,

    #[error("Availability not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Store(String),
}
