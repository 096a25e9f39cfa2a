pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use models::{
    AvailabilityError, AvailableSlot, Doctor, DoctorAvailability, DoctorStatus,
    SetAvailabilityRequest,
};
pub use services::availability::AvailabilityService;
