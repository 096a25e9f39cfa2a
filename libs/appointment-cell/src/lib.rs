pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use models::{
    Appointment, AppointmentError, AppointmentStatus, BookAppointmentRequest, JoinAttempt,
    PaymentStatus,
};
pub use services::booking::AppointmentBookingService;
pub use services::join::JoinWindowService;
pub use services::reconciler::ReconciliationScheduler;
