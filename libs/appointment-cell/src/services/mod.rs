pub mod booking;
pub mod conflict;
pub mod join;
pub mod lifecycle;
pub mod reconciler;
