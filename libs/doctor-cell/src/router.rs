// libs/doctor-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, put},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;

pub fn doctor_routes(state: Arc<AppConfig>) -> Router {
    let protected_routes = Router::new()
        .route("/{doctor_id}", get(handlers::get_doctor))
        .route("/{doctor_id}/availability", put(handlers::set_availability))
        .route("/{doctor_id}/availability", get(handlers::get_availability))
        .route(
            "/{doctor_id}/availability/{date}",
            delete(handlers::delete_availability),
        )
        .route("/{doctor_id}/slots", get(handlers::list_slots))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new().merge(protected_routes).with_state(state)
}
