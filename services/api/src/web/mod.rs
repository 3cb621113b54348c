pub mod auth;
pub mod identity;
pub mod middleware;
pub mod rest;
pub mod state;

pub use middleware::require_auth;

use axum::{
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::web::state::AppState;

/// Builds the API router. Swagger UI is merged in by the binary.
pub fn router(state: Arc<AppState>) -> Router {
    // Public routes (no auth required). Gateway callbacks are authenticated by their hash.
    let public_routes = Router::new()
        .route("/auth/signup", post(auth::signup_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler))
        .route("/availability", get(rest::get_availability_handler))
        .route("/payment/webhook", post(rest::payment_webhook_handler))
        .route("/payment/success", post(rest::payment_success_handler))
        .route("/payment/failure", post(rest::payment_failure_handler))
        .route("/booking-status/{order_id}", get(rest::booking_status_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/availability", axum::routing::put(rest::set_availability_handler))
        .route("/availability/sync", post(rest::sync_calendar_handler))
        .route("/reserve-slot", post(rest::reserve_slot_handler))
        .route("/payment/order", post(rest::create_payment_order_handler))
        .route("/payment/verify", post(rest::verify_payment_handler))
        .route("/sessions", get(rest::list_sessions_handler))
        .route("/sessions/{id}/reschedule", post(rest::reschedule_handler))
        .route(
            "/sessions/{id}/reschedule/approve",
            post(rest::approve_reschedule_handler),
        )
        .route(
            "/sessions/{id}/reschedule/reject",
            post(rest::reject_reschedule_handler),
        )
        .route("/sessions/{id}/cancel", post(rest::cancel_session_handler))
        .route("/sessions/{id}/complete", post(rest::complete_session_handler))
        .route("/credits", get(rest::list_credits_handler))
        .route("/credits/apply", post(rest::apply_credit_handler))
        .route(
            "/packages/{client_package_id}/book",
            post(rest::book_from_package_handler),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors_layer(&state.config.cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);
    match origin.parse::<HeaderValue>() {
        Ok(origin) => layer.allow_origin(origin),
        Err(e) => {
            warn!("CORS_ORIGIN '{}' is not a valid header value, cross-origin requests are refused: {}", origin, e);
            layer
        }
    }
}
