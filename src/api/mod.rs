pub mod health;
pub mod mpesa;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::payments::{CallbackReceiver, PaymentService, StatusReconciler};

/// Static facts reported by the health endpoint
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub environment: String,
    pub mpesa_environment: String,
    pub mpesa_configured: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<StatusReconciler>,
    pub callbacks: Arc<CallbackReceiver>,
    pub info: Arc<ServiceInfo>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/payments/mpesa/initiate", post(mpesa::initiate))
        .route("/api/payments/mpesa/status", post(mpesa::status))
        .route("/api/payments/mpesa/callback", post(mpesa::callback))
        .route(
            "/api/payments/mpesa/callback/:secret",
            post(mpesa::callback_with_secret),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
