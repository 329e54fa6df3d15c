//! API route definitions

use crate::dispatch::ModelDispatcher;
use crate::lifecycle::ModelLifecycleManager;
use crate::memory::MemoryService;
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<ModelLifecycleManager>,
    pub dispatcher: Arc<ModelDispatcher>,
    pub memory: Arc<MemoryService>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/profile", get(handlers::profile))
        // Model lifecycle
        .route("/models", get(handlers::list_models))
        .route("/models/release-all", post(handlers::release_all))
        .route("/models/{slug}", get(handlers::get_model))
        .route("/models/{slug}", delete(handlers::release_model))
        .route("/models/{slug}/ensure", post(handlers::ensure_model))
        .route("/models/{slug}/complete", post(handlers::complete))
        // Routing
        .route("/route", post(handlers::route_message))
        .route("/dispatch", post(handlers::dispatch_message))
        // Memory
        .route("/memory/remember", post(handlers::remember))
        .route("/memory/recall", post(handlers::recall))
        .route("/memory/stats", get(handlers::memory_stats))
        .route("/memory/{id}", delete(handlers::forget))
        // Documents
        .route("/documents", post(handlers::add_document))
        .route("/documents/query", post(handlers::query_documents))
        .route("/documents/{doc_id}", delete(handlers::remove_document))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
