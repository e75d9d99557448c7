use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};

use crate::app::services::AppServices;

pub async fn health() -> axum::http::StatusCode {
    axum::http::StatusCode::OK
}

/// Liveness plus a glance at the worker pool.
pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "activeWorkers": services.manager.controls().active_count(),
        "hasActiveJobs": services.manager.has_active_jobs(),
        "invoices": services.invoices.count(),
    }))
}
