use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use ordersync_infra::jobs::JobError;

pub fn job_error_to_response(err: JobError) -> axum::response::Response {
    match err {
        JobError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobError::InvalidTransition { from, to } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "success": false,
                "error": "invalid_transition",
                "message": format!("cannot move job from {from} to {to}"),
            })),
        )
            .into_response(),
        JobError::AlreadyRunning(e) => json_error(StatusCode::CONFLICT, "already_running", e.to_string()),
        JobError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn invalid_job_id() -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_id", "jobId must be a UUID")
}
