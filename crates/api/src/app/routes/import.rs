use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;

use ordersync_core::filters::{DEFAULT_PRESET, FinancialStatus, FulfillmentStatus, OrderStatus};
use ordersync_core::{DateRange, DomainError, ImportFilter, JobId};
use ordersync_infra::jobs::{JobAction, JobData, JobKind, JobStatus};

use crate::app::dto::{self, StartImportRequest};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(get_jobs).post(start_import).patch(control_job))
        .route("/presets", get(presets))
        .route("/:job_id", get(job_detail))
}

pub async fn start_import(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<StartImportRequest>,
) -> axum::response::Response {
    let (data, resumed_from) = match body.resume_job_id.as_deref() {
        Some(previous) => match resumed_job_data(&services, previous) {
            Ok((data, previous_id)) => (data, Some(previous_id)),
            Err(response) => return response,
        },
        None => match new_job_data(&services, &body) {
            Ok(data) => (data, None),
            Err(response) => return response,
        },
    };

    let job_id = match services.manager.create_job(data) {
        Ok(id) => id,
        Err(e) => return errors::job_error_to_response(e),
    };
    if let Some(previous) = resumed_from {
        if let Err(response) = copy_checkpoint(&services, previous, job_id).await {
            return response;
        }
    }

    if let Err(e) = services.orchestrator.spawn(job_id) {
        return errors::job_error_to_response(e);
    }

    let Some(job) = services.manager.get_job(job_id) else {
        return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "job vanished after creation");
    };
    (StatusCode::ACCEPTED, Json(dto::StartImportResponse::started(&job))).into_response()
}

/// Build the payload of a fresh job from the request filters.
fn new_job_data(services: &AppServices, body: &StartImportRequest) -> Result<JobData, axum::response::Response> {
    let Some(kind) = dto::parse_mode(body.mode.as_deref()) else {
        return Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_mode",
            "mode must be \"paginated\" or \"bulk\"",
        ));
    };

    let now = Utc::now();
    let range = match (body.date_from.as_deref(), body.date_to.as_deref()) {
        (Some(from), Some(to)) => {
            let validation = services.filters.validate_date_range(from, to, now);
            match validation.range {
                Some(range) if validation.valid => range,
                _ => {
                    let rejected = dto::InvalidRangeResponse::from_validation(validation);
                    return Err((StatusCode::BAD_REQUEST, Json(rejected)).into_response());
                }
            }
        }
        _ => services
            .filters
            .preset(DEFAULT_PRESET, now)
            .map(|preset| preset.range())
            .unwrap_or_else(|| DateRange::new(now - chrono::Duration::days(30), now)),
    };

    let filter = ImportFilter {
        financial_status: parse_status::<FinancialStatus>(body.financial_status.as_deref())?,
        fulfillment_status: parse_status::<FulfillmentStatus>(body.fulfillment_status.as_deref())?,
        status: parse_status::<OrderStatus>(body.status.as_deref())?,
        search: body.search.clone().filter(|s| !s.trim().is_empty()),
        ..ImportFilter::new(range)
    };

    Ok(match kind {
        JobKind::PaginatedImport => JobData::paginated(filter),
        JobKind::BulkImport => JobData::bulk(filter),
    })
}

/// A continuation keeps the previous job's mode and filter; its cursor is
/// only meaningful for that query.
fn resumed_job_data(
    services: &AppServices,
    previous: &str,
) -> Result<(JobData, JobId), axum::response::Response> {
    let previous_id: JobId = previous.parse().map_err(|_| errors::invalid_job_id())?;
    let Some(previous) = services.manager.get_job(previous_id) else {
        return Err(errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {previous_id} not found"),
        ));
    };
    if !matches!(previous.status, JobStatus::Failed | JobStatus::Cancelled) {
        return Err(errors::json_error(
            StatusCode::CONFLICT,
            "not_resumable",
            format!("only failed or cancelled jobs can be resumed, job is {}", previous.status),
        ));
    }

    let data = match previous.data {
        JobData::Paginated { filter, .. } => JobData::Paginated {
            filter,
            resumed_from: Some(previous_id),
        },
        JobData::Bulk { filter, .. } => JobData::bulk(filter),
    };
    Ok((data, previous_id))
}

async fn copy_checkpoint(
    services: &AppServices,
    from: JobId,
    to: JobId,
) -> Result<(), axum::response::Response> {
    let store_error =
        |e: ordersync_infra::checkpoint::CheckpointError| errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string());

    if let Some(checkpoint) = services.checkpoints.get(from).await.map_err(store_error)? {
        services
            .checkpoints
            .save(&checkpoint.reassigned(to))
            .await
            .map_err(store_error)?;
        tracing::info!(job_id = %to, resumed_from = %from, processed = checkpoint.processed_count, "checkpoint carried over");
    }
    Ok(())
}

fn parse_status<T>(raw: Option<&str>) -> Result<Option<T>, axum::response::Response>
where
    T: std::str::FromStr<Err = DomainError>,
{
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|e: DomainError| errors::json_error(StatusCode::BAD_REQUEST, "invalid_filter", e.to_string())),
    }
}

pub async fn get_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::JobQuery>,
) -> axum::response::Response {
    let Some(raw) = query.job_id else {
        let jobs = services.manager.list_jobs(services.config.list_limit);
        return Json(dto::JobListResponse { jobs }).into_response();
    };

    let Ok(job_id) = raw.parse::<JobId>() else {
        return errors::invalid_job_id();
    };
    match services.manager.get_job(job_id) {
        Some(job) => Json(dto::JobResponse { job }).into_response(),
        None => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
    }
}

pub async fn control_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::JobActionRequest>,
) -> axum::response::Response {
    let (Some(raw_id), Some(raw_action)) = (body.job_id, body.action) else {
        return errors::json_error(StatusCode::BAD_REQUEST, "missing_field", "jobId and action are required");
    };
    let Ok(action) = raw_action.parse::<JobAction>() else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_action",
            "action must be pause, resume, or cancel",
        );
    };
    let Ok(job_id) = raw_id.parse::<JobId>() else {
        return errors::invalid_job_id();
    };

    match services.manager.request_action(job_id, action) {
        Ok(status) => Json(dto::JobActionResponse {
            success: true,
            status,
            message: match action {
                JobAction::Pause => "Job paused",
                JobAction::Resume => "Job resumed",
                JobAction::Cancel => "Job cancelled",
            }
            .to_string(),
        })
        .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn job_detail(
    Extension(services): Extension<Arc<AppServices>>,
    Path(raw_id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = raw_id.parse::<JobId>() else {
        return errors::invalid_job_id();
    };
    let Some(job) = services.manager.get_job(job_id) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found"));
    };
    let checkpoint = match services.checkpoints.get(job_id).await {
        Ok(cp) => cp,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    };
    Json(dto::JobDetailResponse::new(job, checkpoint)).into_response()
}

pub async fn presets(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(dto::PresetsResponse {
        presets: services.filters.preset_ranges(Utc::now()),
    })
}
