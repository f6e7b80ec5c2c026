//! HTTP handler functions for the riksdata server.

use actix_web::{HttpRequest, HttpResponse, web};
use riksdata_ingest::IngestError;
use riksdata_ingest::admin;
use riksdata_ingest::driver::FetchDriver;
use riksdata_ingest::worker::FileWorker;
use riksdata_ingest_models::{FileQueueResponse, IngestRequest, IngestResponse};
use riksdata_server_models::{
    AdminActionResponse, ApiHealth, ProgressListResponse, ProgressQueryParams, QueueStatsResponse,
    ResetFailedResponse,
};
use riksdata_source_models::DataSource;
use serde::de::DeserializeOwned;

use crate::auth::require_admin;
use crate::{ApiError, AppState};

/// Decodes a JSON body. An empty body decodes as `{}`.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))
}

fn parse_source(raw: &str) -> Result<DataSource, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Unknown source \"{raw}\"")))
}

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Runs `work` on its own task so it finishes, and releases what it holds,
/// even if the client disconnects and the handler future is dropped.
async fn detached<T, F>(work: F) -> Result<T, ApiError>
where
    T: 'static,
    F: Future<Output = Result<T, IngestError>> + 'static,
{
    actix_rt::spawn(work)
        .await
        .map_err(|e| ApiError::Internal(format!("Invocation task failed: {e}")))?
        .map_err(ApiError::from)
}

async fn invoke(
    state: web::Data<AppState>,
    req: &HttpRequest,
    body: &[u8],
    source: DataSource,
) -> Result<HttpResponse, ApiError> {
    let principal = require_admin(&state, req).await?;
    let request: IngestRequest = parse_body(body)?;

    log::info!(
        "{} invoked {source}/{} (maxPages={:?}, paginate={})",
        principal.user_id,
        request.data_type.trim(),
        request.max_pages,
        request.paginate
    );

    let summary = detached(async move {
        FetchDriver::new(state.store.as_ref(), state.pages.as_ref())
            .retry_policy(state.retry)
            .page_delay(state.page_delay)
            .cancellation(state.shutdown.child_token())
            .run(source, &request)
            .await
    })
    .await?;

    Ok(HttpResponse::Ok().json(IngestResponse::from(&summary)))
}

/// `POST /functions/v1/fetch-riksdagen-data`
pub async fn fetch_riksdagen(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    invoke(state, &req, &body, DataSource::Riksdagen).await
}

/// `POST /functions/v1/fetch-regeringskansliet-data`
pub async fn fetch_regeringskansliet(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    invoke(state, &req, &body, DataSource::Regeringskansliet).await
}

/// `POST /functions/v1/process-file-queue`
///
/// Processes one batch of queued attachment downloads.
pub async fn process_file_queue(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;

    let summary = detached(async move {
        FileWorker::new(
            state.store.as_ref(),
            state.files.as_ref(),
            state.objects.as_ref(),
        )
        .run()
        .await
    })
    .await?;

    Ok(HttpResponse::Ok().json(FileQueueResponse::from(summary)))
}

/// `GET /api/admin/progress[?source=...]`
pub async fn list_progress(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;

    let params = web::Query::<ProgressQueryParams>::from_query(req.query_string())
        .map_err(|e| ApiError::BadRequest(format!("Invalid query: {e}")))?;
    let progress = admin::list_progress(state.store.as_ref(), params.source).await?;

    Ok(HttpResponse::Ok().json(ProgressListResponse {
        success: true,
        progress,
    }))
}

/// `POST /api/admin/progress/{source}/{data_type}/stop`
pub async fn stop(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;
    let (source, data_type) = path.into_inner();

    let key = admin::request_stop(state.store.as_ref(), parse_source(&source)?, &data_type).await?;
    Ok(HttpResponse::Ok().json(AdminActionResponse::new(format!(
        "Stop requested for {key}"
    ))))
}

/// `POST /api/admin/progress/{source}/{data_type}/clear-stop`
pub async fn clear_stop(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;
    let (source, data_type) = path.into_inner();

    let key = admin::clear_stop(state.store.as_ref(), parse_source(&source)?, &data_type).await?;
    Ok(HttpResponse::Ok().json(AdminActionResponse::new(format!(
        "Stop flag cleared for {key}"
    ))))
}

/// `POST /api/admin/progress/{source}/{data_type}/reset`
pub async fn reset(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;
    let (source, data_type) = path.into_inner();

    let key = admin::reset(state.store.as_ref(), parse_source(&source)?, &data_type).await?;
    Ok(HttpResponse::Ok().json(AdminActionResponse::new(format!(
        "Progress reset for {key}"
    ))))
}

/// `DELETE /api/admin/progress/{source}/{data_type}`
pub async fn delete_progress(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;
    let (source, data_type) = path.into_inner();
    let source = parse_source(&source)?;

    let message = if admin::delete(state.store.as_ref(), source, &data_type).await? {
        format!("Progress deleted for {source}/{data_type}")
    } else {
        format!("No progress for {source}/{data_type}")
    };
    Ok(HttpResponse::Ok().json(AdminActionResponse::new(message)))
}

/// `GET /api/admin/file-queue/stats`
pub async fn queue_stats(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;
    let stats = admin::queue_stats(state.store.as_ref()).await?;
    Ok(HttpResponse::Ok().json(QueueStatsResponse {
        success: true,
        stats,
    }))
}

/// `POST /api/admin/file-queue/reset-failed`
pub async fn reset_failed(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    require_admin(&state, &req).await?;
    let reset = admin::reset_failed(state.store.as_ref()).await?;
    Ok(HttpResponse::Ok().json(ResetFailedResponse {
        success: true,
        reset,
    }))
}
