//! Axum JSON surface for the ingest service.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use toll_core::{ProcessCsvDataRequest, ProcessCsvFileRequest, ValidateCsvDataRequest};
use toll_ingest::{IngestError, IngestService};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "toll-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestService>,
}

impl AppState {
    pub fn new(service: IngestService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/process/file", post(process_file_handler))
        .route("/v1/process/data", post(process_data_handler))
        .route("/v1/validate", post(validate_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: IngestService) -> anyhow::Result<()> {
    let port = service.config().listen_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "toll ingest listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

struct ApiError(IngestError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IngestError::InvalidArgument(_) | IngestError::MalformedDate(_) => {
                StatusCode::BAD_REQUEST
            }
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(code = self.0.code(), error = %self.0, "request rejected");
        (
            status,
            Json(serde_json::json!({
                "code": self.0.code(),
                "message": self.0.message(),
            })),
        )
            .into_response()
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.service.health_check()).into_response()
}

async fn process_file_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ProcessCsvFileRequest>, JsonRejection>,
) -> Response {
    let req = body.ok().map(|Json(req)| req);
    let cancel = state.service.request_signal();
    match state.service.process_csv_file(req.as_ref(), &cancel).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn process_data_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ProcessCsvDataRequest>, JsonRejection>,
) -> Response {
    let req = body.ok().map(|Json(req)| req);
    let cancel = state.service.request_signal();
    match state.service.process_csv_data(req.as_ref(), &cancel).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn validate_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ValidateCsvDataRequest>, JsonRejection>,
) -> Response {
    let req = body.ok().map(|Json(req)| req);
    match state.service.validate_csv_data(req.as_ref()) {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}
