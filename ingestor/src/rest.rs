use crate::auth::require_api_key;
use crate::db::{MeasurementFilter, Store};
use crate::errors::Error;
use crate::metrics::{MEASUREMENTS_WRITTEN_TOTAL, REQUESTS_TOTAL, VALIDATION_FAILURES_TOTAL};
use crate::model::{IngestResponse, MeasurementsResponse, PayloadShape};
use crate::normalize::normalize;
use crate::validate::validate;
use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct AppState {
    pub store: Store,
    pub api_key: Arc<str>,
}

#[derive(Debug, Deserialize)]
pub struct MeasurementQuery {
    device_id: Option<String>,
    location_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// Routes guarded by the shared-secret header.
pub fn create_router(store: Store, api_key: impl Into<Arc<str>>) -> Router {
    let state = AppState {
        store,
        api_key: api_key.into(),
    };

    Router::new()
        .route(
            "/temperatures",
            post(ingest_batch).get(list_measurements),
        )
        .route("/weather", post(ingest_single))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

async fn ingest_batch(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    ingest(&state, PayloadShape::Batch, body?).await
}

async fn ingest_single(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    ingest(&state, PayloadShape::Single, body?).await
}

async fn ingest(
    state: &AppState,
    shape: PayloadShape,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    REQUESTS_TOTAL.inc();
    let request_id = Uuid::new_v4();

    let payload = validate(shape, &body).map_err(|e| {
        VALIDATION_FAILURES_TOTAL.inc();
        warn!(%request_id, ?shape, "Rejected payload: {}", e);
        e
    })?;
    let submitted = payload.len();

    let records = normalize(payload).map_err(ApiError::write_failure)?;
    let written = state
        .store
        .upsert(&records)
        .await
        .map_err(ApiError::write_failure)?;

    MEASUREMENTS_WRITTEN_TOTAL.inc_by(written as f64);
    info!(%request_id, ?shape, submitted, "Stored {} measurements", written);

    Ok(Json(IngestResponse::added(written)))
}

async fn list_measurements(
    State(state): State<AppState>,
    params: Result<Query<MeasurementQuery>, QueryRejection>,
) -> Result<Json<MeasurementsResponse>, ApiError> {
    let Query(params) = params?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let sql_offset = i64::try_from(offset).map_err(|_| {
        ApiError::Validation(format!(
            "\"offset\" must be less than or equal to {}",
            i64::MAX
        ))
    })?;

    let filter = MeasurementFilter {
        device_id: params.device_id,
        location_id: params.location_id,
        start: params.start,
        end: params.end,
        limit: limit as i64,
        offset: sql_offset,
    };

    let data = state
        .store
        .query(&filter)
        .await
        .map_err(|e| ApiError::Internal {
            message: "Failed to query measurements",
            source: e,
        })?;

    Ok(Json(MeasurementsResponse {
        total: data.len(),
        data,
        limit,
        offset,
    }))
}

/// Every failure leaves as `{"error": ...}`. Internal causes are logged and
/// replaced by a fixed message.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Validation(String),
    Rejected(StatusCode, String),
    Internal { message: &'static str, source: Error },
}

impl ApiError {
    fn write_failure(source: Error) -> Self {
        Self::Internal {
            message: "Failed to add measurements",
            source,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(message) => Self::Validation(message),
            source => Self::Internal {
                message: "Internal server error",
                source,
            },
        }
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        Self::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            Self::Validation(message) => (StatusCode::BAD_REQUEST, message),
            Self::Rejected(status, message) => (status, message),
            Self::Internal { message, source } => {
                error!("API error: {}: {}", message, source);
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
