use crate::metrics::AUTH_FAILURES_TOTAL;
use crate::rest::{ApiError, AppState};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests whose `x-api-key` does not match the configured key.
/// Runs before any body extraction.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !is_authorized(request.headers(), &state.api_key) {
        AUTH_FAILURES_TOTAL.inc();
        warn!(
            "Rejected {} {}: missing or invalid API key",
            request.method(),
            request.uri().path()
        );
        return ApiError::Unauthorized.into_response();
    }

    next.run(request).await
}

fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|provided| !expected.is_empty() && provided == expected)
}
