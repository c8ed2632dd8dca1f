use axum::{Router, extract::Path, routing::get};
use http::StatusCode;

/// Routes answering with a chosen status: `GET /` returns 200 and `/status/{code}` returns `code`.
///
/// Served by the binary and used by the tests to drive settlement with arbitrary statuses.
pub fn status_router() -> Router {
    Router::new()
        .route("/", get(|| async { "OK" }))
        .route("/status/{code}", get(status).post(status))
}

async fn status(Path(code): Path<u16>) -> (StatusCode, String) {
    match StatusCode::from_u16(code) {
        Ok(status) => (status, status.canonical_reason().unwrap_or_default().to_string()),
        Err(_) => (StatusCode::BAD_REQUEST, format!("invalid status code {code}")),
    }
}
