//! Request throttling middleware

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::app::AppState;

/// Reject lobby requests beyond the server-wide rate
pub async fn throttle_lobby(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.lobby_limiter.check().is_err() {
        warn!(path = %request.uri().path(), "Rate limited lobby request");
        let body = serde_json::json!({
            "success": false,
            "message": "Too many requests. Please try again later."
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }

    next.run(request).await
}
