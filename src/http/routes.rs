//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::physics::VehicleStats;
use crate::game::{DirectoryError, SessionError};
use crate::http::middleware::throttle_lobby;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::VehicleType;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/vehicles", get(vehicles_handler))
        .route("/ws/:code", get(ws_handler));

    let lobby_routes = Router::new()
        .route("/create", post(create_handler))
        .route("/join", post(join_handler))
        .route("/start", post(start_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .route_layer(middleware::from_fn_with_state(state.clone(), throttle_lobby));

    Router::new()
        .merge(public_routes)
        .merge(lobby_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health and catalog
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    active_vehicles: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.directory.active_sessions(),
        active_vehicles: state.directory.total_vehicles(),
    })
}

async fn vehicles_handler() -> Json<Vec<VehicleStats>> {
    Json(VehicleType::ALL.into_iter().map(VehicleStats::for_type).collect())
}

// ============================================================================
// Session management
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    gamer_name: String,
    #[serde(alias = "tankType")]
    vehicle_type: u8,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    success: bool,
    message: String,
    session_code: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    #[serde(alias = "gameCode")]
    session_code: String,
    gamer_name: String,
    #[serde(alias = "tankType")]
    vehicle_type: u8,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(alias = "gameCode")]
    session_code: String,
}

/// Outcome of join/start
#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    message: String,
}

impl StatusResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    fn rejected(message: String) -> Self {
        Self {
            success: false,
            message,
        }
    }
}

fn parse_vehicle(raw: u8) -> Result<VehicleType, DirectoryError> {
    VehicleType::try_from(raw).map_err(|_| SessionError::UnknownVehicle(raw).into())
}

/// Capacity and validation failures go back to the caller as a message;
/// internal ones tear every session down and become a 500
async fn rejection(state: &AppState, err: DirectoryError) -> Result<String, AppError> {
    if err.is_internal() {
        state.directory.fail_all(&err).await;
        return Err(AppError::Internal(err.to_string()));
    }
    Ok(err.to_string())
}

async fn create_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, AppError> {
    let outcome = parse_vehicle(req.vehicle_type)
        .and_then(|vehicle_type| state.directory.create_session(&req.gamer_name, vehicle_type));

    let response = match outcome {
        Ok(session_code) => CreateResponse {
            success: true,
            message: String::new(),
            session_code,
        },
        Err(e) => CreateResponse {
            success: false,
            message: rejection(&state, e).await?,
            session_code: String::new(),
        },
    };
    Ok(Json(response))
}

async fn join_handler(
    State(state): State<AppState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    let outcome = match parse_vehicle(req.vehicle_type) {
        Ok(vehicle_type) => {
            state
                .directory
                .join_session(&req.session_code, &req.gamer_name, vehicle_type)
                .await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => Ok(Json(StatusResponse::ok())),
        Err(e) => Ok(Json(StatusResponse::rejected(rejection(&state, e).await?))),
    }
}

async fn start_handler(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    match state.directory.start_round(&req.session_code).await {
        Ok(()) => Ok(Json(StatusResponse::ok())),
        Err(e) => Ok(Json(StatusResponse::rejected(rejection(&state, e).await?))),
    }
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong. Please try again later.".to_string(),
            ),
        };

        let body = serde_json::json!({
            "success": false,
            "message": message
        });

        (status, Json(body)).into_response()
    }
}
