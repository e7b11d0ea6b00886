//! HTTP front end: `POST /run` and `GET /health`

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use coderun_common::{ErrorResponse, HealthResponse, RunRequest, RunResponse};
use coderun_sandbox::{SessionError, SessionService, TurnOutput};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    service: SessionService,
}

impl AppState {
    pub fn new(service: SessionService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &SessionService {
        &self.service
    }
}

/// Create the HTTP router
pub fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/run", post(handle_run))
        .route("/health", get(handle_health))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Error reply for a failed `POST /run`
#[derive(Debug)]
pub enum AppError {
    Session(SessionError),
    MalformedBody(JsonRejection),
    Internal(String),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::MalformedBody(rejection)
    }
}

impl From<SessionError> for AppError {
    fn from(error: SessionError) -> Self {
        Self::Session(error)
    }
}

fn internal_error(details: String) -> (StatusCode, ErrorResponse) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorResponse::new("Failed to process the request.").with_details(details),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Session(SessionError::SessionNotFound(_)) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("Container not found or not ready"),
            ),
            AppError::Session(SessionError::InvalidRequest(reason)) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new(reason))
            }
            AppError::MalformedBody(rejection) => {
                debug!("Rejected request body: {}", rejection.body_text());
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::new("Invalid request body").with_details(rejection.body_text()),
                )
            }
            AppError::Session(other) => {
                error!("Request failed: {}", other);
                internal_error(other.to_string())
            }
            AppError::Internal(details) => {
                error!("Request failed: {}", details);
                internal_error(details)
            }
        };
        (status, Json(body)).into_response()
    }
}

fn to_response(turn: TurnOutput) -> RunResponse {
    RunResponse {
        output: turn.output,
        requires_input: turn.requires_input,
        container_id: turn.live.then(|| turn.session_id.to_string()),
    }
}

/// Handle `POST /run` - start a session or continue one
async fn handle_run(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, AppError> {
    let Json(request) = payload?;
    debug!(
        container_id = ?request.container_id,
        has_input = request.input.is_some(),
        "Received run request"
    );

    // Detached so a dropped connection cannot cancel a turn midway.
    let service = state.service.clone();
    let outcome = tokio::spawn(async move {
        match request.container_id {
            Some(id) => service.resume(&id, request.input.as_deref()).await,
            None => service.run(&request.code).await,
        }
    })
    .await;

    match outcome {
        Ok(result) => Ok(Json(to_response(result?))),
        Err(join_error) => Err(AppError::Internal(format!("run task failed: {join_error}"))),
    }
}

/// Handle `GET /health`
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.service.registry().len().await,
    })
}
