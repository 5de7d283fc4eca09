use super::state::AppState;
use crate::relay::{AccessToken, LifecycleState, RelayError, Resolution};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// `<channel>-<token1>-<token2>`
    pub access_token: String,

    /// Relay server (default: configured server)
    pub server: Option<String>,

    /// "1080p", "720p", "540p" or "360p" (default: configured resolution)
    pub resolution: Option<String>,

    /// RTMP buffer in milliseconds (default: configured buffering)
    pub buffering: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub channel: String,
    pub resolution: Resolution,
    pub status: LifecycleState,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub status: LifecycleState,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /relay/login
/// Parse the access token and start relaying
pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let token = match AccessToken::parse(&req.access_token) {
        Ok(token) => token,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let resolution = match req.resolution.as_deref().map(str::parse::<Resolution>) {
        Some(Ok(resolution)) => Some(resolution),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        None => None,
    };

    if state.relay.state().await != LifecycleState::Idle {
        return error_response(StatusCode::CONFLICT, "Relay is already connected");
    }

    // Remember the overrides for later logins
    let config = {
        let mut settings = state.settings.write().await;
        if let Some(server) = req.server {
            settings.server = server;
        }
        if let Some(resolution) = resolution {
            settings.resolution = resolution;
        }
        if let Some(buffering) = req.buffering {
            settings.buffering = buffering;
        }
        settings.access_token = req.access_token.trim().to_string();
        settings.relay_config(&token)
    };

    info!("Login to channel {} ({})", config.channel, config.resolution);

    let channel = config.channel.clone();
    let resolution = config.resolution;

    match state.relay.start(config).await {
        Ok(()) => (
            StatusCode::OK,
            Json(LoginResponse {
                channel,
                resolution,
                status: state.relay.state().await,
            }),
        )
            .into_response(),
        Err(e @ RelayError::InvalidConfig(_)) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            error!("Failed to start relay: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start relay: {}", e),
            )
        }
    }
}

/// POST /relay/logout
/// Stop relaying and forget the access token
pub async fn logout(State(state): State<AppState>) -> Response {
    if state.relay.state().await == LifecycleState::Idle {
        return error_response(StatusCode::CONFLICT, "Relay is not connected");
    }

    if let Err(e) = state.relay.stop().await {
        error!("Failed to stop relay: {}", e);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to stop relay: {}", e),
        );
    }

    state.settings.write().await.access_token.clear();
    info!("Logged out");

    (
        StatusCode::OK,
        Json(LogoutResponse {
            status: state.relay.state().await,
            message: "Relay stopped".to_string(),
        }),
    )
        .into_response()
}

/// GET /relay/status
/// Current relay state, session counters and tracks
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.relay.status().await))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
