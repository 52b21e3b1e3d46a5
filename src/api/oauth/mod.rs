//! HTTP surface of the connect flow.
//!
//! 1. User clicks "Connect"
//! 2. GET /oauth/connect → 302 to the provider's authorization page
//! 3. User authorizes on the provider's site
//! 4. Provider redirects to GET /oauth/complete?state=..&code=..
//! 5. Code is exchanged for a token, which is stored encrypted
//! 6. Waiters for the user are told how it went
//!
//! Every route identifies the caller by the identity cookie set by the host
//! application. Errors are plain text and never carry internal detail.

use crate::auth::extract_session_user;
use crate::flow::{FlowController, FlowError};
use crate::oauth::ExchangeError;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, warn};

const COMPLETED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>Connected</title>
</head>
<body>
<p>Completed connecting to Lichess. Please close this window.</p>
</body>
</html>
"#;

/// Application error types for OAuth endpoints
#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        (status, error_message).into_response()
    }
}

impl From<FlowError> for AppError {
    fn from(err: FlowError) -> Self {
        let message = err.public_message().to_string();
        match err {
            FlowError::InvalidOrExpiredState | FlowError::StateMismatch | FlowError::MissingCode => {
                AppError::BadRequest(message)
            }
            FlowError::UserMismatch => AppError::Unauthorized(message),
            FlowError::Exchange(ref e) if e.is_provider_side() => AppError::BadGateway(message),
            FlowError::Exchange(ExchangeError::Local(_)) => AppError::ServerError(message),
            FlowError::Decryption(_) => AppError::Conflict(message),
            FlowError::NotConnected => AppError::NotFound(message),
            _ => AppError::ServerError(message),
        }
    }
}

/// Shared application state for OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub flow: FlowController,
    /// Name of the cookie carrying the signed-in user id
    pub identity_cookie: String,
}

impl OAuthAppState {
    fn caller(&self, headers: &HeaderMap) -> Result<String, AppError> {
        extract_session_user(headers, &self.identity_cookie).map_err(|e| {
            debug!(error = %e, "Rejecting unauthenticated request");
            AppError::Unauthorized("not authorized".to_string())
        })
    }
}

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct OAuthCallback {
    #[serde(default)]
    state: String,
    #[serde(default)]
    code: String,
    error: Option<String>,
    error_description: Option<String>,
}

/// Connection status response
#[derive(Debug, Serialize)]
pub struct ConnectionStatus {
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    disconnected: bool,
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/oauth/connect", get(oauth_connect))
        .route("/oauth/complete", get(oauth_complete))
        .route("/oauth/status", get(oauth_status))
        .route("/oauth/disconnect", post(oauth_disconnect))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(Arc::new(state))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(panic = %detail, "Recovered from a panic in HTTP handler");

    AppError::ServerError("internal error, please try again later".to_string()).into_response()
}

/// GET /oauth/connect
///
/// Starts the flow and redirects the user to the provider.
///
/// # Security
/// - Requires the identity cookie
/// - Fresh `state` and PKCE verifier per attempt, held server-side for 10 minutes
async fn oauth_connect(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = state.caller(&headers)?;
    debug!(user_id = %user_id, "OAuth connect requested");

    let auth_url = state.flow.initiate(&user_id).await.map_err(|e| {
        error!(user_id = %user_id, error = %e, "Failed to start OAuth flow");
        AppError::from(e)
    })?;

    Ok((StatusCode::FOUND, [(header::LOCATION, auth_url)]).into_response())
}

/// GET /oauth/complete
///
/// Provider callback. Exchanges the code for a token and stores it encrypted.
///
/// # Security
/// - `state` is single-use and must have been issued to the same user
/// - The PKCE verifier never leaves the server until the token request
async fn oauth_complete(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
    Query(callback): Query<OAuthCallback>,
) -> Result<Response, AppError> {
    let user_id = state.caller(&headers)?;
    debug!(user_id = %user_id, "OAuth callback received");

    // A denied authorization arrives without a code; completing still burns
    // the session and tells the waiters.
    if let Some(error) = &callback.error {
        warn!(
            user_id = %user_id,
            error = %error,
            description = %callback.error_description.as_deref().unwrap_or("Unknown error"),
            "OAuth authorization failed at provider"
        );
    }

    state
        .flow
        .complete(&user_id, &callback.state, &callback.code)
        .await?;

    Ok(Html(COMPLETED_PAGE).into_response())
}

/// GET /oauth/status
async fn oauth_status(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
) -> Result<Json<ConnectionStatus>, AppError> {
    let user_id = state.caller(&headers)?;

    let status = match state.flow.connection(&user_id) {
        Ok(Some(credential)) => ConnectionStatus {
            connected: true,
            external_username: credential.external_username,
            expires_at: credential.token.expires_at,
        },
        Ok(None) => ConnectionStatus {
            connected: false,
            external_username: None,
            expires_at: None,
        },
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Failed to read stored credential");
            return Err(e.into());
        }
    };

    Ok(Json(status))
}

/// POST /oauth/disconnect
async fn oauth_disconnect(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let user_id = state.caller(&headers)?;

    let disconnected = state.flow.disconnect(&user_id).map_err(|e| {
        error!(user_id = %user_id, error = %e, "Failed to remove stored credential");
        AppError::from(e)
    })?;

    Ok(Json(DisconnectResponse { disconnected }))
}
