//! HTTP surface: the OAuth callback endpoint and the security stats view.
//!
//! The provider redirects the user's browser here after consent. Errors
//! map to actionable messages; raw provider payloads and token material
//! are never echoed back.

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::SecurityLog;
use crate::error::AuthError;
use crate::kv::KvStore;
use crate::oauth::AuthFlow;
use crate::rate_limit::RateLimiter;

/// Action name the callback endpoint is rate limited under.
const CALLBACK_ACTION: &str = "login";

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<AuthFlow>,
    pub audit: Arc<SecurityLog>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Query parameters the provider sends to the callback.
#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct CallbackResponse {
    success: bool,
    account: String,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Builds the router for the callback endpoint and the stats view.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/oauth/callback", get(oauth_callback))
        .route("/admin/security/stats", get(security_stats))
        .with_state(Arc::new(state))
}

/// GET /oauth/callback
///
/// Completes the authorization dance. The owning user is the first
/// segment of `state`; the flow re-checks the binding and consumes the
/// pending verifier exactly once.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    debug!("OAuth callback received");

    if let Some(error) = query.error {
        warn!(error = %error, "provider reported an authorization error");
        let err = if error == "access_denied" {
            AuthError::AccessDenied
        } else {
            AuthError::TransientProvider(error)
        };
        return error_response(&err);
    }

    let (Some(code), Some(callback_state)) = (query.code, query.state) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "missing 'code' or 'state' parameter".to_string(),
            }),
        )
            .into_response();
    };

    let user_id = callback_state
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string();
    if user_id.is_empty() {
        return error_response(&AuthError::InvalidState);
    }

    let decision = state
        .rate_limiter
        .check_and_consume(&user_id, CALLBACK_ACTION, &state.audit);
    if !decision.allowed {
        return error_response(&AuthError::RateLimitExceeded {
            reset_at: decision.reset_at,
        });
    }

    match state.flow.handle_callback(&user_id, &code, &callback_state).await {
        Ok(credential) => {
            info!(user = %user_id, "account linked via callback");
            Json(CallbackResponse {
                success: true,
                account: credential.account_id.clone(),
                message: format!("Successfully linked {}", credential.account_id),
            })
            .into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// GET /admin/security/stats
async fn security_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(state.audit.stats(50)).into_response()
}

/// Maps an error kind to a status code and a user-safe message.
fn error_response(err: &AuthError) -> Response {
    let (status, message) = match err {
        AuthError::InvalidState
        | AuthError::SessionExpired
        | AuthError::CsrfValidationFailed
        | AuthError::ReauthorizationRequired
        | AuthError::CredentialNotFound => (StatusCode::UNAUTHORIZED, err.to_string()),
        AuthError::AccessDenied | AuthError::AccountLocked { .. } => {
            (StatusCode::FORBIDDEN, err.to_string())
        }
        AuthError::InvalidGrant => (StatusCode::BAD_REQUEST, err.to_string()),
        AuthError::RateLimitExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, err.to_string()),
        AuthError::TransientProvider(_) => (
            StatusCode::BAD_GATEWAY,
            "the storage provider is temporarily unavailable, try again shortly".to_string(),
        ),
        AuthError::RedirectMismatch | AuthError::InvalidClientConfig => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "the application is misconfigured, contact the operator".to_string(),
        ),
        AuthError::CorruptedCiphertext | AuthError::Storage(_) | AuthError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        ),
    };

    let mut response = (status, Json(ErrorResponse { error: message })).into_response();
    if let AuthError::RateLimitExceeded { reset_at } = err {
        let secs = (*reset_at - chrono::Utc::now()).num_seconds().max(0);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

/// Periodic cleanup of expired flow state and stale audit entries.
///
/// Spawned by the host process; cleanup is never hidden inside a
/// constructor.
pub async fn run_cleanup(kv: Arc<dyn KvStore>, audit: Arc<SecurityLog>, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        let purged = kv.purge_expired();
        let pruned = audit.cleanup();
        debug!(purged, pruned, "cleanup pass complete");
    }
}
