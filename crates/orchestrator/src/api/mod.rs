//! The thin internal HTTP API.
//!
//! Bearer-token auth (SHA-256 hash, constant-time compare); JSON in and
//! out; every route is a translation layer over the store and the
//! emitter — no business logic lives here.

pub mod bots;
pub mod tenancy;
pub mod webhooks;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use qm_domain::Error;

use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Map a domain error onto an HTTP response.
pub(crate) fn error_response(error: Error) -> Response {
    match &error {
        Error::NotFound(_) => api_error(StatusCode::NOT_FOUND, error.to_string()),
        Error::Conflict(_) => api_error(StatusCode::CONFLICT, error.to_string()),
        Error::Config(_) | Error::Credential(_) => {
            api_error(StatusCode::UNPROCESSABLE_ENTITY, error.to_string())
        }
        _ => {
            tracing::error!(error = %error, "request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/organizations", post(tenancy::create_organization))
        .route("/organizations/:id", get(tenancy::get_organization))
        .route("/organizations/:id/projects", post(tenancy::create_project))
        .route("/projects/:id/credentials", put(tenancy::put_credential))
        .route("/bots", post(bots::create_bot))
        .route("/app-sessions", post(bots::create_app_session))
        .route("/bots/:object_id", get(bots::get_bot).patch(bots::patch_bot))
        .route("/projects/:id/bots", get(bots::list_bots))
        .route("/bots/:object_id/events", get(bots::bot_events))
        .route("/bots/:object_id/recordings", get(bots::recordings))
        .route("/bots/:object_id/transcript", get(bots::transcript))
        .route(
            "/bots/:object_id/participant-events",
            get(bots::participant_events),
        )
        .route("/bots/:object_id/chat-messages", get(bots::chat_messages))
        .route(
            "/projects/:id/webhooks",
            post(webhooks::create_subscription).get(webhooks::list_subscriptions),
        )
        .route(
            "/webhooks/:id",
            axum::routing::delete(webhooks::delete_subscription),
        )
        .route(
            "/bots/:object_id/webhook-deliveries",
            get(webhooks::deliveries_for_bot),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/healthz", get(health))
        .nest("/api/v1", v1)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Bearer-token check. With no token configured the API is open (local
/// development).
async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token_hash else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let hash = Sha256::digest(presented.as_bytes());

    if hash.as_slice().ct_eq(expected.as_slice()).unwrap_u8() == 1 {
        next.run(request).await
    } else {
        api_error(StatusCode::UNAUTHORIZED, "invalid or missing bearer token")
    }
}
