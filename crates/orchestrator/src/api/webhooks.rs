//! Webhook subscription management routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use qm_domain::trigger::TriggerType;
use qm_store::{NewSubscription, Store};
use qm_webhooks::generate_secret;

use crate::api::{api_error, error_response};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateSubscriptionRequest {
    pub url: String,
    pub triggers: Vec<TriggerType>,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> impl IntoResponse {
    if !request.url.starts_with("https://") && !request.url.starts_with("http://") {
        return api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "url must be http(s)",
        );
    }
    if request.triggers.is_empty() {
        return api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "at least one trigger is required",
        );
    }

    let new = NewSubscription {
        project_id,
        url: request.url,
        triggers: request.triggers,
        // The secret is returned exactly once, at creation.
        secret: generate_secret(),
    };
    match state.store.create_subscription(new).await {
        Ok(subscription) => (StatusCode::CREATED, Json(subscription)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> impl IntoResponse {
    match state
        .store
        .subscriptions_for_project(project_id, false)
        .await
    {
        Ok(subscriptions) => {
            // Secrets are not re-readable.
            let listed: Vec<serde_json::Value> = subscriptions
                .into_iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id,
                        "project_id": s.project_id,
                        "url": s.url,
                        "triggers": s.triggers,
                        "is_active": s.is_active,
                        "created_at": s.created_at,
                    })
                })
                .collect();
            Json(listed).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.delete_subscription(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn deliveries_for_bot(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> impl IntoResponse {
    let bot = match state.store.bot_by_object_id(&object_id).await {
        Ok(bot) => bot,
        Err(e) => return error_response(e),
    };
    match state.store.delivery_attempts_for_bot(bot.id).await {
        Ok(attempts) => Json(attempts).into_response(),
        Err(e) => error_response(e),
    }
}
