//! Organization / project / credential management routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use qm_store::{CredentialProvider, Store};

use crate::api::{api_error, error_response};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateOrganizationRequest {
    name: String,
    /// Initial balance in credits (fractional allowed).
    #[serde(default)]
    credits: f64,
}

pub async fn create_organization(
    State(state): State<AppState>,
    Json(request): Json<CreateOrganizationRequest>,
) -> impl IntoResponse {
    if request.name.trim().is_empty() {
        return api_error(StatusCode::UNPROCESSABLE_ENTITY, "name must not be empty");
    }
    let credits_mc = (request.credits * 1000.0).round() as i64;
    match state
        .store
        .create_organization(request.name.trim(), credits_mc)
        .await
    {
        Ok(organization) => (StatusCode::CREATED, Json(organization)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_organization(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.organization(id).await {
        Ok(organization) => Json(organization).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    name: String,
}

pub async fn create_project(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    Json(request): Json<CreateProjectRequest>,
) -> impl IntoResponse {
    match state
        .store
        .create_project(organization_id, request.name.trim())
        .await
    {
        Ok(project) => (StatusCode::CREATED, Json(project)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct PutCredentialRequest {
    provider: CredentialProvider,
    /// Provider-specific secret blob, sealed before storage.
    secret: serde_json::Value,
}

pub async fn put_credential(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<PutCredentialRequest>,
) -> impl IntoResponse {
    let Some(cipher) = &state.credential_cipher else {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "credential key is not configured on this deployment",
        );
    };
    let ciphertext = match cipher.seal(&request.secret) {
        Ok(ciphertext) => ciphertext,
        Err(e) => return error_response(e),
    };
    match state
        .store
        .put_credential(project_id, request.provider, ciphertext)
        .await
    {
        // The ciphertext is write-only through the API.
        Ok(credential) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": credential.id,
                "project_id": credential.project_id,
                "provider": credential.provider,
                "created_at": credential.created_at,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
