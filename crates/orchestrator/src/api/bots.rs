//! Bot lifecycle routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use qm_domain::bot::BotKind;
use qm_domain::settings::BotSettings;
use qm_store::{Bot, Created, DesiredAction, NewBot, Store};

use crate::api::{api_error, error_response};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateBotRequest {
    pub project_id: Uuid,
    pub meeting_url: String,
    #[serde(default = "default_bot_name")]
    pub name: String,
    #[serde(default)]
    pub join_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deduplication_key: Option<String>,
    #[serde(default)]
    pub settings: BotSettings,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_bot_name() -> String {
    "Quorum Notetaker".into()
}

async fn create(
    state: AppState,
    request: CreateBotRequest,
    kind: BotKind,
) -> Response {
    if let Some(join_at) = request.join_at {
        if join_at <= Utc::now() {
            return api_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "join_at must be in the future",
            );
        }
    }

    let new = NewBot {
        project_id: request.project_id,
        kind,
        meeting_url: request.meeting_url,
        name: request.name,
        join_at: request.join_at,
        deduplication_key: request.deduplication_key,
        settings: request.settings.normalize(),
        metadata: request.metadata,
    };
    match state.store.create_bot(new).await {
        // The dedup invariant hands back the existing row with 200.
        Ok(Created::New(bot)) => (StatusCode::CREATED, Json(bot)).into_response(),
        Ok(Created::Existing(bot)) => (StatusCode::OK, Json(bot)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn create_bot(
    State(state): State<AppState>,
    Json(request): Json<CreateBotRequest>,
) -> impl IntoResponse {
    create(state, request, BotKind::Meeting).await
}

pub async fn create_app_session(
    State(state): State<AppState>,
    Json(request): Json<CreateBotRequest>,
) -> impl IntoResponse {
    if !request.meeting_url.starts_with("rtms://") {
        return api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "app sessions require an rtms:// stream url",
        );
    }
    create(state, request, BotKind::AppSession).await
}

pub async fn get_bot(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> impl IntoResponse {
    match state.store.bot_by_object_id(&object_id).await {
        Ok(bot) => Json(bot).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_bots(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.list_bots(project_id).await {
        Ok(bots) => Json(bots).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotAction {
    Leave,
    PauseRecording,
    ResumeRecording,
}

#[derive(Deserialize)]
pub struct PatchBotRequest {
    pub action: BotAction,
}

/// Record an intent for the owning worker; it is honored on the next
/// heartbeat tick.
pub async fn patch_bot(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
    Json(request): Json<PatchBotRequest>,
) -> impl IntoResponse {
    let bot = match state.store.bot_by_object_id(&object_id).await {
        Ok(bot) => bot,
        Err(e) => return error_response(e),
    };
    if bot.state.is_terminal() {
        return api_error(StatusCode::CONFLICT, "bot is already terminal");
    }
    let action = match request.action {
        BotAction::Leave => DesiredAction::Leave,
        BotAction::PauseRecording => DesiredAction::PauseRecording,
        BotAction::ResumeRecording => DesiredAction::ResumeRecording,
    };
    match state.store.set_desired_action(bot.id, Some(action)).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "bot_id": bot.object_id, "action": action })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn bot_events(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> impl IntoResponse {
    match lookup(&state, &object_id).await {
        Ok(bot) => match state.store.bot_events(bot.id).await {
            Ok(events) => Json(events).into_response(),
            Err(e) => error_response(e),
        },
        Err(response) => response,
    }
}

pub async fn recordings(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> impl IntoResponse {
    match lookup(&state, &object_id).await {
        Ok(bot) => match state.store.recordings_for_bot(bot.id).await {
            Ok(recordings) => Json(recordings).into_response(),
            Err(e) => error_response(e),
        },
        Err(response) => response,
    }
}

#[derive(Deserialize)]
pub struct TranscriptQuery {
    /// Merge cached interim hypotheses over the persisted finals.
    #[serde(default = "default_true")]
    pub include_partials: bool,
}

fn default_true() -> bool {
    true
}

/// Final utterances in meeting order, with the interim cache appended
/// for live readers.
pub async fn transcript(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> impl IntoResponse {
    let bot = match lookup(&state, &object_id).await {
        Ok(bot) => bot,
        Err(response) => return response,
    };
    let recordings = match state.store.recordings_for_bot(bot.id).await {
        Ok(recordings) => recordings,
        Err(e) => return error_response(e),
    };
    let Some(default_recording) = recordings.iter().find(|r| r.is_default) else {
        return Json(serde_json::json!({ "utterances": [], "partials": [] })).into_response();
    };
    let utterances = match state.store.utterances(default_recording.id).await {
        Ok(utterances) => utterances,
        Err(e) => return error_response(e),
    };

    let partials = if query.include_partials && !bot.state.is_terminal() {
        state
            .partials
            .for_bot(bot.id)
            .into_iter()
            .map(|p| {
                serde_json::json!({
                    "participant_uuid": p.participant_uuid,
                    "relative_timestamp_ms": p.relative_timestamp_ms,
                    "duration_ms": p.duration_ms,
                    "transcript": p.text,
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    Json(serde_json::json!({
        "transcription_state": default_recording.transcription_state,
        "utterances": utterances,
        "partials": partials,
    }))
    .into_response()
}

pub async fn participant_events(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> impl IntoResponse {
    match lookup(&state, &object_id).await {
        Ok(bot) => {
            let events = state.store.participant_events(bot.id).await;
            let participants = state.store.participants(bot.id).await;
            match (events, participants) {
                (Ok(events), Ok(participants)) => Json(serde_json::json!({
                    "participants": participants,
                    "events": events,
                }))
                .into_response(),
                (Err(e), _) | (_, Err(e)) => error_response(e),
            }
        }
        Err(response) => response,
    }
}

pub async fn chat_messages(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> impl IntoResponse {
    match lookup(&state, &object_id).await {
        Ok(bot) => match state.store.chat_messages(bot.id).await {
            Ok(messages) => Json(messages).into_response(),
            Err(e) => error_response(e),
        },
        Err(response) => response,
    }
}

async fn lookup(state: &AppState, object_id: &str) -> Result<Bot, Response> {
    state
        .store
        .bot_by_object_id(object_id)
        .await
        .map_err(error_response)
}
