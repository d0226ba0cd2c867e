//! API-surface tests and the scheduled-join flow through the embedded
//! dispatcher.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use qm_adapter::{AdapterRegistry, SimAdapter, SimScript};
use qm_domain::bot::BotState;
use qm_domain::config::Config;
use qm_domain::platform::Platform;
use qm_orchestrator::api;
use qm_orchestrator::dispatcher::Dispatcher;
use qm_orchestrator::launcher::TaskLauncher;
use qm_orchestrator::state::AppState;
use qm_store::{MemoryStore, Store};

async fn test_state() -> (AppState, tempfile::TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.worker.scratch_dir = scratch.path().to_path_buf();
    let store = Arc::new(MemoryStore::new());
    let mut state = AppState::with_store(Arc::new(config), store).unwrap();

    let mut adapters = AdapterRegistry::empty();
    adapters.register(
        Platform::ZoomNative,
        Arc::new(SimAdapter::new(SimScript::happy_path(1, 20_000))),
    );
    state.adapters = Arc::new(adapters);
    (state, scratch)
}

async fn request(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn create_and_read_bot_through_the_api() {
    let (state, _scratch) = test_state().await;
    let app = api::router(state.clone());

    let (status, organization) = request(
        &app,
        "POST",
        "/api/v1/organizations",
        Some(serde_json::json!({ "name": "acme", "credits": 100.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(organization["credits_mc"], 100_000);

    let (status, project) = request(
        &app,
        "POST",
        &format!("/api/v1/organizations/{}/projects", organization["id"].as_str().unwrap()),
        Some(serde_json::json!({ "name": "default" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["id"].as_str().unwrap().to_owned();

    let create_body = serde_json::json!({
        "project_id": project_id,
        "meeting_url": "https://zoom.us/j/42",
        "deduplication_key": "standup",
    });
    let (status, bot) = request(&app, "POST", "/api/v1/bots", Some(create_body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let object_id = bot["object_id"].as_str().unwrap().to_owned();
    assert!(object_id.starts_with("bot_"));
    assert_eq!(bot["state"], "ready");

    // Same dedup key: the existing bot comes back with 200.
    let (status, duplicate) = request(&app, "POST", "/api/v1/bots", Some(create_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(duplicate["object_id"], object_id.as_str());

    let (status, fetched) =
        request(&app, "GET", &format!("/api/v1/bots/{object_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["object_id"], object_id.as_str());

    let (status, _) = request(&app, "GET", "/api/v1/bots/bot_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Unknown meeting hosts are a config error.
    let (status, error) = request(
        &app,
        "POST",
        "/api/v1/bots",
        Some(serde_json::json!({
            "project_id": project_id,
            "meeting_url": "https://example.com/call",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(error["error"].as_str().unwrap().contains("unsupported"));

    // Intent endpoint records the desired action.
    let (status, accepted) = request(
        &app,
        "PATCH",
        &format!("/api/v1/bots/{object_id}"),
        Some(serde_json::json!({ "action": "leave" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["action"], "leave");
}

#[tokio::test]
async fn webhook_subscription_lifecycle() {
    let (state, _scratch) = test_state().await;
    let app = api::router(state.clone());

    let organization = state.store.create_organization("acme", 0).await.unwrap();
    let project = state
        .store
        .create_project(organization.id, "p")
        .await
        .unwrap();

    let (status, subscription) = request(
        &app,
        "POST",
        &format!("/api/v1/projects/{}/webhooks", project.id),
        Some(serde_json::json!({
            "url": "https://receiver.example.com/hook",
            "triggers": ["bot.state_change", "transcript.update"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!subscription["secret"].as_str().unwrap().is_empty());

    // Listing never re-exposes the secret.
    let (status, listed) = request(
        &app,
        "GET",
        &format!("/api/v1/projects/{}/webhooks", project.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(listed[0].get("secret").is_none());

    let (status, _) = request(
        &app,
        "DELETE",
        &format!("/api/v1/webhooks/{}", subscription["id"].as_str().unwrap()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Invalid subscriptions are rejected up front.
    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/v1/projects/{}/webhooks", project.id),
        Some(serde_json::json!({ "url": "ftp://nope", "triggers": ["bot.state_change"] })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn bearer_auth_guards_the_api_when_configured() {
    // Hash of "sesame" wired directly into state, as if the env var had
    // been read at startup.
    let (mut state, _scratch) = test_state().await;
    use sha2::Digest;
    state.api_token_hash = Some(sha2::Sha256::digest(b"sesame").to_vec());
    let app = api::router(state);

    let unauthenticated = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/organizations")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"acme"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let authenticated = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/organizations")
                .header("content-type", "application/json")
                .header("authorization", "Bearer sesame")
                .body(Body::from(r#"{"name":"acme"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(authenticated.status(), StatusCode::CREATED);

    // Health stays open for probes.
    let health = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn scheduled_bot_joins_before_its_join_at() {
    let (state, _scratch) = test_state().await;
    let organization = state.store.create_organization("acme", 100_000).await.unwrap();
    let project = state
        .store
        .create_project(organization.id, "p")
        .await
        .unwrap();

    let join_at = chrono::Utc::now() + chrono::Duration::seconds(120);
    let bot = state
        .store
        .create_bot(qm_store::NewBot {
            project_id: project.id,
            kind: qm_domain::bot::BotKind::Meeting,
            meeting_url: "https://zoom.us/j/1".into(),
            name: "Notetaker".into(),
            join_at: Some(join_at),
            deduplication_key: None,
            settings: qm_domain::settings::BotSettings {
                transcription: qm_domain::settings::TranscriptionSettings {
                    enabled: false,
                    ..Default::default()
                },
                recording_type: qm_domain::settings::RecordingType::AudioOnly,
                format: qm_domain::settings::RecordingFormat::Wav,
                ..Default::default()
            },
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap()
        .into_bot();
    assert_eq!(bot.state, BotState::Scheduled);

    let dispatcher = Dispatcher::new(state.clone(), Arc::new(TaskLauncher::new(state.clone())));

    // An early tick leaves the bot alone.
    dispatcher.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(state.store.bot(bot.id).await.unwrap().state, BotState::Scheduled);

    // At join_at − pre_roll (60 s) the bot matures and launches; the
    // in-process worker reaches JOINING (and beyond) before join_at.
    dispatcher
        .tick(chrono::Utc::now() + chrono::Duration::seconds(61))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let current = state.store.bot(bot.id).await.unwrap().state;
    assert!(
        !matches!(current, BotState::Scheduled | BotState::Ready | BotState::Staged),
        "worker must be past staging, saw {current}"
    );
}
