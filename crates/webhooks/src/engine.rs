//! Emission and delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use qm_domain::config::WebhooksConfig;
use qm_domain::trigger::TriggerType;
use qm_domain::Result;
use qm_store::{
    Bot, DeliveryResult, NewDelivery, Store, WebhookDeliveryAttempt,
};

use crate::payload::build_payload;
use crate::sign::{signature_header, SIGNATURE_HEADER};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fans one event out to every matching active subscription.
#[derive(Clone)]
pub struct WebhookEmitter {
    store: Arc<dyn Store>,
}

impl WebhookEmitter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Enqueue a trigger for a project. Returns how many subscriptions
    /// matched. Failures to enqueue never propagate to the caller's
    /// control flow beyond the error; webhook trouble must not affect
    /// bot state.
    pub async fn emit(
        &self,
        project_id: Uuid,
        bot: Option<&Bot>,
        trigger: TriggerType,
        data: serde_json::Value,
    ) -> Result<usize> {
        let subscriptions = self
            .store
            .subscriptions_for_project(project_id, true)
            .await?;
        let matching: Vec<_> = subscriptions
            .into_iter()
            .filter(|s| s.triggers.contains(&trigger))
            .collect();
        if matching.is_empty() {
            return Ok(0);
        }

        let (payload, idempotency_key) = build_payload(trigger, bot, data)?;
        let mut enqueued = 0;
        for subscription in matching {
            self.store
                .enqueue_delivery(NewDelivery {
                    subscription_id: subscription.id,
                    bot_id: bot.map(|b| b.id),
                    trigger,
                    payload: payload.clone(),
                    idempotency_key: idempotency_key.clone(),
                })
                .await?;
            enqueued += 1;
        }
        tracing::debug!(
            project_id = %project_id,
            trigger = %trigger,
            subscriptions = enqueued,
            "webhook enqueued"
        );
        Ok(enqueued)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// When attempt `n` (0-based, already failed) retries, measured from the
/// enqueue time; `None` once attempts are exhausted.
pub fn next_attempt_at(
    created_at: DateTime<Utc>,
    failed_attempts: u32,
    now: DateTime<Utc>,
    offsets_secs: &[u64],
) -> Option<DateTime<Utc>> {
    let offset = offsets_secs.get(failed_attempts as usize)?;
    let scheduled = created_at + chrono::Duration::seconds(*offset as i64);
    Some(scheduled.max(now))
}

pub struct DeliveryWorker {
    store: Arc<dyn Store>,
    config: WebhooksConfig,
    client: reqwest::Client,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn Store>, config: WebhooksConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.total_timeout_secs))
            .build()
            .map_err(|e| qm_domain::Error::Http(format!("building client: {e}")))?;
        Ok(Self {
            store,
            config,
            client,
        })
    }

    /// Claim and deliver one batch of due attempts. Returns how many
    /// were processed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let batch = self.store.claim_due_deliveries(now, 16).await?;
        let count = batch.len();
        for attempt in batch {
            self.deliver(attempt, now).await?;
        }
        Ok(count)
    }

    /// Drain the queue until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let processed = match self.run_once(Utc::now()).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "delivery pass failed");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = cancel.cancelled() => return,
                }
            } else if cancel.is_cancelled() {
                return;
            }
        }
    }

    async fn deliver(&self, attempt: WebhookDeliveryAttempt, now: DateTime<Utc>) -> Result<()> {
        let subscription = self.store.subscription(attempt.subscription_id).await?;
        let body = serde_json::to_vec(&attempt.payload)?;
        let signature = signature_header(&subscription.secret, &body);

        let response = self
            .client
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;

        let (success, response_body) = match response {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                (status.is_success(), format!("{}: {}", status.as_u16(), text))
            }
            Err(e) => (false, format!("request error: {e}")),
        };

        let truncated: String = response_body
            .chars()
            .take(self.config.max_response_bytes)
            .collect();

        let failed_attempts = attempt.attempt_count + 1;
        let next = next_attempt_at(
            attempt.created_at,
            failed_attempts,
            now,
            &self.config.retry_offsets_secs,
        );
        let exhausted = !success && next.is_none();

        if !success {
            tracing::warn!(
                attempt_id = %attempt.id,
                url = %subscription.url,
                attempt = failed_attempts,
                exhausted,
                "webhook delivery failed"
            );
        }

        self.store
            .record_delivery_result(
                attempt.id,
                DeliveryResult {
                    success,
                    response_body: truncated,
                    next_attempt_at: next,
                    exhausted,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use parking_lot::Mutex;
    use qm_domain::bot::BotKind;
    use qm_domain::settings::BotSettings;
    use qm_store::{DeliveryStatus, MemoryStore, NewBot, NewSubscription};

    use crate::sign::verify_signature;

    #[derive(Clone, Default)]
    struct Receiver {
        hits: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        fail_first: Arc<Mutex<u32>>,
    }

    async fn hook(
        State(receiver): State<Receiver>,
        headers: HeaderMap,
        body: axum::body::Bytes,
    ) -> (axum::http::StatusCode, &'static str) {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        receiver.hits.lock().push((signature, body.to_vec()));
        let mut failures = receiver.fail_first.lock();
        if *failures > 0 {
            *failures -= 1;
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "whoops")
        } else {
            (axum::http::StatusCode::OK, "ok")
        }
    }

    async fn serve(receiver: Receiver) -> String {
        let app = Router::new().route("/hook", post(hook)).with_state(receiver);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    async fn fixture(store: &MemoryStore, url: &str) -> (Uuid, Bot, Uuid, String) {
        let org = store.create_organization("acme", 100_000).await.unwrap();
        let project = store.create_project(org.id, "p").await.unwrap();
        let secret = crate::sign::generate_secret();
        let subscription = store
            .create_subscription(NewSubscription {
                project_id: project.id,
                url: url.to_owned(),
                triggers: vec![TriggerType::BotStateChange, TriggerType::TranscriptUpdate],
                secret: secret.clone(),
            })
            .await
            .unwrap();
        let bot = store
            .create_bot(NewBot {
                project_id: project.id,
                kind: BotKind::Meeting,
                meeting_url: "https://zoom.us/j/1".into(),
                name: "Notetaker".into(),
                join_at: None,
                deduplication_key: None,
                settings: BotSettings::default(),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap()
            .into_bot();
        (project.id, bot, subscription.id, secret)
    }

    #[test]
    fn retry_schedule_follows_offsets() {
        let offsets = vec![0, 30, 120, 600, 3600];
        let created = Utc::now();

        let first = next_attempt_at(created, 1, created, &offsets).unwrap();
        assert_eq!((first - created).num_seconds(), 30);
        let second = next_attempt_at(created, 2, created, &offsets).unwrap();
        assert_eq!((second - created).num_seconds(), 120);
        // Fifth failure exhausts the schedule.
        assert!(next_attempt_at(created, 5, created, &offsets).is_none());
    }

    #[test]
    fn overdue_retry_is_scheduled_now_not_in_the_past() {
        let offsets = vec![0, 30];
        let created = Utc::now() - chrono::Duration::hours(1);
        let now = Utc::now();
        let next = next_attempt_at(created, 1, now, &offsets).unwrap();
        assert_eq!(next, now);
    }

    #[tokio::test]
    async fn emit_matches_triggers_only() {
        let store = Arc::new(MemoryStore::new());
        let (project_id, bot, _, _) = fixture(&store, "https://example.com/hook").await;
        let emitter = WebhookEmitter::new(store.clone());

        let n = emitter
            .emit(
                project_id,
                Some(&bot),
                TriggerType::BotStateChange,
                serde_json::json!({ "new_state": "joining" }),
            )
            .await
            .unwrap();
        assert_eq!(n, 1);

        // Not subscribed to chat updates.
        let n = emitter
            .emit(
                project_id,
                Some(&bot),
                TriggerType::ChatMessagesUpdate,
                serde_json::json!({}),
            )
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn delivery_signs_body_and_succeeds() {
        let receiver = Receiver::default();
        let url = serve(receiver.clone()).await;
        let store = Arc::new(MemoryStore::new());
        let (project_id, bot, subscription_id, secret) = fixture(&store, &url).await;

        WebhookEmitter::new(store.clone())
            .emit(project_id, Some(&bot), TriggerType::BotStateChange, serde_json::json!({}))
            .await
            .unwrap();

        let worker = DeliveryWorker::new(store.clone(), WebhooksConfig::default()).unwrap();
        assert_eq!(worker.run_once(Utc::now()).await.unwrap(), 1);

        let hits = receiver.hits.lock();
        assert_eq!(hits.len(), 1);
        let (signature, body) = &hits[0];
        assert!(verify_signature(&secret, body, signature));

        let attempts = store
            .delivery_attempts_for_subscription(subscription_id)
            .await
            .unwrap();
        assert_eq!(attempts[0].status, DeliveryStatus::Success);
        assert_eq!(attempts[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn failures_retry_on_schedule_until_success() {
        let receiver = Receiver {
            fail_first: Arc::new(Mutex::new(2)),
            ..Default::default()
        };
        let url = serve(receiver.clone()).await;
        let store = Arc::new(MemoryStore::new());
        let (project_id, bot, subscription_id, _) = fixture(&store, &url).await;

        WebhookEmitter::new(store.clone())
            .emit(project_id, Some(&bot), TriggerType::BotStateChange, serde_json::json!({}))
            .await
            .unwrap();

        let worker = DeliveryWorker::new(store.clone(), WebhooksConfig::default()).unwrap();
        let enqueue = Utc::now();

        // Attempt 1: 500.
        assert_eq!(worker.run_once(enqueue).await.unwrap(), 1);
        // Not due again immediately.
        assert_eq!(worker.run_once(enqueue).await.unwrap(), 0);
        // Attempt 2 at +30 s: 500.
        assert_eq!(
            worker
                .run_once(enqueue + chrono::Duration::seconds(31))
                .await
                .unwrap(),
            1
        );
        // Attempt 3 at +120 s: 200.
        assert_eq!(
            worker
                .run_once(enqueue + chrono::Duration::seconds(121))
                .await
                .unwrap(),
            1
        );

        let attempt = store
            .delivery_attempts_for_subscription(subscription_id)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(attempt.status, DeliveryStatus::Success);
        assert_eq!(attempt.attempt_count, 3);
        assert_eq!(attempt.response_body_list.len(), 3);
        assert!(attempt.response_body_list[0].starts_with("500"));
        assert!(attempt.response_body_list[2].starts_with("200"));
        assert!(attempt.succeeded_at.is_some());
        assert_eq!(hits_count(&receiver), 3);
    }

    fn hits_count(receiver: &Receiver) -> usize {
        receiver.hits.lock().len()
    }

    #[tokio::test]
    async fn five_failures_is_terminal() {
        let receiver = Receiver {
            fail_first: Arc::new(Mutex::new(99)),
            ..Default::default()
        };
        let url = serve(receiver.clone()).await;
        let store = Arc::new(MemoryStore::new());
        let (project_id, bot, subscription_id, _) = fixture(&store, &url).await;

        WebhookEmitter::new(store.clone())
            .emit(project_id, Some(&bot), TriggerType::BotStateChange, serde_json::json!({}))
            .await
            .unwrap();

        let worker = DeliveryWorker::new(store.clone(), WebhooksConfig::default()).unwrap();
        let enqueue = Utc::now();
        for offset in [0i64, 31, 121, 601, 3601] {
            assert_eq!(
                worker
                    .run_once(enqueue + chrono::Duration::seconds(offset))
                    .await
                    .unwrap(),
                1,
                "offset {offset}"
            );
        }
        // Exhausted: nothing further is ever due.
        assert_eq!(
            worker
                .run_once(enqueue + chrono::Duration::days(1))
                .await
                .unwrap(),
            0
        );

        let attempt = store
            .delivery_attempts_for_subscription(subscription_id)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(attempt.status, DeliveryStatus::Failure);
        assert_eq!(attempt.attempt_count, 5);
        assert_eq!(attempt.response_body_list.len(), 5);
    }

    #[tokio::test]
    async fn unreachable_receiver_records_request_error() {
        let store = Arc::new(MemoryStore::new());
        // Port 9 (discard) is never listening.
        let (project_id, bot, subscription_id, _) =
            fixture(&store, "http://127.0.0.1:9/hook").await;

        WebhookEmitter::new(store.clone())
            .emit(project_id, Some(&bot), TriggerType::BotStateChange, serde_json::json!({}))
            .await
            .unwrap();

        let mut config = WebhooksConfig::default();
        config.connect_timeout_secs = 1;
        config.total_timeout_secs = 2;
        let worker = DeliveryWorker::new(store.clone(), config).unwrap();
        worker.run_once(Utc::now()).await.unwrap();

        let attempt = store
            .delivery_attempts_for_subscription(subscription_id)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(attempt.status, DeliveryStatus::Pending);
        assert!(attempt.response_body_list[0].starts_with("request error"));
    }
}
