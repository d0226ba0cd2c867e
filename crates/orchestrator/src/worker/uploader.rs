//! Artifact upload at post-processing time.

use chrono::Utc;

use qm_blobstore::ObjectStore;
use qm_domain::settings::RecordingFormat;
use qm_domain::Result;
use qm_pipeline::PipelineOutput;
use qm_store::{
    Bot, NewRecording, Recording, RecordingPatch, RecordingState, Store,
};

use crate::state::AppState;

/// Content type for a recording format.
fn content_type(format: RecordingFormat) -> &'static str {
    match format {
        RecordingFormat::Mp4 => "video/mp4",
        RecordingFormat::Webm => "video/webm",
        RecordingFormat::Wav | RecordingFormat::Mp3 => "audio/wav",
        RecordingFormat::None => "application/octet-stream",
    }
}

/// Upload the pipeline's outputs and settle the recording rows.
///
/// The default recording reaches `complete` only when at least one frame
/// was captured and the upload succeeded; anything else is `failed` (or
/// left `not_started` when recording never began).
pub async fn finalize_recording(
    state: &AppState,
    bot: &Bot,
    recording: &Recording,
    output: PipelineOutput,
    recording_started: bool,
) -> Result<Recording> {
    if !recording_started {
        return state
            .store
            .update_recording(
                recording.id,
                RecordingPatch {
                    state: Some(RecordingState::NotStarted),
                    ..Default::default()
                },
            )
            .await;
    }

    let Some(stats) = output.primary else {
        // NO_RECORDING bots have nothing to upload; the row records the
        // meeting span only.
        return state
            .store
            .update_recording(
                recording.id,
                RecordingPatch {
                    state: Some(RecordingState::Complete),
                    duration_ms: Some(output.duration_ms),
                    completed_at: Some(Utc::now()),
                    frames_dropped: Some(output.frames_dropped),
                    ..Default::default()
                },
            )
            .await;
    };

    if stats.duration_ms == 0 || stats.bytes == 0 {
        return fail(state, recording, "no frames captured", output.frames_dropped).await;
    }

    let key = qm_blobstore::keys::recording_key(
        &bot.object_id,
        &bot.metadata,
        recording.format.extension(),
    );
    let data = tokio::fs::read(&stats.path).await?;
    let bytes = data.len() as u64;
    match state
        .blobs
        .put(&key, data, content_type(recording.format))
        .await
    {
        Ok(_) => {
            let _ = tokio::fs::remove_file(&stats.path).await;
        }
        Err(e) => {
            tracing::error!(error = %e, key, "recording upload failed");
            return fail(state, recording, &format!("upload failed: {e}"), output.frames_dropped)
                .await;
        }
    }

    // Per-participant variants are best-effort; a failure marks the
    // default row's failure_data but does not fail the recording.
    let mut variant_failures = Vec::new();
    for (participant_uuid, variant) in &output.participants {
        let variant_key = qm_blobstore::keys::participant_recording_key(
            &bot.object_id,
            participant_uuid,
            "wav",
        );
        let data = match tokio::fs::read(&variant.path).await {
            Ok(data) => data,
            Err(e) => {
                variant_failures.push(format!("{participant_uuid}: read: {e}"));
                continue;
            }
        };
        let variant_bytes = data.len() as u64;
        match state.blobs.put(&variant_key, data, "audio/wav").await {
            Ok(_) => {
                let _ = tokio::fs::remove_file(&variant.path).await;
                let row = state
                    .store
                    .create_recording(NewRecording {
                        bot_id: bot.id,
                        recording_type: qm_domain::settings::RecordingType::AudioOnly,
                        format: RecordingFormat::Wav,
                        is_default: false,
                        participant_uuid: Some(participant_uuid.clone()),
                    })
                    .await?;
                state
                    .store
                    .update_recording(
                        row.id,
                        RecordingPatch {
                            state: Some(RecordingState::Complete),
                            storage_key: Some(variant_key),
                            bytes: Some(variant_bytes),
                            duration_ms: Some(variant.duration_ms),
                            completed_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Err(e) => variant_failures.push(format!("{participant_uuid}: {e}")),
        }
    }

    let failure_data = (!variant_failures.is_empty())
        .then(|| serde_json::json!({ "variant_uploads": variant_failures }));

    state
        .store
        .update_recording(
            recording.id,
            RecordingPatch {
                state: Some(RecordingState::Complete),
                storage_key: Some(key),
                bytes: Some(bytes),
                duration_ms: Some(stats.duration_ms),
                frames_dropped: Some(output.frames_dropped),
                failure_data,
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
}

async fn fail(
    state: &AppState,
    recording: &Recording,
    reason: &str,
    frames_dropped: u64,
) -> Result<Recording> {
    state
        .store
        .update_recording(
            recording.id,
            RecordingPatch {
                state: Some(RecordingState::Failed),
                frames_dropped: Some(frames_dropped),
                failure_data: Some(serde_json::json!({ "error": reason })),
                ..Default::default()
            },
        )
        .await
}

/// Upload a diagnostic screenshot under `debug/…`; failures only log.
pub async fn upload_debug_screenshot(
    state: &AppState,
    bot: &Bot,
    event_id: uuid::Uuid,
    png: Vec<u8>,
) {
    let key = qm_blobstore::keys::debug_key(&bot.object_id, &event_id.to_string(), "png");
    match state.blobs.put(&key, png, "image/png").await {
        Ok(_) => {
            if let Err(e) = state
                .store
                .record_debug_artifact(bot.id, event_id, &key, "image/png")
                .await
            {
                tracing::warn!(error = %e, "failed to record debug artifact");
            }
        }
        Err(e) => tracing::warn!(error = %e, key, "debug screenshot upload failed"),
    }
}
