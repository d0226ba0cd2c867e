//! Zoom RTMS ingest adapter.
//!
//! App sessions add no participant to the meeting; Zoom pushes the
//! meeting's media to us over a websocket. This adapter dials the stream,
//! authenticates with the per-project RTMS token, and translates the wire
//! protocol into ordinary adapter events. `Admitted` is emitted as soon as
//! the stream attaches since there is no admission handshake.
//!
//! Wire protocol: JSON text frames for control/events, binary frames for
//! media (see [`parse_media_frame`]).

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use qm_domain::{Error, Result};

use crate::{
    AdapterControls, AdapterEvent, AudioFrame, BotAdapter, ChatTarget, OpenContext,
    ParticipantInfo, VideoContent, VideoFrame,
};

const PING_INTERVAL: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Control/event messages on the text channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    SessionStarted {},
    ParticipantJoined {
        uuid: String,
        name: String,
        #[serde(default)]
        user_uuid: Option<String>,
        #[serde(default)]
        host: bool,
    },
    ParticipantLeft {
        uuid: String,
        ts_ms: u64,
    },
    Speech {
        uuid: String,
        active: bool,
        ts_ms: u64,
    },
    Screenshare {
        uuid: String,
        active: bool,
        ts_ms: u64,
    },
    Chat {
        uuid: String,
        text: String,
        #[serde(default)]
        to_bot: bool,
        ts_ms: u64,
    },
    SessionEnded {
        ts_ms: u64,
    },
    Error {
        message: String,
    },
}

/// Media frame kinds on the binary channel.
const KIND_AUDIO: u8 = 1;
const KIND_VIDEO: u8 = 2;

/// Parse a binary media frame.
///
/// Layout: `kind u8 | uuid_len u8 | uuid … | ts_ms u64be | payload`.
/// Audio payload: `sample_rate u32be | i16le PCM …`.
/// Video payload: `keyframe u8 | H.264 access unit …`.
pub fn parse_media_frame(data: &[u8]) -> Result<AdapterEvent> {
    let err = |what: &str| Error::Adapter(format!("malformed media frame: {what}"));

    if data.len() < 2 {
        return Err(err("too short"));
    }
    let kind = data[0];
    let uuid_len = data[1] as usize;
    let header_end = 2 + uuid_len + 8;
    if data.len() < header_end {
        return Err(err("truncated header"));
    }
    let uuid = std::str::from_utf8(&data[2..2 + uuid_len])
        .map_err(|_| err("uuid is not utf-8"))?
        .to_owned();
    let ts_ms = u64::from_be_bytes(
        data[2 + uuid_len..header_end]
            .try_into()
            .expect("slice length checked"),
    );
    let payload = &data[header_end..];

    match kind {
        KIND_AUDIO => {
            if payload.len() < 4 {
                return Err(err("audio payload too short"));
            }
            let sample_rate =
                u32::from_be_bytes(payload[..4].try_into().expect("slice length checked"));
            let pcm_bytes = &payload[4..];
            if pcm_bytes.len() % 2 != 0 {
                return Err(err("odd PCM byte count"));
            }
            let pcm = pcm_bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            Ok(AdapterEvent::Audio(AudioFrame {
                participant_uuid: uuid,
                pcm,
                sample_rate,
                ts_ms,
            }))
        }
        KIND_VIDEO => {
            if payload.is_empty() {
                return Err(err("empty video payload"));
            }
            Ok(AdapterEvent::Video(VideoFrame {
                participant_uuid: uuid,
                content: VideoContent::H264 {
                    data: payload[1..].to_vec(),
                    keyframe: payload[0] != 0,
                },
                ts_ms,
            }))
        }
        other => Err(err(&format!("unknown kind {other}"))),
    }
}

fn translate(message: WireMessage) -> Option<AdapterEvent> {
    Some(match message {
        WireMessage::SessionStarted {} => AdapterEvent::Admitted,
        WireMessage::ParticipantJoined {
            uuid,
            name,
            user_uuid,
            host,
        } => AdapterEvent::ParticipantJoined(ParticipantInfo {
            uuid,
            full_name: name,
            user_uuid,
            is_host: host,
        }),
        WireMessage::ParticipantLeft { uuid, ts_ms } => {
            AdapterEvent::ParticipantLeft { uuid, ts_ms }
        }
        WireMessage::Speech { uuid, active: true, ts_ms } => {
            AdapterEvent::SpeechStart { uuid, ts_ms }
        }
        WireMessage::Speech { uuid, active: false, ts_ms } => {
            AdapterEvent::SpeechStop { uuid, ts_ms }
        }
        WireMessage::Screenshare { uuid, active: true, ts_ms } => {
            AdapterEvent::ScreenshareStart { uuid, ts_ms }
        }
        WireMessage::Screenshare { uuid, active: false, ts_ms } => {
            AdapterEvent::ScreenshareStop { uuid, ts_ms }
        }
        WireMessage::Chat { uuid, text, to_bot, ts_ms } => AdapterEvent::Chat {
            participant_uuid: uuid,
            text,
            to: if to_bot { ChatTarget::OnlyBot } else { ChatTarget::Everyone },
            ts_ms,
        },
        WireMessage::SessionEnded { ts_ms } => AdapterEvent::MeetingEnded { ts_ms },
        WireMessage::Error { message } => AdapterEvent::FatalError { message },
    })
}

/// `rtms://host/stream` → `wss://host/stream`.
fn ws_url(meeting_url: &str) -> Result<String> {
    meeting_url
        .strip_prefix("rtms://")
        .map(|rest| format!("wss://{rest}"))
        .ok_or_else(|| Error::Adapter(format!("not an rtms url: {meeting_url}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct RtmsAdapter;

impl RtmsAdapter {
    pub fn new() -> Self {
        Self
    }
}

struct RtmsControls {
    close: CancellationToken,
}

#[async_trait::async_trait]
impl AdapterControls for RtmsControls {
    // Recording happens on our side of the stream; there is no meeting
    // surface to drive.
    async fn start_recording(&self) -> Result<()> {
        Ok(())
    }

    async fn pause_recording(&self) -> Result<()> {
        Ok(())
    }

    async fn resume_recording(&self) -> Result<()> {
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.close.cancel();
        Ok(())
    }
}

#[async_trait::async_trait]
impl BotAdapter for RtmsAdapter {
    async fn open(
        &self,
        ctx: OpenContext,
    ) -> Result<(mpsc::Receiver<AdapterEvent>, Box<dyn AdapterControls>)> {
        let url = ws_url(&ctx.meeting_url)?;
        let token = ctx.credentials["rtms_token"].as_str().unwrap_or_default();
        let dial = if token.is_empty() {
            url.clone()
        } else {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}token={token}")
        };

        tracing::info!(url = %url, "connecting to RTMS stream");
        let (ws, _response) = tokio_tungstenite::connect_async(dial.as_str())
            .await
            .map_err(|e| Error::Adapter(format!("RTMS connect: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let (tx, rx) = mpsc::channel(256);
        let close = CancellationToken::new();
        let controls = RtmsControls { close: close.clone() };
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.tick().await; // immediate first tick is not a ping
            loop {
                tokio::select! {
                    _ = close.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        // Zoom tears the stream down on close; that is our
                        // terminal event.
                        let _ = tx.send(AdapterEvent::MeetingEnded { ts_ms: 0 }).await;
                        break;
                    }
                    _ = cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            let _ = tx
                                .send(AdapterEvent::FatalError {
                                    message: "RTMS stream write failed".into(),
                                })
                                .await;
                            break;
                        }
                    }
                    frame = stream.next() => {
                        let Some(frame) = frame else {
                            let _ = tx
                                .send(AdapterEvent::FatalError {
                                    message: "RTMS stream closed unexpectedly".into(),
                                })
                                .await;
                            break;
                        };
                        let message = match frame {
                            Ok(m) => m,
                            Err(e) => {
                                let _ = tx
                                    .send(AdapterEvent::FatalError {
                                        message: format!("RTMS stream error: {e}"),
                                    })
                                    .await;
                                break;
                            }
                        };
                        match message {
                            Message::Text(text) => {
                                match serde_json::from_str::<WireMessage>(&text) {
                                    Ok(wire) => {
                                        if let Some(event) = translate(wire) {
                                            let terminal = event.is_terminal();
                                            if tx.send(event).await.is_err() || terminal {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        tracing::debug!(error = %e, "ignoring unparseable RTMS message");
                                    }
                                }
                            }
                            Message::Binary(data) => match parse_media_frame(&data) {
                                Ok(event) => {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "dropping malformed media frame");
                                }
                            },
                            Message::Close(_) => {
                                let _ = tx.send(AdapterEvent::MeetingEnded { ts_ms: 0 }).await;
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok((rx, Box::new(controls)))
    }

    fn kind(&self) -> &'static str {
        "rtms"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: u8, uuid: &str, ts_ms: u64, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![kind, uuid.len() as u8];
        data.extend_from_slice(uuid.as_bytes());
        data.extend_from_slice(&ts_ms.to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn parses_audio_frame() {
        let mut payload = 16_000u32.to_be_bytes().to_vec();
        for sample in [100i16, -200, 300] {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        let event = parse_media_frame(&frame(KIND_AUDIO, "p1", 1234, &payload)).unwrap();
        let AdapterEvent::Audio(audio) = event else {
            panic!("expected audio");
        };
        assert_eq!(audio.participant_uuid, "p1");
        assert_eq!(audio.ts_ms, 1234);
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.pcm, vec![100, -200, 300]);
    }

    #[test]
    fn parses_video_keyframe() {
        let payload = [1u8, 0x00, 0x00, 0x01, 0x65];
        let event = parse_media_frame(&frame(KIND_VIDEO, "p2", 99, &payload)).unwrap();
        let AdapterEvent::Video(video) = event else {
            panic!("expected video");
        };
        assert_eq!(video.ts_ms, 99);
        let VideoContent::H264 { data, keyframe } = video.content else {
            panic!("expected h264");
        };
        assert!(keyframe);
        assert_eq!(data, vec![0x00, 0x00, 0x01, 0x65]);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(parse_media_frame(&[]).is_err());
        assert!(parse_media_frame(&[KIND_AUDIO]).is_err());
        // uuid_len points past the end.
        assert!(parse_media_frame(&[KIND_AUDIO, 200, b'a']).is_err());
        // Odd PCM byte count.
        let mut payload = 48_000u32.to_be_bytes().to_vec();
        payload.push(0xFF);
        assert!(parse_media_frame(&frame(KIND_AUDIO, "p", 0, &payload)).is_err());
        // Unknown kind.
        assert!(parse_media_frame(&frame(9, "p", 0, &[])).is_err());
    }

    #[test]
    fn session_events_translate() {
        let started: WireMessage = serde_json::from_str(r#"{"type":"session_started"}"#).unwrap();
        assert!(matches!(translate(started), Some(AdapterEvent::Admitted)));

        let chat: WireMessage = serde_json::from_str(
            r#"{"type":"chat","uuid":"u1","text":"hi","to_bot":true,"ts_ms":5}"#,
        )
        .unwrap();
        let Some(AdapterEvent::Chat { to, .. }) = translate(chat) else {
            panic!("expected chat");
        };
        assert_eq!(to, ChatTarget::OnlyBot);

        let ended: WireMessage =
            serde_json::from_str(r#"{"type":"session_ended","ts_ms":60000}"#).unwrap();
        assert!(matches!(
            translate(ended),
            Some(AdapterEvent::MeetingEnded { ts_ms: 60000 })
        ));
    }

    #[test]
    fn ws_url_rewrites_scheme() {
        assert_eq!(
            ws_url("rtms://stream.zoom.us/abc").unwrap(),
            "wss://stream.zoom.us/abc"
        );
        assert!(ws_url("https://zoom.us/j/1").is_err());
    }
}
