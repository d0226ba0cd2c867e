//! Deepgram live-streaming client.
//!
//! One websocket per session: binary PCM out, JSON results in, a
//! `KeepAlive` text frame on an interval, `CloseStream` to end. The
//! socket is split into a writer task (fed by a command channel) and a
//! reader task that parses results into [`TranscriptEvent`]s.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use qm_domain::config::DeepgramConfig;
use qm_domain::{Error, Result};

use crate::{Session, SessionSink, TranscriptEvent, TranscriptWord};

pub struct DeepgramProvider {
    config: DeepgramConfig,
    api_key: String,
}

impl DeepgramProvider {
    /// Key precedence: explicit (per-project credential) over the
    /// configured environment variable.
    pub fn new(config: DeepgramConfig, api_key: Option<String>) -> Result<Self> {
        let api_key = match api_key {
            Some(key) if !key.is_empty() => key,
            _ => std::env::var(&config.api_key_env).map_err(|_| {
                Error::Credential(format!(
                    "no Deepgram API key: set {} or a project credential",
                    config.api_key_env
                ))
            })?,
        };
        Ok(Self { config, api_key })
    }

    fn session_url(&self, language: &str, sample_rate: u32) -> String {
        format!(
            "{}?model=nova-2&language={language}&encoding=linear16&sample_rate={sample_rate}&channels=1&punctuate=true&interim_results=true&smart_format=true",
            self.config.ws_url
        )
    }
}

enum WriterCmd {
    Audio(Vec<u8>),
    KeepAlive,
    Close,
}

struct DeepgramSink {
    writer_tx: mpsc::Sender<WriterCmd>,
}

#[async_trait::async_trait]
impl SessionSink for DeepgramSink {
    async fn send(&mut self, pcm: Vec<i16>) -> Result<()> {
        let mut bytes = Vec::with_capacity(pcm.len() * 2);
        for sample in pcm {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.writer_tx
            .send(WriterCmd::Audio(bytes))
            .await
            .map_err(|_| Error::Transcription {
                provider: "deepgram".into(),
                message: "session writer is gone".into(),
            })
    }

    async fn close(&mut self) -> Result<()> {
        self.writer_tx
            .send(WriterCmd::Close)
            .await
            .map_err(|_| Error::Transcription {
                provider: "deepgram".into(),
                message: "session writer is gone".into(),
            })
    }
}

#[async_trait::async_trait]
impl crate::TranscriptionProvider for DeepgramProvider {
    async fn open(&self, language: &str, sample_rate: u32) -> Result<Session> {
        let url = self.session_url(language, sample_rate);
        let mut request = url.clone().into_client_request().map_err(|e| {
            Error::Transcription {
                provider: "deepgram".into(),
                message: format!("bad session url: {e}"),
            }
        })?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key).parse().map_err(|_| {
                Error::Credential("Deepgram API key contains invalid header bytes".into())
            })?,
        );

        let (ws, _response) =
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| Error::Transcription {
                    provider: "deepgram".into(),
                    message: format!("connect: {e}"),
                })?;
        tracing::debug!(url = %self.config.ws_url, language, sample_rate, "deepgram session open");
        let (mut sink, mut stream) = ws.split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCmd>(64);
        let (events_tx, events_rx) = mpsc::channel::<TranscriptEvent>(64);

        // Writer: serializes audio, keepalives and the close handshake.
        tokio::spawn(async move {
            while let Some(cmd) = writer_rx.recv().await {
                let result = match cmd {
                    WriterCmd::Audio(bytes) => sink.send(Message::Binary(bytes)).await,
                    WriterCmd::KeepAlive => {
                        sink.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await
                    }
                    WriterCmd::Close => {
                        let _ = sink
                            .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                            .await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        // Keepalive ticker.
        let keepalive_tx = writer_tx.clone();
        let keepalive = Duration::from_secs(self.config.keepalive_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(keepalive);
            interval.tick().await;
            loop {
                interval.tick().await;
                if keepalive_tx.send(WriterCmd::KeepAlive).await.is_err() {
                    break;
                }
            }
        });

        // Reader: parse results until the socket ends.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        for event in parse_results(&text) {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events_tx
                            .send(TranscriptEvent::Error {
                                message: format!("stream error: {e}"),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = events_tx.send(TranscriptEvent::Closed).await;
        });

        Ok(Session {
            sink: Box::new(DeepgramSink { writer_tx }),
            events: events_rx,
        })
    }

    fn provider_id(&self) -> &'static str {
        "deepgram"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct DgResult {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    duration: f64,
    channel: Option<DgChannel>,
}

#[derive(Debug, Deserialize)]
struct DgChannel {
    alternatives: Vec<DgAlternative>,
}

#[derive(Debug, Deserialize)]
struct DgAlternative {
    transcript: String,
    #[serde(default)]
    words: Vec<DgWord>,
}

#[derive(Debug, Deserialize)]
struct DgWord {
    word: String,
    start: f64,
    end: f64,
    #[serde(default)]
    confidence: f64,
}

/// Parse one Deepgram text frame into events. Non-result frames
/// (metadata, speech-started, …) produce nothing.
fn parse_results(text: &str) -> Vec<TranscriptEvent> {
    let Ok(result) = serde_json::from_str::<DgResult>(text) else {
        return Vec::new();
    };
    if result.kind != "Results" {
        return Vec::new();
    }
    let Some(alternative) = result
        .channel
        .as_ref()
        .and_then(|c| c.alternatives.first())
    else {
        return Vec::new();
    };
    if alternative.transcript.is_empty() {
        return Vec::new();
    }

    let words = alternative
        .words
        .iter()
        .map(|w| TranscriptWord {
            word: w.word.clone(),
            start_ms: (w.start * 1000.0) as u64,
            end_ms: (w.end * 1000.0) as u64,
            confidence: w.confidence,
        })
        .collect();
    let start_ms = (result.start * 1000.0) as u64;
    let duration_ms = (result.duration * 1000.0) as u64;
    let text = alternative.transcript.clone();

    vec![if result.is_final {
        TranscriptEvent::Final {
            text,
            start_ms,
            duration_ms,
            words,
        }
    } else {
        TranscriptEvent::Partial {
            text,
            start_ms,
            duration_ms,
            words,
        }
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULT: &str = r#"{
        "type": "Results",
        "is_final": true,
        "start": 1.5,
        "duration": 2.0,
        "channel": {
            "alternatives": [{
                "transcript": "hello world",
                "words": [
                    {"word": "hello", "start": 1.5, "end": 2.1, "confidence": 0.98},
                    {"word": "world", "start": 2.2, "end": 2.9, "confidence": 0.95}
                ]
            }]
        }
    }"#;

    #[test]
    fn parses_final_result_with_word_timing() {
        let events = parse_results(RESULT);
        assert_eq!(events.len(), 1);
        let TranscriptEvent::Final {
            text,
            start_ms,
            duration_ms,
            words,
        } = &events[0]
        else {
            panic!("expected final");
        };
        assert_eq!(text, "hello world");
        assert_eq!(*start_ms, 1500);
        assert_eq!(*duration_ms, 2000);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].start_ms, 1500);
        assert_eq!(words[1].end_ms, 2900);
    }

    #[test]
    fn interim_results_become_partials() {
        let interim = RESULT.replace("\"is_final\": true", "\"is_final\": false");
        let events = parse_results(&interim);
        assert!(matches!(events[0], TranscriptEvent::Partial { .. }));
    }

    #[test]
    fn metadata_and_empty_transcripts_are_skipped() {
        assert!(parse_results(r#"{"type":"Metadata","request_id":"x"}"#).is_empty());
        let empty = RESULT.replace("hello world", "");
        assert!(parse_results(&empty).is_empty());
        assert!(parse_results("not json").is_empty());
    }

    #[test]
    fn session_url_carries_audio_parameters() {
        let provider = DeepgramProvider {
            config: DeepgramConfig::default(),
            api_key: "k".into(),
        };
        let url = provider.session_url("en", 48_000);
        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("sample_rate=48000"));
        assert!(url.contains("language=en"));
        assert!(url.contains("interim_results=true"));
    }
}
