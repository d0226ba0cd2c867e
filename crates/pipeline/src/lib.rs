//! The per-bot media pipeline.
//!
//! Wiring: adapter frames land in per-participant rings (audio) and the
//! compositor (video); a 10 ms tick mixes one slot, appends it to the
//! output container, and every `VIDEO_EVERY_SLOTS` ticks composites and
//! encodes one video frame. Pause keeps the timeline contiguous by
//! writing silence and freezing the frame. Video waiting on the encoder
//! is dropped oldest-first once it spans the backpressure window; audio
//! is never dropped.

pub mod clock;
pub mod compositor;
pub mod mixer;
pub mod muxer;
pub mod resample;
pub mod ring;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use image::RgbImage;

use qm_adapter::{AudioFrame, VideoContent, VideoFrame};
use qm_domain::config::MediaConfig;
use qm_domain::settings::{BotSettings, RecordingFormat, RecordingType};
use qm_domain::{Error, Result};

use clock::{MeetingClock, SLOT_MS};
use compositor::{Compositor, SpeakerTracker};
use mixer::{Mixer, ParticipantSlot};
use muxer::{MuxStats, Muxer, VideoPayload, WavMuxer};

/// Composite/encode cadence: one video frame per 10 slots (10 fps).
const VIDEO_EVERY_SLOTS: u64 = 10;
/// Encoder budget per tick; the queue beyond this waits (or gets dropped
/// by backpressure).
const VIDEO_WRITES_PER_TICK: usize = 2;

/// Everything the uploader needs once the pipeline is done.
#[derive(Debug)]
pub struct PipelineOutput {
    /// The mixed default recording, when a container was configured.
    pub primary: Option<MuxStats>,
    /// Per-participant audio variants, when enabled.
    pub participants: Vec<(String, MuxStats)>,
    pub frames_dropped: u64,
    /// Audio slots lost to ring overwrites (ingest far ahead of ticks).
    pub audio_overwritten: u64,
    pub duration_ms: u64,
}

pub struct Pipeline {
    media: MediaConfig,
    recording_type: RecordingType,
    format: RecordingFormat,
    per_participant_audio: bool,
    scratch_dir: PathBuf,
    file_stem: String,

    clock: MeetingClock,
    mixer: Mixer,
    compositor: Compositor,
    tracker: SpeakerTracker,
    muxer: Option<Box<dyn Muxer>>,
    participant_wavs: HashMap<String, WavMuxer>,

    next_slot: u64,
    recording: bool,
    paused: bool,
    /// Encoded video waiting for its turn at the muxer: `(ts_ms, payload)`.
    video_queue: VecDeque<(u64, VideoPayload)>,
    frames_dropped: u64,
}

impl Pipeline {
    /// Build the pipeline for one bot. Files go under `scratch_dir` named
    /// by `file_stem`.
    pub fn new(
        settings: &BotSettings,
        media: &MediaConfig,
        scratch_dir: &Path,
        file_stem: &str,
    ) -> Result<Self> {
        std::fs::create_dir_all(scratch_dir)?;
        let format = settings.format;
        let path = scratch_dir.join(format!("{file_stem}.{}", format.extension()));
        let muxer = match settings.recording_type {
            RecordingType::NoRecording => None,
            _ => muxer::for_format(format, &path, media.width as u16, media.height as u16)?,
        };

        Ok(Self {
            media: media.clone(),
            recording_type: settings.recording_type,
            format,
            per_participant_audio: settings.per_participant_audio,
            scratch_dir: scratch_dir.to_path_buf(),
            file_stem: file_stem.to_owned(),
            clock: MeetingClock::new(),
            mixer: Mixer::new(media.ring_secs),
            compositor: Compositor::new(settings.view, media.width, media.height),
            tracker: SpeakerTracker::new(media.speaker_window_ms, media.speaker_hysteresis_ms),
            muxer,
            participant_wavs: HashMap::new(),
            next_slot: 0,
            recording: false,
            paused: false,
            video_queue: VecDeque::new(),
            frames_dropped: 0,
        })
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn start_recording(&mut self) {
        self.recording = true;
    }

    /// Pause: the output keeps its timeline with silence and a frozen
    /// frame; nothing is cut.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn participant_joined(&mut self, uuid: &str, name: &str) {
        self.compositor.add_participant(uuid, name);
    }

    pub fn participant_left(&mut self, uuid: &str) {
        self.compositor.remove_participant(uuid);
        self.tracker.forget(uuid);
        self.mixer.remove_participant(uuid);
    }

    /// Ingest one participant audio frame.
    pub fn ingest_audio(&mut self, frame: &AudioFrame) {
        let slot = self.clock.slot(frame.ts_ms);
        self.mixer
            .ingest(&frame.participant_uuid, &frame.pcm, frame.sample_rate, slot);
    }

    /// Ingest one participant video frame.
    pub fn ingest_video(&mut self, frame: &VideoFrame) {
        if self.recording_type != RecordingType::AudioAndVideo {
            return;
        }
        let relative_ms = self.clock.relative_ms(frame.ts_ms);
        match &frame.content {
            VideoContent::Rgb { width, height, data } => {
                self.compositor
                    .ingest_frame(&frame.participant_uuid, *width, *height, data);
            }
            VideoContent::H264 { data, keyframe } => {
                // Encoded platforms bypass the compositor; frames go to the
                // muxer as-is.
                self.queue_video(
                    relative_ms,
                    VideoPayload::H264 {
                        data: data.clone(),
                        keyframe: *keyframe,
                    },
                );
            }
        }
    }

    /// Advance one 10 ms slot. Call at slot cadence while the bot is in
    /// the meeting.
    pub fn tick(&mut self) -> Result<()> {
        let slot = self.next_slot;
        self.next_slot += 1;

        let (mixed, per_participant) = self.mixer.tick(slot);
        self.tracker.observe(slot, &per_participant);

        if !self.recording {
            return Ok(());
        }

        // Audio first; it is never dropped.
        if let Some(muxer) = &mut self.muxer {
            if self.paused {
                muxer.write_audio(&vec![0i16; clock::SAMPLES_PER_SLOT])?;
            } else {
                muxer.write_audio(&mixed.samples)?;
            }
        }

        if !self.paused {
            self.write_participant_slots(&per_participant)?;
        }

        // Composite at video cadence (browser platforms; H.264 platforms
        // feed the queue directly from ingest).
        if self.recording_type == RecordingType::AudioAndVideo
            && slot % VIDEO_EVERY_SLOTS == 0
        {
            if self.paused {
                // Freeze: re-encode the last rendered frame so the
                // timeline stays continuous.
                if let Some(frozen) = self.compositor.last_render().cloned() {
                    let ts_ms = slot * SLOT_MS;
                    let payload = encode_jpeg(&frozen)?;
                    self.queue_video(ts_ms, payload);
                }
            } else {
                let active = self.tracker.active().map(str::to_owned);
                let rendered = self.compositor.render(active.as_deref());
                let ts_ms = slot * SLOT_MS;
                let payload = encode_jpeg(&rendered)?;
                self.queue_video(ts_ms, payload);
            }
        }

        self.drain_video_queue()?;
        Ok(())
    }

    fn write_participant_slots(&mut self, slots: &[ParticipantSlot]) -> Result<()> {
        if !self.per_participant_audio {
            return Ok(());
        }
        for p in slots {
            if !self.participant_wavs.contains_key(&p.participant_uuid) {
                let path = self
                    .scratch_dir
                    .join(format!("{}-{}.wav", self.file_stem, p.participant_uuid));
                self.participant_wavs
                    .insert(p.participant_uuid.clone(), WavMuxer::create(&path)?);
            }
            let wav = self
                .participant_wavs
                .get_mut(&p.participant_uuid)
                .expect("inserted above");
            let mut padded = p.samples.clone();
            padded.resize(clock::SAMPLES_PER_SLOT, 0);
            wav.write_audio(&padded)?;
        }
        Ok(())
    }

    fn queue_video(&mut self, ts_ms: u64, payload: VideoPayload) {
        if !self.recording || self.format == RecordingFormat::None {
            return;
        }
        self.video_queue.push_back((ts_ms, payload));
        // Backpressure: drop oldest video once the queue spans more than
        // the configured lag. Audio never takes this path.
        while let (Some((oldest, _)), Some((newest, _))) =
            (self.video_queue.front(), self.video_queue.back())
        {
            if newest - oldest > self.media.backpressure_lag_ms {
                self.video_queue.pop_front();
                self.frames_dropped += 1;
            } else {
                break;
            }
        }
    }

    fn drain_video_queue(&mut self) -> Result<()> {
        let Some(muxer) = &mut self.muxer else {
            self.video_queue.clear();
            return Ok(());
        };
        for _ in 0..VIDEO_WRITES_PER_TICK {
            let Some((ts_ms, payload)) = self.video_queue.pop_front() else {
                break;
            };
            muxer.write_video(ts_ms, &payload)?;
        }
        Ok(())
    }

    /// Frames dropped so far under backpressure.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// PNG of the last composited frame, for debug artifacts around
    /// adapter failures. `None` before the first render.
    pub fn snapshot_png(&self) -> Option<Vec<u8>> {
        let frame = self.compositor.last_render()?;
        let mut data = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut data);
        frame.write_with_encoder(encoder).ok()?;
        Some(data)
    }

    /// Drain remaining video, finalize every container, fsync.
    pub fn finalize(mut self) -> Result<PipelineOutput> {
        // The final drain is not budget-limited.
        if let Some(muxer) = &mut self.muxer {
            while let Some((ts_ms, payload)) = self.video_queue.pop_front() {
                muxer.write_video(ts_ms, &payload)?;
            }
        }

        let audio_overwritten = self.mixer.overwritten();
        let duration_ms = self.next_slot * SLOT_MS;

        let primary = match self.muxer {
            Some(muxer) => Some(muxer.finalize()?),
            None => None,
        };

        let mut participants = Vec::new();
        for (uuid, wav) in self.participant_wavs {
            participants.push((uuid, Box::new(wav).finalize()?));
        }
        participants.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(PipelineOutput {
            primary,
            participants,
            frames_dropped: self.frames_dropped,
            audio_overwritten,
            duration_ms,
        })
    }
}

fn encode_jpeg(frame: &RgbImage) -> Result<VideoPayload> {
    let mut data = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut data, 80);
    frame
        .write_with_encoder(encoder)
        .map_err(|e| Error::Pipeline(format!("jpeg encode: {e}")))?;
    Ok(VideoPayload::Jpeg { data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::SAMPLES_PER_SLOT;

    fn settings(recording_type: RecordingType, format: RecordingFormat) -> BotSettings {
        BotSettings {
            recording_type,
            format,
            per_participant_audio: false,
            ..Default::default()
        }
    }

    fn audio(uuid: &str, ts_ms: u64, value: i16) -> AudioFrame {
        AudioFrame {
            participant_uuid: uuid.into(),
            pcm: vec![value; SAMPLES_PER_SLOT],
            sample_rate: clock::HOUSE_RATE,
            ts_ms,
        }
    }

    #[test]
    fn audio_only_wav_records_mixed_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new(
            &settings(RecordingType::AudioOnly, RecordingFormat::Wav),
            &MediaConfig::default(),
            dir.path(),
            "bot_test",
        )
        .unwrap();
        pipeline.start_recording();

        for slot in 0..100u64 {
            pipeline.ingest_audio(&audio("a", slot * 10, 1000));
            pipeline.tick().unwrap();
        }
        let output = pipeline.finalize().unwrap();
        let primary = output.primary.unwrap();
        assert_eq!(primary.duration_ms, 1000);
        assert_eq!(output.duration_ms, 1000);
        assert_eq!(output.frames_dropped, 0);

        let mut reader = hound::WavReader::open(&primary.path).unwrap();
        let first: i16 = reader.samples::<i16>().next().unwrap().unwrap();
        assert_eq!(first, 1000);
    }

    #[test]
    fn pause_writes_silence_not_a_cut() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new(
            &settings(RecordingType::AudioOnly, RecordingFormat::Wav),
            &MediaConfig::default(),
            dir.path(),
            "bot_pause",
        )
        .unwrap();
        pipeline.start_recording();

        for slot in 0..10u64 {
            pipeline.ingest_audio(&audio("a", slot * 10, 2000));
            pipeline.tick().unwrap();
        }
        pipeline.pause();
        for slot in 10..20u64 {
            pipeline.ingest_audio(&audio("a", slot * 10, 2000));
            pipeline.tick().unwrap();
        }
        pipeline.resume();
        for slot in 20..30u64 {
            pipeline.ingest_audio(&audio("a", slot * 10, 2000));
            pipeline.tick().unwrap();
        }

        let output = pipeline.finalize().unwrap();
        let primary = output.primary.unwrap();
        // The file spans the pause: 30 slots, no cut.
        assert_eq!(primary.duration_ms, 300);

        let samples: Vec<i16> = hound::WavReader::open(&primary.path)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples.len(), 30 * SAMPLES_PER_SLOT);
        assert_eq!(samples[5 * SAMPLES_PER_SLOT], 2000, "pre-pause audio");
        assert_eq!(samples[15 * SAMPLES_PER_SLOT], 0, "paused audio is silence");
        assert_eq!(samples[25 * SAMPLES_PER_SLOT], 2000, "post-resume audio");
    }

    #[test]
    fn backpressure_drops_oldest_video_never_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new(
            &settings(RecordingType::AudioAndVideo, RecordingFormat::Mp4),
            &MediaConfig::default(),
            dir.path(),
            "bot_bp",
        )
        .unwrap();
        pipeline.start_recording();

        // Flood the queue with H.264 frames spanning far beyond the lag
        // window without ticking.
        for i in 0..100u64 {
            pipeline.ingest_video(&VideoFrame {
                participant_uuid: "a".into(),
                content: VideoContent::H264 {
                    data: vec![0, 0, 0, 1, 0x65, 1, 2, 3],
                    keyframe: true,
                },
                ts_ms: i * 33,
            });
        }
        assert!(pipeline.frames_dropped() > 0);

        for slot in 0..50u64 {
            pipeline.ingest_audio(&audio("a", slot * 10, 500));
            pipeline.tick().unwrap();
        }
        let output = pipeline.finalize().unwrap();
        // All ticked audio made it out regardless of the video flood.
        assert_eq!(output.duration_ms, 500);
        assert!(output.frames_dropped > 0);
    }

    #[test]
    fn no_recording_produces_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = Pipeline::new(
            &settings(RecordingType::NoRecording, RecordingFormat::None),
            &MediaConfig::default(),
            dir.path(),
            "bot_null",
        )
        .unwrap();
        pipeline.start_recording();
        for slot in 0..10u64 {
            pipeline.ingest_audio(&audio("a", slot * 10, 100));
            pipeline.tick().unwrap();
        }
        let output = pipeline.finalize().unwrap();
        assert!(output.primary.is_none());
    }

    #[test]
    fn per_participant_variants_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(RecordingType::AudioOnly, RecordingFormat::Wav);
        settings.per_participant_audio = true;
        let mut pipeline =
            Pipeline::new(&settings, &MediaConfig::default(), dir.path(), "bot_pp").unwrap();
        pipeline.start_recording();

        for slot in 0..20u64 {
            pipeline.ingest_audio(&audio("alice", slot * 10, 700));
            pipeline.ingest_audio(&audio("bob", slot * 10, -700));
            pipeline.tick().unwrap();
        }
        let output = pipeline.finalize().unwrap();
        assert_eq!(output.participants.len(), 2);
        let uuids: Vec<&str> = output
            .participants
            .iter()
            .map(|(u, _)| u.as_str())
            .collect();
        assert_eq!(uuids, vec!["alice", "bob"]);
        for (_, stats) in &output.participants {
            assert_eq!(stats.duration_ms, 200);
        }
    }

    #[test]
    fn video_pipeline_composites_rgb_to_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let mut media = MediaConfig::default();
        media.width = 64;
        media.height = 36;
        let mut pipeline = Pipeline::new(
            &settings(RecordingType::AudioAndVideo, RecordingFormat::Mp4),
            &media,
            dir.path(),
            "bot_av",
        )
        .unwrap();
        pipeline.start_recording();
        pipeline.participant_joined("a", "Alice");

        let rgb = vec![200u8; 8 * 8 * 3];
        for slot in 0..50u64 {
            pipeline.ingest_audio(&audio("a", slot * 10, 300));
            if slot % 10 == 0 {
                pipeline.ingest_video(&VideoFrame {
                    participant_uuid: "a".into(),
                    content: VideoContent::Rgb {
                        width: 8,
                        height: 8,
                        data: rgb.clone(),
                    },
                    ts_ms: slot * 10,
                });
            }
            pipeline.tick().unwrap();
        }
        let output = pipeline.finalize().unwrap();
        let primary = output.primary.unwrap();
        assert!(primary.bytes > 0);

        let data = std::fs::read(&primary.path).unwrap();
        assert!(data.windows(4).any(|w| w == b"jpeg"), "composited track is MJPEG");
    }
}
