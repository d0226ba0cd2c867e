//! Minimal Matroska muxer, used for the `webm` format choice.
//!
//! Streams an unknown-size Segment: EBML header, Info, Tracks, then
//! 1-second Clusters of SimpleBlocks. Because the Tracks element must
//! precede media and the video codec is only known once the first frame
//! arrives, early blocks are buffered briefly; a recording that never
//! produces video within the pre-roll is declared audio-only.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use qm_domain::{Error, Result};

use crate::clock::{HOUSE_RATE, SAMPLES_PER_SLOT, SLOT_MS};
use crate::muxer::{MuxStats, Muxer, VideoPayload};

// Element IDs (with marker bits, written verbatim).
const ID_EBML: u32 = 0x1A45_DFA3;
const ID_DOCTYPE: u32 = 0x4282;
const ID_DOCTYPE_VERSION: u32 = 0x4287;
const ID_DOCTYPE_READ_VERSION: u32 = 0x4285;
const ID_SEGMENT: u32 = 0x1853_8067;
const ID_INFO: u32 = 0x1549_A966;
const ID_TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
const ID_MUXING_APP: u32 = 0x4D80;
const ID_WRITING_APP: u32 = 0x5741;
const ID_TRACKS: u32 = 0x1654_AE6B;
const ID_TRACK_ENTRY: u32 = 0xAE;
const ID_TRACK_NUMBER: u32 = 0xD7;
const ID_TRACK_UID: u32 = 0x73C5;
const ID_TRACK_TYPE: u32 = 0x83;
const ID_CODEC_ID: u32 = 0x86;
const ID_CODEC_PRIVATE: u32 = 0x63A2;
const ID_VIDEO: u32 = 0xE0;
const ID_PIXEL_WIDTH: u32 = 0xB0;
const ID_PIXEL_HEIGHT: u32 = 0xBA;
const ID_AUDIO: u32 = 0xE1;
const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
const ID_CHANNELS: u32 = 0x9F;
const ID_BIT_DEPTH: u32 = 0x6264;
const ID_CLUSTER: u32 = 0x1F43_B675;
const ID_TIMESTAMP: u32 = 0xE7;
const ID_SIMPLE_BLOCK: u32 = 0xA3;

const AUDIO_TRACK: u8 = 1;
const VIDEO_TRACK: u8 = 2;
const CLUSTER_SPAN_MS: u64 = 1000;
/// Blocks buffered before track headers commit (5 s of audio slots).
const PREROLL_SLOTS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MkvVideoCodec {
    H264,
    Jpeg,
}

struct PendingBlock {
    track: u8,
    ts_ms: u64,
    keyframe: bool,
    data: Vec<u8>,
}

pub struct MkvMuxer {
    path: PathBuf,
    file: File,
    width: u16,
    height: u16,
    headers_written: bool,
    video_codec: Option<MkvVideoCodec>,
    codec_private: Option<Vec<u8>>,
    preroll: Vec<PendingBlock>,
    audio_slots: u64,
    cluster_start_ms: Option<u64>,
    cluster: Vec<u8>,
    last_ts_ms: u64,
}

impl MkvMuxer {
    pub fn create(path: &Path) -> Result<Self> {
        Self::with_dimensions(path, 1280, 720)
    }

    pub fn with_dimensions(path: &Path, width: u16, height: u16) -> Result<Self> {
        let mut file = File::create(path)?;

        let header = element(
            ID_EBML,
            &[
                string_element(ID_DOCTYPE, "matroska"),
                uint_element(ID_DOCTYPE_VERSION, 4),
                uint_element(ID_DOCTYPE_READ_VERSION, 2),
            ]
            .concat(),
        );
        file.write_all(&header)?;

        // Unknown-size segment: everything after this streams.
        file.write_all(&encode_id(ID_SEGMENT))?;
        file.write_all(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF])?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            width,
            height,
            headers_written: false,
            video_codec: None,
            codec_private: None,
            preroll: Vec::new(),
            audio_slots: 0,
            cluster_start_ms: None,
            cluster: Vec::new(),
            last_ts_ms: 0,
        })
    }

    fn write_headers(&mut self) -> Result<()> {
        let info = element(
            ID_INFO,
            &[
                uint_element(ID_TIMESTAMP_SCALE, 1_000_000), // 1 ms ticks
                string_element(ID_MUXING_APP, "quorum"),
                string_element(ID_WRITING_APP, "quorum"),
            ]
            .concat(),
        );

        let audio_entry = element(
            ID_TRACK_ENTRY,
            &[
                uint_element(ID_TRACK_NUMBER, AUDIO_TRACK as u64),
                uint_element(ID_TRACK_UID, AUDIO_TRACK as u64),
                uint_element(ID_TRACK_TYPE, 2),
                string_element(ID_CODEC_ID, "A_PCM/INT/LIT"),
                element(
                    ID_AUDIO,
                    &[
                        float_element(ID_SAMPLING_FREQUENCY, HOUSE_RATE as f64),
                        uint_element(ID_CHANNELS, 1),
                        uint_element(ID_BIT_DEPTH, 16),
                    ]
                    .concat(),
                ),
            ]
            .concat(),
        );

        let mut tracks_body = audio_entry;
        if let Some(codec) = self.video_codec {
            let codec_id = match codec {
                MkvVideoCodec::H264 => "V_MPEG4/ISO/AVC",
                MkvVideoCodec::Jpeg => "V_MJPEG",
            };
            let mut entry = vec![
                uint_element(ID_TRACK_NUMBER, VIDEO_TRACK as u64),
                uint_element(ID_TRACK_UID, VIDEO_TRACK as u64),
                uint_element(ID_TRACK_TYPE, 1),
                string_element(ID_CODEC_ID, codec_id),
                element(
                    ID_VIDEO,
                    &[
                        uint_element(ID_PIXEL_WIDTH, self.width as u64),
                        uint_element(ID_PIXEL_HEIGHT, self.height as u64),
                    ]
                    .concat(),
                ),
            ];
            if let Some(private) = &self.codec_private {
                entry.push(element(ID_CODEC_PRIVATE, private));
            }
            tracks_body.extend_from_slice(&element(ID_TRACK_ENTRY, &entry.concat()));
        }
        let tracks = element(ID_TRACKS, &tracks_body);

        self.file.write_all(&info)?;
        self.file.write_all(&tracks)?;
        self.headers_written = true;

        let preroll = std::mem::take(&mut self.preroll);
        for block in preroll {
            self.append_block(block)?;
        }
        Ok(())
    }

    fn push_block(&mut self, block: PendingBlock) -> Result<()> {
        if self.headers_written {
            return self.append_block(block);
        }
        self.preroll.push(block);
        // Commit headers once video has shown itself or the pre-roll
        // window has passed (audio-only meeting).
        if self.video_codec.is_some() || self.audio_slots > PREROLL_SLOTS {
            self.write_headers()?;
        }
        Ok(())
    }

    fn append_block(&mut self, block: PendingBlock) -> Result<()> {
        let start = *self.cluster_start_ms.get_or_insert(block.ts_ms);
        if block.ts_ms >= start + CLUSTER_SPAN_MS {
            self.flush_cluster()?;
            self.cluster_start_ms = Some(block.ts_ms);
        }
        let start = self.cluster_start_ms.unwrap_or(block.ts_ms);

        let mut body = vec![0x80 | block.track]; // 1-byte track vint
        let relative = (block.ts_ms - start) as i16;
        body.extend_from_slice(&relative.to_be_bytes());
        body.push(if block.keyframe { 0x80 } else { 0x00 });
        body.extend_from_slice(&block.data);
        self.cluster
            .extend_from_slice(&element(ID_SIMPLE_BLOCK, &body));
        self.last_ts_ms = self.last_ts_ms.max(block.ts_ms);
        Ok(())
    }

    fn flush_cluster(&mut self) -> Result<()> {
        if self.cluster.is_empty() {
            return Ok(());
        }
        let start = self.cluster_start_ms.unwrap_or(0);
        let body = [
            uint_element(ID_TIMESTAMP, start),
            std::mem::take(&mut self.cluster),
        ]
        .concat();
        self.file.write_all(&element(ID_CLUSTER, &body))?;
        Ok(())
    }
}

impl Muxer for MkvMuxer {
    fn write_audio(&mut self, samples: &[i16]) -> Result<()> {
        if samples.len() != SAMPLES_PER_SLOT {
            return Err(Error::Pipeline(format!(
                "audio slot must be {SAMPLES_PER_SLOT} samples, got {}",
                samples.len()
            )));
        }
        let ts_ms = self.audio_slots * SLOT_MS;
        self.audio_slots += 1;
        let mut data = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        self.push_block(PendingBlock {
            track: AUDIO_TRACK,
            ts_ms,
            keyframe: true,
            data,
        })
    }

    fn write_video(&mut self, ts_ms: u64, payload: &VideoPayload) -> Result<()> {
        let (codec, data, keyframe) = match payload {
            VideoPayload::H264 { data, keyframe } => (MkvVideoCodec::H264, data.clone(), *keyframe),
            VideoPayload::Jpeg { data } => (MkvVideoCodec::Jpeg, data.clone(), true),
        };

        match self.video_codec {
            None if !self.headers_written => self.video_codec = Some(codec),
            None => {
                tracing::warn!("video arrived after audio-only headers; dropping frame");
                return Ok(());
            }
            Some(existing) if existing != codec => {
                tracing::warn!("dropping video frame with mismatched codec");
                return Ok(());
            }
            Some(_) => {}
        }

        self.push_block(PendingBlock {
            track: VIDEO_TRACK,
            ts_ms,
            keyframe,
            data,
        })
    }

    fn finalize(mut self: Box<Self>) -> Result<MuxStats> {
        if !self.headers_written {
            self.write_headers()?;
        }
        self.flush_cluster()?;
        self.file.sync_all()?;

        let bytes = self.file.metadata()?.len();
        let audio_ms = self.audio_slots * SLOT_MS;
        Ok(MuxStats {
            path: self.path.clone(),
            bytes,
            duration_ms: audio_ms.max(self.last_ts_ms + SLOT_MS),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EBML plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Element IDs carry their own length marker; write the minimal
/// big-endian bytes of the literal.
fn encode_id(id: u32) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip.min(3)..].to_vec()
}

/// EBML variable-width size field.
fn encode_size(len: u64) -> Vec<u8> {
    for width in 1..=8u32 {
        let capacity = (1u64 << (7 * width)) - 1;
        if len < capacity {
            let mut bytes = vec![0u8; width as usize];
            let marked = len | (1u64 << (7 * width));
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = (marked >> (8 * (width as usize - 1 - i))) as u8;
            }
            return bytes;
        }
    }
    unreachable!("size exceeds EBML limits")
}

fn element(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = encode_id(id);
    out.extend_from_slice(&encode_size(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

fn uint_element(id: u32, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    element(id, &bytes[skip.min(7)..])
}

fn float_element(id: u32, value: f64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

fn string_element(id: u32, value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}
