//! Hand-written ISO-BMFF (MP4) muxer.
//!
//! Progressive layout: `ftyp`, one growing `mdat`, and a `moov` written at
//! finalize. Audio is a 16-bit little-endian PCM track (`sowt`); video is
//! either passthrough H.264 (`avc1`, AVCC-framed) or compositor JPEG
//! frames (`jpeg` sample entries). Sizes are 32-bit; recordings are
//! bounded by the max-duration auto-leave long before that matters.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use qm_domain::{Error, Result};

use crate::clock::{HOUSE_RATE, SAMPLES_PER_SLOT, SLOT_MS};
use crate::muxer::{MuxStats, Muxer, VideoPayload};

const AUDIO_TRACK_ID: u32 = 1;
const VIDEO_TRACK_ID: u32 = 2;
/// Video track timescale: milliseconds.
const VIDEO_TIMESCALE: u32 = 1000;

#[derive(Debug)]
enum VideoCodec {
    H264 { sps: Vec<u8>, pps: Vec<u8> },
    Jpeg,
}

#[derive(Debug)]
struct VideoSample {
    offset: u64,
    size: u32,
    ts_ms: u64,
    keyframe: bool,
}

pub struct Mp4Muxer {
    path: PathBuf,
    file: File,
    /// File offset of the mdat size field, patched at finalize.
    mdat_offset: u64,
    width: u16,
    height: u16,
    audio_chunk_offsets: Vec<u64>,
    audio_samples: u64,
    video_codec: Option<VideoCodec>,
    video_samples: Vec<VideoSample>,
}

impl Mp4Muxer {
    pub fn create(path: &Path) -> Result<Self> {
        Self::with_dimensions(path, 1280, 720)
    }

    pub fn with_dimensions(path: &Path, width: u16, height: u16) -> Result<Self> {
        let mut file = File::create(path)?;

        let ftyp = atom(
            b"ftyp",
            &[
                b"isom".as_slice(),
                &0x200u32.to_be_bytes(),
                b"isom",
                b"iso2",
                b"avc1",
                b"mp41",
            ]
            .concat(),
        );
        file.write_all(&ftyp)?;

        let mdat_offset = file.stream_position()?;
        file.write_all(&0u32.to_be_bytes())?;
        file.write_all(b"mdat")?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mdat_offset,
            width,
            height,
            audio_chunk_offsets: Vec::new(),
            audio_samples: 0,
            video_codec: None,
            video_samples: Vec::new(),
        })
    }

    fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.file.stream_position()?;
        self.file.write_all(data)?;
        Ok(offset)
    }
}

impl Muxer for Mp4Muxer {
    fn write_audio(&mut self, samples: &[i16]) -> Result<()> {
        if samples.len() != SAMPLES_PER_SLOT {
            return Err(Error::Pipeline(format!(
                "audio slot must be {SAMPLES_PER_SLOT} samples, got {}",
                samples.len()
            )));
        }
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let offset = self.append(&bytes)?;
        self.audio_chunk_offsets.push(offset);
        self.audio_samples += samples.len() as u64;
        Ok(())
    }

    fn write_video(&mut self, ts_ms: u64, payload: &VideoPayload) -> Result<()> {
        let (sample, keyframe) = match payload {
            VideoPayload::H264 { data, keyframe } => {
                let nals = split_annex_b(data);
                if nals.is_empty() {
                    return Err(Error::Pipeline("H.264 payload has no NAL units".into()));
                }
                // Capture parameter sets once; they configure the sample
                // entry rather than travel in samples.
                let mut sample = Vec::new();
                for nal in &nals {
                    match nal.first().map(|b| b & 0x1F) {
                        Some(7) => {
                            if self.video_codec.is_none() {
                                self.video_codec = Some(VideoCodec::H264 {
                                    sps: nal.to_vec(),
                                    pps: Vec::new(),
                                });
                            }
                        }
                        Some(8) => {
                            if let Some(VideoCodec::H264 { pps, .. }) = &mut self.video_codec {
                                if pps.is_empty() {
                                    *pps = nal.to_vec();
                                }
                            }
                        }
                        _ => {
                            sample.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                            sample.extend_from_slice(nal);
                        }
                    }
                }
                if matches!(self.video_codec, Some(VideoCodec::Jpeg)) {
                    tracing::warn!("dropping H.264 frame on a JPEG video track");
                    return Ok(());
                }
                if sample.is_empty() {
                    // Parameter-set-only payload; nothing to store.
                    return Ok(());
                }
                (sample, *keyframe)
            }
            VideoPayload::Jpeg { data } => {
                match &self.video_codec {
                    None => self.video_codec = Some(VideoCodec::Jpeg),
                    Some(VideoCodec::Jpeg) => {}
                    Some(VideoCodec::H264 { .. }) => {
                        tracing::warn!("dropping JPEG frame on an H.264 video track");
                        return Ok(());
                    }
                }
                // Every JPEG frame is independently decodable.
                (data.clone(), true)
            }
        };

        let offset = self.append(&sample)?;
        self.video_samples.push(VideoSample {
            offset,
            size: sample.len() as u32,
            ts_ms,
            keyframe,
        });
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> Result<MuxStats> {
        // Patch the mdat size now that its extent is known.
        let mdat_end = self.file.stream_position()?;
        let mdat_size = (mdat_end - self.mdat_offset) as u32;
        self.file.seek(SeekFrom::Start(self.mdat_offset))?;
        self.file.write_all(&mdat_size.to_be_bytes())?;
        self.file.seek(SeekFrom::Start(mdat_end))?;

        let audio_duration_ms = self.audio_samples * 1000 / HOUSE_RATE as u64;
        let video_duration_ms = video_duration_ms(&self.video_samples);
        let duration_ms = audio_duration_ms.max(video_duration_ms);

        let moov = self.build_moov(duration_ms);
        self.file.write_all(&moov)?;
        self.file.sync_all()?;

        let bytes = self.file.metadata()?.len();
        Ok(MuxStats {
            path: self.path.clone(),
            bytes,
            duration_ms,
        })
    }
}

fn video_duration_ms(samples: &[VideoSample]) -> u64 {
    match samples {
        [] => 0,
        [only] => only.ts_ms + SLOT_MS,
        [.., prev, last] => last.ts_ms + (last.ts_ms - prev.ts_ms).max(SLOT_MS),
    }
}

impl Mp4Muxer {
    fn build_moov(&self, duration_ms: u64) -> Vec<u8> {
        let mut tracks = Vec::new();
        if self.audio_samples > 0 {
            tracks.extend_from_slice(&self.audio_trak(duration_ms));
        }
        if !self.video_samples.is_empty() && self.video_codec.is_some() {
            tracks.extend_from_slice(&self.video_trak());
        }
        atom(b"moov", &[mvhd(duration_ms), tracks].concat())
    }

    fn audio_trak(&self, duration_ms: u64) -> Vec<u8> {
        let stsd = {
            // `sowt`: 16-bit little-endian PCM, mono, house rate.
            let mut entry = Vec::new();
            entry.extend_from_slice(&[0u8; 6]); // reserved
            entry.extend_from_slice(&1u16.to_be_bytes()); // data ref index
            entry.extend_from_slice(&[0u8; 8]); // version/revision/vendor
            entry.extend_from_slice(&1u16.to_be_bytes()); // channels
            entry.extend_from_slice(&16u16.to_be_bytes()); // bits
            entry.extend_from_slice(&[0u8; 4]); // compression/packet size
            entry.extend_from_slice(&(HOUSE_RATE << 16).to_be_bytes()); // 16.16 rate
            full_atom(b"stsd", 0, 0, &[1u32.to_be_bytes().to_vec(), atom(b"sowt", &entry)].concat())
        };

        let stts = full_atom(
            b"stts",
            0,
            0,
            &[
                1u32.to_be_bytes(),
                (self.audio_samples as u32).to_be_bytes(),
                1u32.to_be_bytes(),
            ]
            .concat(),
        );
        let stsc = full_atom(
            b"stsc",
            0,
            0,
            &[
                1u32.to_be_bytes(),
                1u32.to_be_bytes(),
                (SAMPLES_PER_SLOT as u32).to_be_bytes(),
                1u32.to_be_bytes(),
            ]
            .concat(),
        );
        let stsz = full_atom(
            b"stsz",
            0,
            0,
            &[
                2u32.to_be_bytes(), // constant sample size: one i16
                (self.audio_samples as u32).to_be_bytes(),
            ]
            .concat(),
        );
        let stco = chunk_offsets(&self.audio_chunk_offsets);

        let stbl = atom(b"stbl", &[stsd, stts, stsc, stsz, stco].concat());
        let smhd = full_atom(b"smhd", 0, 0, &[0u8; 4]);
        let minf = atom(b"minf", &[smhd, dinf(), stbl].concat());
        let mdia = atom(
            b"mdia",
            &[
                mdhd(HOUSE_RATE, self.audio_samples),
                hdlr(b"soun", "SoundHandler"),
                minf,
            ]
            .concat(),
        );
        atom(
            b"trak",
            &[tkhd(AUDIO_TRACK_ID, duration_ms, 0, 0, true), mdia].concat(),
        )
    }

    fn video_trak(&self) -> Vec<u8> {
        let entry_body = {
            let mut entry = Vec::new();
            entry.extend_from_slice(&[0u8; 6]); // reserved
            entry.extend_from_slice(&1u16.to_be_bytes()); // data ref index
            entry.extend_from_slice(&[0u8; 16]); // pre-defined/reserved
            entry.extend_from_slice(&self.width.to_be_bytes());
            entry.extend_from_slice(&self.height.to_be_bytes());
            entry.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
            entry.extend_from_slice(&0x0048_0000u32.to_be_bytes());
            entry.extend_from_slice(&[0u8; 4]); // reserved
            entry.extend_from_slice(&1u16.to_be_bytes()); // frame count
            entry.extend_from_slice(&[0u8; 32]); // compressor name
            entry.extend_from_slice(&24u16.to_be_bytes()); // depth
            entry.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pre-defined
            entry
        };

        let sample_entry = match &self.video_codec {
            Some(VideoCodec::H264 { sps, pps }) => {
                let mut avcc = vec![1u8]; // configuration version
                avcc.extend_from_slice(&sps.get(1..4).unwrap_or(&[66, 0, 30]).to_vec());
                avcc.push(0xFF); // 4-byte NAL lengths
                avcc.push(0xE1); // one SPS
                avcc.extend_from_slice(&(sps.len() as u16).to_be_bytes());
                avcc.extend_from_slice(sps);
                avcc.push(1); // one PPS
                avcc.extend_from_slice(&(pps.len() as u16).to_be_bytes());
                avcc.extend_from_slice(pps);
                atom(b"avc1", &[entry_body, atom(b"avcC", &avcc)].concat())
            }
            _ => atom(b"jpeg", &entry_body),
        };
        let stsd = full_atom(
            b"stsd",
            0,
            0,
            &[1u32.to_be_bytes().to_vec(), sample_entry].concat(),
        );

        // Run-length encode the inter-frame deltas.
        let mut stts_entries: Vec<(u32, u32)> = Vec::new();
        for (i, sample) in self.video_samples.iter().enumerate() {
            let delta = match self.video_samples.get(i + 1) {
                Some(next) => (next.ts_ms - sample.ts_ms).max(1) as u32,
                None => stts_entries.last().map(|(_, d)| *d).unwrap_or(SLOT_MS as u32),
            };
            match stts_entries.last_mut() {
                Some((count, d)) if *d == delta => *count += 1,
                _ => stts_entries.push((1, delta)),
            }
        }
        let mut stts_body = (stts_entries.len() as u32).to_be_bytes().to_vec();
        for (count, delta) in &stts_entries {
            stts_body.extend_from_slice(&count.to_be_bytes());
            stts_body.extend_from_slice(&delta.to_be_bytes());
        }
        let stts = full_atom(b"stts", 0, 0, &stts_body);

        let stsc = full_atom(
            b"stsc",
            0,
            0,
            &[
                1u32.to_be_bytes(),
                1u32.to_be_bytes(),
                1u32.to_be_bytes(),
                1u32.to_be_bytes(),
            ]
            .concat(),
        );

        let mut stsz_body = 0u32.to_be_bytes().to_vec();
        stsz_body.extend_from_slice(&(self.video_samples.len() as u32).to_be_bytes());
        for sample in &self.video_samples {
            stsz_body.extend_from_slice(&sample.size.to_be_bytes());
        }
        let stsz = full_atom(b"stsz", 0, 0, &stsz_body);

        let stco = chunk_offsets(
            &self
                .video_samples
                .iter()
                .map(|s| s.offset)
                .collect::<Vec<_>>(),
        );

        let mut stbl_children = vec![stsd, stts];
        if matches!(self.video_codec, Some(VideoCodec::H264 { .. })) {
            let keyframes: Vec<u32> = self
                .video_samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.keyframe)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            let mut stss_body = (keyframes.len() as u32).to_be_bytes().to_vec();
            for n in &keyframes {
                stss_body.extend_from_slice(&n.to_be_bytes());
            }
            stbl_children.push(full_atom(b"stss", 0, 0, &stss_body));
        }
        stbl_children.extend_from_slice(&[stsc, stsz, stco]);
        let stbl = atom(b"stbl", &stbl_children.concat());

        let vmhd = full_atom(b"vmhd", 0, 1, &[0u8; 8]);
        let minf = atom(b"minf", &[vmhd, dinf(), stbl].concat());
        let duration_ms = video_duration_ms(&self.video_samples);
        let mdia = atom(
            b"mdia",
            &[
                mdhd(VIDEO_TIMESCALE, duration_ms),
                hdlr(b"vide", "VideoHandler"),
                minf,
            ]
            .concat(),
        );
        atom(
            b"trak",
            &[
                tkhd(VIDEO_TRACK_ID, duration_ms, self.width, self.height, false),
                mdia,
            ]
            .concat(),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Box plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn atom(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(tag);
    out.extend_from_slice(payload);
    out
}

fn full_atom(tag: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![version];
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    atom(tag, &body)
}

fn mvhd(duration_ms: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 8]); // creation/modification
    body.extend_from_slice(&VIDEO_TIMESCALE.to_be_bytes());
    body.extend_from_slice(&(duration_ms as u32).to_be_bytes());
    body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    body.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    body.extend_from_slice(&[0u8; 10]); // reserved
    body.extend_from_slice(&identity_matrix());
    body.extend_from_slice(&[0u8; 24]); // pre-defined
    body.extend_from_slice(&3u32.to_be_bytes()); // next track id
    full_atom(b"mvhd", 0, 0, &body)
}

fn tkhd(track_id: u32, duration_ms: u64, width: u16, height: u16, audio: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&track_id.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]); // reserved
    body.extend_from_slice(&(duration_ms as u32).to_be_bytes());
    body.extend_from_slice(&[0u8; 8]); // reserved
    body.extend_from_slice(&[0u8; 4]); // layer + alternate group
    body.extend_from_slice(&(if audio { 0x0100u16 } else { 0 }).to_be_bytes()); // volume
    body.extend_from_slice(&[0u8; 2]); // reserved
    body.extend_from_slice(&identity_matrix());
    body.extend_from_slice(&((width as u32) << 16).to_be_bytes());
    body.extend_from_slice(&((height as u32) << 16).to_be_bytes());
    full_atom(b"tkhd", 0, 7, &body)
}

fn mdhd(timescale: u32, duration: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&timescale.to_be_bytes());
    body.extend_from_slice(&(duration as u32).to_be_bytes());
    body.extend_from_slice(&0x55C4u16.to_be_bytes()); // language: und
    body.extend_from_slice(&[0u8; 2]);
    full_atom(b"mdhd", 0, 0, &body)
}

fn hdlr(handler: &[u8; 4], name: &str) -> Vec<u8> {
    let mut body = vec![0u8; 4]; // pre-defined
    body.extend_from_slice(handler);
    body.extend_from_slice(&[0u8; 12]); // reserved
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    full_atom(b"hdlr", 0, 0, &body)
}

fn dinf() -> Vec<u8> {
    // Self-contained data reference.
    let url = full_atom(b"url ", 0, 1, &[]);
    let dref = full_atom(b"dref", 0, 0, &[1u32.to_be_bytes().to_vec(), url].concat());
    atom(b"dinf", &dref)
}

fn chunk_offsets(offsets: &[u64]) -> Vec<u8> {
    let mut body = (offsets.len() as u32).to_be_bytes().to_vec();
    for &offset in offsets {
        body.extend_from_slice(&(offset as u32).to_be_bytes());
    }
    full_atom(b"stco", 0, 0, &body)
}

fn identity_matrix() -> [u8; 36] {
    let mut matrix = [0u8; 36];
    matrix[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    matrix[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    matrix[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    matrix
}

/// Split annex-B framed H.264 into NAL units (start codes stripped).
fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut i = 0;
    let mut start = None;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                nals.push(&data[s..code_start]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            nals.push(&data[s..]);
        }
    }
    nals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_payload() -> Vec<u8> {
        // SPS, PPS, then one IDR slice, annex-B framed.
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1, 0x67, 66, 0, 30, 0xAC]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
        data.extend_from_slice(&[0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33]);
        data
    }

    #[test]
    fn split_annex_b_handles_both_start_codes() {
        let payload = h264_payload();
        let nals = split_annex_b(&payload);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0][0] & 0x1F, 7);
        assert_eq!(nals[1][0] & 0x1F, 8);
        assert_eq!(nals[2][0] & 0x1F, 5);
    }

    #[test]
    fn audio_only_mp4_has_ftyp_mdat_moov() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.mp4");
        let mut muxer = Mp4Muxer::create(&path).unwrap();
        for _ in 0..100 {
            muxer.write_audio(&[500i16; SAMPLES_PER_SLOT]).unwrap();
        }
        let stats = Box::new(muxer).finalize().unwrap();
        assert_eq!(stats.duration_ms, 1000);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[4..8], b"ftyp");
        let mdat_offset = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
        assert_eq!(&data[mdat_offset + 4..mdat_offset + 8], b"mdat");
        let mdat_size = u32::from_be_bytes(data[mdat_offset..mdat_offset + 4].try_into().unwrap());
        // 100 slots of 480 samples × 2 bytes plus the 8-byte header.
        assert_eq!(mdat_size as usize, 100 * SAMPLES_PER_SLOT * 2 + 8);
        let moov_offset = mdat_offset + mdat_size as usize;
        assert_eq!(&data[moov_offset + 4..moov_offset + 8], b"moov");
    }

    #[test]
    fn h264_track_collects_parameter_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let mut muxer = Mp4Muxer::create(&path).unwrap();
        for i in 0..5u64 {
            muxer
                .write_video(
                    i * 40,
                    &VideoPayload::H264 {
                        data: h264_payload(),
                        keyframe: i == 0,
                    },
                )
                .unwrap();
        }
        let stats = Box::new(muxer).finalize().unwrap();
        assert!(stats.bytes > 0);

        let data = std::fs::read(&path).unwrap();
        let has = |needle: &[u8]| data.windows(needle.len()).any(|w| w == needle);
        assert!(has(b"avc1"));
        assert!(has(b"avcC"));
        assert!(has(b"stss"));
    }

    #[test]
    fn jpeg_track_uses_jpeg_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mjpeg.mp4");
        let mut muxer = Mp4Muxer::create(&path).unwrap();
        muxer
            .write_video(0, &VideoPayload::Jpeg { data: vec![0xFF, 0xD8, 0xFF] })
            .unwrap();
        // A stray H.264 frame on a JPEG track is dropped, not fatal.
        muxer
            .write_video(40, &VideoPayload::H264 { data: h264_payload(), keyframe: true })
            .unwrap();
        let stats = Box::new(muxer).finalize().unwrap();
        assert!(stats.bytes > 0);

        let data = std::fs::read(&path).unwrap();
        assert!(data.windows(4).any(|w| w == b"jpeg"));
        assert!(!data.windows(4).any(|w| w == b"avcC"));
    }

    #[test]
    fn wrong_slot_size_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut muxer = Mp4Muxer::create(&dir.path().join("x.mp4")).unwrap();
        assert!(muxer.write_audio(&[0i16; 100]).is_err());
    }
}
