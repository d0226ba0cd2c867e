//! WAV output for audio-only recordings.

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};

use qm_domain::{Error, Result};

use crate::clock::{HOUSE_RATE, SLOT_MS};
use crate::muxer::{MuxStats, Muxer, VideoPayload};

pub struct WavMuxer {
    path: PathBuf,
    writer: WavWriter<BufWriter<std::fs::File>>,
    slots_written: u64,
}

impl WavMuxer {
    pub fn create(path: &Path) -> Result<Self> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: HOUSE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)
            .map_err(|e| Error::Pipeline(format!("creating {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            slots_written: 0,
        })
    }
}

impl Muxer for WavMuxer {
    fn write_audio(&mut self, samples: &[i16]) -> Result<()> {
        for &sample in samples {
            self.writer
                .write_sample(sample)
                .map_err(|e| Error::Pipeline(format!("wav write: {e}")))?;
        }
        self.slots_written += 1;
        Ok(())
    }

    fn write_video(&mut self, _ts_ms: u64, _payload: &VideoPayload) -> Result<()> {
        // Audio-only container; the pipeline should not route video here.
        tracing::debug!("ignoring video frame on wav muxer");
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<MuxStats> {
        let Self {
            path,
            writer,
            slots_written,
        } = *self;
        writer
            .finalize()
            .map_err(|e| Error::Pipeline(format!("wav finalize: {e}")))?;

        let file = OpenOptions::new().read(true).open(&path)?;
        file.sync_all()?;
        let bytes = file.metadata()?.len();

        Ok(MuxStats {
            path,
            bytes,
            duration_ms: slots_written * SLOT_MS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SAMPLES_PER_SLOT;

    #[test]
    fn writes_readable_wav_with_correct_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut muxer = WavMuxer::create(&path).unwrap();
        for _ in 0..100 {
            muxer.write_audio(&[1200i16; SAMPLES_PER_SLOT]).unwrap();
        }
        let stats = Box::new(muxer).finalize().unwrap();
        assert_eq!(stats.duration_ms, 1000);
        assert!(stats.bytes > (SAMPLES_PER_SLOT * 2 * 100) as u64);

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, HOUSE_RATE);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), SAMPLES_PER_SLOT * 100);
        assert_eq!(samples[0], 1200);
    }

    #[test]
    fn video_is_ignored_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut muxer = WavMuxer::create(&dir.path().join("a.wav")).unwrap();
        muxer
            .write_video(0, &VideoPayload::Jpeg { data: vec![1, 2, 3] })
            .unwrap();
        let stats = Box::new(muxer).finalize().unwrap();
        assert_eq!(stats.duration_ms, 0);
    }
}
