//! Output containers.
//!
//! A muxer consumes the pipeline's mixed audio slots and encoded video
//! payloads and writes one continuous file. Pause intervals never reach
//! the muxer as gaps; the pipeline substitutes silence and frozen frames
//! so the output timeline stays contiguous.

mod mkv;
mod mp4;
mod wav;

pub use mkv::MkvMuxer;
pub use mp4::Mp4Muxer;
pub use wav::WavMuxer;

use std::path::{Path, PathBuf};

use qm_domain::settings::RecordingFormat;
use qm_domain::{Error, Result};

/// Encoded video handed to the muxer: H.264 access units pass through
/// from native platforms, JPEG frames come from the compositor.
#[derive(Debug, Clone)]
pub enum VideoPayload {
    H264 { data: Vec<u8>, keyframe: bool },
    Jpeg { data: Vec<u8> },
}

/// Result of finalizing a container.
#[derive(Debug, Clone)]
pub struct MuxStats {
    pub path: PathBuf,
    pub bytes: u64,
    pub duration_ms: u64,
}

pub trait Muxer: Send {
    /// Append one 10 ms slot of mixed audio (480 samples, house format).
    fn write_audio(&mut self, samples: &[i16]) -> Result<()>;

    /// Append one video frame at a meeting-relative timestamp.
    fn write_video(&mut self, ts_ms: u64, payload: &VideoPayload) -> Result<()>;

    /// Finish the container: write trailing metadata and fsync.
    fn finalize(self: Box<Self>) -> Result<MuxStats>;
}

/// Build the muxer for a recording format. `None` formats produce no
/// muxer and the pipeline skips encoding entirely.
pub fn for_format(
    format: RecordingFormat,
    path: &Path,
    width: u16,
    height: u16,
) -> Result<Option<Box<dyn Muxer>>> {
    match format {
        RecordingFormat::Mp4 => Ok(Some(Box::new(Mp4Muxer::with_dimensions(
            path, width, height,
        )?))),
        RecordingFormat::Webm => Ok(Some(Box::new(MkvMuxer::with_dimensions(
            path, width, height,
        )?))),
        RecordingFormat::Wav => Ok(Some(Box::new(WavMuxer::create(path)?))),
        RecordingFormat::None => Ok(None),
        // Normalization happens at bot creation; reaching here is a bug
        // upstream, not a user error.
        RecordingFormat::Mp3 => Err(Error::Pipeline(
            "mp3 must be normalized before the pipeline starts".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_covers_every_format() {
        let dir = tempfile::tempdir().unwrap();
        for (format, expect_some) in [
            (RecordingFormat::Mp4, true),
            (RecordingFormat::Webm, true),
            (RecordingFormat::Wav, true),
            (RecordingFormat::None, false),
        ] {
            let path = dir.path().join(format!("out.{}", format.extension()));
            let muxer = for_format(format, &path, 1280, 720).unwrap();
            assert_eq!(muxer.is_some(), expect_some, "{format:?}");
        }
        assert!(for_format(RecordingFormat::Mp3, &dir.path().join("x.mp3"), 1280, 720).is_err());
    }
}
