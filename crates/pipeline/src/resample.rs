//! Linear-interpolation resampling to the house format.

use dasp::interpolate::linear::Linear;
use dasp::signal::{self, Signal};

/// Resample mono i16 PCM between rates. Same-rate input is returned
/// unchanged.
pub fn resample(pcm: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || pcm.is_empty() {
        return pcm.to_vec();
    }

    let mut source = signal::from_iter(pcm.iter().map(|&s| [s as f64]));
    let first = source.next();
    let second = source.next();
    let interpolator = Linear::new(first, second);

    source
        .from_hz_to_hz(interpolator, from_hz as f64, to_hz as f64)
        .until_exhausted()
        .map(|frame| frame[0].round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_identity() {
        let pcm = vec![1, 2, 3, -4];
        assert_eq!(resample(&pcm, 48_000, 48_000), pcm);
    }

    #[test]
    fn upsampling_roughly_doubles_length() {
        let pcm: Vec<i16> = (0..160).map(|i| (i * 10) as i16).collect();
        let out = resample(&pcm, 16_000, 48_000);
        // Linear interpolation consumes two priming samples; allow slack.
        assert!((out.len() as i64 - 480).unsigned_abs() <= 8, "got {}", out.len());
    }

    #[test]
    fn downsampling_shrinks() {
        let pcm: Vec<i16> = vec![1000; 480];
        let out = resample(&pcm, 48_000, 16_000);
        assert!((out.len() as i64 - 160).unsigned_abs() <= 8, "got {}", out.len());
        // A constant signal stays constant under linear interpolation.
        assert!(out.iter().all(|&s| (s - 1000).abs() <= 1));
    }

    #[test]
    fn empty_input() {
        assert!(resample(&[], 16_000, 48_000).is_empty());
    }
}
