//! The summing audio mixer.
//!
//! Each tick drains one slot from every participant ring, sums into a
//! 32-bit accumulator, soft-clips, and reports per-participant energy so
//! the compositor can track the active speaker.

use std::collections::HashMap;

use crate::clock::{HOUSE_RATE, SAMPLES_PER_SLOT};
use crate::resample::resample;
use crate::ring::AudioRing;

/// Soft-clip ceiling: ±0.95 of full scale.
const CLIP_LIMIT: f32 = 0.95 * i16::MAX as f32;

/// One mixed 10 ms frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedFrame {
    pub slot: u64,
    pub samples: Vec<i16>,
}

/// Per-participant output of one tick, pre-mix.
#[derive(Debug, Clone)]
pub struct ParticipantSlot {
    pub participant_uuid: String,
    pub samples: Vec<i16>,
    /// Mean square of the slot's samples, for speaker tracking.
    pub energy: f64,
}

pub struct Mixer {
    rings: HashMap<String, AudioRing>,
    ring_capacity_slots: usize,
}

impl Mixer {
    pub fn new(ring_secs: u64) -> Self {
        Self {
            rings: HashMap::new(),
            ring_capacity_slots: (ring_secs * 1000 / crate::clock::SLOT_MS) as usize,
        }
    }

    /// Ingest one participant frame, resampling to the house rate.
    pub fn ingest(&mut self, participant_uuid: &str, pcm: &[i16], sample_rate: u32, slot: u64) {
        let capacity = self.ring_capacity_slots;
        let ring = self
            .rings
            .entry(participant_uuid.to_owned())
            .or_insert_with(|| AudioRing::new(capacity));
        let house = resample(pcm, sample_rate, HOUSE_RATE);
        // A frame longer than one slot spills into the following slots.
        for (i, chunk) in house.chunks(SAMPLES_PER_SLOT).enumerate() {
            ring.push(slot + i as u64, chunk);
        }
    }

    pub fn remove_participant(&mut self, participant_uuid: &str) {
        self.rings.remove(participant_uuid);
    }

    /// Samples lost to ring overflow across all participants.
    pub fn overwritten(&self) -> u64 {
        self.rings.values().map(|r| r.overwritten()).sum()
    }

    /// Mix one slot. Returns the mixed frame plus each participant's
    /// pre-mix slot (for per-participant recording and speaker tracking).
    pub fn tick(&mut self, slot: u64) -> (MixedFrame, Vec<ParticipantSlot>) {
        let mut accumulator = vec![0i32; SAMPLES_PER_SLOT];
        let mut per_participant = Vec::new();

        for (uuid, ring) in &mut self.rings {
            let Some(samples) = ring.take(slot) else {
                continue;
            };
            let mut energy = 0f64;
            for (i, &sample) in samples.iter().enumerate() {
                accumulator[i] += sample as i32;
                energy += (sample as f64) * (sample as f64);
            }
            per_participant.push(ParticipantSlot {
                participant_uuid: uuid.clone(),
                energy: energy / samples.len() as f64,
                samples,
            });
        }

        let samples = accumulator.into_iter().map(soft_clip).collect();
        (MixedFrame { slot, samples }, per_participant)
    }
}

/// Soft clip into ±0.95 full scale with a tanh knee.
fn soft_clip(sum: i32) -> i16 {
    let x = sum as f32;
    if x.abs() <= CLIP_LIMIT {
        return x as i16;
    }
    (CLIP_LIMIT * (x / CLIP_LIMIT).tanh()) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_mixes_to_silence() {
        let mut mixer = Mixer::new(2);
        let (frame, slots) = mixer.tick(0);
        assert_eq!(frame.samples, vec![0i16; SAMPLES_PER_SLOT]);
        assert!(slots.is_empty());
    }

    #[test]
    fn two_participants_sum() {
        let mut mixer = Mixer::new(2);
        mixer.ingest("a", &[1000; SAMPLES_PER_SLOT], HOUSE_RATE, 0);
        mixer.ingest("b", &[-400; SAMPLES_PER_SLOT], HOUSE_RATE, 0);
        let (frame, slots) = mixer.tick(0);
        assert_eq!(frame.samples[0], 600);
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn loud_sum_is_clipped_within_limit() {
        let mut mixer = Mixer::new(2);
        mixer.ingest("a", &[30_000; SAMPLES_PER_SLOT], HOUSE_RATE, 0);
        mixer.ingest("b", &[30_000; SAMPLES_PER_SLOT], HOUSE_RATE, 0);
        let (frame, _) = mixer.tick(0);
        let limit = (0.95 * i16::MAX as f32) as i16;
        assert!(frame.samples.iter().all(|&s| s <= limit && s >= -limit));
        // And it did not collapse to zero.
        assert!(frame.samples[0] > 20_000);
    }

    #[test]
    fn clip_is_monotonic() {
        let quiet = soft_clip(40_000);
        let loud = soft_clip(80_000);
        assert!(loud >= quiet);
    }

    #[test]
    fn energy_tracks_the_speaker() {
        let mut mixer = Mixer::new(2);
        mixer.ingest("loud", &[10_000; SAMPLES_PER_SLOT], HOUSE_RATE, 0);
        mixer.ingest("quiet", &[100; SAMPLES_PER_SLOT], HOUSE_RATE, 0);
        let (_, slots) = mixer.tick(0);
        let loud = slots.iter().find(|s| s.participant_uuid == "loud").unwrap();
        let quiet = slots.iter().find(|s| s.participant_uuid == "quiet").unwrap();
        assert!(loud.energy > quiet.energy * 100.0);
    }

    #[test]
    fn long_frame_spills_into_following_slots() {
        let mut mixer = Mixer::new(2);
        // 30 ms of audio lands in slots 0..3.
        mixer.ingest("a", &[500; SAMPLES_PER_SLOT * 3], HOUSE_RATE, 0);
        for slot in 0..3 {
            let (frame, _) = mixer.tick(slot);
            assert_eq!(frame.samples[0], 500, "slot {slot}");
        }
        let (frame, _) = mixer.tick(3);
        assert_eq!(frame.samples[0], 0);
    }
}
