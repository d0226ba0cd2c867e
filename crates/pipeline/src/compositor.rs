//! Video composition: active-speaker tracking and tile layout.
//!
//! Decoded RGB frames are composited into a single output frame per video
//! tick. The active speaker is whoever carried the most audio energy over
//! the trailing window, with hysteresis so brief interjections do not
//! flip the view. Tiles without a live frame get a name placeholder.

use std::collections::{HashMap, VecDeque};

use image::{imageops, Rgb, RgbImage};

use qm_domain::settings::ViewLayout;

use crate::clock::SLOT_MS;
use crate::mixer::ParticipantSlot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Active-speaker tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SpeakerTracker {
    window_slots: u64,
    hysteresis_ms: u64,
    energies: HashMap<String, VecDeque<(u64, f64)>>,
    current: Option<String>,
    last_switch_ms: u64,
}

impl SpeakerTracker {
    pub fn new(window_ms: u64, hysteresis_ms: u64) -> Self {
        Self {
            window_slots: window_ms / SLOT_MS,
            hysteresis_ms,
            energies: HashMap::new(),
            current: None,
            last_switch_ms: 0,
        }
    }

    /// Feed one tick's per-participant energies.
    pub fn observe(&mut self, slot: u64, slots: &[ParticipantSlot]) {
        for p in slots {
            let window = self
                .energies
                .entry(p.participant_uuid.clone())
                .or_default();
            window.push_back((slot, p.energy));
        }
        let horizon = slot.saturating_sub(self.window_slots);
        for window in self.energies.values_mut() {
            while window.front().map(|(s, _)| *s < horizon).unwrap_or(false) {
                window.pop_front();
            }
        }

        // Mean energy over the window decides the leader; switches are
        // rate-limited by the hysteresis interval.
        let leader = self
            .energies
            .iter()
            .map(|(uuid, window)| {
                let mean = if window.is_empty() {
                    0.0
                } else {
                    window.iter().map(|(_, e)| e).sum::<f64>() / window.len() as f64
                };
                (uuid.clone(), mean)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, mean)| *mean > 0.0)
            .map(|(uuid, _)| uuid);

        let now_ms = slot * SLOT_MS;
        match (&self.current, leader) {
            (None, Some(leader)) => {
                self.current = Some(leader);
                self.last_switch_ms = now_ms;
            }
            (Some(current), Some(leader)) if *current != leader => {
                if now_ms.saturating_sub(self.last_switch_ms) >= self.hysteresis_ms {
                    self.current = Some(leader);
                    self.last_switch_ms = now_ms;
                }
            }
            _ => {}
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn forget(&mut self, participant_uuid: &str) {
        self.energies.remove(participant_uuid);
        if self.current.as_deref() == Some(participant_uuid) {
            self.current = None;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compositor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Tile {
    name: String,
    frame: Option<RgbImage>,
}

pub struct Compositor {
    layout: ViewLayout,
    width: u32,
    height: u32,
    /// Insertion order drives gallery placement.
    order: Vec<String>,
    tiles: HashMap<String, Tile>,
    /// Last rendered output, reused while paused (freeze frame).
    last_render: Option<RgbImage>,
}

impl Compositor {
    pub fn new(layout: ViewLayout, width: u32, height: u32) -> Self {
        Self {
            layout,
            width,
            height,
            order: Vec::new(),
            tiles: HashMap::new(),
            last_render: None,
        }
    }

    pub fn add_participant(&mut self, uuid: &str, name: &str) {
        if !self.tiles.contains_key(uuid) {
            self.order.push(uuid.to_owned());
            self.tiles.insert(
                uuid.to_owned(),
                Tile {
                    name: name.to_owned(),
                    frame: None,
                },
            );
        }
    }

    pub fn remove_participant(&mut self, uuid: &str) {
        self.order.retain(|u| u != uuid);
        self.tiles.remove(uuid);
    }

    /// Store a participant's latest decoded frame.
    pub fn ingest_frame(&mut self, uuid: &str, width: u32, height: u32, rgb: &[u8]) {
        if rgb.len() != (width * height * 3) as usize {
            tracing::warn!(uuid, width, height, bytes = rgb.len(), "dropping misshapen frame");
            return;
        }
        let Some(image) = RgbImage::from_raw(width, height, rgb.to_vec()) else {
            return;
        };
        if let Some(tile) = self.tiles.get_mut(uuid) {
            tile.frame = Some(image);
        } else {
            // Frame before the join event: create the tile with an empty
            // name, the join event fills it in.
            self.order.push(uuid.to_owned());
            self.tiles.insert(
                uuid.to_owned(),
                Tile {
                    name: String::new(),
                    frame: Some(image),
                },
            );
        }
    }

    /// The frozen frame from the last render, for pause continuity.
    pub fn last_render(&self) -> Option<&RgbImage> {
        self.last_render.as_ref()
    }

    /// Compose one output frame.
    pub fn render(&mut self, active_speaker: Option<&str>) -> RgbImage {
        let mut canvas = RgbImage::from_pixel(self.width, self.height, Rgb([16, 16, 20]));

        match self.layout {
            ViewLayout::SpeakerView => {
                let uuid = active_speaker
                    .filter(|u| self.tiles.contains_key(*u))
                    .map(str::to_owned)
                    .or_else(|| self.order.first().cloned());
                if let Some(uuid) = uuid {
                    self.blit(&mut canvas, &uuid, 0, 0, self.width, self.height);
                }
            }
            ViewLayout::GalleryView => {
                let visible: Vec<String> = self.order.iter().take(16).cloned().collect();
                if !visible.is_empty() {
                    let (cols, rows) = grid_dims(visible.len());
                    let tile_w = self.width / cols;
                    let tile_h = self.height / rows;
                    for (i, uuid) in visible.iter().enumerate() {
                        let x = (i as u32 % cols) * tile_w;
                        let y = (i as u32 / cols) * tile_h;
                        self.blit(&mut canvas, uuid, x, y, tile_w, tile_h);
                    }
                }
            }
        }

        self.last_render = Some(canvas.clone());
        canvas
    }

    fn blit(&self, canvas: &mut RgbImage, uuid: &str, x: u32, y: u32, w: u32, h: u32) {
        let Some(tile) = self.tiles.get(uuid) else {
            return;
        };
        let rendered = match &tile.frame {
            Some(frame) => imageops::resize(frame, w, h, imageops::FilterType::Triangle),
            None => placeholder(&tile.name, uuid, w, h),
        };
        imageops::overlay(canvas, &rendered, x as i64, y as i64);
    }
}

/// Gallery grid sizes: 1, 2, 4, 9 or 16 tiles.
fn grid_dims(n: usize) -> (u32, u32) {
    match n {
        0 | 1 => (1, 1),
        2 => (2, 1),
        3 | 4 => (2, 2),
        5..=9 => (3, 3),
        _ => (4, 4),
    }
}

/// A solid tile carrying the participant's initial, used when no video is
/// available.
fn placeholder(name: &str, uuid: &str, w: u32, h: u32) -> RgbImage {
    let background = color_for(uuid);
    let mut tile = RgbImage::from_pixel(w, h, background);

    let initial = name
        .chars()
        .find(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or('?');
    let scale = (h / 14).max(1);
    let glyph_w = 5 * scale;
    let glyph_h = 7 * scale;
    let x0 = w.saturating_sub(glyph_w) / 2;
    let y0 = h.saturating_sub(glyph_h) / 2;
    draw_glyph(&mut tile, initial, x0, y0, scale);
    tile
}

/// Stable per-participant tile color.
fn color_for(uuid: &str) -> Rgb<u8> {
    let hash = uuid
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    Rgb([
        64 + (hash & 0x3F) as u8,
        64 + ((hash >> 6) & 0x3F) as u8,
        96 + ((hash >> 12) & 0x3F) as u8,
    ])
}

/// 5×7 bitmap glyphs for A–Z, 0–9 and `?`; rows as 5-bit masks.
fn glyph_rows(c: char) -> [u8; 7] {
    match c {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x1B, 0x11],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1E, 0x01, 0x01, 0x0E, 0x01, 0x01, 0x1E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

fn draw_glyph(image: &mut RgbImage, c: char, x0: u32, y0: u32, scale: u32) {
    let rows = glyph_rows(c);
    let white = Rgb([235, 235, 235]);
    for (row, mask) in rows.iter().enumerate() {
        for col in 0..5u32 {
            if mask & (0x10 >> col) != 0 {
                for dy in 0..scale {
                    for dx in 0..scale {
                        let x = x0 + col * scale + dx;
                        let y = y0 + row as u32 * scale + dy;
                        if x < image.width() && y < image.height() {
                            image.put_pixel(x, y, white);
                        }
                    }
                }
            }
        }
    }
}
