//! The per-bot worker: controller, auto-leave policy, artifact upload.

pub mod autoleave;
pub mod controller;
pub mod uploader;

pub use controller::{run_bot, run_worker};
