//! # SARA Playout Core (sara-playout)
//!
//! Playback and mix-trigger runtime for radio automation: decoder backends,
//! device-slot selection, per-item mix plans, sample-accurate mix triggers
//! with a progress-based fallback, loop enforcement, and PFL preview.
//!
//! **Architecture:** std-thread audio internals (monitor, fade, block
//! mixer, output callbacks) under an async orchestration layer (controller,
//! auto-mix runtime, preview engine).

pub mod alerts;
pub mod announce;
pub mod automix;
pub mod backend;
pub mod controller;
pub mod error;
pub mod executor;
pub mod model;
pub mod plan;
pub mod player;
pub mod preview;
pub mod settings;

pub use controller::{PlaybackContext, PlaybackController};
pub use error::{Error, Result};
pub use plan::{MixPlan, MixPlanner};
