//! Decoder backend abstraction
//!
//! A backend owns decoded streams bound to output devices and exposes the
//! capability set the player builds on: stream lifecycle, seconds-based
//! position/length, linear volume, one-shot-per-crossing position syncs
//! (mix-time or normal), and end-of-data syncs.
//!
//! Three concrete implementations:
//! - [`direct::DirectBackend`]: shared output devices, one render stream
//!   per device summing its active decoded streams.
//! - [`exclusive::ExclusiveBackend`]: driver-exclusive devices; decode-only
//!   streams routed to a stereo channel pair, reference-counted driver
//!   start, gain via channel volume.
//! - [`mixer::MixerBackend`]: software block summer bound to one device.
//!
//! Sync callbacks never run on the render path; fired syncs are handed off
//! to a backend-owned dispatch thread.

pub mod decode;
pub mod device;
pub mod direct;
pub mod exclusive;
pub mod mixer;
pub mod transcode;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Stable identifier of an output device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a decoded stream inside a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Handle to a registered sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncId(pub u64);

/// When a position sync fires relative to the render path
///
/// `MixTime` fires while the sample is being rendered (just before it is
/// audible); `Normal` fires once the sample has reached the output. Both
/// dispatch off the render thread either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    MixTime,
    Normal,
}

/// Stream creation flags
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFlags {
    /// Decode the whole file up front so length and seeks are exact
    pub prescan: bool,
    /// Wrap the whole stream at end-of-data instead of stopping
    pub sample_loop: bool,
    /// Create without binding to an output (driver-exclusive routing)
    pub decode_only: bool,
}

/// Callback invoked when a sync fires; hand-off work only
pub type SyncCallback = Arc<dyn Fn() + Send + Sync>;

/// Uniform capability set over the three backend variants
pub trait AudioBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Create a decoded stream bound to `device`.
    ///
    /// May transparently transcode containers the decoder does not handle,
    /// tying the temp file's lifetime to the stream.
    fn create_stream(&self, device: &DeviceId, path: &Path, flags: StreamFlags)
        -> Result<StreamId>;

    /// Idempotent; also deletes any transcode temp file.
    fn free_stream(&self, stream: StreamId);

    /// Start or resume playback.
    fn play(&self, stream: StreamId) -> Result<()>;

    /// Suspend without losing position.
    fn pause(&self, stream: StreamId);

    /// Halt; removes all registered syncs.
    fn stop(&self, stream: StreamId);

    /// Current absolute position in seconds.
    fn position_seconds(&self, stream: StreamId) -> f64;

    /// Seek to an absolute position in seconds.
    fn set_position_seconds(&self, stream: StreamId, seconds: f64);

    /// Stream length in seconds; preferred over metadata duration when the
    /// two disagree by more than 0.5 s.
    fn length_seconds(&self, stream: StreamId) -> f64;

    /// Linear gain; values above 1.0 amplify.
    fn set_volume(&self, stream: StreamId, gain: f32);

    /// True while the stream has not stopped or reached end-of-data.
    fn is_active(&self, stream: StreamId) -> bool;

    /// Register a position sync firing once per crossing of `seconds`.
    ///
    /// Re-arms when the position moves back before the sync point, so loop
    /// jumps retrigger it. Multiple syncs at one position are allowed.
    fn add_sync_position(
        &self,
        stream: StreamId,
        seconds: f64,
        mode: SyncMode,
        callback: SyncCallback,
    ) -> Result<SyncId>;

    /// Register an end-of-data sync.
    fn add_sync_end(&self, stream: StreamId, callback: SyncCallback) -> Result<SyncId>;

    /// Idempotent.
    fn remove_sync(&self, stream: StreamId, sync: SyncId);

    /// Whether position syncs are sample-accurate enough to arm mix
    /// triggers on (the progress fallback is used otherwise).
    fn supports_mix_trigger(&self) -> bool;
}
