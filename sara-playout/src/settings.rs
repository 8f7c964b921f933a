//! Read-only settings provider
//!
//! The core reads settings per call and never persists them; the hosting
//! application decides where they live. The in-memory implementation backs
//! the binary and the test suites.

use crate::backend::DeviceId;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Where mix-trigger callbacks run before touching the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixExecutorKind {
    /// Invoke on the calling thread (a UI dispatcher is assumed upstream)
    Inline,
    /// Hand off to a dedicated single worker thread
    Worker,
}

/// Per-call settings surface consumed by the core
pub trait SettingsProvider: Send + Sync {
    /// Global default fade in seconds
    fn fade_seconds(&self) -> f64;

    /// PFL monitor device, if configured
    fn pfl_device(&self) -> Option<DeviceId>;

    /// Remove items from the playlist once played
    fn auto_remove_played(&self) -> bool;

    /// Keep the selection on the playing track
    fn follow_playing_selection(&self) -> bool;

    /// Seconds before intro end at which the intro alert fires
    fn intro_alert_seconds(&self) -> f64;

    /// Remaining seconds at which the track-end alert fires
    fn track_end_alert_seconds(&self) -> f64;

    /// Mix callback executor strategy
    fn mix_executor(&self) -> MixExecutorKind;

    /// Extensions eligible for the transcode fallback
    fn transcode_extensions(&self) -> Vec<String>;
}

/// Mutable in-memory settings for the binary and tests
pub struct StaticSettings {
    inner: Mutex<SettingsValues>,
}

#[derive(Debug, Clone)]
struct SettingsValues {
    fade_seconds: f64,
    pfl_device: Option<DeviceId>,
    auto_remove_played: bool,
    follow_playing_selection: bool,
    intro_alert_seconds: f64,
    track_end_alert_seconds: f64,
    mix_executor: MixExecutorKind,
    transcode_extensions: Vec<String>,
}

impl Default for StaticSettings {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SettingsValues {
                fade_seconds: 3.0,
                pfl_device: None,
                auto_remove_played: false,
                follow_playing_selection: true,
                intro_alert_seconds: 5.0,
                track_end_alert_seconds: 10.0,
                mix_executor: MixExecutorKind::Worker,
                transcode_extensions: vec![
                    "m4a".into(),
                    "mp4".into(),
                    "wma".into(),
                    "aiff".into(),
                ],
            }),
        }
    }
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fade_seconds(&self, value: f64) {
        self.inner.lock().unwrap().fade_seconds = value.max(0.0);
    }

    pub fn set_pfl_device(&self, device: Option<DeviceId>) {
        self.inner.lock().unwrap().pfl_device = device;
    }

    pub fn set_auto_remove_played(&self, value: bool) {
        self.inner.lock().unwrap().auto_remove_played = value;
    }

    pub fn set_mix_executor(&self, value: MixExecutorKind) {
        self.inner.lock().unwrap().mix_executor = value;
    }

    pub fn set_track_end_alert_seconds(&self, value: f64) {
        self.inner.lock().unwrap().track_end_alert_seconds = value.max(0.0);
    }
}

impl SettingsProvider for StaticSettings {
    fn fade_seconds(&self) -> f64 {
        self.inner.lock().unwrap().fade_seconds
    }

    fn pfl_device(&self) -> Option<DeviceId> {
        self.inner.lock().unwrap().pfl_device.clone()
    }

    fn auto_remove_played(&self) -> bool {
        self.inner.lock().unwrap().auto_remove_played
    }

    fn follow_playing_selection(&self) -> bool {
        self.inner.lock().unwrap().follow_playing_selection
    }

    fn intro_alert_seconds(&self) -> f64 {
        self.inner.lock().unwrap().intro_alert_seconds
    }

    fn track_end_alert_seconds(&self) -> f64 {
        self.inner.lock().unwrap().track_end_alert_seconds
    }

    fn mix_executor(&self) -> MixExecutorKind {
        self.inner.lock().unwrap().mix_executor
    }

    fn transcode_extensions(&self) -> Vec<String> {
        self.inner.lock().unwrap().transcode_extensions.clone()
    }
}
