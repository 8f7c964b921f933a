//! Runtime tuning parameters
//!
//! Central home for the timing constants the playout runtime depends on.
//! These are fixed values, not user settings; user-facing knobs (fade
//! length, PFL device, alert thresholds) live behind the settings provider
//! in `sara-playout`.

use std::time::Duration;

/// Ignore native mix callbacks firing more than this before the mix point.
pub const MIX_NATIVE_EARLY_GUARD: f64 = 0.1;

/// Wait up to this long past the mix point for the native callback before
/// the progress fallback takes over.
pub const MIX_NATIVE_LATE_GUARD: f64 = 0.1;

/// Fire the explicit (progress-driven) mix once remaining time to the mix
/// point drops to this.
pub const MIX_EXPLICIT_PROGRESS_GUARD: f64 = 0.04;

/// A native callback arriving more than this before its armed mix point is
/// treated as a spurious early fire and demoted to the progress path.
pub const MIX_NATIVE_EARLY_FIRE_TOLERANCE: f64 = 0.75;

/// When a loop is disabled mid-play, do not re-arm a mix point that is
/// already within this window of the current position.
pub const MIX_REARM_LATE_WINDOW: f64 = 0.05;

/// Player monitor poll interval.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(1);

/// Minimum spacing between progress callbacks.
pub const PROGRESS_CADENCE: f64 = 0.05;

/// Software loop guard reacts once the position passes loop end by this
/// much, giving the native sync first chance to jump.
pub const LOOP_GUARD_SLACK: f64 = 0.004;

/// Hard clamp threshold past loop end; excursions beyond this jump
/// unconditionally.
pub const LOOP_HARD_CLAMP: f64 = 0.05;

/// Acceptable drift after a loop jump; larger drift triggers one re-seek.
pub const LOOP_DRIFT_TOLERANCE: f64 = 0.002;

/// Fade threads step every this many seconds.
pub const FADE_STEP_SECONDS: f64 = 0.05;

/// Fades always run at least this many steps.
pub const FADE_MIN_STEPS: u32 = 4;

/// Bound on joining a fade thread during stop.
pub const FADE_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound on waiting for preview players to report finished.
pub const PREVIEW_FINISH_TIMEOUT: Duration = Duration::from_millis(500);

/// Mix previews auto-stop this many seconds after the rehearsed fade ends.
pub const PREVIEW_TAIL_SECONDS: f64 = 4.0;

/// Device acquisition retries after a configured device disappears.
pub const DEVICE_INIT_ATTEMPTS: u32 = 2;

/// Mix triggers are clamped to track length minus this margin.
pub const MIX_TRIGGER_END_MARGIN: f64 = 0.01;

/// Stream length overrides metadata duration when they disagree by more
/// than this.
pub const LENGTH_DISAGREEMENT: f64 = 0.5;

/// Micro fade applied by the block mixer to mask start/loop clicks.
pub const MICRO_FADE_SECONDS: f64 = 0.004;

/// Window scanned for a zero crossing when a mixer source starts mid-file.
pub const ZERO_CROSS_WINDOW_SECONDS: f64 = 0.005;

/// Block mixer render quantum in frames.
pub const MIXER_BLOCK_FRAMES: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_ordering() {
        // The explicit progress guard must be tighter than the native
        // late guard, or the fallback would race the native callback.
        assert!(MIX_EXPLICIT_PROGRESS_GUARD < MIX_NATIVE_LATE_GUARD);
    }

    #[test]
    fn test_loop_guard_below_clamp() {
        assert!(LOOP_GUARD_SLACK < LOOP_HARD_CLAMP);
        assert!(LOOP_DRIFT_TOLERANCE < LOOP_GUARD_SLACK);
    }

    #[test]
    fn test_monitor_faster_than_progress() {
        assert!(MONITOR_INTERVAL.as_secs_f64() < PROGRESS_CADENCE);
    }
}
