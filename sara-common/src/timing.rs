//! Time and gain unit conversions
//!
//! Streams are decoded to interleaved stereo f32, so one frame is two
//! samples (8 bytes). Callers always work in seconds; backends convert to
//! frames or bytes at the edge.

/// Bytes per interleaved stereo f32 frame
pub const BYTES_PER_FRAME: u64 = 8;

/// Lower clamp for replay gain adjustments (dB)
pub const GAIN_DB_MIN: f64 = -60.0;

/// Upper clamp for replay gain adjustments (dB)
pub const GAIN_DB_MAX: f64 = 18.0;

/// Convert seconds to a frame count at the given sample rate.
///
/// Negative inputs clamp to zero.
pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * sample_rate as f64).round() as u64
}

/// Convert a frame count to seconds at the given sample rate.
pub fn frames_to_seconds(frames: u64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    frames as f64 / sample_rate as f64
}

/// Convert seconds to a byte offset in an interleaved stereo f32 stream.
pub fn seconds_to_bytes(seconds: f64, sample_rate: u32) -> u64 {
    seconds_to_frames(seconds, sample_rate) * BYTES_PER_FRAME
}

/// Convert a byte offset to seconds in an interleaved stereo f32 stream.
pub fn bytes_to_seconds(bytes: u64, sample_rate: u32) -> f64 {
    frames_to_seconds(bytes / BYTES_PER_FRAME, sample_rate)
}

/// Convert a dB gain to a linear factor.
///
/// The dB value is clamped to [-60, +18] before conversion; `None` means
/// unity gain. Values above 1.0 are allowed (amplification).
pub fn db_to_linear(gain_db: Option<f64>) -> f32 {
    match gain_db {
        None => 1.0,
        Some(db) => {
            let clamped = db.clamp(GAIN_DB_MIN, GAIN_DB_MAX);
            10f64.powf(clamped / 20.0) as f32
        }
    }
}
