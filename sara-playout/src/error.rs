//! Error types for the playout core
//!
//! Expected failures cross component boundaries as typed results; nothing
//! in this crate panics across a boundary. Monitor, fade, and preview
//! threads log unexpected failures and abort only the current step.

use thiserror::Error;

/// Main error type for the playout core
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device selection and acquisition errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Stream decode and creation errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Playback-specific errors
    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    /// Preview-specific errors
    #[error("Preview error: {0}")]
    Preview(#[from] PreviewError),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors related to output devices and slots
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Enumerated device disappeared between listing and acquisition
    #[error("Audio device '{device}' is unavailable")]
    Unavailable { device: String },

    /// No device left for the playlist after slot selection and fallback
    #[error("No audio device available")]
    Exhausted,

    /// Backend handle refers to a previous device generation
    #[error("Cached player for device '{device}' is stale")]
    PlayerStale { device: String },

    /// Exclusive driver refused to start
    #[error("Driver start failed for device '{device}': {reason}")]
    DriverStart { device: String, reason: String },
}

/// Errors related to stream creation and decoding
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Decoder rejected the file outright
    #[error("Stream creation failed for {path}: {reason}")]
    StreamCreateFailed { path: String, reason: String },

    /// Container/codec not supported and not in the transcode set
    #[error("Unsupported audio format: {path}")]
    UnsupportedFormat { path: String },

    /// File missing on disk
    #[error("Audio file not found: {path}")]
    FileNotFound { path: String },

    /// Transcode fallback failed
    #[error("Transcode fallback failed for {path}: {reason}")]
    TranscodeFailed { path: String, reason: String },

    /// Resampling to the device rate failed
    #[error("Resampling error: {reason}")]
    Resampling { reason: String },

    /// Backend handle no longer refers to a live stream
    #[error("Unknown stream handle")]
    UnknownStream,
}

/// Errors related to playback operations
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// Item is marked PLAYED and restart was not requested
    #[error("Item already played")]
    AlreadyPlayed,

    /// The backend does not support native sample syncs
    #[error("Native mix triggers not supported by this backend")]
    TriggerUnsupported,

    /// External callback raised; logged and swallowed by the caller
    #[error("Callback error: {0}")]
    Callback(String),
}

/// Errors related to the PFL preview engine
#[derive(Debug, Error)]
pub enum PreviewError {
    /// No PFL device configured
    #[error("No PFL device configured")]
    NoPflDevice,

    /// PFL device is in the busy set
    #[error("PFL device is currently in use")]
    PflBusy,

    /// Configured PFL device is not known to the backend
    #[error("Selected PFL device '{device}' is not available")]
    PflUnavailable { device: String },

    /// One of the preview players could not start
    #[error("Preview setup failed: {reason}")]
    SetupFailed { reason: String },
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, Error>;
