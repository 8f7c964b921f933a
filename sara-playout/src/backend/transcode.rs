//! Transcode fallback for unsupported containers
//!
//! When stream creation fails with an unsupported-format error and the file
//! extension is in the configured transcode set, the backend decodes the
//! file once and rewrites it as a temporary WAV, then opens that. The temp
//! path is keyed to the stream that uses it and removed on free, including
//! error paths; files abandoned by a crash are acceptable.

use crate::backend::decode;
use crate::error::{DecodeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// True when the extension qualifies for the WAV fallback.
pub fn is_transcode_candidate(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Decode `path` and write it as a temp WAV; returns the temp path.
pub fn transcode_to_wav(path: &Path) -> Result<PathBuf> {
    let (samples, sample_rate) =
        decode::decode_native(path).map_err(|e| DecodeError::TranscodeFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let temp_path = std::env::temp_dir().join(format!("sara-transcode-{}.wav", Uuid::new_v4()));

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer =
        hound::WavWriter::create(&temp_path, spec).map_err(|e| DecodeError::TranscodeFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let write_result = (|| -> std::result::Result<(), hound::Error> {
        for &sample in &samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()
    })();

    if let Err(e) = write_result {
        cleanup_temp(&temp_path);
        return Err(DecodeError::TranscodeFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
        .into());
    }

    debug!(
        "Transcoded {} -> {}",
        path.display(),
        temp_path.display()
    );
    Ok(temp_path)
}

/// Remove a transcode temp file; missing files are not an error.
pub fn cleanup_temp(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed transcode temp {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove transcode temp {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec!["m4a".into(), "wma".into()]
    }

    #[test]
    fn test_candidate_matches_case_insensitive() {
        assert!(is_transcode_candidate(Path::new("/x/track.M4A"), &exts()));
        assert!(is_transcode_candidate(Path::new("/x/track.m4a"), &exts()));
    }

    #[test]
    fn test_candidate_rejects_others() {
        assert!(!is_transcode_candidate(Path::new("/x/track.flac"), &exts()));
        assert!(!is_transcode_candidate(Path::new("/x/noext"), &exts()));
    }

    #[test]
    fn test_cleanup_missing_is_silent() {
        cleanup_temp(Path::new("/tmp/sara-transcode-does-not-exist.wav"));
    }

    #[test]
    fn test_transcode_missing_source_fails() {
        let err = transcode_to_wav(Path::new("/nonexistent/in.m4a")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Decode(DecodeError::TranscodeFailed { .. })
        ));
    }
}
