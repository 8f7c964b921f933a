//! File decoding to interleaved stereo f32
//!
//! Streams are prescan-decoded with symphonia, folded to stereo, and
//! resampled to the device rate with rubato so backend position math stays
//! exact (one frame = one sample clock tick at the device rate).

use crate::error::{DecodeError, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Fully decoded audio, interleaved stereo f32 at `sample_rate`
#[derive(Debug)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn frames(&self) -> u64 {
        (self.samples.len() / 2) as u64
    }

    pub fn duration_seconds(&self) -> f64 {
        sara_common::timing::frames_to_seconds(self.frames(), self.sample_rate)
    }
}

/// Decode a whole file to stereo f32 at `target_rate`.
///
/// Fails with `UnsupportedFormat` when symphonia cannot probe the container
/// or find a playable track, so the caller can route to the transcode
/// fallback.
pub fn decode_file(path: &Path, target_rate: u32) -> Result<DecodedAudio> {
    let (samples, source_rate) = decode_native(path)?;

    let samples = if source_rate == target_rate {
        samples
    } else {
        resample_stereo(&samples, source_rate, target_rate)?
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: target_rate,
    })
}

/// Decode a file at its native rate, folded to stereo.
pub fn decode_native(path: &Path) -> Result<(Vec<f32>, u32)> {
    debug!("Decoding {}", path.display());

    if !path.exists() {
        return Err(DecodeError::FileNotFound {
            path: path.display().to_string(),
        }
        .into());
    }

    let file = std::fs::File::open(path).map_err(|e| DecodeError::StreamCreateFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|_| DecodeError::UnsupportedFormat {
            path: path.display().to_string(),
        })?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::UnsupportedFormat {
            path: path.display().to_string(),
        })?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| DecodeError::StreamCreateFailed {
            path: path.display().to_string(),
            reason: "sample rate missing".into(),
        })?;

    let channels = codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(2)
        .max(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|_| DecodeError::UnsupportedFormat {
            path: path.display().to_string(),
        })?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                warn!("Packet read error in {}: {}", path.display(), e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_buf.is_none() {
                    let spec = *decoded.spec();
                    sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                }
                let buf = sample_buf.as_mut().unwrap();
                buf.copy_interleaved_ref(decoded);
                interleaved.extend_from_slice(buf.samples());
            }
            Err(e) => {
                warn!("Decode error in {}: {}", path.display(), e);
                continue;
            }
        }
    }

    if interleaved.is_empty() {
        return Err(DecodeError::StreamCreateFailed {
            path: path.display().to_string(),
            reason: "no decodable audio data".into(),
        }
        .into());
    }

    let stereo = fold_to_stereo(&interleaved, channels);
    debug!(
        "Decoded {} frames at {} Hz from {}",
        stereo.len() / 2,
        sample_rate,
        path.display()
    );
    Ok((stereo, sample_rate))
}

/// Fold any channel count to interleaved stereo.
///
/// Mono duplicates; more than two channels keep the first pair.
pub fn fold_to_stereo(interleaved: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => interleaved.to_vec(),
        1 => {
            let mut out = Vec::with_capacity(interleaved.len() * 2);
            for &s in interleaved {
                out.push(s);
                out.push(s);
            }
            out
        }
        n => {
            let frames = interleaved.len() / n;
            let mut out = Vec::with_capacity(frames * 2);
            for frame in 0..frames {
                out.push(interleaved[frame * n]);
                out.push(interleaved[frame * n + 1]);
            }
            out
        }
    }
}

/// One-shot stereo resample via rubato.
fn resample_stereo(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    let frames = input.len() / 2;
    if frames == 0 {
        return Ok(Vec::new());
    }

    debug!("Resampling {} -> {} Hz ({} frames)", input_rate, output_rate, frames);

    let planar: Vec<Vec<f32>> = vec![
        input.iter().step_by(2).copied().collect(),
        input.iter().skip(1).step_by(2).copied().collect(),
    ];

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        frames,
        2,
    )
    .map_err(|e| DecodeError::Resampling {
        reason: e.to_string(),
    })?;

    let planar_out = resampler
        .process(&planar, None)
        .map_err(|e| DecodeError::Resampling {
            reason: e.to_string(),
        })?;

    let out_frames = planar_out[0].len();
    let mut out = Vec::with_capacity(out_frames * 2);
    for i in 0..out_frames {
        out.push(planar_out[0][i]);
        out.push(planar_out[1][i]);
    }
    Ok(out)
}
