//! Software block mixer backend
//!
//! Sums several decoded sources into one output stream on a single device.
//! A dedicated block thread renders fixed-size quanta, applies per-source
//! gain and micro fades, and writes to a pluggable sink: a ring-buffered
//! cpal stream in production, a pacing null sink in tests.
//!
//! Sources snap mid-file starts to a nearby zero crossing and get a short
//! micro fade-in after start and after each backward seek to mask clicks
//! at offsets and loop wraps.

use crate::backend::decode;
use crate::backend::direct::{spawn_sync_dispatch, EndSync, PositionSync};
use crate::backend::transcode;
use crate::backend::{
    AudioBackend, DeviceId, StreamFlags, StreamId, SyncCallback, SyncId, SyncMode,
};
use crate::error::{DecodeError, Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{traits::*, HeapRb};
use sara_common::params::{MICRO_FADE_SECONDS, MIXER_BLOCK_FRAMES, ZERO_CROSS_WINDOW_SECONDS};
use sara_common::timing;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Destination for mixed blocks
pub trait MixerSink: Send {
    /// Write one interleaved stereo block; paces the caller to real time.
    fn write(&mut self, interleaved: &[f32]) -> Result<()>;
}

/// Builds a sink once the mixer thread is running (sample rate in Hz)
pub type SinkFactory = Arc<dyn Fn(u32) -> Result<Box<dyn MixerSink>> + Send + Sync>;

struct MixerSource {
    samples: Vec<f32>,
    cursor: u64,
    playing: bool,
    halted: bool,
    ended: bool,
    sample_loop: bool,
    gain: f32,
    micro_fade_remaining: u64,
    micro_fade_total: u64,
    syncs: Vec<PositionSync>,
    end_syncs: Vec<EndSync>,
    transcoded: Option<PathBuf>,
}

impl MixerSource {
    fn total_frames(&self) -> u64 {
        (self.samples.len() / 2) as u64
    }
}

/// Block-summing backend bound to one output device
pub struct MixerBackend {
    device: DeviceId,
    sample_rate: u32,
    transcode_extensions: Vec<String>,
    next_id: AtomicU64,
    sources: Arc<Mutex<HashMap<u64, MixerSource>>>,
    stop: Arc<AtomicBool>,
    dispatch_tx: mpsc::UnboundedSender<SyncCallback>,
    micro_fade_frames: u64,
    zero_cross_frames: u64,
}

impl MixerBackend {
    /// Mixer with an explicit sink factory; the block thread starts
    /// immediately and idles until a source plays.
    pub fn new(
        device: DeviceId,
        sample_rate: u32,
        transcode_extensions: Vec<String>,
        sink_factory: SinkFactory,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        spawn_sync_dispatch(dispatch_rx);

        let backend = Arc::new(Self {
            device,
            sample_rate,
            transcode_extensions,
            next_id: AtomicU64::new(1),
            sources: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            dispatch_tx,
            micro_fade_frames: timing::seconds_to_frames(MICRO_FADE_SECONDS, sample_rate).max(1),
            zero_cross_frames: timing::seconds_to_frames(ZERO_CROSS_WINDOW_SECONDS, sample_rate)
                .max(1),
        });

        let sources = Arc::clone(&backend.sources);
        let stop = Arc::clone(&backend.stop);
        let dispatch = backend.dispatch_tx.clone();
        let rate = sample_rate;
        let spawned = thread::Builder::new()
            .name(format!("mixer-{}", backend.device))
            .spawn(move || run_mixer_loop(rate, sources, stop, dispatch, sink_factory));
        if let Err(e) = spawned {
            error!("Failed to spawn mixer thread: {}", e);
        }

        backend
    }

    /// Mixer writing to the device through a ring-buffered cpal stream.
    pub fn for_device(device: DeviceId, transcode_extensions: Vec<String>) -> Arc<Self> {
        let sample_rate = probe_device_rate(&device).unwrap_or(44100);
        let name = device.clone();
        let factory: SinkFactory =
            Arc::new(move |rate| CpalSink::open(&name, rate).map(|s| Box::new(s) as Box<dyn MixerSink>));
        Self::new(device, sample_rate, transcode_extensions, factory)
    }

    /// Mixer writing to a pacing null sink (tests, silent rendering).
    pub fn with_null_sink(
        device: DeviceId,
        sample_rate: u32,
        transcode_extensions: Vec<String>,
    ) -> Arc<Self> {
        let factory: SinkFactory =
            Arc::new(move |rate| Ok(Box::new(NullSink { sample_rate: rate }) as Box<dyn MixerSink>));
        Self::new(device, sample_rate, transcode_extensions, factory)
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Stop the block thread and drop every source.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
        let mut sources = self.sources.lock().unwrap();
        for (_, source) in sources.drain() {
            if let Some(temp) = source.transcoded {
                transcode::cleanup_temp(&temp);
            }
        }
    }
}

impl Drop for MixerBackend {
    fn drop(&mut self) {
        self.close();
    }
}

impl AudioBackend for MixerBackend {
    fn name(&self) -> &'static str {
        "mixer"
    }

    fn create_stream(
        &self,
        device: &DeviceId,
        path: &std::path::Path,
        flags: StreamFlags,
    ) -> Result<StreamId> {
        if device != &self.device {
            return Err(Error::Device(crate::error::DeviceError::Unavailable {
                device: device.to_string(),
            }));
        }

        let decoded_result = decode::decode_file(path, self.sample_rate);
        let (decoded, transcoded) = match decoded_result {
            Ok(d) => (d, None),
            Err(Error::Decode(DecodeError::UnsupportedFormat { .. }))
                if transcode::is_transcode_candidate(path, &self.transcode_extensions) =>
            {
                let temp = transcode::transcode_to_wav(path)?;
                match decode::decode_file(&temp, self.sample_rate) {
                    Ok(d) => (d, Some(temp)),
                    Err(e) => {
                        transcode::cleanup_temp(&temp);
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let source = MixerSource {
            samples: decoded.samples,
            cursor: 0,
            playing: false,
            halted: false,
            ended: false,
            sample_loop: flags.sample_loop,
            gain: 1.0,
            micro_fade_remaining: self.micro_fade_frames,
            micro_fade_total: self.micro_fade_frames,
            syncs: Vec::new(),
            end_syncs: Vec::new(),
            transcoded,
        };
        self.sources.lock().unwrap().insert(id, source);
        debug!("Mixer source {} created for {}", id, path.display());
        Ok(StreamId(id))
    }

    fn free_stream(&self, stream: StreamId) {
        if let Some(source) = self.sources.lock().unwrap().remove(&stream.0) {
            if let Some(temp) = source.transcoded {
                transcode::cleanup_temp(&temp);
            }
        }
    }

    fn play(&self, stream: StreamId) -> Result<()> {
        let mut sources = self.sources.lock().unwrap();
        let source = sources
            .get_mut(&stream.0)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        if source.ended {
            source.cursor = 0;
            source.ended = false;
        }
        source.halted = false;
        source.playing = true;
        Ok(())
    }

    fn pause(&self, stream: StreamId) {
        if let Some(source) = self.sources.lock().unwrap().get_mut(&stream.0) {
            source.playing = false;
        }
    }

    fn stop(&self, stream: StreamId) {
        if let Some(source) = self.sources.lock().unwrap().get_mut(&stream.0) {
            source.playing = false;
            source.halted = true;
            source.syncs.clear();
            source.end_syncs.clear();
        }
    }

    fn position_seconds(&self, stream: StreamId) -> f64 {
        self.sources
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| timing::frames_to_seconds(s.cursor, self.sample_rate))
            .unwrap_or(0.0)
    }

    fn set_position_seconds(&self, stream: StreamId, seconds: f64) {
        let mut sources = self.sources.lock().unwrap();
        if let Some(source) = sources.get_mut(&stream.0) {
            let target = timing::seconds_to_frames(seconds, self.sample_rate);
            let snapped = snap_to_zero_crossing(&source.samples, target, self.zero_cross_frames)
                .min(source.total_frames());
            let backwards = snapped < source.cursor;
            source.cursor = snapped;
            if backwards {
                source.micro_fade_remaining = self.micro_fade_frames;
                source.micro_fade_total = self.micro_fade_frames;
            }
        }
    }

    fn length_seconds(&self, stream: StreamId) -> f64 {
        self.sources
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| timing::frames_to_seconds(s.total_frames(), self.sample_rate))
            .unwrap_or(0.0)
    }

    fn set_volume(&self, stream: StreamId, gain: f32) {
        if let Some(source) = self.sources.lock().unwrap().get_mut(&stream.0) {
            source.gain = gain.max(0.0);
        }
    }

    fn is_active(&self, stream: StreamId) -> bool {
        self.sources
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| !s.ended && !s.halted)
            .unwrap_or(false)
    }

    fn add_sync_position(
        &self,
        stream: StreamId,
        seconds: f64,
        mode: SyncMode,
        callback: SyncCallback,
    ) -> Result<SyncId> {
        let mut sources = self.sources.lock().unwrap();
        let source = sources
            .get_mut(&stream.0)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        let id = SyncId(self.next_id.fetch_add(1, Ordering::Relaxed));
        source.syncs.push(PositionSync {
            id,
            frame: timing::seconds_to_frames(seconds, self.sample_rate),
            mode,
            armed: true,
            callback,
        });
        Ok(id)
    }

    fn add_sync_end(&self, stream: StreamId, callback: SyncCallback) -> Result<SyncId> {
        let mut sources = self.sources.lock().unwrap();
        let source = sources
            .get_mut(&stream.0)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        let id = SyncId(self.next_id.fetch_add(1, Ordering::Relaxed));
        source.end_syncs.push(EndSync {
            id,
            fired: false,
            callback,
        });
        Ok(id)
    }

    fn remove_sync(&self, stream: StreamId, sync: SyncId) {
        if let Some(source) = self.sources.lock().unwrap().get_mut(&stream.0) {
            source.syncs.retain(|s| s.id != sync);
            source.end_syncs.retain(|s| s.id != sync);
        }
    }

    fn supports_mix_trigger(&self) -> bool {
        true
    }
}

/// Block loop: render, pace through the sink, hand off fired syncs.
fn run_mixer_loop(
    sample_rate: u32,
    sources: Arc<Mutex<HashMap<u64, MixerSource>>>,
    stop: Arc<AtomicBool>,
    dispatch: mpsc::UnboundedSender<SyncCallback>,
    sink_factory: SinkFactory,
) {
    let mut sink = match sink_factory(sample_rate) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Mixer sink unavailable: {}", e);
            return;
        }
    };

    let mut block = vec![0.0f32; MIXER_BLOCK_FRAMES * 2];

    while !stop.load(Ordering::Acquire) {
        block.iter_mut().for_each(|s| *s = 0.0);
        let mut any_active = false;

        {
            let mut sources = sources.lock().unwrap();
            for source in sources.values_mut() {
                if source.playing {
                    any_active = true;
                    mix_source_block(source, &mut block, &dispatch);
                }
            }
        }

        if !any_active {
            thread::sleep(Duration::from_millis(5));
            continue;
        }

        if let Err(e) = sink.write(&block) {
            error!("Mixer sink write failed: {}", e);
            break;
        }
    }
}

fn mix_source_block(
    source: &mut MixerSource,
    block: &mut [f32],
    dispatch: &mpsc::UnboundedSender<SyncCallback>,
) {
    let total = source.total_frames();
    let before = source.cursor;
    let frames_out = block.len() / 2;
    let mut cursor = before;
    let mut wrapped = false;

    for i in 0..frames_out {
        if cursor >= total {
            if source.sample_loop {
                cursor = 0;
                wrapped = true;
                source.micro_fade_remaining = source.micro_fade_total;
            } else {
                break;
            }
        }

        let mut factor = source.gain;
        if source.micro_fade_remaining > 0 {
            let progress =
                1.0 - source.micro_fade_remaining as f32 / source.micro_fade_total as f32;
            factor *= progress;
            source.micro_fade_remaining -= 1;
        }

        let si = (cursor * 2) as usize;
        block[i * 2] += source.samples[si] * factor;
        block[i * 2 + 1] += source.samples[si + 1] * factor;
        cursor += 1;
    }

    let ended = cursor >= total && !source.sample_loop;
    source.cursor = cursor.min(total);

    for sync in source.syncs.iter_mut() {
        if sync.armed {
            let crossed = if wrapped {
                before < sync.frame || cursor >= sync.frame
            } else {
                before < sync.frame && cursor >= sync.frame
            };
            if crossed {
                sync.armed = false;
                let _ = dispatch.send(Arc::clone(&sync.callback));
            }
        } else if cursor < sync.frame {
            sync.armed = true;
        }
    }

    if ended {
        source.playing = false;
        source.ended = true;
        for sync in source.end_syncs.iter_mut() {
            if !sync.fired {
                sync.fired = true;
                let _ = dispatch.send(Arc::clone(&sync.callback));
            }
        }
    }
}

/// Find the zero crossing nearest to `target_frame` within the window.
fn snap_to_zero_crossing(samples: &[f32], target_frame: u64, window: u64) -> u64 {
    let total = (samples.len() / 2) as u64;
    if target_frame == 0 || total == 0 {
        return target_frame.min(total);
    }
    let target = target_frame.min(total);
    let start = target.saturating_sub(window);
    let end = (target + window).min(total);
    if end <= start + 1 {
        return target;
    }

    let mut best: Option<(u64, u64)> = None;
    let mut prev = samples[(start * 2) as usize];
    for frame in (start + 1)..end {
        let cur = samples[(frame * 2) as usize];
        if prev == 0.0 || prev * cur <= 0.0 {
            let dist = frame.abs_diff(target);
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((frame, dist));
            }
        }
        prev = cur;
    }
    best.map(|(frame, _)| frame).unwrap_or(target)
}

/// Null sink that paces writes to real time without touching hardware.
struct NullSink {
    sample_rate: u32,
}

impl MixerSink for NullSink {
    fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        let frames = interleaved.len() / 2;
        thread::sleep(Duration::from_secs_f64(
            frames as f64 / self.sample_rate as f64,
        ));
        Ok(())
    }
}

/// cpal sink fed through a lock-free ring buffer.
struct CpalSink {
    producer: ringbuf::HeapProd<f32>,
    _stream: cpal::Stream,
}

// cpal::Stream is only !Send because of a conservative marker covering platforms
// (e.g. emscripten) that don't apply here; the stream is never touched after
// construction except to keep it alive, so moving it across threads is sound.
unsafe impl Send for CpalSink {}

impl CpalSink {
    fn open(device_id: &DeviceId, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let mut candidates = host.output_devices().map_err(|e| {
            Error::Other(anyhow::anyhow!("failed to enumerate devices: {}", e))
        })?;
        let device = candidates
            .find(|d| d.name().ok().as_deref() == Some(device_id.as_str()))
            .ok_or_else(|| crate::error::DeviceError::Unavailable {
                device: device_id.to_string(),
            })?;

        let config = cpal::StreamConfig {
            channels: 2,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Half a second of headroom between the block thread and the callback
        let rb = HeapRb::<f32>::new(sample_rate as usize);
        let (producer, mut consumer) = rb.split();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let got = consumer.pop_slice(data);
                    for sample in data.iter_mut().skip(got) {
                        *sample = 0.0;
                    }
                },
                move |err| {
                    warn!("Mixer output stream error: {}", err);
                },
                None,
            )
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to build mixer stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to start mixer stream: {}", e)))?;

        Ok(Self {
            producer,
            _stream: stream,
        })
    }
}

impl MixerSink for CpalSink {
    fn write(&mut self, interleaved: &[f32]) -> Result<()> {
        let mut written = 0;
        while written < interleaved.len() {
            written += self.producer.push_slice(&interleaved[written..]);
            if written < interleaved.len() {
                thread::sleep(Duration::from_millis(2));
            }
        }
        Ok(())
    }
}

fn probe_device_rate(device_id: &DeviceId) -> Option<u32> {
    let host = cpal::default_host();
    let mut devices = host.output_devices().ok()?;
    let device = devices.find(|d| d.name().ok().as_deref() == Some(device_id.as_str()))?;
    crate::backend::direct::best_output_config(&device)
        .ok()
        .map(|(config, _)| config.sample_rate.0)
}
