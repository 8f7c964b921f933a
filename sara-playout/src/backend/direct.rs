//! Shared-device output backend
//!
//! One render stream per output device, summing every active decoded stream
//! bound to it. Streams are prescan-decoded to stereo f32 at the device
//! rate, so the render cursor is the sample clock: position queries, seeks,
//! and sync evaluation all work in frames.
//!
//! The cpal stream object is not `Send`, so each device output lives on a
//! dedicated thread that builds the stream and keeps it alive until the
//! backend drops it. Fired syncs are pushed to a dispatch thread; the
//! render callback never runs user code.

use crate::backend::decode;
use crate::backend::device::DeviceManager;
use crate::backend::transcode;
use crate::backend::{
    AudioBackend, DeviceId, StreamFlags, StreamId, SyncCallback, SyncId, SyncMode,
};
use crate::error::{DecodeError, DeviceError, Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use sara_common::timing;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Registered position sync
pub(crate) struct PositionSync {
    pub(crate) id: SyncId,
    pub(crate) frame: u64,
    #[allow(dead_code)]
    pub(crate) mode: SyncMode,
    pub(crate) armed: bool,
    pub(crate) callback: SyncCallback,
}

/// Registered end-of-data sync
pub(crate) struct EndSync {
    pub(crate) id: SyncId,
    pub(crate) fired: bool,
    pub(crate) callback: SyncCallback,
}

/// One decoded stream and its render state
pub(crate) struct StreamState {
    pub(crate) device: DeviceId,
    pub(crate) sample_rate: u32,
    pub(crate) samples: Vec<f32>,
    /// Frame cursor; written by the render thread, read anywhere
    pub(crate) cursor: AtomicU64,
    pub(crate) playing: AtomicBool,
    /// Set by `stop`; cleared by `play`
    pub(crate) halted: AtomicBool,
    /// Reached end-of-data without a loop flag
    pub(crate) ended: AtomicBool,
    pub(crate) sample_loop: bool,
    pub(crate) gain: Mutex<f32>,
    pub(crate) syncs: Mutex<Vec<PositionSync>>,
    pub(crate) end_syncs: Mutex<Vec<EndSync>>,
    pub(crate) transcoded: Mutex<Option<PathBuf>>,
}

impl StreamState {
    pub(crate) fn total_frames(&self) -> u64 {
        (self.samples.len() / 2) as u64
    }
}

/// Stream table shared between the backend API and its render threads
pub(crate) struct SharedStreams {
    next_id: AtomicU64,
    pub(crate) streams: Mutex<HashMap<u64, Arc<StreamState>>>,
}

impl SharedStreams {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn get(&self, stream: StreamId) -> Option<Arc<StreamState>> {
        self.streams.lock().unwrap().get(&stream.0).cloned()
    }

    pub(crate) fn remove(&self, stream: StreamId) -> Option<Arc<StreamState>> {
        self.streams.lock().unwrap().remove(&stream.0)
    }
}

/// Mix one stream's next block into `data` (interleaved stereo), advancing
/// its cursor and firing syncs through the dispatch channel.
pub(crate) fn mix_stream_block(
    state: &StreamState,
    data: &mut [f32],
    extra_gain: f32,
    dispatch: &mpsc::UnboundedSender<SyncCallback>,
) {
    if !state.playing.load(Ordering::Acquire) {
        return;
    }

    let total = state.total_frames();
    let before = state.cursor.load(Ordering::Acquire);
    let gain = *state.gain.lock().unwrap() * extra_gain;
    let frames_out = data.len() / 2;

    let mut cursor = before;
    let mut wrapped = false;
    for i in 0..frames_out {
        if cursor >= total {
            if state.sample_loop {
                cursor = 0;
                wrapped = true;
            } else {
                break;
            }
        }
        let si = (cursor * 2) as usize;
        data[i * 2] += state.samples[si] * gain;
        data[i * 2 + 1] += state.samples[si + 1] * gain;
        cursor += 1;
    }

    let ended = cursor >= total && !state.sample_loop;
    state.cursor.store(cursor.min(total), Ordering::Release);

    fire_position_syncs(state, before, cursor, wrapped, dispatch);

    if ended {
        state.playing.store(false, Ordering::Release);
        state.ended.store(true, Ordering::Release);
        fire_end_syncs(state, dispatch);
    }
}

/// Fire position syncs crossed in `(before, after]`; re-arm syncs the
/// cursor has moved back behind (loop jumps retrigger them).
pub(crate) fn fire_position_syncs(
    state: &StreamState,
    before: u64,
    after: u64,
    wrapped: bool,
    dispatch: &mpsc::UnboundedSender<SyncCallback>,
) {
    let mut syncs = state.syncs.lock().unwrap();
    for sync in syncs.iter_mut() {
        if sync.armed {
            let crossed = if wrapped {
                before < sync.frame || after >= sync.frame
            } else {
                before < sync.frame && after >= sync.frame
            };
            if crossed {
                sync.armed = false;
                let _ = dispatch.send(Arc::clone(&sync.callback));
            }
        } else if after < sync.frame {
            sync.armed = true;
        }
    }
}

pub(crate) fn fire_end_syncs(state: &StreamState, dispatch: &mpsc::UnboundedSender<SyncCallback>) {
    let mut end_syncs = state.end_syncs.lock().unwrap();
    for sync in end_syncs.iter_mut() {
        if !sync.fired {
            sync.fired = true;
            let _ = dispatch.send(Arc::clone(&sync.callback));
        }
    }
}

/// Spawn the thread that invokes fired sync callbacks off the render path.
pub(crate) fn spawn_sync_dispatch(mut rx: mpsc::UnboundedReceiver<SyncCallback>) {
    let spawned = thread::Builder::new()
        .name("sync-dispatch".into())
        .spawn(move || {
            while let Some(callback) = rx.blocking_recv() {
                callback();
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn sync dispatch thread: {}", e);
    }
}

struct OutputHandle {
    stop: Arc<AtomicBool>,
    sample_rate: u32,
}

/// Backend for shared (non-exclusive) output devices
pub struct DirectBackend {
    devices: Arc<DeviceManager>,
    transcode_extensions: Vec<String>,
    shared: Arc<SharedStreams>,
    outputs: Mutex<HashMap<DeviceId, OutputHandle>>,
    dispatch_tx: mpsc::UnboundedSender<SyncCallback>,
}

impl DirectBackend {
    pub fn new(devices: Arc<DeviceManager>, transcode_extensions: Vec<String>) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        spawn_sync_dispatch(dispatch_rx);
        Arc::new(Self {
            devices,
            transcode_extensions,
            shared: Arc::new(SharedStreams::new()),
            outputs: Mutex::new(HashMap::new()),
            dispatch_tx,
        })
    }

    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    /// Ensure the device's render thread is up; returns its sample rate.
    fn ensure_output(&self, device: &DeviceId) -> Result<u32> {
        {
            let outputs = self.outputs.lock().unwrap();
            if let Some(handle) = outputs.get(device) {
                return Ok(handle.sample_rate);
            }
        }

        if !self.devices.is_known(device) {
            self.devices.refresh();
            if !self.devices.is_known(device) {
                return Err(DeviceError::Unavailable {
                    device: device.to_string(),
                }
                .into());
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (rate_tx, rate_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let shared = Arc::clone(&self.shared);
        let dispatch = self.dispatch_tx.clone();
        let device_id = device.clone();
        let thread_stop = Arc::clone(&stop);

        thread::Builder::new()
            .name(format!("output-{}", device))
            .spawn(move || {
                run_device_output(device_id, shared, dispatch, thread_stop, rate_tx);
            })
            .map_err(|e| Error::Io(e))?;

        match rate_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(sample_rate)) => {
                info!("Output ready on {} at {} Hz", device, sample_rate);
                self.outputs.lock().unwrap().insert(
                    device.clone(),
                    OutputHandle { stop, sample_rate },
                );
                Ok(sample_rate)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                stop.store(true, Ordering::Release);
                Err(DeviceError::Unavailable {
                    device: device.to_string(),
                }
                .into())
            }
        }
    }

    fn decode_with_fallback(
        &self,
        path: &Path,
        rate: u32,
    ) -> Result<(decode::DecodedAudio, Option<PathBuf>)> {
        match decode::decode_file(path, rate) {
            Ok(decoded) => Ok((decoded, None)),
            Err(Error::Decode(DecodeError::UnsupportedFormat { .. }))
                if transcode::is_transcode_candidate(path, &self.transcode_extensions) =>
            {
                info!("Transcode fallback for {}", path.display());
                let temp = transcode::transcode_to_wav(path)?;
                match decode::decode_file(&temp, rate) {
                    Ok(decoded) => Ok((decoded, Some(temp))),
                    Err(e) => {
                        transcode::cleanup_temp(&temp);
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl AudioBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn create_stream(
        &self,
        device: &DeviceId,
        path: &Path,
        flags: StreamFlags,
    ) -> Result<StreamId> {
        let rate = self.ensure_output(device)?;
        let (decoded, transcoded) = self.decode_with_fallback(path, rate)?;

        let id = self.shared.next_id();
        let state = Arc::new(StreamState {
            device: device.clone(),
            sample_rate: decoded.sample_rate,
            samples: decoded.samples,
            cursor: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            sample_loop: flags.sample_loop,
            gain: Mutex::new(1.0),
            syncs: Mutex::new(Vec::new()),
            end_syncs: Mutex::new(Vec::new()),
            transcoded: Mutex::new(transcoded),
        });
        self.shared.streams.lock().unwrap().insert(id, state);
        debug!("Stream {} created on {} for {}", id, device, path.display());
        Ok(StreamId(id))
    }

    fn free_stream(&self, stream: StreamId) {
        if let Some(state) = self.shared.remove(stream) {
            state.playing.store(false, Ordering::Release);
            if let Some(temp) = state.transcoded.lock().unwrap().take() {
                transcode::cleanup_temp(&temp);
            }
            debug!("Stream {} freed", stream.0);
        }
    }

    fn play(&self, stream: StreamId) -> Result<()> {
        let state = self
            .shared
            .get(stream)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        if state.ended.load(Ordering::Acquire) {
            state.cursor.store(0, Ordering::Release);
            state.ended.store(false, Ordering::Release);
        }
        state.halted.store(false, Ordering::Release);
        state.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&self, stream: StreamId) {
        if let Some(state) = self.shared.get(stream) {
            state.playing.store(false, Ordering::Release);
        }
    }

    fn stop(&self, stream: StreamId) {
        if let Some(state) = self.shared.get(stream) {
            state.playing.store(false, Ordering::Release);
            state.halted.store(true, Ordering::Release);
            state.syncs.lock().unwrap().clear();
            state.end_syncs.lock().unwrap().clear();
        }
    }

    fn position_seconds(&self, stream: StreamId) -> f64 {
        self.shared
            .get(stream)
            .map(|s| timing::frames_to_seconds(s.cursor.load(Ordering::Acquire), s.sample_rate))
            .unwrap_or(0.0)
    }

    fn set_position_seconds(&self, stream: StreamId, seconds: f64) {
        if let Some(state) = self.shared.get(stream) {
            let frame =
                timing::seconds_to_frames(seconds, state.sample_rate).min(state.total_frames());
            state.cursor.store(frame, Ordering::Release);
        }
    }

    fn length_seconds(&self, stream: StreamId) -> f64 {
        self.shared
            .get(stream)
            .map(|s| timing::frames_to_seconds(s.total_frames(), s.sample_rate))
            .unwrap_or(0.0)
    }

    fn set_volume(&self, stream: StreamId, gain: f32) {
        if let Some(state) = self.shared.get(stream) {
            *state.gain.lock().unwrap() = gain.max(0.0);
        }
    }

    fn is_active(&self, stream: StreamId) -> bool {
        self.shared
            .get(stream)
            .map(|s| !s.ended.load(Ordering::Acquire) && !s.halted.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn add_sync_position(
        &self,
        stream: StreamId,
        seconds: f64,
        mode: SyncMode,
        callback: SyncCallback,
    ) -> Result<SyncId> {
        let state = self
            .shared
            .get(stream)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        let id = SyncId(self.shared.next_id());
        let frame = timing::seconds_to_frames(seconds, state.sample_rate);
        state.syncs.lock().unwrap().push(PositionSync {
            id,
            frame,
            mode,
            armed: true,
            callback,
        });
        Ok(id)
    }

    fn add_sync_end(&self, stream: StreamId, callback: SyncCallback) -> Result<SyncId> {
        let state = self
            .shared
            .get(stream)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        let id = SyncId(self.shared.next_id());
        state.end_syncs.lock().unwrap().push(EndSync {
            id,
            fired: false,
            callback,
        });
        Ok(id)
    }

    fn remove_sync(&self, stream: StreamId, sync: SyncId) {
        if let Some(state) = self.shared.get(stream) {
            state.syncs.lock().unwrap().retain(|s| s.id != sync);
            state.end_syncs.lock().unwrap().retain(|s| s.id != sync);
        }
    }

    fn supports_mix_trigger(&self) -> bool {
        true
    }
}

impl Drop for DirectBackend {
    fn drop(&mut self) {
        for (_, handle) in self.outputs.lock().unwrap().drain() {
            handle.stop.store(true, Ordering::Release);
        }
    }
}

/// Owns the cpal stream for one device; exits when the stop flag is set.
fn run_device_output(
    device_id: DeviceId,
    shared: Arc<SharedStreams>,
    dispatch: mpsc::UnboundedSender<SyncCallback>,
    stop: Arc<AtomicBool>,
    rate_tx: std::sync::mpsc::Sender<Result<u32>>,
) {
    let built = build_cpal_stream(&device_id, shared, dispatch);
    let (stream, sample_rate) = match built {
        Ok(pair) => pair,
        Err(e) => {
            let _ = rate_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = rate_tx.send(Err(Error::Other(anyhow::anyhow!(
            "failed to start output stream on {}: {}",
            device_id,
            e
        ))));
        return;
    }
    let _ = rate_tx.send(Ok(sample_rate));

    while !stop.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
    debug!("Output thread for {} exited", device_id);
}

fn build_cpal_stream(
    device_id: &DeviceId,
    shared: Arc<SharedStreams>,
    dispatch: mpsc::UnboundedSender<SyncCallback>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let mut candidates = host.output_devices().map_err(|e| {
        Error::Other(anyhow::anyhow!("failed to enumerate devices: {}", e))
    })?;

    let device = candidates
        .find(|d| d.name().ok().as_deref() == Some(device_id.as_str()))
        .ok_or_else(|| DeviceError::Unavailable {
            device: device_id.to_string(),
        })?;

    let (config, sample_format) = best_output_config(&device)?;
    if sample_format != SampleFormat::F32 {
        return Err(Error::Other(anyhow::anyhow!(
            "device {} offers no f32 output format",
            device_id
        )));
    }

    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let render_device = device_id.clone();
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                scratch.clear();
                scratch.resize(frames * 2, 0.0);

                let states: Vec<Arc<StreamState>> = {
                    let streams = shared.streams.lock().unwrap();
                    streams
                        .values()
                        .filter(|s| s.device == render_device)
                        .cloned()
                        .collect()
                };
                for state in &states {
                    mix_stream_block(state, &mut scratch, 1.0, &dispatch);
                }

                for frame_idx in 0..frames {
                    let left = scratch[frame_idx * 2].clamp(-1.0, 1.0);
                    let right = scratch[frame_idx * 2 + 1].clamp(-1.0, 1.0);
                    let out = &mut data[frame_idx * channels..(frame_idx + 1) * channels];
                    out[0] = left;
                    if channels > 1 {
                        out[1] = right;
                    }
                    for extra in out.iter_mut().skip(2) {
                        *extra = 0.0;
                    }
                }
            },
            move |err| {
                warn!("Output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to build output stream: {}", e)))?;

    Ok((stream, sample_rate))
}

/// Prefer 44.1 kHz stereo f32, else the device default.
pub(crate) fn best_output_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat)> {
    let mut supported = device.supported_output_configs().map_err(|e| {
        Error::Other(anyhow::anyhow!("failed to get device configs: {}", e))
    })?;

    let preferred = supported.find(|config| {
        config.channels() == 2
            && config.min_sample_rate().0 <= 44100
            && config.max_sample_rate().0 >= 44100
            && config.sample_format() == SampleFormat::F32
    });

    if let Some(config) = preferred {
        let sample_format = config.sample_format();
        let config = config.with_sample_rate(cpal::SampleRate(44100)).config();
        return Ok((config, sample_format));
    }

    let default = device.default_output_config().map_err(|e| {
        Error::Other(anyhow::anyhow!("failed to get default config: {}", e))
    })?;
    let sample_format = default.sample_format();
    Ok((default.config(), sample_format))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(frames: u64, sample_loop: bool) -> StreamState {
        StreamState {
            device: DeviceId::from("test"),
            sample_rate: 1000,
            samples: vec![0.5; (frames * 2) as usize],
            cursor: AtomicU64::new(0),
            playing: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            sample_loop,
            gain: Mutex::new(1.0),
            syncs: Mutex::new(Vec::new()),
            end_syncs: Mutex::new(Vec::new()),
            transcoded: Mutex::new(None),
        }
    }

    #[test]
    fn test_mix_block_advances_cursor() {
        let state = test_state(1000, false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut block = vec![0.0f32; 256 * 2];
        mix_stream_block(&state, &mut block, 1.0, &tx);
        assert_eq!(state.cursor.load(Ordering::Acquire), 256);
        assert!((block[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mix_block_applies_gain() {
        let state = test_state(100, false);
        *state.gain.lock().unwrap() = 0.5;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut block = vec![0.0f32; 8];
        mix_stream_block(&state, &mut block, 1.0, &tx);
        assert!((block[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_mix_block_ends_stream() {
        let state = test_state(100, false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        state.end_syncs.lock().unwrap().push(EndSync {
            id: SyncId(1),
            fired: false,
            callback: Arc::new(move || fired_clone.store(true, Ordering::SeqCst)),
        });

        let mut block = vec![0.0f32; 256 * 2];
        mix_stream_block(&state, &mut block, 1.0, &tx);

        assert!(state.ended.load(Ordering::Acquire));
        assert!(!state.playing.load(Ordering::Acquire));
        // End sync was handed off
        let callback = rx.try_recv().unwrap();
        callback();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mix_block_sample_loop_wraps() {
        let state = test_state(100, true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut block = vec![0.0f32; 256 * 2];
        mix_stream_block(&state, &mut block, 1.0, &tx);
        assert!(!state.ended.load(Ordering::Acquire));
        assert!(state.cursor.load(Ordering::Acquire) < 100);
    }

    #[test]
    fn test_position_sync_fires_once_and_rearms() {
        let state = test_state(1000, false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.syncs.lock().unwrap().push(PositionSync {
            id: SyncId(1),
            frame: 300,
            mode: SyncMode::MixTime,
            armed: true,
            callback: Arc::new(|| {}),
        });

        // Crossing 300 fires
        fire_position_syncs(&state, 200, 400, false, &tx);
        assert!(rx.try_recv().is_ok());
        // Staying past does not re-fire
        fire_position_syncs(&state, 400, 500, false, &tx);
        assert!(rx.try_recv().is_err());
        // Seek back re-arms, crossing fires again
        fire_position_syncs(&state, 100, 200, false, &tx);
        fire_position_syncs(&state, 200, 350, false, &tx);
        assert!(rx.try_recv().is_ok());
    }
}
