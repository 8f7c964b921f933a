//! Driver-exclusive output backend
//!
//! Models ASIO-style devices: streams are created decode-only (no shared
//! output binding) and routed to a stereo channel pair when played, with
//! the right channel joined to the left. Driver start is reference counted
//! per device; stopping a player only drops its reference, and the driver
//! render thread stops when no players remain. Gain is applied as channel
//! volume on the pair, not as stream gain.

use crate::backend::decode;
use crate::backend::device::DeviceManager;
use crate::backend::direct::{
    best_output_config, mix_stream_block, spawn_sync_dispatch, EndSync, PositionSync,
    SharedStreams, StreamState,
};
use crate::backend::transcode;
use crate::backend::{
    AudioBackend, DeviceId, StreamFlags, StreamId, SyncCallback, SyncId, SyncMode,
};
use crate::error::{DecodeError, DeviceError, Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use sara_common::timing;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct DriverState {
    refs: usize,
    running: bool,
    stop: Arc<AtomicBool>,
    sample_rate: u32,
    /// Gain of the stereo pair; the right channel is joined to the left
    channel_gain: Arc<Mutex<f32>>,
    attached: Arc<Mutex<Vec<u64>>>,
}

/// Backend for driver-exclusive output devices
pub struct ExclusiveBackend {
    devices: Arc<DeviceManager>,
    transcode_extensions: Vec<String>,
    shared: Arc<SharedStreams>,
    drivers: Mutex<HashMap<DeviceId, DriverState>>,
    dispatch_tx: mpsc::UnboundedSender<SyncCallback>,
}

impl ExclusiveBackend {
    pub fn new(devices: Arc<DeviceManager>, transcode_extensions: Vec<String>) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        spawn_sync_dispatch(dispatch_rx);
        Arc::new(Self {
            devices,
            transcode_extensions,
            shared: Arc::new(SharedStreams::new()),
            drivers: Mutex::new(HashMap::new()),
            dispatch_tx,
        })
    }

    /// Probe the driver's native rate without starting it.
    fn driver_rate(&self, device: &DeviceId) -> Result<u32> {
        {
            let drivers = self.drivers.lock().unwrap();
            if let Some(driver) = drivers.get(device) {
                return Ok(driver.sample_rate);
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

        let host = cpal::default_host();
        let mut candidates = host.output_devices().map_err(|e| {
            Error::Other(anyhow::anyhow!("failed to enumerate devices: {}", e))
        })?;
        let cpal_device = candidates
            .find(|d| d.name().ok().as_deref() == Some(device.as_str()))
            .ok_or_else(|| DeviceError::Unavailable {
                device: device.to_string(),
            })?;
        let (config, _) = best_output_config(&cpal_device)?;
        let sample_rate = config.sample_rate.0;

        self.drivers.lock().unwrap().insert(
            device.clone(),
            DriverState {
                refs: 0,
                running: false,
                stop: Arc::new(AtomicBool::new(false)),
                sample_rate,
                channel_gain: Arc::new(Mutex::new(1.0)),
                attached: Arc::new(Mutex::new(Vec::new())),
            },
        );
        Ok(sample_rate)
    }

    /// Add one driver reference, starting the render thread if needed.
    fn driver_addref(&self, device: &DeviceId) -> Result<()> {
        let mut drivers = self.drivers.lock().unwrap();
        let driver = drivers
            .get_mut(device)
            .ok_or_else(|| DeviceError::Unavailable {
                device: device.to_string(),
            })?;
        driver.refs += 1;
        if !driver.running {
            let stop = Arc::new(AtomicBool::new(false));
            driver.stop = Arc::clone(&stop);
            let shared = Arc::clone(&self.shared);
            let dispatch = self.dispatch_tx.clone();
            let attached = Arc::clone(&driver.attached);
            let channel_gain = Arc::clone(&driver.channel_gain);
            let device_id = device.clone();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

            thread::Builder::new()
                .name(format!("driver-{}", device))
                .spawn(move || {
                    run_driver_output(device_id, shared, dispatch, attached, channel_gain, stop, ready_tx);
                })
                .map_err(Error::Io)?;

            match ready_rx.recv_timeout(Duration::from_secs(2)) {
                Ok(Ok(())) => {
                    driver.running = true;
                    info!("Driver started on {}", device);
                }
                Ok(Err(e)) => {
                    driver.refs -= 1;
                    return Err(Error::Device(DeviceError::DriverStart {
                        device: device.to_string(),
                        reason: e.to_string(),
                    }));
                }
                Err(_) => {
                    driver.refs -= 1;
                    return Err(Error::Device(DeviceError::DriverStart {
                        device: device.to_string(),
                        reason: "driver start timed out".into(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Drop one driver reference; the last one stops the render thread.
    fn driver_release(&self, device: &DeviceId) {
        let mut drivers = self.drivers.lock().unwrap();
        if let Some(driver) = drivers.get_mut(device) {
            driver.refs = driver.refs.saturating_sub(1);
            if driver.refs == 0 && driver.running {
                driver.stop.store(true, Ordering::Release);
                driver.running = false;
                debug!("Driver on {} stopped (no players remain)", device);
            }
        }
    }

    /// Remove the stream from its driver's source list; true when it was
    /// actually attached (and therefore holds a driver reference).
    fn detach(&self, device: &DeviceId, stream: StreamId) -> bool {
        let drivers = self.drivers.lock().unwrap();
        if let Some(driver) = drivers.get(device) {
            let mut attached = driver.attached.lock().unwrap();
            let before = attached.len();
            attached.retain(|id| *id != stream.0);
            return attached.len() != before;
        }
        false
    }
}

impl AudioBackend for ExclusiveBackend {
    fn name(&self) -> &'static str {
        "exclusive"
    }

    fn create_stream(
        &self,
        device: &DeviceId,
        path: &std::path::Path,
        flags: StreamFlags,
    ) -> Result<StreamId> {
        let rate = self.driver_rate(device)?;

        let decoded_result = decode::decode_file(path, rate);
        let (decoded, transcoded): (decode::DecodedAudio, Option<PathBuf>) = match decoded_result {
            Ok(d) => (d, None),
            Err(Error::Decode(DecodeError::UnsupportedFormat { .. }))
                if transcode::is_transcode_candidate(path, &self.transcode_extensions) =>
            {
                let temp = transcode::transcode_to_wav(path)?;
                match decode::decode_file(&temp, rate) {
                    Ok(d) => (d, Some(temp)),
                    Err(e) => {
                        transcode::cleanup_temp(&temp);
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let id = self.shared.next_id();
        let state = Arc::new(StreamState {
            device: device.clone(),
            sample_rate: decoded.sample_rate,
            samples: decoded.samples,
            cursor: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            // Decode streams keep wrapping so the driver loop never starves
            // mid-transition; loop points are enforced by syncs and the
            // player guard.
            sample_loop: flags.sample_loop || flags.decode_only,
            gain: Mutex::new(1.0),
            syncs: Mutex::new(Vec::new()),
            end_syncs: Mutex::new(Vec::new()),
            transcoded: Mutex::new(transcoded),
        });
        self.shared.streams.lock().unwrap().insert(id, state);
        debug!(
            "Decode stream {} created on exclusive {} for {}",
            id,
            device,
            path.display()
        );
        Ok(StreamId(id))
    }

    fn free_stream(&self, stream: StreamId) {
        if let Some(state) = self.shared.remove(stream) {
            state.playing.store(false, Ordering::Release);
            if self.detach(&state.device, stream) {
                self.driver_release(&state.device);
            }
            if let Some(temp) = state.transcoded.lock().unwrap().take() {
                transcode::cleanup_temp(&temp);
            }
        }
    }

    fn play(&self, stream: StreamId) -> Result<()> {
        let state = self
            .shared
            .get(stream)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;

        // Resume keeps the driver reference taken at the first start
        let already_attached = {
            let drivers = self.drivers.lock().unwrap();
            drivers
                .get(&state.device)
                .map(|d| d.attached.lock().unwrap().contains(&stream.0))
                .unwrap_or(false)
        };
        if !already_attached {
            self.driver_addref(&state.device)?;
            let drivers = self.drivers.lock().unwrap();
            if let Some(driver) = drivers.get(&state.device) {
                driver.attached.lock().unwrap().push(stream.0);
            }
        }
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
            if self.detach(&state.device, stream) {
                self.driver_release(&state.device);
            }
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
        // Channel volume on the pair, not stream gain
        if let Some(state) = self.shared.get(stream) {
            let drivers = self.drivers.lock().unwrap();
            if let Some(driver) = drivers.get(&state.device) {
                *driver.channel_gain.lock().unwrap() = gain.max(0.0);
            }
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

/// Render thread for one exclusive driver.
#[allow(clippy::too_many_arguments)]
fn run_driver_output(
    device_id: DeviceId,
    shared: Arc<SharedStreams>,
    dispatch: mpsc::UnboundedSender<SyncCallback>,
    attached: Arc<Mutex<Vec<u64>>>,
    channel_gain: Arc<Mutex<f32>>,
    stop: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let host = cpal::default_host();
    let device = match host.output_devices() {
        Ok(mut devices) => {
            match devices.find(|d| d.name().ok().as_deref() == Some(device_id.as_str())) {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(DeviceError::Unavailable {
                        device: device_id.to_string(),
                    }
                    .into()));
                    return;
                }
            }
        }
        Err(e) => {
            let _ = ready_tx.send(Err(Error::Other(anyhow::anyhow!(
                "failed to enumerate devices: {}",
                e
            ))));
            return;
        }
    };

    let (config, sample_format) = match best_output_config(&device) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if sample_format != SampleFormat::F32 {
        let _ = ready_tx.send(Err(Error::Other(anyhow::anyhow!(
            "driver device {} offers no f32 output format",
            device_id
        ))));
        return;
    }

    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            scratch.clear();
            scratch.resize(frames * 2, 0.0);

            let gain = *channel_gain.lock().unwrap();
            let ids: Vec<u64> = attached.lock().unwrap().clone();
            let states: Vec<Arc<StreamState>> = {
                let streams = shared.streams.lock().unwrap();
                ids.iter().filter_map(|id| streams.get(id).cloned()).collect()
            };
            for state in &states {
                mix_stream_block(state, &mut scratch, gain, &dispatch);
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
            warn!("Driver stream error: {}", err);
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(Error::Other(anyhow::anyhow!(
                "failed to build driver stream: {}",
                e
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(Error::Other(anyhow::anyhow!(
            "failed to start driver stream: {}",
            e
        ))));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
    debug!("Driver thread for {} exited", device_id);
}
