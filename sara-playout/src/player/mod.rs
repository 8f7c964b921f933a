//! Player over a decoder backend
//!
//! A player owns one decoded stream on one device slot. It arms loop syncs
//! and the native mix trigger, runs the monitor thread that enforces loop
//! boundaries and progress cadence, and steps fades on a short-lived fade
//! thread. All callbacks are invoked off the render path.

mod fade;
mod mix_trigger;
mod monitor;

use crate::backend::device::{DeviceLease, DeviceManager};
use crate::backend::{AudioBackend, DeviceId, StreamFlags, StreamId, SyncId};
use crate::error::Result;
use sara_common::params::{FADE_JOIN_TIMEOUT, LOOP_DRIFT_TOLERANCE};
use sara_common::timing;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Invoked once when an item reaches its natural or faded end
pub type FinishedCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Invoked with `(item_id, absolute_seconds)` at the progress cadence
pub type ProgressCallback = Arc<dyn Fn(Uuid, f64) + Send + Sync>;

/// Invoked when an armed mix trigger fires
pub type TriggerCallback = Arc<dyn Fn() + Send + Sync>;

/// Settable event with a bounded wait; the std counterpart of the async
/// notify used by the preview engine.
pub(crate) struct WaitFlag {
    state: Mutex<bool>,
    cv: Condvar,
}

impl WaitFlag {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Returns true when the flag was set within the timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _result) = self
            .cv
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap();
        *guard
    }
}

pub(crate) struct PlayState {
    pub(crate) stream: Option<StreamId>,
    pub(crate) item_id: Option<Uuid>,
    pub(crate) lease: Option<DeviceLease>,
    pub(crate) loop_syncs: Vec<SyncId>,
    pub(crate) mix_syncs: Vec<SyncId>,
}

pub(crate) struct PlayerShared {
    pub(crate) backend: Arc<dyn AudioBackend>,
    pub(crate) devices: Arc<DeviceManager>,
    pub(crate) device: DeviceId,
    pub(crate) state: Mutex<PlayState>,
    /// Bumped on every play/stop; stale fade threads observe it and bail
    pub(crate) generation: AtomicU64,
    pub(crate) gain: Mutex<f32>,
    pub(crate) loop_points: Mutex<Option<(f64, f64)>>,
    pub(crate) loop_active: AtomicBool,
    pub(crate) loop_guard_armed: AtomicBool,
    pub(crate) last_loop_jump: Mutex<Option<Instant>>,
    pub(crate) start_offset: Mutex<f64>,
    pub(crate) finished_fired: AtomicBool,
    pub(crate) mix_latch: AtomicBool,
    pub(crate) finished_cb: Mutex<Option<FinishedCallback>>,
    pub(crate) progress_cb: Mutex<Option<ProgressCallback>>,
    pub(crate) monitor_stop: Mutex<Arc<AtomicBool>>,
    pub(crate) monitor_exited: Mutex<Arc<WaitFlag>>,
    pub(crate) fade_done: Mutex<Option<Arc<WaitFlag>>>,
    /// Weak back-reference so sync callbacks can reach the shared state
    /// without keeping the player alive
    self_ref: Mutex<std::sync::Weak<PlayerShared>>,
}

impl PlayerShared {
    /// Seek to loop start and verify the landing position; one re-seek on
    /// drift beyond tolerance. Called from sync dispatch and the guard.
    pub(crate) fn jump_to_loop_start(&self, reason: &str) {
        let stream = match self.state.lock().unwrap().stream {
            Some(stream) => stream,
            None => return,
        };
        let loop_start = match *self.loop_points.lock().unwrap() {
            Some((start, _)) => start,
            None => return,
        };

        *self.last_loop_jump.lock().unwrap() = Some(Instant::now());
        self.backend.set_position_seconds(stream, loop_start);

        let landed = self.backend.position_seconds(stream);
        if (landed - loop_start).abs() > LOOP_DRIFT_TOLERANCE {
            self.backend.set_position_seconds(stream, loop_start);
        }
        debug!(
            "Loop jump ({}) stream={} start={:.6} landed={:.6}",
            reason, stream.0, loop_start, landed
        );

        if !self.loop_guard_armed.load(Ordering::Acquire) {
            self.loop_guard_armed.store(true, Ordering::Release);
        }
    }

    /// Fire the finished callback at most once per play.
    pub(crate) fn fire_finished(&self, item_id: Uuid) {
        if self.finished_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.finished_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(item_id);
        }
    }

    /// Tear down the current stream. `from_worker` skips the joins a
    /// monitor or fade thread must not perform on itself.
    pub(crate) fn stop_internal(&self, from_worker: bool) {
        let stop_flag = self.monitor_stop.lock().unwrap().clone();
        stop_flag.store(true, Ordering::Release);

        if !from_worker {
            let fade_done = self.fade_done.lock().unwrap().clone();
            if let Some(fade_done) = fade_done {
                if !fade_done.wait_timeout(FADE_JOIN_TIMEOUT) {
                    warn!("Fade thread did not finish within the join timeout");
                }
            }
            *self.fade_done.lock().unwrap() = None;
        }

        // Invalidate any fade still stepping against the old stream
        self.generation.fetch_add(1, Ordering::AcqRel);

        {
            let mut state = self.state.lock().unwrap();
            if let Some(stream) = state.stream.take() {
                self.backend.stop(stream);
                for sync in state.loop_syncs.drain(..) {
                    self.backend.remove_sync(stream, sync);
                }
                for sync in state.mix_syncs.drain(..) {
                    self.backend.remove_sync(stream, sync);
                }
                self.backend.free_stream(stream);
            }
            state.item_id = None;
            state.lease = None;
        }

        self.loop_active.store(false, Ordering::Release);
        *self.start_offset.lock().unwrap() = 0.0;

        if !from_worker {
            let exited = self.monitor_exited.lock().unwrap().clone();
            if !exited.wait_timeout(FADE_JOIN_TIMEOUT) {
                debug!("Monitor thread still draining after stop");
            }
        }
    }

    /// Remove registered loop syncs and re-arm them when loop points are
    /// set. Two syncs are registered at the loop end, one mix-time and one
    /// normal, to raise the odds of a timely callback; the monitor guard
    /// covers the rest.
    pub(crate) fn apply_loop_settings(&self) {
        let mut state = self.state.lock().unwrap();
        let stream = match state.stream {
            Some(stream) => stream,
            None => return,
        };
        for sync in state.loop_syncs.drain(..) {
            self.backend.remove_sync(stream, sync);
        }

        let end = match *self.loop_points.lock().unwrap() {
            Some((start, end)) if self.loop_active.load(Ordering::Acquire) => {
                end.max(start.max(0.0) + 0.001)
            }
            _ => return,
        };

        for mode in [crate::backend::SyncMode::MixTime, crate::backend::SyncMode::Normal] {
            let shared = self.weak_self();
            let callback: crate::backend::SyncCallback = Arc::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.jump_to_loop_start("sync");
                }
            });
            match self.backend.add_sync_position(stream, end, mode, callback) {
                Ok(id) => state.loop_syncs.push(id),
                Err(e) => debug!("Failed to set loop sync: {}", e),
            }
        }
    }

    fn weak_self(&self) -> std::sync::Weak<PlayerShared> {
        // Stored by Player::new immediately after construction
        self.self_ref.lock().unwrap().clone()
    }
}

// Weak back-reference so sync callbacks can reach the shared state without
// keeping the player alive.
impl PlayerShared {
    fn set_self_ref(self: &Arc<Self>) {
        *self.self_ref.lock().unwrap() = Arc::downgrade(self);
    }
}

/// One decoding stream on one device slot
pub struct Player {
    shared: Arc<PlayerShared>,
}

impl Player {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        devices: Arc<DeviceManager>,
        device: DeviceId,
    ) -> Arc<Self> {
        let shared = Arc::new(PlayerShared {
            backend,
            devices,
            device,
            state: Mutex::new(PlayState {
                stream: None,
                item_id: None,
                lease: None,
                loop_syncs: Vec::new(),
                mix_syncs: Vec::new(),
            }),
            generation: AtomicU64::new(0),
            gain: Mutex::new(1.0),
            loop_points: Mutex::new(None),
            loop_active: AtomicBool::new(false),
            loop_guard_armed: AtomicBool::new(false),
            last_loop_jump: Mutex::new(None),
            start_offset: Mutex::new(0.0),
            finished_fired: AtomicBool::new(false),
            mix_latch: AtomicBool::new(false),
            finished_cb: Mutex::new(None),
            progress_cb: Mutex::new(None),
            monitor_stop: Mutex::new(Arc::new(AtomicBool::new(true))),
            monitor_exited: Mutex::new({
                let flag = WaitFlag::new();
                flag.set();
                flag
            }),
            fade_done: Mutex::new(None),
            self_ref: Mutex::new(std::sync::Weak::new()),
        });
        shared.set_self_ref();
        Arc::new(Self { shared })
    }

    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    /// Start playback of `path` for `item_id`.
    ///
    /// Stops any current stream first (bounded fade join), acquires the
    /// device, creates and seeks the stream, applies gain, arms loop syncs
    /// and the mix trigger, and starts the monitor.
    pub fn play(
        &self,
        item_id: Uuid,
        path: &Path,
        start_seconds: f64,
        allow_loop: bool,
        mix_trigger_seconds: Option<f64>,
        on_mix_trigger: Option<TriggerCallback>,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.stop_internal(false);

        let lease = shared.devices.acquire(&shared.device);
        let flags = StreamFlags {
            prescan: true,
            sample_loop: allow_loop,
            decode_only: false,
        };
        let stream = shared.backend.create_stream(&shared.device, path, flags)?;

        if start_seconds > 0.0 {
            shared.backend.set_position_seconds(stream, start_seconds);
            *shared.start_offset.lock().unwrap() = start_seconds;
        }
        shared
            .backend
            .set_volume(stream, *shared.gain.lock().unwrap());

        {
            let mut state = shared.state.lock().unwrap();
            state.stream = Some(stream);
            state.item_id = Some(item_id);
            state.lease = Some(lease);
        }

        shared.finished_fired.store(false, Ordering::Release);
        shared.mix_latch.store(false, Ordering::Release);
        shared.loop_guard_armed.store(false, Ordering::Release);
        *shared.last_loop_jump.lock().unwrap() = None;

        shared.backend.play(stream)?;

        shared.loop_active.store(
            shared.loop_points.lock().unwrap().is_some(),
            Ordering::Release,
        );
        shared.apply_loop_settings();
        mix_trigger::apply_mix_trigger(shared, mix_trigger_seconds, on_mix_trigger);

        monitor::start_monitor(Arc::clone(shared));
        debug!("Player started item={} on {}", item_id, shared.device);
        Ok(())
    }

    pub fn pause(&self) {
        if let Some(stream) = self.shared.state.lock().unwrap().stream {
            self.shared.backend.pause(stream);
        }
    }

    /// Resume a paused stream in place.
    pub fn resume(&self) -> Result<()> {
        match self.shared.state.lock().unwrap().stream {
            Some(stream) => self.shared.backend.play(stream),
            None => Ok(()),
        }
    }

    pub fn stop(&self) {
        self.shared.stop_internal(false);
    }

    /// Linear fade to silence over `duration`, then stop and report
    /// finished. A second call while a fade is running is ignored.
    pub fn fade_out(&self, duration: f64) {
        fade::fade_out(&self.shared, duration);
    }

    /// Set or clear loop points; arms or removes the loop-end syncs on the
    /// live stream.
    pub fn set_loop(&self, start_seconds: Option<f64>, end_seconds: Option<f64>) {
        let shared = &self.shared;
        match (start_seconds, end_seconds) {
            (Some(start), Some(end)) if end > start => {
                *shared.loop_points.lock().unwrap() = Some((start, end));
                shared.loop_active.store(
                    shared.state.lock().unwrap().stream.is_some(),
                    Ordering::Release,
                );
                shared.loop_guard_armed.store(false, Ordering::Release);
                *shared.last_loop_jump.lock().unwrap() = None;
                shared.apply_loop_settings();
            }
            _ => {
                *shared.loop_points.lock().unwrap() = None;
                shared.loop_active.store(false, Ordering::Release);
                shared.loop_guard_armed.store(false, Ordering::Release);
                *shared.last_loop_jump.lock().unwrap() = None;
                let mut state = shared.state.lock().unwrap();
                if let Some(stream) = state.stream {
                    for sync in state.loop_syncs.drain(..) {
                        shared.backend.remove_sync(stream, sync);
                    }
                }
            }
        }
    }

    /// Replace the armed mix trigger; `None` removes the syncs without
    /// touching playback.
    pub fn set_mix_trigger(
        &self,
        mix_trigger_seconds: Option<f64>,
        on_mix_trigger: Option<TriggerCallback>,
    ) {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock().unwrap();
            if let Some(stream) = state.stream {
                for sync in state.mix_syncs.drain(..) {
                    shared.backend.remove_sync(stream, sync);
                }
            }
        }
        mix_trigger::apply_mix_trigger(shared, mix_trigger_seconds, on_mix_trigger);
    }

    /// Replay gain in dB; `None` resets to unity. Applies immediately to a
    /// live stream so the next buffer is already attenuated.
    pub fn set_gain_db(&self, gain_db: Option<f64>) {
        let factor = timing::db_to_linear(gain_db);
        *self.shared.gain.lock().unwrap() = factor;
        if let Some(stream) = self.shared.state.lock().unwrap().stream {
            self.shared.backend.set_volume(stream, factor);
        }
    }

    pub fn set_finished_callback(&self, callback: Option<FinishedCallback>) {
        *self.shared.finished_cb.lock().unwrap() = callback;
    }

    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        *self.shared.progress_cb.lock().unwrap() = callback;
    }

    /// Real stream length; preferred over metadata duration when they
    /// disagree noticeably.
    pub fn get_length_seconds(&self) -> f64 {
        match self.shared.state.lock().unwrap().stream {
            Some(stream) => self.shared.backend.length_seconds(stream),
            None => 0.0,
        }
    }

    pub fn position_seconds(&self) -> f64 {
        match self.shared.state.lock().unwrap().stream {
            Some(stream) => self.shared.backend.position_seconds(stream),
            None => 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        match self.shared.state.lock().unwrap().stream {
            Some(stream) => self.shared.backend.is_active(stream),
            None => false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_active()
    }

    pub fn supports_mix_trigger(&self) -> bool {
        self.shared.backend.supports_mix_trigger()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.stop_internal(false);
    }
}
