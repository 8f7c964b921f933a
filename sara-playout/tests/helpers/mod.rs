//! Test helpers: a scripted backend with a manual clock
//!
//! Implements the backend capability set without hardware. Positions move
//! only when a test calls `advance`, syncs fire synchronously on the test
//! thread, and every interesting call is counted so suites can assert on
//! stream lifecycles, sync registration, and fade stepping.
#![allow(dead_code)]

use sara_playout::backend::{
    AudioBackend, DeviceId, StreamFlags, StreamId, SyncCallback, SyncId, SyncMode,
};
use sara_playout::error::{DecodeError, DeviceError, Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct FakeSync {
    id: SyncId,
    seconds: f64,
    armed: bool,
    callback: SyncCallback,
}

struct FakeEndSync {
    id: SyncId,
    fired: bool,
    callback: SyncCallback,
}

struct FakeStream {
    path: PathBuf,
    #[allow(dead_code)]
    device: DeviceId,
    position: f64,
    length: f64,
    playing: bool,
    halted: bool,
    ended: bool,
    sample_loop: bool,
    syncs: Vec<FakeSync>,
    end_syncs: Vec<FakeEndSync>,
    volume_history: Vec<f32>,
    seek_history: Vec<f64>,
}

/// Backend double with scripted lengths and a manual clock
pub struct FakeBackend {
    next_id: AtomicU64,
    supports_trigger: bool,
    fail_next_play: AtomicBool,
    lengths: Mutex<HashMap<PathBuf, f64>>,
    streams: Mutex<HashMap<u64, FakeStream>>,
    /// Freed streams, kept so suites can still inspect their histories
    graveyard: Mutex<HashMap<u64, FakeStream>>,
    created: Mutex<Vec<PathBuf>>,
    freed: Mutex<Vec<u64>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Self::with_trigger_support(true)
    }

    pub fn with_trigger_support(supports_trigger: bool) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            supports_trigger,
            fail_next_play: AtomicBool::new(false),
            lengths: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            graveyard: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            freed: Mutex::new(Vec::new()),
        })
    }

    /// Script the stream length reported for a path (default 30 s).
    pub fn set_length(&self, path: &Path, seconds: f64) {
        self.lengths
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), seconds);
    }

    /// Make the next `play` fail once (stale-handle simulation).
    pub fn fail_next_play(&self) {
        self.fail_next_play.store(true, Ordering::SeqCst);
    }

    pub fn create_count(&self, path: &Path) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_path() == path)
            .count()
    }

    pub fn freed_count(&self) -> usize {
        self.freed.lock().unwrap().len()
    }

    pub fn live_stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Most recently created stream for a path, if still live.
    pub fn stream_for(&self, path: &Path) -> Option<StreamId> {
        let streams = self.streams.lock().unwrap();
        streams
            .iter()
            .filter(|(_, s)| s.path.as_path() == path)
            .max_by_key(|(id, _)| **id)
            .map(|(id, _)| StreamId(*id))
    }

    pub fn position_sync_count(&self, stream: StreamId) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| s.syncs.len())
            .unwrap_or(0)
    }

    pub fn end_sync_count(&self, stream: StreamId) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| s.end_syncs.len())
            .unwrap_or(0)
    }

    pub fn volume_history(&self, stream: StreamId) -> Vec<f32> {
        if let Some(state) = self.streams.lock().unwrap().get(&stream.0) {
            return state.volume_history.clone();
        }
        self.graveyard
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| s.volume_history.clone())
            .unwrap_or_default()
    }

    pub fn seek_history(&self, stream: StreamId) -> Vec<f64> {
        if let Some(state) = self.streams.lock().unwrap().get(&stream.0) {
            return state.seek_history.clone();
        }
        self.graveyard
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| s.seek_history.clone())
            .unwrap_or_default()
    }

    /// Move the position without firing syncs: a missed native callback.
    pub fn advance_silent(&self, stream: StreamId, to_seconds: f64) {
        if let Some(state) = self.streams.lock().unwrap().get_mut(&stream.0) {
            state.position = to_seconds;
        }
    }

    /// Advance the manual clock of a stream, firing any syncs crossed.
    /// Callbacks run synchronously on the calling thread.
    pub fn advance(&self, stream: StreamId, to_seconds: f64) {
        let fired: Vec<SyncCallback> = {
            let mut streams = self.streams.lock().unwrap();
            let state = match streams.get_mut(&stream.0) {
                Some(state) => state,
                None => return,
            };
            let before = state.position;
            state.position = to_seconds;

            let mut fired = Vec::new();
            for sync in state.syncs.iter_mut() {
                if sync.armed && before < sync.seconds && to_seconds >= sync.seconds {
                    sync.armed = false;
                    fired.push(Arc::clone(&sync.callback));
                } else if !sync.armed && to_seconds < sync.seconds {
                    sync.armed = true;
                }
            }

            if to_seconds >= state.length && !state.sample_loop {
                state.ended = true;
                state.playing = false;
                for sync in state.end_syncs.iter_mut() {
                    if !sync.fired {
                        sync.fired = true;
                        fired.push(Arc::clone(&sync.callback));
                    }
                }
            }
            fired
        };
        for callback in fired {
            callback();
        }
    }

    /// Mark the stream finished without firing syncs (hard device stop).
    pub fn kill(&self, stream: StreamId) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(&stream.0) {
            state.ended = true;
            state.playing = false;
        }
    }
}

impl AudioBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create_stream(
        &self,
        device: &DeviceId,
        path: &Path,
        flags: StreamFlags,
    ) -> Result<StreamId> {
        let length = self
            .lengths
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(30.0);
        if length < 0.0 {
            return Err(Error::Decode(DecodeError::UnsupportedFormat {
                path: path.display().to_string(),
            }));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.lock().unwrap().push(path.to_path_buf());
        self.streams.lock().unwrap().insert(
            id,
            FakeStream {
                path: path.to_path_buf(),
                device: device.clone(),
                position: 0.0,
                length,
                playing: false,
                halted: false,
                ended: false,
                sample_loop: flags.sample_loop,
                syncs: Vec::new(),
                end_syncs: Vec::new(),
                volume_history: Vec::new(),
                seek_history: Vec::new(),
            },
        );
        Ok(StreamId(id))
    }

    fn free_stream(&self, stream: StreamId) {
        if let Some(state) = self.streams.lock().unwrap().remove(&stream.0) {
            self.graveyard.lock().unwrap().insert(stream.0, state);
            self.freed.lock().unwrap().push(stream.0);
        }
    }

    fn play(&self, stream: StreamId) -> Result<()> {
        if self.fail_next_play.swap(false, Ordering::SeqCst) {
            return Err(Error::Device(DeviceError::PlayerStale {
                device: "fake".into(),
            }));
        }
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(&stream.0)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        if state.ended {
            state.position = 0.0;
            state.ended = false;
        }
        state.halted = false;
        state.playing = true;
        Ok(())
    }

    fn pause(&self, stream: StreamId) {
        if let Some(state) = self.streams.lock().unwrap().get_mut(&stream.0) {
            state.playing = false;
        }
    }

    fn stop(&self, stream: StreamId) {
        if let Some(state) = self.streams.lock().unwrap().get_mut(&stream.0) {
            state.playing = false;
            state.halted = true;
            state.syncs.clear();
            state.end_syncs.clear();
        }
    }

    fn position_seconds(&self, stream: StreamId) -> f64 {
        self.streams
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| s.position)
            .unwrap_or(0.0)
    }

    fn set_position_seconds(&self, stream: StreamId, seconds: f64) {
        if let Some(state) = self.streams.lock().unwrap().get_mut(&stream.0) {
            state.position = seconds.min(state.length);
            state.seek_history.push(seconds);
        }
    }

    fn length_seconds(&self, stream: StreamId) -> f64 {
        self.streams
            .lock()
            .unwrap()
            .get(&stream.0)
            .map(|s| s.length)
            .unwrap_or(0.0)
    }

    fn set_volume(&self, stream: StreamId, gain: f32) {
        if let Some(state) = self.streams.lock().unwrap().get_mut(&stream.0) {
            state.volume_history.push(gain);
        }
    }

    fn is_active(&self, stream: StreamId) -> bool {
        self.streams
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
        _mode: SyncMode,
        callback: SyncCallback,
    ) -> Result<SyncId> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(&stream.0)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        let id = SyncId(self.next_id.fetch_add(1, Ordering::SeqCst));
        state.syncs.push(FakeSync {
            id,
            seconds,
            armed: true,
            callback,
        });
        Ok(id)
    }

    fn add_sync_end(&self, stream: StreamId, callback: SyncCallback) -> Result<SyncId> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams
            .get_mut(&stream.0)
            .ok_or(Error::Decode(DecodeError::UnknownStream))?;
        let id = SyncId(self.next_id.fetch_add(1, Ordering::SeqCst));
        state.end_syncs.push(FakeEndSync {
            id,
            fired: false,
            callback,
        });
        Ok(id)
    }

    fn remove_sync(&self, stream: StreamId, sync: SyncId) {
        if let Some(state) = self.streams.lock().unwrap().get_mut(&stream.0) {
            state.syncs.retain(|s| s.id != sync);
            state.end_syncs.retain(|s| s.id != sync);
        }
    }

    fn supports_mix_trigger(&self) -> bool {
        self.supports_trigger
    }
}

use sara_playout::announce::RecordingSink;
use sara_playout::backend::device::{DeviceInfo, DeviceManager};
use sara_playout::controller::PlaybackController;
use sara_playout::model::{PlaylistItem, PlaylistKind, PlaylistModel};
use sara_playout::settings::StaticSettings;
use tokio::sync::RwLock;

/// Standard two-device registry used across suites
pub fn test_devices() -> Arc<DeviceManager> {
    DeviceManager::with_devices(vec![
        DeviceInfo {
            id: DeviceId::from("out-1"),
            name: "out-1".into(),
            is_default: true,
        },
        DeviceInfo {
            id: DeviceId::from("out-2"),
            name: "out-2".into(),
            is_default: false,
        },
        DeviceInfo {
            id: DeviceId::from("pfl"),
            name: "pfl".into(),
            is_default: false,
        },
    ])
}

pub struct TestRig {
    pub backend: Arc<FakeBackend>,
    pub devices: Arc<DeviceManager>,
    pub settings: Arc<StaticSettings>,
    pub sink: Arc<RecordingSink>,
    pub controller: Arc<PlaybackController>,
    pub tempdir: tempfile::TempDir,
}

impl TestRig {
    pub fn new() -> Self {
        let backend = FakeBackend::new();
        let devices = test_devices();
        let settings = Arc::new(StaticSettings::new());
        let sink = Arc::new(RecordingSink::new());
        let controller = PlaybackController::new(
            backend.clone(),
            Arc::clone(&devices),
            settings.clone(),
            sink.clone(),
        );
        let tempdir = tempfile::tempdir().unwrap();
        Self {
            backend,
            devices,
            settings,
            sink,
            controller,
            tempdir,
        }
    }

    /// Item backed by a real (empty) temp file so existence checks pass.
    pub fn item(&self, name: &str, duration: f64) -> PlaylistItem {
        let path = self.tempdir.path().join(format!("{}.flac", name));
        std::fs::write(&path, b"").unwrap();
        self.backend.set_length(&path, duration);
        PlaylistItem::new(name, path, duration)
    }

    pub fn playlist(&self, items: Vec<PlaylistItem>) -> Arc<RwLock<PlaylistModel>> {
        let mut model = PlaylistModel::new("test", PlaylistKind::Music);
        model.output_slots = vec![
            Some(DeviceId::from("out-1")),
            Some(DeviceId::from("out-2")),
        ];
        model.items = items;
        Arc::new(RwLock::new(model))
    }
}
