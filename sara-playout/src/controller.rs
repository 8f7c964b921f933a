//! Playback controller
//!
//! Registry of active `(playlist_id, item_id) → PlaybackContext` entries.
//! Selects a device slot, acquires (or revives) a player, wires callbacks,
//! and exposes the start/stop/update surface the auto-mix runtime drives.
//! Expected failures come back as `None`/`false`, never as panics across
//! the boundary; a failed start reverts the item to pending.

use crate::announce::AnnouncementSink;
use crate::backend::device::{DeviceInfo, DeviceManager};
use crate::backend::mixer::MixerBackend;
use crate::backend::{AudioBackend, DeviceId};
use crate::model::{ItemStatus, PlaylistModel};
use crate::player::{FinishedCallback, Player, ProgressCallback, TriggerCallback};
use crate::settings::SettingsProvider;
use sara_common::events::AnnouncementCategory;
use sara_common::params::DEVICE_INIT_ATTEMPTS;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Playlist shared with the external playlist layer
pub type SharedPlaylist = Arc<RwLock<PlaylistModel>>;

/// Key addressing one playing item
pub type ContextKey = (Uuid, Uuid);

/// Factory producing a software mixer bound to a device
pub type MixerFactory = Box<dyn Fn(&DeviceId) -> Arc<MixerBackend> + Send + Sync>;

/// State owned per started item
pub struct PlaybackContext {
    pub player: Arc<Player>,
    pub source_path: PathBuf,
    pub device_id: DeviceId,
    pub slot_index: usize,
    pub intro_seconds: Option<f64>,
    pub intro_alert_triggered: AtomicBool,
    pub track_end_alert_triggered: AtomicBool,
}

/// Registry of players, contexts, mixers, and the PFL preview
pub struct PlaybackController {
    pub(crate) backend: Arc<dyn AudioBackend>,
    pub(crate) devices: Arc<DeviceManager>,
    pub(crate) settings: Arc<dyn SettingsProvider>,
    pub(crate) announcer: Arc<dyn AnnouncementSink>,
    contexts: RwLock<HashMap<ContextKey, Arc<PlaybackContext>>>,
    /// Cached idle players per device; revived or replaced on stale handles
    player_cache: Mutex<HashMap<DeviceId, Arc<Player>>>,
    mixers: Mutex<HashMap<DeviceId, Arc<MixerBackend>>>,
    mixer_factory: Option<MixerFactory>,
    pub(crate) preview: tokio::sync::Mutex<Option<crate::preview::PreviewContext>>,
    pub(crate) pfl_device: Mutex<Option<DeviceId>>,
}

impl PlaybackController {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        devices: Arc<DeviceManager>,
        settings: Arc<dyn SettingsProvider>,
        announcer: Arc<dyn AnnouncementSink>,
    ) -> Arc<Self> {
        let pfl = settings.pfl_device();
        Arc::new(Self {
            backend,
            devices,
            settings,
            announcer,
            contexts: RwLock::new(HashMap::new()),
            player_cache: Mutex::new(HashMap::new()),
            mixers: Mutex::new(HashMap::new()),
            mixer_factory: None,
            preview: tokio::sync::Mutex::new(None),
            pfl_device: Mutex::new(pfl),
        })
    }

    /// Controller that routes single-slot playlists through a software
    /// mixer produced by `factory`.
    pub fn with_mixer_factory(
        backend: Arc<dyn AudioBackend>,
        devices: Arc<DeviceManager>,
        settings: Arc<dyn SettingsProvider>,
        announcer: Arc<dyn AnnouncementSink>,
        factory: MixerFactory,
    ) -> Arc<Self> {
        let pfl = settings.pfl_device();
        Arc::new(Self {
            backend,
            devices,
            settings,
            announcer,
            contexts: RwLock::new(HashMap::new()),
            player_cache: Mutex::new(HashMap::new()),
            mixers: Mutex::new(HashMap::new()),
            mixer_factory: Some(factory),
            preview: tokio::sync::Mutex::new(None),
            pfl_device: Mutex::new(pfl),
        })
    }

    pub(crate) fn announce(&self, category: AnnouncementCategory, message: &str) {
        self.announcer.announce(category, message);
    }

    /// Devices currently owned by a context.
    pub async fn busy_device_ids(&self) -> HashSet<DeviceId> {
        self.contexts
            .read()
            .await
            .values()
            .map(|ctx| ctx.device_id.clone())
            .collect()
    }

    pub async fn context(&self, key: &ContextKey) -> Option<Arc<PlaybackContext>> {
        self.contexts.read().await.get(key).cloned()
    }

    /// First context belonging to a playlist, if any.
    pub async fn playlist_context(
        &self,
        playlist_id: Uuid,
    ) -> Option<(ContextKey, Arc<PlaybackContext>)> {
        self.contexts
            .read()
            .await
            .iter()
            .find(|(key, _)| key.0 == playlist_id)
            .map(|(key, ctx)| (*key, Arc::clone(ctx)))
    }

    pub async fn remove_context(&self, key: &ContextKey) -> Option<Arc<PlaybackContext>> {
        let removed = self.contexts.write().await.remove(key);
        if removed.is_some() {
            self.cleanup_unused_mixers().await;
        }
        removed
    }

    /// Re-read the PFL device from settings; a change stops any preview.
    pub async fn reload_pfl_device(&self) {
        let fresh = self.settings.pfl_device();
        let changed = { *self.pfl_device.lock().unwrap() != fresh };
        if changed {
            self.stop_preview(true).await;
        }
        *self.pfl_device.lock().unwrap() = fresh;
    }

    /// Start `item_id` from `playlist`.
    ///
    /// Idempotent for an already-playing item unless `restart_if_playing`;
    /// items marked played are rejected unless restarting flips them back
    /// to pending. `None` means device exhaustion or player failure, and
    /// the item's status is reverted to pending.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_item(
        &self,
        playlist: &SharedPlaylist,
        item_id: Uuid,
        start_seconds: f64,
        on_finished: FinishedCallback,
        on_progress: ProgressCallback,
        restart_if_playing: bool,
        mix_trigger_seconds: Option<f64>,
        on_mix_trigger: Option<TriggerCallback>,
    ) -> Option<Arc<PlaybackContext>> {
        let (playlist_id, item) = {
            let mut model = playlist.write().await;
            let playlist_id = model.id;
            let item = model.get_item_mut(item_id)?;

            if item.status == ItemStatus::Played {
                if restart_if_playing {
                    debug!("Restarting item {} marked played", item_id);
                    item.status = ItemStatus::Pending;
                    item.current_position = 0.0;
                } else {
                    debug!("Skipping item {} already played", item_id);
                    return None;
                }
            }
            (playlist_id, item.clone())
        };

        let key = (playlist_id, item_id);
        info!(
            "start_item playlist={} item={} title={}",
            playlist_id, item_id, item.title
        );

        // Reuse a live context unless a restart was requested; a restart
        // keeps the same player and slot.
        let mut reuse: Option<(Arc<Player>, DeviceId, usize)> = None;
        if let Some(existing) = self.context(&key).await {
            if item.status == ItemStatus::Playing {
                if restart_if_playing {
                    debug!("Restarting already-playing item on {}", existing.device_id);
                    existing.player.stop();
                    reuse = Some((
                        Arc::clone(&existing.player),
                        existing.device_id.clone(),
                        existing.slot_index,
                    ));
                } else {
                    debug!("Item already playing, reusing context on {}", existing.device_id);
                    return Some(existing);
                }
            }
        }

        let (player, device_id, slot_index) = match reuse {
            Some(triple) => triple,
            None => match self.ensure_player(playlist).await {
                Some(triple) => triple,
                None => {
                    warn!("No player acquired for playlist={} item={}", playlist_id, item_id);
                    self.revert_to_pending(playlist, item_id).await;
                    return None;
                }
            },
        };

        player.set_finished_callback(Some(Arc::clone(&on_finished)));
        player.set_progress_callback(Some(Arc::clone(&on_progress)));
        // ReplayGain before start so the first buffer is already attenuated
        player.set_gain_db(item.replay_gain_db);

        let allow_loop = item.loop_enabled && item.has_loop();
        if !allow_loop {
            player.set_loop(None, None);
        }

        let play_result = player.play(
            item_id,
            &item.path,
            start_seconds,
            allow_loop,
            mix_trigger_seconds,
            on_mix_trigger.clone(),
        );

        let player = match play_result {
            Ok(()) => player,
            Err(e) => {
                player.set_finished_callback(None);
                player.set_progress_callback(None);
                warn!(
                    "Play failed playlist={} item={} device={}: {}",
                    playlist_id, item_id, device_id, e
                );
                // Stale handle recovery: drop the cached player, recreate
                // once, re-issue play.
                self.player_cache.lock().unwrap().remove(&device_id);
                let fresh = Player::new(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.devices),
                    device_id.clone(),
                );
                fresh.set_finished_callback(Some(Arc::clone(&on_finished)));
                fresh.set_progress_callback(Some(Arc::clone(&on_progress)));
                fresh.set_gain_db(item.replay_gain_db);
                if !allow_loop {
                    fresh.set_loop(None, None);
                }
                match fresh.play(
                    item_id,
                    &item.path,
                    start_seconds,
                    allow_loop,
                    mix_trigger_seconds,
                    on_mix_trigger,
                ) {
                    Ok(()) => {
                        self.player_cache
                            .lock()
                            .unwrap()
                            .insert(device_id.clone(), Arc::clone(&fresh));
                        fresh
                    }
                    Err(retry) => {
                        warn!("Retry after player refresh failed: {}", retry);
                        self.announce(AnnouncementCategory::PlaybackErrors, &retry.to_string());
                        self.revert_to_pending(playlist, item_id).await;
                        return None;
                    }
                }
            }
        };

        if allow_loop {
            player.set_loop(item.loop_start_seconds, item.loop_end_seconds);
        }

        let context = Arc::new(PlaybackContext {
            player,
            source_path: item.path.clone(),
            device_id,
            slot_index,
            intro_seconds: item.intro_seconds,
            intro_alert_triggered: AtomicBool::new(false),
            track_end_alert_triggered: AtomicBool::new(false),
        });
        self.contexts.write().await.insert(key, Arc::clone(&context));

        {
            let mut model = playlist.write().await;
            if let Some(item) = model.get_item_mut(item_id) {
                item.status = ItemStatus::Playing;
            }
        }
        Some(context)
    }

    async fn revert_to_pending(&self, playlist: &SharedPlaylist, item_id: Uuid) {
        let mut model = playlist.write().await;
        if let Some(item) = model.get_item_mut(item_id) {
            item.status = ItemStatus::Pending;
        }
    }

    /// Suspend a playing item without losing its position.
    pub async fn pause_item(&self, playlist: &SharedPlaylist, item_id: Uuid) -> bool {
        let playlist_id = playlist.read().await.id;
        let context = match self.context(&(playlist_id, item_id)).await {
            Some(context) => context,
            None => return false,
        };
        context.player.pause();
        let mut model = playlist.write().await;
        if let Some(item) = model.get_item_mut(item_id) {
            item.status = ItemStatus::Paused;
        }
        true
    }

    /// Resume a paused item in place.
    pub async fn resume_item(&self, playlist: &SharedPlaylist, item_id: Uuid) -> bool {
        let playlist_id = playlist.read().await.id;
        let context = match self.context(&(playlist_id, item_id)).await {
            Some(context) => context,
            None => return false,
        };
        if let Err(e) = context.player.resume() {
            warn!("Resume failed for item {}: {}", item_id, e);
            return false;
        }
        let mut model = playlist.write().await;
        if let Some(item) = model.get_item_mut(item_id) {
            item.status = ItemStatus::Playing;
        }
        true
    }

    /// Replace (or clear) the native mix trigger of a running item.
    ///
    /// Returns false when no context exists or the player lacks native
    /// trigger support.
    pub async fn update_mix_trigger(
        &self,
        playlist_id: Uuid,
        item_id: Uuid,
        mix_trigger_seconds: Option<f64>,
        on_mix_trigger: Option<TriggerCallback>,
    ) -> bool {
        let key = (playlist_id, item_id);
        let context = match self.context(&key).await {
            Some(context) => context,
            None => return false,
        };
        if !context.player.supports_mix_trigger() {
            return false;
        }
        context
            .player
            .set_mix_trigger(mix_trigger_seconds, on_mix_trigger);
        true
    }

    /// Stop every context of a playlist; fade when `fade_duration > 0`.
    /// Never blocks on fade completion. Returns the removed entries.
    pub async fn stop_playlist(
        &self,
        playlist_id: Uuid,
        fade_duration: f64,
    ) -> Vec<(ContextKey, Arc<PlaybackContext>)> {
        let mut removed = Vec::new();
        {
            let mut contexts = self.contexts.write().await;
            let keys: Vec<ContextKey> = contexts
                .keys()
                .filter(|key| key.0 == playlist_id)
                .copied()
                .collect();
            for key in keys {
                if let Some(context) = contexts.remove(&key) {
                    if fade_duration > 0.0 {
                        context.player.fade_out(fade_duration);
                    } else {
                        context.player.stop();
                    }
                    context.player.set_finished_callback(None);
                    context.player.set_progress_callback(None);
                    removed.push((key, context));
                }
            }
        }
        self.cleanup_unused_mixers().await;
        removed
    }

    /// Drop a playlist's contexts without touching the players.
    pub async fn clear_playlist_entries(&self, playlist_id: Uuid) {
        {
            let mut contexts = self.contexts.write().await;
            contexts.retain(|key, _| key.0 != playlist_id);
        }
        self.cleanup_unused_mixers().await;
    }

    /// Best-effort warm-up of the most likely next track. Never delays the
    /// critical path; IO runs on the blocking pool.
    pub async fn schedule_next_preload(&self, playlist: &SharedPlaylist, current_item_id: Uuid) {
        let next_path: Option<PathBuf> = {
            let model = playlist.read().await;
            let current = model.index_of(current_item_id);
            let total = model.items.len();
            current.and_then(|idx| {
                (1..=total)
                    .map(|offset| &model.items[(idx + offset) % total.max(1)])
                    .find(|item| item.status == ItemStatus::Pending)
                    .map(|item| item.path.clone())
            })
        };

        if let Some(path) = next_path {
            tokio::task::spawn_blocking(move || {
                use std::io::Read;
                if let Ok(mut file) = std::fs::File::open(&path) {
                    let mut buffer = vec![0u8; 256 * 1024];
                    let _ = file.read(&mut buffer);
                    debug!("Preloaded head of {}", path.display());
                }
            });
        }
    }

    /// Acquire a player for the playlist's next slot.
    ///
    /// Walks configured slots, falls back to scoring all known devices,
    /// nulls slots whose device disappeared (with a refresh and a bounded
    /// retry), and routes single-slot playlists through the software mixer
    /// when one is available.
    async fn ensure_player(
        &self,
        playlist: &SharedPlaylist,
    ) -> Option<(Arc<Player>, DeviceId, usize)> {
        let mut missing: HashSet<DeviceId> = HashSet::new();
        let mut attempts = 0u32;

        while attempts < DEVICE_INIT_ATTEMPTS {
            let mut devices = self.devices.devices();
            if devices.is_empty() {
                self.devices.refresh();
                devices = self.devices.devices();
                if devices.is_empty() {
                    self.announce(AnnouncementCategory::Device, "No audio devices available");
                    return None;
                }
            }

            let known: HashSet<DeviceId> = devices.iter().map(|d| d.id.clone()).collect();
            let busy = self.busy_device_ids().await;

            let (selection, single_slot, playlist_name) = {
                let mut model = playlist.write().await;
                let single_slot = model.configured_slots().len() <= 1;
                let selection = model.select_next_slot(&known, &busy);
                (selection, single_slot, model.name.clone())
            };

            let (slot_index, device_id) = match selection {
                Some(pair) => pair,
                None => match pick_fallback(&devices, &busy) {
                    Some(device_id) => (0, device_id),
                    None => {
                        self.announce(
                            AnnouncementCategory::Device,
                            &format!("No configured player for playlist {} is available", playlist_name),
                        );
                        return None;
                    }
                },
            };

            if !known.contains(&device_id) {
                missing.insert(device_id.clone());
                {
                    let mut model = playlist.write().await;
                    if slot_index < model.output_slots.len() {
                        model.output_slots[slot_index] = None;
                    }
                }
                attempts += 1;
                self.devices.refresh();
                debug!(
                    "Device {} missing for playlist {}, refreshing (attempt {})",
                    device_id, playlist_name, attempts
                );
                continue;
            }

            debug!(
                "Selected device {} slot={} single_slot={} busy={:?}",
                device_id, slot_index, single_slot, busy
            );

            // Single-slot playlists go through the software mixer when the
            // backend stack provides one.
            if single_slot {
                if let Some(mixer) = self.get_or_create_mixer(&device_id) {
                    let player = Player::new(
                        mixer as Arc<dyn AudioBackend>,
                        Arc::clone(&self.devices),
                        device_id.clone(),
                    );
                    return Some((player, device_id, slot_index));
                }
            }

            let player = self.get_or_create_player(&device_id).await;
            return Some((player, device_id, slot_index));
        }

        if !missing.is_empty() {
            let mut names: Vec<String> = missing.iter().map(|d| d.to_string()).collect();
            names.sort();
            self.announce(
                AnnouncementCategory::Device,
                &format!("Unavailable devices: {}", names.join(", ")),
            );
        }
        None
    }

    /// Cached player for the device, unless a live context still owns it.
    async fn get_or_create_player(&self, device_id: &DeviceId) -> Arc<Player> {
        let cached = self.player_cache.lock().unwrap().get(device_id).cloned();
        if let Some(player) = cached {
            let in_use = self
                .contexts
                .read()
                .await
                .values()
                .any(|ctx| Arc::ptr_eq(&ctx.player, &player));
            if !in_use {
                return player;
            }
        }
        let player = Player::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.devices),
            device_id.clone(),
        );
        self.player_cache
            .lock()
            .unwrap()
            .insert(device_id.clone(), Arc::clone(&player));
        player
    }

    fn get_or_create_mixer(&self, device_id: &DeviceId) -> Option<Arc<MixerBackend>> {
        let factory = self.mixer_factory.as_ref()?;
        let mut mixers = self.mixers.lock().unwrap();
        if let Some(mixer) = mixers.get(device_id) {
            return Some(Arc::clone(mixer));
        }
        let mixer = factory(device_id);
        mixers.insert(device_id.clone(), Arc::clone(&mixer));
        Some(mixer)
    }

    /// Close mixers whose device no longer hosts any context.
    async fn cleanup_unused_mixers(&self) {
        let active: HashSet<DeviceId> = self
            .contexts
            .read()
            .await
            .values()
            .map(|ctx| ctx.device_id.clone())
            .collect();
        let mut mixers = self.mixers.lock().unwrap();
        let stale: Vec<DeviceId> = mixers
            .keys()
            .filter(|device| !active.contains(*device))
            .cloned()
            .collect();
        for device in stale {
            if let Some(mixer) = mixers.remove(&device) {
                mixer.close();
                debug!("Closed idle mixer on {}", device);
            }
        }
    }
}

/// Prefer a free device, default output first; fall back to the first
/// known device when everything is busy.
fn pick_fallback(devices: &[DeviceInfo], busy: &HashSet<DeviceId>) -> Option<DeviceId> {
    let mut sorted: Vec<&DeviceInfo> = devices.iter().collect();
    sorted.sort_by_key(|d| (busy.contains(&d.id), !d.is_default));
    sorted
        .iter()
        .find(|d| !busy.contains(&d.id))
        .or_else(|| sorted.first())
        .map(|d| d.id.clone())
}
