//! Auto-mix runtime
//!
//! Advances a playlist on two event sources per running item: progress
//! ticks from the player monitor and the sample-accurate native mix
//! callback. Early and late native firings are guarded, loop holds and
//! break markers suppress mixing, and the `triggered` latch inside the
//! plan guarantees one mix per item lifetime. The per-key state map
//! carries intent only (armed, loop hold, break halt); deduplication is
//! the latch's job.

use crate::alerts;
use crate::controller::{ContextKey, PlaybackController, SharedPlaylist};
use crate::executor::CallbackExecutor;
use crate::model::{ItemStatus, PlaylistKind};
use crate::plan::{MixPlan, MixPlanner};
use crate::player::{FinishedCallback, ProgressCallback, TriggerCallback};
use crate::settings::SettingsProvider;
use sara_common::events::AnnouncementCategory;
use sara_common::params::{
    LENGTH_DISAGREEMENT, MIX_EXPLICIT_PROGRESS_GUARD, MIX_NATIVE_EARLY_FIRE_TOLERANCE,
    MIX_NATIVE_EARLY_GUARD, MIX_NATIVE_LATE_GUARD, MIX_REARM_LATE_WINDOW,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Intent recorded per `(playlist_id, item_id)` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoMixState {
    /// Plan armed, waiting for the trigger
    Armed,
    /// Loop playback holds the mix until the loop is disabled
    LoopHold,
    /// A break marker stops auto-mix at this item
    BreakHalt,
    /// The mix fired for this key
    Fired,
}

/// Events the players feed into the runtime
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Progress {
        playlist_id: Uuid,
        item_id: Uuid,
        seconds: f64,
    },
    NativeTrigger {
        playlist_id: Uuid,
        item_id: Uuid,
    },
    Finished {
        playlist_id: Uuid,
        item_id: Uuid,
    },
}

/// Outcome of evaluating a progress tick against an armed plan
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ProgressDecision {
    Skip,
    Fire { fade_duration: f64 },
}

/// Outcome of a native mix callback against an armed plan
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum NativeDecision {
    Ignore,
    /// Backend fired too early; disarm native, fall back to progress
    DemoteToProgress,
    Fire { fade_duration: f64 },
}

/// Evaluate one progress tick. Pure; `trigger_window` is the largest of
/// fade, overlap, and outro.
pub(crate) fn decide_on_progress(
    plan: &MixPlan,
    trigger_window: f64,
    seconds: f64,
) -> ProgressDecision {
    if plan.triggered {
        return ProgressDecision::Skip;
    }

    let elapsed = (seconds - plan.base_cue).max(0.0);
    let remaining = (plan.effective_duration - elapsed).max(0.0);
    let mix_remaining = plan
        .mix_at
        .map(|mix_at| (mix_at - seconds).max(0.0))
        .unwrap_or(remaining);

    if let Some(mix_at) = plan.mix_at {
        if plan.native_trigger {
            // Give the native callback its window before falling back
            let headroom = (plan.track_end() - mix_at).max(0.0);
            let fade_guard = MIX_NATIVE_LATE_GUARD.min(plan.fade_seconds.max(0.0));
            let window = fade_guard.min(headroom);
            let shortfall = fade_guard - window;

            if seconds < mix_at - MIX_NATIVE_EARLY_GUARD {
                return ProgressDecision::Skip;
            }
            if seconds < mix_at + window && shortfall <= 0.0 {
                return ProgressDecision::Skip;
            }
            // Native callback is late (or has no room past the mix point);
            // take over on the progress path.
        }
    }

    let should_fire = if plan.mix_at.is_some() {
        mix_remaining <= MIX_EXPLICIT_PROGRESS_GUARD
    } else {
        remaining <= trigger_window.max(0.1)
    };

    if should_fire {
        ProgressDecision::Fire {
            fade_duration: plan.fade_seconds.max(0.0).min(remaining),
        }
    } else {
        ProgressDecision::Skip
    }
}

/// Evaluate a native mix callback. `current_abs` is cue-in plus the item's
/// current stream-relative position.
pub(crate) fn decide_on_native(plan: &MixPlan, current_abs: f64) -> NativeDecision {
    if plan.triggered {
        return NativeDecision::Ignore;
    }
    let mix_at = match plan.mix_at {
        Some(mix_at) => mix_at,
        None => return NativeDecision::Ignore,
    };

    if current_abs < mix_at - MIX_NATIVE_EARLY_FIRE_TOLERANCE {
        return NativeDecision::DemoteToProgress;
    }

    let elapsed = (current_abs - plan.base_cue).max(0.0);
    let remaining = (plan.effective_duration - elapsed).max(0.0);
    NativeDecision::Fire {
        fade_duration: plan.fade_seconds.max(0.0).min(remaining),
    }
}

/// Sequential next-index selection with the override precedence: queued
/// selection, break resume, last-started tracker, then skip the item that
/// is already playing.
pub(crate) fn select_next_index(
    total: usize,
    current_idx: Option<usize>,
    queued_idx: Option<usize>,
    break_resume: Option<usize>,
    last_started_idx: Option<usize>,
    playing_idx: Option<usize>,
) -> Option<usize> {
    if total == 0 {
        return None;
    }

    let mut next = if let Some(queued) = queued_idx {
        queued % total
    } else if let Some(resume) = break_resume {
        resume % total
    } else if let Some(current) = current_idx {
        (current + 1) % total
    } else if let Some(last) = last_started_idx {
        (last + 1) % total
    } else {
        0
    };

    if Some(next) == playing_idx {
        next = (next + 1) % total;
        if Some(next) == playing_idx {
            return None;
        }
    }
    Some(next)
}

/// Runtime driving one controller from player events
pub struct AutoMixRuntime {
    controller: Arc<PlaybackController>,
    settings: Arc<dyn SettingsProvider>,
    playlists: RwLock<HashMap<Uuid, SharedPlaylist>>,
    states: RwLock<HashMap<ContextKey, AutoMixState>>,
    plans: RwLock<HashMap<ContextKey, MixPlan>>,
    last_started: RwLock<HashMap<Uuid, Uuid>>,
    active_break: RwLock<HashMap<Uuid, Uuid>>,
    enabled: AtomicBool,
    executor: CallbackExecutor,
    event_tx: mpsc::UnboundedSender<RuntimeEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<RuntimeEvent>>>,
}

impl AutoMixRuntime {
    pub fn new(
        controller: Arc<PlaybackController>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let executor = CallbackExecutor::new(settings.mix_executor());
        Arc::new(Self {
            controller,
            settings,
            playlists: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            last_started: RwLock::new(HashMap::new()),
            active_break: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            executor,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    pub fn controller(&self) -> &Arc<PlaybackController> {
        &self.controller
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Make a playlist known to the runtime.
    pub async fn register_playlist(&self, playlist: SharedPlaylist) {
        let id = playlist.read().await.id;
        self.playlists.write().await.insert(id, playlist);
    }

    pub async fn state(&self, key: &ContextKey) -> Option<AutoMixState> {
        self.states.read().await.get(key).copied()
    }

    pub async fn plan(&self, key: &ContextKey) -> Option<MixPlan> {
        self.plans.read().await.get(key).cloned()
    }

    /// Start consuming player events. Call once.
    pub fn spawn(self: &Arc<Self>) {
        let mut rx = match self.event_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    RuntimeEvent::Progress {
                        playlist_id,
                        item_id,
                        seconds,
                    } => runtime.handle_progress(playlist_id, item_id, seconds).await,
                    RuntimeEvent::NativeTrigger {
                        playlist_id,
                        item_id,
                    } => runtime.handle_native_trigger(playlist_id, item_id).await,
                    RuntimeEvent::Finished {
                        playlist_id,
                        item_id,
                    } => runtime.handle_finished(playlist_id, item_id).await,
                }
            }
        });
    }

    /// Stop a playlist's playback and forget its auto-mix state.
    pub async fn stop_playlist(&self, playlist_id: Uuid, fade_duration: f64) {
        self.controller.stop_playlist(playlist_id, fade_duration).await;
        self.states.write().await.retain(|key, _| key.0 != playlist_id);
        self.plans.write().await.retain(|key, _| key.0 != playlist_id);
        self.active_break.write().await.remove(&playlist_id);
    }

    fn callbacks_for(&self, playlist_id: Uuid) -> (FinishedCallback, ProgressCallback) {
        let finished_tx = self.event_tx.clone();
        let on_finished: FinishedCallback = Arc::new(move |item_id| {
            let _ = finished_tx.send(RuntimeEvent::Finished {
                playlist_id,
                item_id,
            });
        });
        let progress_tx = self.event_tx.clone();
        let on_progress: ProgressCallback = Arc::new(move |item_id, seconds| {
            let _ = progress_tx.send(RuntimeEvent::Progress {
                playlist_id,
                item_id,
                seconds,
            });
        });
        (on_finished, on_progress)
    }

    fn trigger_callback_for(self: &Arc<Self>, playlist_id: Uuid, item_id: Uuid) -> TriggerCallback {
        let tx = self.event_tx.clone();
        let runtime = Arc::clone(self);
        Arc::new(move || {
            let tx = tx.clone();
            runtime.executor.submit(move || {
                let _ = tx.send(RuntimeEvent::NativeTrigger {
                    playlist_id,
                    item_id,
                });
            });
        })
    }

    /// Start one item, arm its plan, and record break/loop intent.
    pub async fn start_playback(
        self: &Arc<Self>,
        playlist_id: Uuid,
        item_id: Uuid,
        restart_if_playing: bool,
    ) -> bool {
        let playlist = match self.playlists.read().await.get(&playlist_id).cloned() {
            Some(playlist) => playlist,
            None => return false,
        };

        self.controller.stop_preview(false).await;

        let item = {
            let model = playlist.read().await;
            match model.get_item(item_id) {
                Some(item) => item.clone(),
                None => return false,
            }
        };

        if !item.path.exists() {
            self.controller.announce(
                AnnouncementCategory::PlaybackErrors,
                &format!("File {} does not exist", item.path.display()),
            );
            let mut model = playlist.write().await;
            if let Some(entry) = model.get_item_mut(item_id) {
                entry.status = ItemStatus::Pending;
            }
            return false;
        }

        let key = (playlist_id, item_id);
        let fade_default = self.settings.fade_seconds();
        let is_music = item_is_music(&playlist).await;

        let plan = if is_music && item.break_after {
            MixPlanner::resolve(&item, 0.0, None)
        } else {
            MixPlanner::resolve(&item, fade_default, None)
        };

        let (on_finished, on_progress) = self.callbacks_for(playlist_id);
        let on_mix_trigger = if plan.mix_at.is_some() {
            Some(self.trigger_callback_for(playlist_id, item_id))
        } else {
            None
        };

        let start_seconds = item.cue_in_seconds.unwrap_or(0.0);
        let context = self
            .controller
            .start_item(
                &playlist,
                item_id,
                start_seconds,
                on_finished,
                on_progress,
                restart_if_playing,
                plan.mix_at,
                on_mix_trigger,
            )
            .await;

        let context = match context {
            Some(context) => context,
            None => return false,
        };

        // Reconcile against the real stream length when metadata lies
        let mut plan = plan;
        plan.native_trigger = context.player.supports_mix_trigger();
        let real_length = context.player.get_length_seconds();
        if real_length > 0.0 {
            let real_effective = (real_length - plan.base_cue).max(0.0);
            if (real_effective - plan.effective_duration).abs() > LENGTH_DISAGREEMENT
                && !item.break_after
            {
                debug!(
                    "Adjusting mix timing with stream length item={} meta={:.3} real={:.3}",
                    item_id, plan.effective_duration, real_effective
                );
                let mut adjusted = MixPlanner::resolve(&item, fade_default, Some(real_effective));
                adjusted.native_trigger = plan.native_trigger;
                plan = adjusted;
                if plan.native_trigger {
                    let callback = self.trigger_callback_for(playlist_id, item_id);
                    self.controller
                        .update_mix_trigger(playlist_id, item_id, plan.mix_at, Some(callback))
                        .await;
                }
            }
        }

        self.plans.write().await.insert(key, plan);
        self.states.write().await.remove(&key);
        self.last_started.write().await.insert(playlist_id, item_id);

        {
            let mut model = playlist.write().await;
            if item.is_selected {
                model.clear_selection(item_id);
            }
        }

        if is_music && item.break_after {
            self.states.write().await.insert(key, AutoMixState::BreakHalt);
            self.active_break.write().await.insert(playlist_id, item_id);
        }

        self.sync_loop_mix_trigger(playlist_id, item_id).await;

        if item.loop_enabled && item.has_loop() {
            self.controller
                .announce(AnnouncementCategory::Loop, "Loop playing");
        }

        self.controller
            .schedule_next_preload(&playlist, item_id)
            .await;
        true
    }

    /// Reconcile the mix trigger with the item's loop state: a held loop
    /// clears the trigger; disabling the loop re-arms it against the real
    /// stream length unless the mix point already passed.
    pub async fn sync_loop_mix_trigger(self: &Arc<Self>, playlist_id: Uuid, item_id: Uuid) {
        let playlist = match self.playlists.read().await.get(&playlist_id).cloned() {
            Some(playlist) => playlist,
            None => return,
        };
        let item = {
            let model = playlist.read().await;
            match model.get_item(item_id) {
                Some(item) => item.clone(),
                None => return,
            }
        };
        let key = (playlist_id, item_id);

        if item.loop_enabled && item.has_loop() {
            self.states.write().await.insert(key, AutoMixState::LoopHold);
            self.controller
                .update_mix_trigger(playlist_id, item_id, None, None)
                .await;
            self.plans.write().await.remove(&key);
            debug!("Loop hold active, mix trigger cleared item={}", item_id);
            return;
        }

        let was_holding =
            matches!(self.states.read().await.get(&key), Some(AutoMixState::LoopHold));
        if was_holding {
            self.states.write().await.remove(&key);
        } else if self.plans.read().await.contains_key(&key) {
            // Nothing to reconcile: no loop and the plan is armed
            return;
        }

        let context = match self.controller.context(&key).await {
            Some(context) => context,
            None => return,
        };

        let length = context.player.get_length_seconds();
        let override_len = if length > 0.0 {
            Some((length - item.cue_in_seconds.unwrap_or(0.0)).max(0.0))
        } else {
            None
        };

        let mut plan = MixPlanner::resolve(&item, self.settings.fade_seconds(), override_len);
        plan.native_trigger = context.player.supports_mix_trigger();
        let mix_at = match plan.mix_at {
            Some(mix_at) => mix_at,
            None => {
                self.plans.write().await.remove(&key);
                return;
            }
        };

        let current_abs = item.cue_in_seconds.unwrap_or(0.0) + item.current_position;
        if current_abs >= mix_at - MIX_REARM_LATE_WINDOW {
            debug!(
                "Loop disabled but mix point already passed item={} current={:.3} mix_at={:.3}",
                item_id, current_abs, mix_at
            );
            // Too late to arm; stay held so the item plays out
            self.states.write().await.insert(key, AutoMixState::LoopHold);
            return;
        }

        if plan.native_trigger {
            let callback = self.trigger_callback_for(playlist_id, item_id);
            self.controller
                .update_mix_trigger(playlist_id, item_id, Some(mix_at), Some(callback))
                .await;
        }
        debug!(
            "Loop disabled, rescheduled mix trigger item={} mix_at={:.3} native={}",
            item_id, mix_at, plan.native_trigger
        );
        self.plans.write().await.insert(key, plan);
        self.states.write().await.insert(key, AutoMixState::Armed);
    }

    /// Progress tick from a player monitor.
    pub async fn handle_progress(self: &Arc<Self>, playlist_id: Uuid, item_id: Uuid, seconds: f64) {
        let playlist = match self.playlists.read().await.get(&playlist_id).cloned() {
            Some(playlist) => playlist,
            None => return,
        };

        let (item, kind, break_resume, queued) = {
            let mut model = playlist.write().await;
            let kind = model.kind;
            let break_resume = model.break_resume_index;
            let queued = model.next_selected_item_id().is_some();
            let item = match model.get_item_mut(item_id) {
                Some(item) => {
                    item.current_position =
                        (seconds - item.cue_in_seconds.unwrap_or(0.0)).max(0.0);
                    item.clone()
                }
                None => return,
            };
            (item, kind, break_resume, queued)
        };

        let key = (playlist_id, item_id);

        if let Some(context) = self.controller.context(&key).await {
            alerts::evaluate_alerts(
                &context,
                &item,
                seconds,
                self.settings.as_ref(),
                self.controller.announcer.as_ref(),
            );
        }

        if kind != PlaylistKind::Music {
            return;
        }
        if break_resume.is_some() {
            return;
        }
        if self.active_break.read().await.contains_key(&playlist_id) {
            return;
        }
        match self.states.read().await.get(&key) {
            Some(AutoMixState::LoopHold) | Some(AutoMixState::BreakHalt)
            | Some(AutoMixState::Fired) => return,
            _ => {}
        }
        if !self.is_enabled() && !queued {
            return;
        }
        if item.break_after {
            return;
        }

        let plan = match self.plans.read().await.get(&key).cloned() {
            Some(plan) => plan,
            None => {
                let context = self.controller.context(&key).await;
                let native = context
                    .as_ref()
                    .map(|ctx| ctx.player.supports_mix_trigger())
                    .unwrap_or(false);
                let mut plan = MixPlanner::resolve(&item, self.settings.fade_seconds(), None);
                plan.native_trigger = native;
                self.plans.write().await.insert(key, plan.clone());
                plan
            }
        };

        let mut trigger_window = plan.fade_seconds.max(0.0);
        if let Some(overlap) = item.overlap_seconds {
            trigger_window = trigger_window.max(overlap);
        }
        if let Some(outro) = item.outro_seconds {
            trigger_window = trigger_window.max(outro);
        }

        match decide_on_progress(&plan, trigger_window, seconds) {
            ProgressDecision::Skip => {}
            ProgressDecision::Fire { fade_duration } => {
                self.fire_mix(playlist_id, item_id, fade_duration, queued).await;
            }
        }
    }

    /// Native mix callback, already marshalled off the backend thread.
    pub async fn handle_native_trigger(self: &Arc<Self>, playlist_id: Uuid, item_id: Uuid) {
        let playlist = match self.playlists.read().await.get(&playlist_id).cloned() {
            Some(playlist) => playlist,
            None => return,
        };
        let item = {
            let model = playlist.read().await;
            match model.get_item(item_id) {
                Some(item) => item.clone(),
                None => return,
            }
        };
        let key = (playlist_id, item_id);

        let queued = playlist.read().await.next_selected_item_id().is_some();
        if !self.is_enabled() && !queued {
            return;
        }
        match self.states.read().await.get(&key) {
            Some(AutoMixState::Fired) | Some(AutoMixState::LoopHold) => return,
            Some(AutoMixState::BreakHalt) => return,
            _ => {}
        }
        if item.break_after || self.active_break.read().await.get(&playlist_id) == Some(&item_id) {
            self.states.write().await.insert(key, AutoMixState::BreakHalt);
            debug!("Native trigger ignored due to break item={}", item_id);
            return;
        }

        let context = self.controller.context(&key).await;
        let length = context
            .as_ref()
            .map(|ctx| ctx.player.get_length_seconds())
            .filter(|len| *len > 0.0);

        let mut plan = match self.plans.read().await.get(&key).cloned() {
            Some(plan) => plan,
            None => {
                let mut plan = MixPlanner::resolve(&item, self.settings.fade_seconds(), None);
                plan.native_trigger = context
                    .as_ref()
                    .map(|ctx| ctx.player.supports_mix_trigger())
                    .unwrap_or(false);
                plan
            }
        };

        // Clamp the expected mix point to the real track length
        if let (Some(mix_at), Some(length)) = (plan.mix_at, length) {
            let max_mix = (length - 0.01).max(0.0);
            if mix_at > max_mix {
                debug!(
                    "Clamping mix trigger to track length item={} expected={:.3} clamped={:.3}",
                    item_id, mix_at, max_mix
                );
                plan.mix_at = Some(max_mix);
            }
        }

        let current_abs = item.cue_in_seconds.unwrap_or(0.0) + item.current_position;
        match decide_on_native(&plan, current_abs) {
            NativeDecision::Ignore => {}
            NativeDecision::DemoteToProgress => {
                // The backend fired early; disarm native and let the
                // progress path take over against the real length.
                self.controller
                    .update_mix_trigger(playlist_id, item_id, None, None)
                    .await;
                let override_len =
                    length.map(|len| (len - plan.base_cue).max(0.0));
                let mut fallback =
                    MixPlanner::resolve(&item, self.settings.fade_seconds(), override_len);
                if let (Some(mix_at), Some(len)) = (fallback.mix_at, length) {
                    fallback.mix_at = Some(mix_at.min((len - 0.01).max(0.0)));
                }
                fallback.native_trigger = false;
                debug!(
                    "Native trigger fired early item={} current={:.3} -> progress fallback",
                    item_id, current_abs
                );
                self.plans.write().await.insert(key, fallback);
                self.states.write().await.insert(key, AutoMixState::Armed);
            }
            NativeDecision::Fire { fade_duration } => {
                self.plans.write().await.insert(key, plan);
                self.fire_mix(playlist_id, item_id, fade_duration, queued).await;
            }
        }
    }

    /// Single-shot firing path shared by the native and progress triggers.
    async fn fire_mix(
        self: &Arc<Self>,
        playlist_id: Uuid,
        item_id: Uuid,
        fade_duration: f64,
        queued_selection: bool,
    ) {
        let key = (playlist_id, item_id);

        // Latch before any action that could re-enter the fire path
        {
            let mut plans = self.plans.write().await;
            match plans.get_mut(&key) {
                Some(plan) if !plan.triggered => plan.triggered = true,
                Some(_) => return,
                None => return,
            }
        }
        self.states.write().await.insert(key, AutoMixState::Fired);

        let started = self
            .start_next_in_sequence(playlist_id, !queued_selection)
            .await;

        if started {
            if fade_duration > 0.0 {
                if let Some(context) = self.controller.context(&key).await {
                    debug!(
                        "Auto-mix fade out item={} duration={:.3}",
                        item_id, fade_duration
                    );
                    context.player.fade_out(fade_duration);
                }
            }
        } else {
            // Clear the latch so the progress fallback may try again
            if let Some(plan) = self.plans.write().await.get_mut(&key) {
                plan.triggered = false;
            }
            self.states.write().await.remove(&key);
        }
    }

    /// Pick and start the next item of a MUSIC playlist.
    pub async fn start_next_in_sequence(
        self: &Arc<Self>,
        playlist_id: Uuid,
        ignore_queued: bool,
    ) -> bool {
        let playlist = match self.playlists.read().await.get(&playlist_id).cloned() {
            Some(playlist) => playlist,
            None => return false,
        };

        let next_item_id = {
            let mut model = playlist.write().await;
            let total = model.items.len();
            if total == 0 {
                self.controller.announce(
                    AnnouncementCategory::Playlist,
                    &format!("Playlist {} is empty", model.name),
                );
                return false;
            }

            let queued_idx = if ignore_queued {
                None
            } else {
                model
                    .next_selected_item_id()
                    .and_then(|id| model.index_of(id))
            };
            let break_resume = model.break_resume_index.take();
            let playing_ctx = self.controller.playlist_context(playlist_id).await;
            let playing_idx = match &playing_ctx {
                Some(((_, playing_item), _)) => model.index_of(*playing_item),
                None => None,
            };
            let last_started_idx = self
                .last_started
                .read()
                .await
                .get(&playlist_id)
                .and_then(|id| model.index_of(*id));

            let next = select_next_index(
                total,
                playing_idx,
                queued_idx,
                break_resume,
                last_started_idx,
                playing_idx,
            );
            next.map(|idx| model.items[idx].id)
        };

        match next_item_id {
            Some(next_id) => self.start_playback(playlist_id, next_id, false).await,
            None => {
                debug!("No startable item found for playlist {}", playlist_id);
                false
            }
        }
    }

    /// Finished callback: bookkeeping, PLAYED marking, break resume, and
    /// the chained start when auto-mix should keep rolling.
    pub async fn handle_finished(self: &Arc<Self>, playlist_id: Uuid, item_id: Uuid) {
        debug!("Playback finished playlist={} item={}", playlist_id, item_id);
        let key = (playlist_id, item_id);
        self.states.write().await.remove(&key);
        self.plans.write().await.remove(&key);

        if let Some(context) = self.controller.remove_context(&key).await {
            context.player.set_finished_callback(None);
            context.player.set_progress_callback(None);
            context.player.stop();
        }

        let playlist = match self.playlists.read().await.get(&playlist_id).cloned() {
            Some(playlist) => playlist,
            None => return,
        };

        let (kind, item_index, break_after, title) = {
            let model = playlist.read().await;
            let idx = model.index_of(item_id);
            let item = idx.map(|i| &model.items[i]);
            (
                model.kind,
                idx,
                item.map(|i| i.break_after).unwrap_or(false),
                item.map(|i| i.title.clone()).unwrap_or_default(),
            )
        };
        let item_index = match item_index {
            Some(idx) => idx,
            None => return,
        };

        let auto_remove = self.settings.auto_remove_played();
        {
            let mut model = playlist.write().await;
            if auto_remove {
                let removed = model.items.remove(item_index);
                self.controller.announce(
                    AnnouncementCategory::PlaybackEvents,
                    &format!("Removed played track {}", removed.title),
                );
            } else {
                model.mark_played(item_id);
                self.controller.announce(
                    AnnouncementCategory::PlaybackEvents,
                    &format!("Finished {}", title),
                );
            }
        }

        let active_break = self.active_break.read().await.get(&playlist_id).copied();
        let break_flag = kind == PlaylistKind::Music
            && (break_after || active_break == Some(item_id));

        if break_flag {
            let mut model = playlist.write().await;
            let total = model.items.len();
            model.break_resume_index = if total > 0 {
                Some((item_index + 1) % total)
            } else {
                None
            };
            if let Some(item) = model.get_item_mut(item_id) {
                item.break_after = false;
            }
            drop(model);
            self.active_break.write().await.remove(&playlist_id);
            self.last_started.write().await.insert(playlist_id, item_id);
            return;
        }

        if self.is_enabled() && kind == PlaylistKind::Music {
            self.last_started.write().await.insert(playlist_id, item_id);
            let still_playing = self.controller.playlist_context(playlist_id).await.is_some();
            if !still_playing {
                let started = self.start_next_in_sequence(playlist_id, true).await;
                if !started {
                    warn!("Auto-mix fallback after finish failed playlist={}", playlist_id);
                }
            }
        }
    }
}

async fn item_is_music(playlist: &SharedPlaylist) -> bool {
    playlist.read().await.kind == PlaylistKind::Music
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(mix_at: Option<f64>, fade: f64, base_cue: f64, effective: f64, native: bool) -> MixPlan {
        MixPlan {
            mix_at,
            fade_seconds: fade,
            base_cue,
            effective_duration: effective,
            native_trigger: native,
            triggered: false,
        }
    }

    #[test]
    fn test_progress_fires_near_mix_point() {
        // Explicit segue, progress path (no native trigger)
        let p = plan(Some(150.0), 3.0, 0.0, 155.0, false);
        assert_eq!(decide_on_progress(&p, 3.0, 100.0), ProgressDecision::Skip);
        match decide_on_progress(&p, 3.0, 149.99) {
            ProgressDecision::Fire { fade_duration } => {
                assert!((fade_duration - 3.0).abs() < 1e-6);
            }
            other => panic!("expected fire, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_waits_for_native_window() {
        let p = plan(Some(150.0), 3.0, 0.0, 155.0, true);
        // Inside the native window: hold off
        assert_eq!(decide_on_progress(&p, 3.0, 150.0), ProgressDecision::Skip);
        assert_eq!(decide_on_progress(&p, 3.0, 150.05), ProgressDecision::Skip);
        // Past the window: progress takes over
        match decide_on_progress(&p, 3.0, 150.2) {
            ProgressDecision::Fire { .. } => {}
            other => panic!("expected fire, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_fade_clamped_to_remaining() {
        // Overlap 2.5 on a 10 s track, fire at 8.5 leaves 1.5 s
        let p = plan(Some(7.5), 2.5, 0.0, 10.0, false);
        match decide_on_progress(&p, 2.5, 8.5) {
            ProgressDecision::Fire { fade_duration } => {
                assert!((fade_duration - 1.5).abs() < 1e-6);
            }
            other => panic!("expected fire, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_without_mix_point_uses_window() {
        let p = plan(None, 0.0, 0.0, 100.0, false);
        assert_eq!(decide_on_progress(&p, 0.0, 99.0), ProgressDecision::Skip);
        match decide_on_progress(&p, 0.0, 99.95) {
            ProgressDecision::Fire { .. } => {}
            other => panic!("expected fire, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_latched_plan_skips() {
        let mut p = plan(Some(10.0), 1.0, 0.0, 12.0, false);
        p.triggered = true;
        assert_eq!(decide_on_progress(&p, 1.0, 11.0), ProgressDecision::Skip);
    }

    #[test]
    fn test_native_early_fire_demotes() {
        // Segue 8 on a 12 s track, callback arrives at 5.0
        let p = plan(Some(8.0), 2.0, 0.0, 12.0, true);
        assert_eq!(decide_on_native(&p, 5.0), NativeDecision::DemoteToProgress);
    }

    #[test]
    fn test_native_on_time_fires() {
        let p = plan(Some(8.0), 2.0, 0.0, 12.0, true);
        match decide_on_native(&p, 8.0) {
            NativeDecision::Fire { fade_duration } => {
                assert!((fade_duration - 2.0).abs() < 1e-6);
            }
            other => panic!("expected fire, got {:?}", other),
        }
    }

    #[test]
    fn test_native_slightly_early_within_tolerance_fires() {
        let p = plan(Some(8.0), 2.0, 0.0, 12.0, true);
        match decide_on_native(&p, 7.5) {
            NativeDecision::Fire { .. } => {}
            other => panic!("expected fire, got {:?}", other),
        }
    }

    #[test]
    fn test_native_latched_ignores() {
        let mut p = plan(Some(8.0), 2.0, 0.0, 12.0, true);
        p.triggered = true;
        assert_eq!(decide_on_native(&p, 8.0), NativeDecision::Ignore);
    }

    #[test]
    fn test_select_next_sequential() {
        assert_eq!(select_next_index(5, Some(2), None, None, None, None), Some(3));
        assert_eq!(select_next_index(5, Some(4), None, None, None, None), Some(0));
    }

    #[test]
    fn test_select_next_queued_wins() {
        assert_eq!(
            select_next_index(5, Some(2), Some(0), Some(4), Some(1), None),
            Some(0)
        );
    }

    #[test]
    fn test_select_next_break_resume_beats_tracker() {
        assert_eq!(
            select_next_index(5, None, None, Some(4), Some(1), None),
            Some(4)
        );
    }

    #[test]
    fn test_select_next_skips_playing() {
        assert_eq!(
            select_next_index(5, Some(2), None, None, None, Some(3)),
            Some(4)
        );
    }

    #[test]
    fn test_select_next_single_playing_aborts() {
        assert_eq!(select_next_index(1, Some(0), None, None, None, Some(0)), None);
    }

    #[test]
    fn test_select_next_empty() {
        assert_eq!(select_next_index(0, None, None, None, None, None), None);
    }
}
