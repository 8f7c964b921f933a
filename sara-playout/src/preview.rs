//! PFL preview engine
//!
//! Rehearses playback on the operator's monitor device without touching
//! on-air playback. A single preview may exist at a time; starting a new
//! one stops and waits out the previous. The mix preview runs two players:
//! A from a few seconds before the mix point, B fired by a native sync on
//! A (or a timer fallback), with a linear fade on A across the transition.

use crate::backend::DeviceId;
use crate::controller::PlaybackController;
use crate::error::{Error, PreviewError, Result};
use crate::model::PlaylistItem;
use crate::player::{Player, TriggerCallback};
use sara_common::events::AnnouncementCategory;
use sara_common::params::{PREVIEW_FINISH_TIMEOUT, PREVIEW_TAIL_SECONDS};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Settable async event signalling preview teardown
pub struct PreviewStop {
    flag: AtomicBool,
    notify: Notify,
}

impl PreviewStop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn set(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// The one live preview
pub struct PreviewContext {
    pub players: Vec<Arc<Player>>,
    pub device_id: DeviceId,
    pub item_path: PathBuf,
    pub stop: Arc<PreviewStop>,
}

impl PlaybackController {
    /// Resolve and validate the PFL device for a new preview.
    async fn acquire_pfl_device(&self) -> Result<DeviceId> {
        let pfl = {
            self.pfl_device
                .lock()
                .unwrap()
                .clone()
                .or_else(|| self.settings.pfl_device())
        };
        let pfl = match pfl {
            Some(pfl) => pfl,
            None => {
                self.announce(
                    AnnouncementCategory::Pfl,
                    "Configure a PFL device in Options",
                );
                return Err(PreviewError::NoPflDevice.into());
            }
        };

        if !self.devices.is_known(&pfl) {
            self.devices.refresh();
        }
        if !self.devices.is_known(&pfl) {
            self.announce(
                AnnouncementCategory::Pfl,
                "Selected PFL device is not available",
            );
            return Err(PreviewError::PflUnavailable {
                device: pfl.to_string(),
            }
            .into());
        }

        if self.busy_device_ids().await.contains(&pfl) {
            self.announce(AnnouncementCategory::Pfl, "PFL device is currently in use");
            return Err(PreviewError::PflBusy.into());
        }
        Ok(pfl)
    }

    fn new_pfl_player(&self, device: &DeviceId) -> Arc<Player> {
        Player::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.devices),
            device.clone(),
        )
    }

    /// Stop the live preview, if any.
    ///
    /// With `wait`, returns only once every preview player reports
    /// inactive or 500 ms have elapsed; no preview stream survives.
    pub async fn stop_preview(&self, wait: bool) {
        let context = { self.preview.lock().await.take() };
        let context = match context {
            Some(context) => context,
            None => return,
        };

        context.stop.set();
        for player in &context.players {
            player.set_loop(None, None);
            player.stop();
        }

        if wait {
            let deadline = tokio::time::Instant::now() + PREVIEW_FINISH_TIMEOUT;
            loop {
                if context.players.iter().all(|p| !p.is_active()) {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!("Preview players still active after stop timeout");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// Audition one item on the PFL device, optionally looping a range.
    pub async fn start_preview(
        &self,
        item: &PlaylistItem,
        start: f64,
        loop_range: Option<(f64, f64)>,
    ) -> Result<()> {
        debug!(
            "start_preview item={} start={:.3} loop={:?}",
            item.title, start, loop_range
        );
        if let Some((loop_start, loop_end)) = loop_range {
            if loop_end <= loop_start {
                self.announce(
                    AnnouncementCategory::Loop,
                    "Loop end must be greater than start",
                );
                return Err(PreviewError::SetupFailed {
                    reason: "loop end must be greater than start".into(),
                }
                .into());
            }
        }

        self.stop_preview(true).await;
        let pfl = self.acquire_pfl_device().await?;
        let player = self.new_pfl_player(&pfl);

        player.set_finished_callback(None);
        player.set_progress_callback(None);
        player.set_gain_db(item.replay_gain_db);
        if let Some((loop_start, loop_end)) = loop_range {
            player.set_loop(Some(loop_start), Some(loop_end));
        }

        if let Err(e) = player.play(item.id, &item.path, start, true, None, None) {
            self.announce(
                AnnouncementCategory::Pfl,
                &format!("Preview error: {}", e),
            );
            player.stop();
            return Err(Error::Preview(PreviewError::SetupFailed {
                reason: e.to_string(),
            }));
        }

        *self.preview.lock().await = Some(PreviewContext {
            players: vec![player],
            device_id: pfl,
            item_path: item.path.clone(),
            stop: PreviewStop::new(),
        });
        Ok(())
    }

    /// Rehearse the crossfade from `current` into `next` on the PFL device.
    ///
    /// Player A starts `pre_seconds` before `mix_at`; a native sync on A
    /// (or a timer fallback) fires B at the next item's cue and fades A
    /// over `min(fade_seconds, track_end - mix_at)`. The whole preview
    /// auto-stops a few seconds after the rehearsed fade.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_mix_preview(
        self: &Arc<Self>,
        current: &PlaylistItem,
        next: &PlaylistItem,
        mix_at_seconds: f64,
        pre_seconds: f64,
        fade_seconds: f64,
        current_effective_duration: Option<f64>,
        next_cue_override: Option<f64>,
    ) -> Result<()> {
        self.stop_preview(false).await;
        let pfl = self.acquire_pfl_device().await?;

        let player_a = self.new_pfl_player(&pfl);
        let player_b = self.new_pfl_player(&pfl);
        player_a.set_gain_db(current.replay_gain_db);
        player_b.set_gain_db(next.replay_gain_db);

        let start_a = (mix_at_seconds - pre_seconds).max(0.0);
        let effective_duration = current_effective_duration
            .map(|d| d.max(0.0))
            .unwrap_or_else(|| current.effective_duration_seconds());
        let remaining_current = (effective_duration - mix_at_seconds).max(0.0);
        let fade_len = if remaining_current > 0.0 {
            fade_seconds.max(0.0).min(remaining_current)
        } else {
            0.0
        };
        let next_start = next_cue_override.unwrap_or(next.cue_in_seconds.unwrap_or(0.0));
        let delay_b = (mix_at_seconds - start_a).max(0.0);

        debug!(
            "PFL mix preview: current={} next={} mix_at={:.3} pre={:.3} fade={:.3} cue_next={:.3}",
            current.title, next.title, mix_at_seconds, pre_seconds, fade_len, next_start
        );

        // Warm the next file so firing B does not stall on cold IO
        {
            let path = next.path.clone();
            tokio::task::spawn_blocking(move || {
                use std::io::Read;
                if let Ok(mut file) = std::fs::File::open(&path) {
                    let mut buffer = vec![0u8; 256 * 1024];
                    let _ = file.read(&mut buffer);
                }
            });
        }

        let stop = PreviewStop::new();

        let fire_mix: TriggerCallback = {
            let stop = Arc::clone(&stop);
            let player_a = Arc::clone(&player_a);
            let player_b = Arc::clone(&player_b);
            let next_id = next.id;
            let next_path = next.path.clone();
            Arc::new(move || {
                if stop.is_set() {
                    return;
                }
                if let Err(e) = player_b.play(next_id, &next_path, next_start, false, None, None) {
                    debug!("Mix preview player B failed: {}", e);
                    return;
                }
                if fade_len > 0.0 {
                    player_a.fade_out(fade_len);
                }
            })
        };

        if let Err(e) = player_a.play(current.id, &current.path, start_a, false, None, None) {
            self.announce(
                AnnouncementCategory::Pfl,
                &format!("Failed to start mix preview: {}", e),
            );
            player_a.stop();
            player_b.stop();
            return Err(Error::Preview(PreviewError::SetupFailed {
                reason: e.to_string(),
            }));
        }

        if delay_b <= 0.0 {
            // Mix point already behind start A; fire both immediately
            fire_mix();
        } else if player_a.supports_mix_trigger() {
            player_a.set_mix_trigger(Some(mix_at_seconds), Some(Arc::clone(&fire_mix)));
        } else {
            let stop_wait = Arc::clone(&stop);
            let fire = Arc::clone(&fire_mix);
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop_wait.wait() => {}
                    _ = tokio::time::sleep(Duration::from_secs_f64(delay_b)) => {
                        let _ = tokio::task::spawn_blocking(move || fire()).await;
                    }
                }
            });
        }

        // Auto-stop once the rehearsed window has played out
        let total_preview = pre_seconds + fade_len.max(0.0) + PREVIEW_TAIL_SECONDS;
        {
            let stop_wait = Arc::clone(&stop);
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop_wait.wait() => {}
                    _ = tokio::time::sleep(Duration::from_secs_f64(total_preview)) => {
                        controller.stop_preview(false).await;
                    }
                }
            });
        }

        *self.preview.lock().await = Some(PreviewContext {
            players: vec![player_a, player_b],
            device_id: pfl,
            item_path: current.path.clone(),
            stop,
        });
        Ok(())
    }

    /// Move the loop points of a running single-item preview.
    pub async fn update_loop_preview(&self, item: &PlaylistItem, start: f64, end: f64) -> bool {
        if end <= start {
            return false;
        }
        let preview = self.preview.lock().await;
        let context = match preview.as_ref() {
            Some(context) if context.players.len() == 1 && context.item_path == item.path => {
                context
            }
            _ => return false,
        };
        context.players[0].set_loop(Some(start), Some(end));
        true
    }
}
