//! Playlist data model
//!
//! The playlist layer proper (ordering, import, persistence) lives outside
//! the core; these types are the view of it the runtime reads and the
//! status/position fields it writes back through callbacks.

use crate::backend::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a playlist item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Playing,
    Paused,
    Played,
}

/// Playlist flavor; only MUSIC playlists auto-mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistKind {
    Music,
    News,
    Folder,
}

/// One scheduled audio item with its mix markers
///
/// `duration_seconds` comes from metadata and may disagree with the real
/// stream length; `segue_seconds` is absolute in the file; `overlap_seconds`
/// is a tail duration; loop points are absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: Uuid,
    pub title: String,
    pub path: PathBuf,
    pub duration_seconds: f64,
    pub cue_in_seconds: Option<f64>,
    pub intro_seconds: Option<f64>,
    pub outro_seconds: Option<f64>,
    pub segue_seconds: Option<f64>,
    pub segue_fade_seconds: Option<f64>,
    pub overlap_seconds: Option<f64>,
    pub replay_gain_db: Option<f64>,
    pub loop_start_seconds: Option<f64>,
    pub loop_end_seconds: Option<f64>,
    pub loop_enabled: bool,
    pub loop_auto_enabled: bool,
    pub break_after: bool,
    pub is_selected: bool,
    pub status: ItemStatus,
    /// Stream-relative seconds from cue-in, updated by progress callbacks
    pub current_position: f64,
}

impl PlaylistItem {
    /// New pending item with no markers set.
    pub fn new(title: impl Into<String>, path: impl Into<PathBuf>, duration_seconds: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            path: path.into(),
            duration_seconds,
            cue_in_seconds: None,
            intro_seconds: None,
            outro_seconds: None,
            segue_seconds: None,
            segue_fade_seconds: None,
            overlap_seconds: None,
            replay_gain_db: None,
            loop_start_seconds: None,
            loop_end_seconds: None,
            loop_enabled: false,
            loop_auto_enabled: false,
            break_after: false,
            is_selected: false,
            status: ItemStatus::Pending,
            current_position: 0.0,
        }
    }

    /// Duration from cue-in to the metadata end, never negative.
    pub fn effective_duration_seconds(&self) -> f64 {
        (self.duration_seconds - self.cue_in_seconds.unwrap_or(0.0)).max(0.0)
    }

    /// True when both loop points are set and ordered.
    pub fn has_loop(&self) -> bool {
        matches!(
            (self.loop_start_seconds, self.loop_end_seconds),
            (Some(start), Some(end)) if end > start
        )
    }
}

/// Ordered playlist plus its configured output slots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistModel {
    pub id: Uuid,
    pub name: String,
    pub kind: PlaylistKind,
    pub items: Vec<PlaylistItem>,
    /// Configured output devices in slot order; `None` = unassigned slot
    pub output_slots: Vec<Option<DeviceId>>,
    /// Where auto-mix resumes after a break item finished
    pub break_resume_index: Option<usize>,
    /// Round-robin cursor for slot selection
    #[serde(default)]
    next_slot_cursor: usize,
}

impl PlaylistModel {
    pub fn new(name: impl Into<String>, kind: PlaylistKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            items: Vec::new(),
            output_slots: Vec::new(),
            break_resume_index: None,
            next_slot_cursor: 0,
        }
    }

    pub fn get_item(&self, item_id: Uuid) -> Option<&PlaylistItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn get_item_mut(&mut self, item_id: Uuid) -> Option<&mut PlaylistItem> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }

    pub fn index_of(&self, item_id: Uuid) -> Option<usize> {
        self.items.iter().position(|i| i.id == item_id)
    }

    /// Configured slots with unassigned entries filtered out.
    pub fn configured_slots(&self) -> Vec<DeviceId> {
        self.output_slots.iter().flatten().cloned().collect()
    }

    /// Pick the next configured slot whose device is known and not busy.
    ///
    /// Walks the slots round-robin from the last pick so successive items
    /// alternate across configured outputs. Returns `(slot_index, device)`.
    pub fn select_next_slot(
        &mut self,
        known_devices: &HashSet<DeviceId>,
        busy_devices: &HashSet<DeviceId>,
    ) -> Option<(usize, DeviceId)> {
        let total = self.output_slots.len();
        if total == 0 {
            return None;
        }
        for offset in 0..total {
            let idx = (self.next_slot_cursor + offset) % total;
            if let Some(device) = self.output_slots[idx].clone() {
                if known_devices.contains(&device) && !busy_devices.contains(&device) {
                    self.next_slot_cursor = (idx + 1) % total;
                    return Some((idx, device));
                }
            }
        }
        // Hand back a configured slot whose device has disappeared so the
        // caller can null it and retry; busy-but-known slots yield None
        // and the fallback scoring takes over.
        for (idx, slot) in self.output_slots.iter().enumerate() {
            if let Some(device) = slot.clone() {
                if !known_devices.contains(&device) {
                    return Some((idx, device));
                }
            }
        }
        None
    }

    /// Id of the item the operator queued next, if any.
    pub fn next_selected_item_id(&self) -> Option<Uuid> {
        self.items.iter().find(|i| i.is_selected).map(|i| i.id)
    }

    /// Consume the preferred (or first pending) item for starting.
    ///
    /// Leaves status untouched; the start path marks PLAYING only after the
    /// player accepted the stream.
    pub fn begin_next_item(&mut self, preferred: Option<Uuid>) -> Option<Uuid> {
        if let Some(id) = preferred {
            if self.get_item(id).is_some() {
                return Some(id);
            }
        }
        self.items
            .iter()
            .find(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Paused))
            .map(|i| i.id)
    }

    pub fn mark_played(&mut self, item_id: Uuid) {
        if let Some(item) = self.get_item_mut(item_id) {
            item.status = ItemStatus::Played;
            item.current_position = item.effective_duration_seconds();
        }
    }

    pub fn clear_selection(&mut self, item_id: Uuid) {
        if let Some(item) = self.get_item_mut(item_id) {
            item.is_selected = false;
        }
    }
}
