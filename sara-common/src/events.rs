//! Announcement events
//!
//! The playout core reports user-visible events through a single
//! `announce(category, message)` call. The categories here match the event
//! groups the announcement sink may filter on; the sink decides whether to
//! queue, speak, or drop each one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a user-visible announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementCategory {
    /// Output device problems (missing, exhausted, refreshed)
    Device,
    /// PFL preview problems (busy, unavailable, setup failure)
    Pfl,
    /// Loop runtime notices
    Loop,
    /// Playback failures (stream create, callback assignment)
    PlaybackErrors,
    /// Normal playback progress (started, finished, removed)
    PlaybackEvents,
    /// Playlist-level notices (empty, no scheduled tracks)
    Playlist,
}

impl fmt::Display for AnnouncementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnnouncementCategory::Device => "device",
            AnnouncementCategory::Pfl => "pfl",
            AnnouncementCategory::Loop => "loop",
            AnnouncementCategory::PlaybackErrors => "playback_errors",
            AnnouncementCategory::PlaybackEvents => "playback_events",
            AnnouncementCategory::Playlist => "playlist",
        };
        write!(f, "{}", name)
    }
}

/// A single user-visible event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub category: AnnouncementCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Announcement {
    pub fn new(category: AnnouncementCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
