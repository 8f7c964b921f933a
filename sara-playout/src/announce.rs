//! Announcement sink
//!
//! The core emits at most one announcement per user-visible event; the
//! sink decides whether to queue, speak, or drop it. The default sink
//! routes everything to the log.

use sara_common::events::{Announcement, AnnouncementCategory};
use std::sync::Mutex;
use tracing::info;

/// Receives user-visible event notifications
pub trait AnnouncementSink: Send + Sync {
    fn announce(&self, category: AnnouncementCategory, message: &str);
}

/// Sink that logs announcements through `tracing`
pub struct LogSink;

impl AnnouncementSink for LogSink {
    fn announce(&self, category: AnnouncementCategory, message: &str) {
        info!("[{}] {}", category, message);
    }
}

/// Sink that records announcements for inspection (tests, UI polling)
#[derive(Default)]
pub struct RecordingSink {
    recorded: Mutex<Vec<Announcement>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Announcement> {
        std::mem::take(&mut self.recorded.lock().unwrap())
    }

    pub fn count(&self, category: AnnouncementCategory) -> usize {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.category == category)
            .count()
    }
}

impl AnnouncementSink for RecordingSink {
    fn announce(&self, category: AnnouncementCategory, message: &str) {
        self.recorded
            .lock()
            .unwrap()
            .push(Announcement::new(category, message));
    }
}
