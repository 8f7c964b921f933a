//! Intro and track-end alerts
//!
//! Evaluated on every progress tick; each alert fires once per context,
//! latched on the `PlaybackContext` so repeated ticks inside the alert
//! window stay silent.

use crate::announce::AnnouncementSink;
use crate::controller::PlaybackContext;
use crate::model::PlaylistItem;
use crate::settings::SettingsProvider;
use sara_common::events::AnnouncementCategory;
use sara_common::human_time::format_countdown;
use std::sync::atomic::Ordering;

/// Check both alert windows for a progress tick at absolute `seconds`.
pub fn evaluate_alerts(
    context: &PlaybackContext,
    item: &PlaylistItem,
    seconds: f64,
    settings: &dyn SettingsProvider,
    announcer: &dyn AnnouncementSink,
) {
    if let Some(intro) = context.intro_seconds {
        let lead = settings.intro_alert_seconds();
        if lead > 0.0
            && seconds >= intro - lead
            && seconds < intro
            && !context.intro_alert_triggered.swap(true, Ordering::AcqRel)
        {
            announcer.announce(
                AnnouncementCategory::PlaybackEvents,
                &format!("Intro ends in {}", format_countdown(intro - seconds)),
            );
        }
    }

    let threshold = settings.track_end_alert_seconds();
    if threshold > 0.0 {
        let base_cue = item.cue_in_seconds.unwrap_or(0.0);
        let remaining = (base_cue + item.effective_duration_seconds() - seconds).max(0.0);
        if remaining > 0.0
            && remaining <= threshold
            && !context
                .track_end_alert_triggered
                .swap(true, Ordering::AcqRel)
        {
            announcer.announce(
                AnnouncementCategory::PlaybackEvents,
                &format!("{} ends in {}", item.title, format_countdown(remaining)),
            );
        }
    }
}
