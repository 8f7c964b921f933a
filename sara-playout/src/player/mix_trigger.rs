//! Native mix trigger arming
//!
//! Installs a position sync (mix-time) and an end-of-stream sync for the
//! armed mix point. Both share an idempotent latch so the trigger fires
//! exactly once per item lifetime even when the stream ends right on the
//! mix point. The target is clamped to the stream length minus a small
//! margin so a segue set at the very end still fires.

use crate::backend::{SyncCallback, SyncMode};
use crate::player::{PlayerShared, TriggerCallback};
use sara_common::params::MIX_TRIGGER_END_MARGIN;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

pub(crate) fn apply_mix_trigger(
    shared: &Arc<PlayerShared>,
    target_seconds: Option<f64>,
    callback: Option<TriggerCallback>,
) {
    let target = match (target_seconds, callback) {
        (Some(target), Some(callback)) if target > 0.0 => (target, callback),
        _ => return,
    };
    let (requested, callback) = target;

    let stream = match shared.state.lock().unwrap().stream {
        Some(stream) => stream,
        None => return,
    };

    let length = shared.backend.length_seconds(stream);
    let clamped = if length > 0.0 && requested > length - MIX_TRIGGER_END_MARGIN {
        (length - MIX_TRIGGER_END_MARGIN).max(0.0)
    } else {
        requested
    };

    shared.mix_latch.store(false, Ordering::Release);

    let make_latched = |shared: &Arc<PlayerShared>, callback: &TriggerCallback| -> SyncCallback {
        let latch = Arc::downgrade(shared);
        let callback = Arc::clone(callback);
        Arc::new(move || {
            if let Some(shared) = latch.upgrade() {
                if !shared.mix_latch.swap(true, Ordering::AcqRel) {
                    callback();
                }
            }
        })
    };

    let mut state = shared.state.lock().unwrap();
    if state.stream != Some(stream) {
        return;
    }

    match shared
        .backend
        .add_sync_position(stream, clamped, SyncMode::MixTime, make_latched(shared, &callback))
    {
        Ok(id) => state.mix_syncs.push(id),
        Err(e) => {
            debug!("Failed to set mix trigger sync: {}", e);
            return;
        }
    }
    match shared
        .backend
        .add_sync_end(stream, make_latched(shared, &callback))
    {
        Ok(id) => state.mix_syncs.push(id),
        Err(e) => debug!("Failed to set mix trigger end sync: {}", e),
    }

    debug!(
        "Mix trigger set stream={} target={:.3} (requested={:.3})",
        stream.0, clamped, requested
    );
}
