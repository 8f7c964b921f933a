//! Player monitor thread
//!
//! Polls the stream at a millisecond cadence: emits progress callbacks
//! every 50 ms, enforces the loop boundary when the native sync is late,
//! restarts a looping stream that reports inactive instead of declaring
//! end-of-stream, and fires the finished callback exactly once on a true
//! stop.

use crate::player::PlayerShared;
use sara_common::params::{
    LOOP_GUARD_SLACK, LOOP_HARD_CLAMP, MONITOR_INTERVAL, PROGRESS_CADENCE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error};

pub(crate) fn start_monitor(shared: Arc<PlayerShared>) {
    let stop = Arc::new(AtomicBool::new(false));
    let exited = crate::player::WaitFlag::new();
    *shared.monitor_stop.lock().unwrap() = Arc::clone(&stop);
    *shared.monitor_exited.lock().unwrap() = Arc::clone(&exited);

    let spawned = thread::Builder::new()
        .name("player-monitor".into())
        .spawn(move || {
            run_monitor(&shared, &stop);
            exited.set();
        });
    if let Err(e) = spawned {
        error!("Failed to spawn monitor thread: {}", e);
    }
}

fn run_monitor(shared: &Arc<PlayerShared>, stop: &AtomicBool) {
    let mut last_progress: Option<Instant> = None;

    while !stop.load(Ordering::Acquire) {
        let (stream, item_id) = {
            let state = shared.state.lock().unwrap();
            (state.stream, state.item_id)
        };
        let (stream, item_id) = match (stream, item_id) {
            (Some(stream), Some(item_id)) => (stream, item_id),
            _ => break,
        };

        // Progress cadence
        let now = Instant::now();
        let due = last_progress
            .map(|t| now.duration_since(t).as_secs_f64() >= PROGRESS_CADENCE)
            .unwrap_or(true);
        if due {
            let callback = shared.progress_cb.lock().unwrap().clone();
            if let Some(callback) = callback {
                let position = shared.backend.position_seconds(stream);
                callback(item_id, position);
            }
            last_progress = Some(now);
        }

        // Software loop guard: give the native sync first chance, react
        // once the position passes loop end by the slack, clamp hard on a
        // large excursion.
        if shared.loop_active.load(Ordering::Acquire) {
            if let Some((_, loop_end)) = *shared.loop_points.lock().unwrap() {
                let since_jump = shared
                    .last_loop_jump
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed().as_secs_f64())
                    .unwrap_or(f64::MAX);
                if since_jump > LOOP_GUARD_SLACK {
                    let position = shared.backend.position_seconds(stream);
                    if position > loop_end + LOOP_HARD_CLAMP {
                        shared.jump_to_loop_start("clamp");
                    } else if position > loop_end + LOOP_GUARD_SLACK {
                        shared.jump_to_loop_start("guard");
                    }
                }
            }
        }

        if !shared.backend.is_active(stream) {
            if shared.loop_active.load(Ordering::Acquire) {
                // Looping stream ran out of data before the sync landed;
                // resume and re-seek instead of reporting end-of-stream.
                if let Err(e) = shared.backend.play(stream) {
                    debug!("Loop restart failed: {}", e);
                }
                if let Some((loop_start, _)) = *shared.loop_points.lock().unwrap() {
                    shared.backend.set_position_seconds(stream, loop_start);
                }
                thread::sleep(MONITOR_INTERVAL);
                continue;
            }

            shared.fire_finished(item_id);
            shared.stop_internal(true);
            break;
        }

        thread::sleep(MONITOR_INTERVAL);
    }
}
