//! Fade-out thread
//!
//! Divides the fade into equal linear steps, multiplying the gain down on
//! each step. The fade observes the player's stream generation so a stale
//! fade cannot mutate volume on a replaced stream; completion stops the
//! player and reports finished.

use crate::player::{PlayerShared, WaitFlag};
use sara_common::params::{FADE_MIN_STEPS, FADE_STEP_SECONDS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub(crate) fn fade_out(shared: &Arc<PlayerShared>, duration: f64) {
    let (stream, item_id) = {
        let state = shared.state.lock().unwrap();
        (state.stream, state.item_id)
    };

    let stream = match stream {
        Some(stream) => stream,
        None => {
            shared.stop_internal(false);
            return;
        }
    };

    if duration <= 0.0 {
        shared.stop_internal(false);
        if let Some(item_id) = item_id {
            shared.fire_finished(item_id);
        }
        return;
    }

    // One fade at a time; a second request while stepping is ignored
    {
        let fade_done = shared.fade_done.lock().unwrap();
        if let Some(done) = fade_done.as_ref() {
            if !done.is_set() {
                debug!("Fade already in progress, ignoring request");
                return;
            }
        }
    }

    let done = WaitFlag::new();
    *shared.fade_done.lock().unwrap() = Some(Arc::clone(&done));

    let generation = shared.generation.load(Ordering::Acquire);
    let shared = Arc::clone(shared);
    let started = Instant::now();

    let spawned = thread::Builder::new()
        .name("player-fade".into())
        .spawn(move || {
            let steps = ((duration / FADE_STEP_SECONDS) as u32).max(FADE_MIN_STEPS);
            let step_sleep = Duration::from_secs_f64(duration / steps as f64);
            let initial = *shared.gain.lock().unwrap();
            let mut interrupted = false;

            debug!(
                "Fade start stream={} duration={:.3} gain={:.3} steps={}",
                stream.0, duration, initial, steps
            );

            for i in 1..=steps {
                if shared.generation.load(Ordering::Acquire) != generation {
                    interrupted = true;
                    break;
                }
                let factor = initial * (1.0 - i as f32 / steps as f32);
                shared.backend.set_volume(stream, factor);
                thread::sleep(step_sleep);
            }

            let completed =
                !interrupted && shared.generation.load(Ordering::Acquire) == generation;
            debug!(
                "Fade done stream={} requested={:.3} elapsed={:.3} completed={}",
                stream.0,
                duration,
                started.elapsed().as_secs_f64(),
                completed
            );

            if completed {
                shared.stop_internal(true);
                if let Some(item_id) = item_id {
                    shared.fire_finished(item_id);
                }
            } else {
                // Restore the configured gain for whatever now owns the slot
                shared.backend.set_volume(stream, *shared.gain.lock().unwrap());
            }
            done.set();
        });

    if let Err(e) = spawned {
        error!("Failed to spawn fade thread: {}", e);
    }
}
