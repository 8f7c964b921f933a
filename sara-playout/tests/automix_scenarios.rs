//! Auto-mix runtime scenarios: segue/overlap transitions, loop holds,
//! native trigger guards, break markers, and the single-shot latch.

mod helpers;

use helpers::TestRig;
use sara_playout::automix::{AutoMixRuntime, AutoMixState};
use sara_playout::model::ItemStatus;
use std::sync::Arc;

fn runtime_for(rig: &TestRig) -> Arc<AutoMixRuntime> {
    AutoMixRuntime::new(Arc::clone(&rig.controller), rig.settings.clone())
}

/// Explicit segue: the plan arms at the segue point and a progress tick
/// past it starts the next item and fades the outgoing one.
#[tokio::test]
async fn segue_fires_next_item_on_progress() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(3.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 155.0);
    a.segue_seconds = Some(150.0);
    let b = rig.item("b", 120.0);
    let (a_id, b_id) = (a.id, b.id);
    let b_path = b.path.clone();
    let a_path = a.path.clone();

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;

    assert!(runtime.start_playback(playlist_id, a_id, false).await);
    let key = (playlist_id, a_id);
    let plan = runtime.plan(&key).await.unwrap();
    assert_eq!(plan.mix_at, Some(150.0));
    assert!((plan.fade_seconds - 3.0).abs() < 1e-9);

    // Native trigger armed but late; the progress path takes over at 152
    runtime.handle_progress(playlist_id, a_id, 152.0).await;

    assert_eq!(runtime.state(&key).await, Some(AutoMixState::Fired));
    assert!(runtime.plan(&key).await.unwrap().triggered);
    assert!(rig.controller.context(&(playlist_id, b_id)).await.is_some());
    assert_eq!(rig.backend.create_count(&b_path), 1);

    // The outgoing player got a fade: volume steps were issued
    let a_stream = rig.backend.stream_for(&a_path).unwrap();
    for _ in 0..100 {
        if rig.backend.volume_history(a_stream).len() > 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let history = rig.backend.volume_history(a_stream);
    assert!(history.len() > 2, "fade should step the volume down");
}

/// The latch allows exactly one next-item start per key even when many
/// ticks land past the mix point.
#[tokio::test]
async fn latch_fires_single_shot() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(2.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 10.0);
    a.overlap_seconds = Some(2.5);
    let b = rig.item("b", 10.0);
    let (a_id, b_path) = (a.id, b.path.clone());

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    for tick in [8.5, 8.6, 8.7, 9.0, 9.5] {
        runtime.handle_progress(playlist_id, a_id, tick).await;
    }
    assert_eq!(rig.backend.create_count(&b_path), 1);
}

/// Loop-enabled items hold the mix: no plan, state LoopHold, trigger
/// cleared. Disabling the loop mid-play re-arms against the real length.
#[tokio::test]
async fn loop_hold_then_disable_rearms() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(3.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 12.0);
    a.loop_start_seconds = Some(2.0);
    a.loop_end_seconds = Some(6.0);
    a.loop_enabled = true;
    let b = rig.item("b", 12.0);
    let a_id = a.id;

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    let key = (playlist_id, a_id);
    assert_eq!(runtime.state(&key).await, Some(AutoMixState::LoopHold));
    assert!(runtime.plan(&key).await.is_none());

    // Progress ticks do not mix while holding
    runtime.handle_progress(playlist_id, a_id, 11.5).await;
    assert_eq!(runtime.state(&key).await, Some(AutoMixState::LoopHold));

    // Disable the loop at 3.0s; mix point (9.0) is still ahead
    {
        let mut model = playlist.write().await;
        let item = model.get_item_mut(a_id).unwrap();
        item.loop_enabled = false;
        item.current_position = 3.0;
    }
    runtime.sync_loop_mix_trigger(playlist_id, a_id).await;

    assert_eq!(runtime.state(&key).await, Some(AutoMixState::Armed));
    let plan = runtime.plan(&key).await.unwrap();
    assert_eq!(plan.mix_at, Some(9.0));
    assert!(plan.native_trigger);
}

/// Disabling the loop when the mix point already passed keeps the hold.
#[tokio::test]
async fn loop_disable_too_late_stays_held() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(3.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 12.0);
    a.loop_start_seconds = Some(2.0);
    a.loop_end_seconds = Some(6.0);
    a.loop_enabled = true;
    let b = rig.item("b", 12.0);
    let a_id = a.id;

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    {
        let mut model = playlist.write().await;
        let item = model.get_item_mut(a_id).unwrap();
        item.loop_enabled = false;
        item.current_position = 11.0; // past mix_at = 9.0
    }
    runtime.sync_loop_mix_trigger(playlist_id, a_id).await;

    let key = (playlist_id, a_id);
    assert_eq!(runtime.state(&key).await, Some(AutoMixState::LoopHold));
}

/// An early native callback is demoted to the progress path instead of
/// starting the next item ahead of the mix point.
#[tokio::test]
async fn early_native_trigger_demotes_to_progress() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(2.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 12.0);
    a.segue_seconds = Some(8.0);
    let b = rig.item("b", 12.0);
    let (a_id, b_path) = (a.id, b.path.clone());

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    {
        let mut model = playlist.write().await;
        model.get_item_mut(a_id).unwrap().current_position = 5.0;
    }
    runtime.handle_native_trigger(playlist_id, a_id).await;

    let key = (playlist_id, a_id);
    let plan = runtime.plan(&key).await.unwrap();
    assert!(!plan.native_trigger, "plan should fall back to progress");
    assert!(!plan.triggered);
    assert_eq!(rig.backend.create_count(&b_path), 0, "no early start");

    // The fallback still fires when progress reaches the point
    runtime.handle_progress(playlist_id, a_id, 7.99).await;
    assert_eq!(rig.backend.create_count(&b_path), 1);
}

/// A native callback on time fires the mix immediately.
#[tokio::test]
async fn native_trigger_on_time_fires() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(2.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 12.0);
    a.segue_seconds = Some(8.0);
    let b = rig.item("b", 12.0);
    let (a_id, b_path) = (a.id, b.path.clone());

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    {
        let mut model = playlist.write().await;
        model.get_item_mut(a_id).unwrap().current_position = 8.0;
    }
    runtime.handle_native_trigger(playlist_id, a_id).await;

    assert_eq!(rig.backend.create_count(&b_path), 1);
    let key = (playlist_id, a_id);
    assert!(runtime.plan(&key).await.unwrap().triggered);
}

/// The native callback never arrives; a late progress tick detects the
/// missed window and fires the fallback with the shortened fade.
#[tokio::test]
async fn late_native_trigger_falls_back_to_progress() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(2.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 12.0);
    a.segue_seconds = Some(5.0);
    let b = rig.item("b", 12.0);
    let (a_id, b_path) = (a.id, b.path.clone());

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    let key = (playlist_id, a_id);
    let plan = runtime.plan(&key).await.unwrap();
    assert!(plan.native_trigger);
    assert_eq!(plan.mix_at, Some(5.0));

    // Native sync never fires; progress lands well past the window
    runtime.handle_progress(playlist_id, a_id, 10.9).await;

    assert_eq!(rig.backend.create_count(&b_path), 1);
    assert!(runtime.plan(&key).await.unwrap().triggered);
    assert_eq!(runtime.state(&key).await, Some(AutoMixState::Fired));
}

/// A failed next-item start clears the latch so the progress fallback can
/// retry on a later tick.
#[tokio::test]
async fn failed_next_start_releases_latch() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(2.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 10.0);
    a.segue_seconds = Some(8.0);
    // The only other item is already marked played, so the sequence start
    // will fail to pick anything startable
    let mut b = rig.item("b", 10.0);
    b.status = ItemStatus::Played;
    let a_id = a.id;

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    runtime.handle_progress(playlist_id, a_id, 8.2).await;

    let key = (playlist_id, a_id);
    assert!(
        !runtime.plan(&key).await.unwrap().triggered,
        "latch released after failed start"
    );
    assert!(runtime.state(&key).await.is_none());
}

/// Break markers suppress mixing entirely and record resume bookkeeping
/// when the item finishes.
#[tokio::test]
async fn break_halts_mix_and_sets_resume_index() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(3.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 10.0);
    a.break_after = true;
    a.segue_seconds = Some(8.0); // ignored because of the break
    let b = rig.item("b", 10.0);
    let (a_id, b_path) = (a.id, b.path.clone());

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    let key = (playlist_id, a_id);
    assert_eq!(runtime.state(&key).await, Some(AutoMixState::BreakHalt));
    assert!(runtime.plan(&key).await.unwrap().mix_at.is_none());

    runtime.handle_progress(playlist_id, a_id, 9.9).await;
    assert_eq!(rig.backend.create_count(&b_path), 0);

    runtime.handle_finished(playlist_id, a_id).await;
    let model = playlist.read().await;
    assert_eq!(model.break_resume_index, Some(1));
    // Auto-mix does not traverse the break
    drop(model);
    assert_eq!(rig.backend.create_count(&b_path), 0);
}

/// Finishing an ordinary item chains the next start when nothing is
/// playing, and marks the finished one played.
#[tokio::test]
async fn finished_chains_next_when_idle() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(0.0); // no automix plan from fades
    let runtime = runtime_for(&rig);

    let a = rig.item("a", 10.0);
    let b = rig.item("b", 10.0);
    let (a_id, b_path) = (a.id, b.path.clone());

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    runtime.handle_finished(playlist_id, a_id).await;

    let model = playlist.read().await;
    assert_eq!(model.get_item(a_id).unwrap().status, ItemStatus::Played);
    drop(model);
    assert_eq!(rig.backend.create_count(&b_path), 1);
}

/// stop_playlist clears contexts and every auto-mix latch for that
/// playlist.
#[tokio::test]
async fn stop_playlist_clears_state() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(3.0);
    let runtime = runtime_for(&rig);

    let mut a = rig.item("a", 100.0);
    a.segue_seconds = Some(90.0);
    let b = rig.item("b", 100.0);
    let a_id = a.id;

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    runtime.stop_playlist(playlist_id, 0.0).await;

    assert!(rig.controller.playlist_context(playlist_id).await.is_none());
    assert!(runtime.state(&(playlist_id, a_id)).await.is_none());
    assert!(runtime.plan(&(playlist_id, a_id)).await.is_none());
}

/// Metadata that disagrees with the stream length by more than the
/// threshold gets reconciled at start.
#[tokio::test]
async fn real_length_overrides_metadata() {
    let rig = TestRig::new();
    rig.settings.set_fade_seconds(3.0);
    let runtime = runtime_for(&rig);

    // Metadata claims 100 s; the stream is really 95 s
    let mut a = rig.item("a", 100.0);
    rig.backend.set_length(&a.path, 95.0);
    a.overlap_seconds = Some(2.0);
    let b = rig.item("b", 100.0);
    let a_id = a.id;

    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;
    runtime.register_playlist(Arc::clone(&playlist)).await;
    assert!(runtime.start_playback(playlist_id, a_id, false).await);

    let plan = runtime.plan(&(playlist_id, a_id)).await.unwrap();
    assert!((plan.effective_duration - 95.0).abs() < 1e-9);
    assert_eq!(plan.mix_at, Some(93.0));
}
