//! Playback controller behaviors: idempotent starts, played-item gating,
//! slot selection with missing devices, stale-player recovery, and
//! playlist teardown.

mod helpers;

use helpers::{FakeBackend, TestRig};
use sara_playout::backend::device::{DeviceInfo, DeviceManager};
use sara_playout::backend::DeviceId;
use sara_playout::controller::PlaybackController;
use sara_playout::model::ItemStatus;
use sara_playout::player::{FinishedCallback, ProgressCallback};
use std::sync::Arc;

fn noop_callbacks() -> (FinishedCallback, ProgressCallback) {
    (Arc::new(|_| {}), Arc::new(|_, _| {}))
}

#[tokio::test]
async fn start_item_is_idempotent_without_restart() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let (a_id, a_path) = (a.id, a.path.clone());
    let playlist = rig.playlist(vec![a]);

    let (fin, prog) = noop_callbacks();
    let first = rig
        .controller
        .start_item(&playlist, a_id, 0.0, fin.clone(), prog.clone(), false, None, None)
        .await
        .expect("first start");

    let second = rig
        .controller
        .start_item(&playlist, a_id, 0.0, fin, prog, false, None, None)
        .await
        .expect("second start");

    assert!(Arc::ptr_eq(&first, &second), "same context returned");
    assert_eq!(rig.backend.create_count(&a_path), 1, "stream not reopened");
}

#[tokio::test]
async fn restart_reopens_the_stream() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let (a_id, a_path) = (a.id, a.path.clone());
    let playlist = rig.playlist(vec![a]);

    let (fin, prog) = noop_callbacks();
    rig.controller
        .start_item(&playlist, a_id, 0.0, fin.clone(), prog.clone(), false, None, None)
        .await
        .expect("first start");
    rig.controller
        .start_item(&playlist, a_id, 0.0, fin, prog, true, None, None)
        .await
        .expect("restart");

    assert_eq!(rig.backend.create_count(&a_path), 2);
}

#[tokio::test]
async fn played_item_rejected_unless_restarting() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let a_id = a.id;
    let playlist = rig.playlist(vec![a]);
    playlist.write().await.mark_played(a_id);

    let (fin, prog) = noop_callbacks();
    let rejected = rig
        .controller
        .start_item(&playlist, a_id, 0.0, fin.clone(), prog.clone(), false, None, None)
        .await;
    assert!(rejected.is_none());
    assert_eq!(
        playlist.read().await.get_item(a_id).unwrap().status,
        ItemStatus::Played
    );

    let restarted = rig
        .controller
        .start_item(&playlist, a_id, 0.0, fin, prog, true, None, None)
        .await;
    assert!(restarted.is_some());
    assert_eq!(
        playlist.read().await.get_item(a_id).unwrap().status,
        ItemStatus::Playing
    );
}

#[tokio::test]
async fn two_items_take_distinct_slots() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let b = rig.item("b", 30.0);
    let (a_id, b_id) = (a.id, b.id);
    let playlist = rig.playlist(vec![a, b]);

    let (fin, prog) = noop_callbacks();
    let ctx_a = rig
        .controller
        .start_item(&playlist, a_id, 0.0, fin.clone(), prog.clone(), false, None, None)
        .await
        .expect("start a");
    let ctx_b = rig
        .controller
        .start_item(&playlist, b_id, 0.0, fin, prog, false, None, None)
        .await
        .expect("start b");

    assert_ne!(ctx_a.device_id, ctx_b.device_id);
    let busy = rig.controller.busy_device_ids().await;
    assert_eq!(busy.len(), 2);
}

#[tokio::test]
async fn missing_configured_device_nulls_slot_and_falls_back() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let a_id = a.id;
    let playlist = rig.playlist(vec![a]);
    // Only one configured slot pointing at a device that no longer exists
    playlist.write().await.output_slots = vec![Some(DeviceId::from("ghost"))];

    let (fin, prog) = noop_callbacks();
    let context = rig
        .controller
        .start_item(&playlist, a_id, 0.0, fin, prog, false, None, None)
        .await
        .expect("fallback start");

    // The dead slot was nulled in the persisted configuration and a known
    // device was picked instead
    assert_eq!(playlist.read().await.output_slots[0], None);
    assert_ne!(context.device_id, DeviceId::from("ghost"));
}

#[tokio::test]
async fn stale_player_is_recreated_once() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let (a_id, a_path) = (a.id, a.path.clone());
    let playlist = rig.playlist(vec![a]);

    rig.backend.fail_next_play();
    let (fin, prog) = noop_callbacks();
    let context = rig
        .controller
        .start_item(&playlist, a_id, 0.0, fin, prog, false, None, None)
        .await;

    assert!(context.is_some(), "retry after refresh succeeds");
    // First stream was created, failed to play, then a fresh one succeeded
    assert_eq!(rig.backend.create_count(&a_path), 2);
}

#[tokio::test]
async fn failed_start_reverts_status_to_pending() {
    let backend = FakeBackend::new();
    let devices = DeviceManager::with_devices(vec![DeviceInfo {
        id: DeviceId::from("out-1"),
        name: "out-1".into(),
        is_default: true,
    }]);
    let settings = Arc::new(sara_playout::settings::StaticSettings::new());
    let sink = Arc::new(sara_playout::announce::RecordingSink::new());
    let controller =
        PlaybackController::new(backend.clone(), devices, settings, sink);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.xyz");
    std::fs::write(&path, b"").unwrap();
    // Negative scripted length makes stream creation fail both times
    backend.set_length(&path, -1.0);

    let mut item = sara_playout::model::PlaylistItem::new("broken", &path, 30.0);
    item.status = ItemStatus::Pending;
    let item_id = item.id;
    let mut model =
        sara_playout::model::PlaylistModel::new("t", sara_playout::model::PlaylistKind::Music);
    model.output_slots = vec![Some(DeviceId::from("out-1"))];
    model.items = vec![item];
    let playlist = Arc::new(tokio::sync::RwLock::new(model));

    let (fin, prog) = noop_callbacks();
    let context = controller
        .start_item(&playlist, item_id, 0.0, fin, prog, false, None, None)
        .await;

    assert!(context.is_none());
    assert_eq!(
        playlist.read().await.get_item(item_id).unwrap().status,
        ItemStatus::Pending
    );
}

#[tokio::test]
async fn update_mix_trigger_replaces_syncs_exactly() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let (a_id, a_path) = (a.id, a.path.clone());
    let playlist = rig.playlist(vec![a]);
    let playlist_id = playlist.read().await.id;

    let (fin, prog) = noop_callbacks();
    rig.controller
        .start_item(
            &playlist,
            a_id,
            0.0,
            fin,
            prog,
            false,
            Some(20.0),
            Some(Arc::new(|| {})),
        )
        .await
        .expect("start");

    let stream = rig.backend.stream_for(&a_path).unwrap();
    assert_eq!(rig.backend.position_sync_count(stream), 1);
    assert_eq!(rig.backend.end_sync_count(stream), 1);

    // Clear, then re-arm: still exactly one of each
    assert!(
        rig.controller
            .update_mix_trigger(playlist_id, a_id, None, None)
            .await
    );
    assert_eq!(rig.backend.position_sync_count(stream), 0);
    assert_eq!(rig.backend.end_sync_count(stream), 0);

    assert!(
        rig.controller
            .update_mix_trigger(playlist_id, a_id, Some(25.0), Some(Arc::new(|| {})))
            .await
    );
    assert_eq!(rig.backend.position_sync_count(stream), 1);
    assert_eq!(rig.backend.end_sync_count(stream), 1);
}

#[tokio::test]
async fn update_mix_trigger_without_context_is_false() {
    let rig = TestRig::new();
    let result = rig
        .controller
        .update_mix_trigger(uuid::Uuid::new_v4(), uuid::Uuid::new_v4(), Some(5.0), None)
        .await;
    assert!(!result);
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let a_id = a.id;
    let playlist = rig.playlist(vec![a]);

    let (fin, prog) = noop_callbacks();
    rig.controller
        .start_item(&playlist, a_id, 0.0, fin, prog, false, None, None)
        .await
        .expect("start");

    assert!(rig.controller.pause_item(&playlist, a_id).await);
    assert_eq!(
        playlist.read().await.get_item(a_id).unwrap().status,
        ItemStatus::Paused
    );

    assert!(rig.controller.resume_item(&playlist, a_id).await);
    assert_eq!(
        playlist.read().await.get_item(a_id).unwrap().status,
        ItemStatus::Playing
    );

    // Unknown item: both are refused
    let ghost = uuid::Uuid::new_v4();
    assert!(!rig.controller.pause_item(&playlist, ghost).await);
    assert!(!rig.controller.resume_item(&playlist, ghost).await);
}

#[tokio::test]
async fn stop_playlist_removes_all_contexts() {
    let rig = TestRig::new();
    let a = rig.item("a", 30.0);
    let b = rig.item("b", 30.0);
    let (a_id, b_id) = (a.id, b.id);
    let playlist = rig.playlist(vec![a, b]);
    let playlist_id = playlist.read().await.id;

    let (fin, prog) = noop_callbacks();
    rig.controller
        .start_item(&playlist, a_id, 0.0, fin.clone(), prog.clone(), false, None, None)
        .await
        .expect("start a");
    rig.controller
        .start_item(&playlist, b_id, 0.0, fin, prog, false, None, None)
        .await
        .expect("start b");

    let removed = rig.controller.stop_playlist(playlist_id, 0.0).await;
    assert_eq!(removed.len(), 2);
    assert!(rig.controller.playlist_context(playlist_id).await.is_none());
    assert!(rig.controller.busy_device_ids().await.is_empty());
}

#[tokio::test]
async fn no_devices_at_all_announces_and_fails() {
    let backend = FakeBackend::new();
    let devices = DeviceManager::with_devices(Vec::new());
    let settings = Arc::new(sara_playout::settings::StaticSettings::new());
    let sink = Arc::new(sara_playout::announce::RecordingSink::new());
    let controller = PlaybackController::new(
        backend.clone(),
        devices,
        settings,
        sink.clone(),
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.flac");
    std::fs::write(&path, b"").unwrap();
    let item = sara_playout::model::PlaylistItem::new("a", &path, 30.0);
    let item_id = item.id;
    let mut model =
        sara_playout::model::PlaylistModel::new("t", sara_playout::model::PlaylistKind::Music);
    model.items = vec![item];
    let playlist = Arc::new(tokio::sync::RwLock::new(model));

    let (fin, prog) = noop_callbacks();
    let context = controller
        .start_item(&playlist, item_id, 0.0, fin, prog, false, None, None)
        .await;

    assert!(context.is_none());
    assert!(sink.count(sara_common::events::AnnouncementCategory::Device) >= 1);
}
