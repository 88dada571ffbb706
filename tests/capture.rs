mod common;

use std::sync::Arc;

use webrtc_call::error::Error;
use webrtc_call::media::{
    CaptureConstraints, CaptureState, CaptureStreamManager, DeviceKind, JsonFilePreferences,
    LocalTrack, MemoryPreferences, PreferenceStore, TrackKind, VideoConstraints, OUTPUT_DEVICE_KEY,
};

use common::{capture_manager, FakePlatform};

fn manager() -> (Arc<FakePlatform>, Arc<MemoryPreferences>, Arc<CaptureStreamManager>) {
    let platform = FakePlatform::new();
    let prefs = Arc::new(MemoryPreferences::new());
    let capture = capture_manager(platform.clone(), prefs.clone());
    (platform, prefs, capture)
}

fn video_device(platform: &FakePlatform) -> Option<String> {
    platform
        .issued_tracks()
        .iter()
        .rev()
        .find(|t| t.kind() == TrackKind::Video && t.is_live())
        .map(|t| t.device().to_owned())
}

#[tokio::test]
async fn test_start_replaces_previous_stream() {
    let (platform, _, capture) = manager();

    let first = capture.start().await.unwrap();
    assert_eq!(first.tracks().len(), 2);
    assert_eq!(capture.state(), CaptureState::Active);

    let second = capture.start().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert!(!first.is_active());
    assert!(second.is_active());
    assert_eq!(platform.live_tracks(), 2);
    assert_eq!(capture.current_stream().unwrap().id(), second.id());
}

#[tokio::test]
async fn test_stale_device_falls_back_to_defaults() {
    let (platform, _, capture) = manager();

    // Idle: only the stored constraints change.
    capture
        .switch_device(DeviceKind::CaptureVideo, "cam-xyz")
        .await
        .unwrap();
    assert!(platform.acquisitions().is_empty());

    capture.start().await.unwrap();
    let attempts = platform.acquisitions();
    assert_eq!(attempts.len(), 2);
    assert_eq!(
        attempts[0].video.as_ref().unwrap().device_id.as_deref(),
        Some("cam-xyz")
    );
    assert_eq!(attempts[1], CaptureConstraints::default());
    assert_eq!(video_device(&platform).as_deref(), Some("cam-1"));
    assert_eq!(capture.constraints().await, CaptureConstraints::default());
}

#[tokio::test]
async fn test_capture_unavailable_when_defaults_fail() {
    let (platform, _, capture) = manager();
    platform.deny_permission(true);

    let err = capture.start().await.unwrap_err();
    assert!(matches!(err, Error::CaptureUnavailable(_)));
    assert!(err.is_permission_denied());
    assert_eq!(platform.acquisitions().len(), 2);
    assert_eq!(capture.state(), CaptureState::Idle);
    assert!(capture.current_stream().is_none());
}

#[tokio::test]
async fn test_switch_device_restarts_active_stream() {
    let (platform, _, capture) = manager();
    let first = capture.start().await.unwrap();
    assert_eq!(video_device(&platform).as_deref(), Some("cam-1"));

    capture
        .switch_device(DeviceKind::CaptureVideo, "cam-2")
        .await
        .unwrap();
    assert!(!first.is_active());
    assert_eq!(platform.acquisitions().len(), 2);
    assert_eq!(video_device(&platform).as_deref(), Some("cam-2"));
    assert_eq!(platform.live_tracks(), 2);
    assert_eq!(capture.state(), CaptureState::Active);
}

#[tokio::test]
async fn test_switch_device_while_idle_only_stores() {
    let (platform, prefs, capture) = manager();
    capture
        .switch_device(DeviceKind::CaptureAudio, "mic-1")
        .await
        .unwrap();

    assert!(platform.acquisitions().is_empty());
    let constraints = capture.constraints().await;
    assert_eq!(constraints.audio.unwrap().device_id.as_deref(), Some("mic-1"));
    assert!(prefs.get("SavedDevices").unwrap().unwrap().contains("mic-1"));
}

#[tokio::test]
async fn test_output_switch_is_persisted() {
    let (platform, prefs, capture) = manager();

    capture
        .switch_device(DeviceKind::OutputAudio, "spk-2")
        .await
        .unwrap();
    assert_eq!(platform.output().as_deref(), Some("spk-2"));
    assert_eq!(
        prefs.get(OUTPUT_DEVICE_KEY).unwrap().as_deref(),
        Some("\"spk-2\"")
    );

    let err = capture
        .switch_device(DeviceKind::OutputAudio, "spk-9")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeviceUnavailable(_)));
    assert_eq!(platform.output().as_deref(), Some("spk-2"));
    assert_eq!(
        prefs.get(OUTPUT_DEVICE_KEY).unwrap().as_deref(),
        Some("\"spk-2\"")
    );
    assert!(platform.acquisitions().is_empty());
}

#[tokio::test]
async fn test_start_restores_saved_output() {
    let platform = FakePlatform::new();
    let prefs = Arc::new(MemoryPreferences::with_value(OUTPUT_DEVICE_KEY, "\"spk-2\""));
    let capture = capture_manager(platform.clone(), prefs);

    capture.start().await.unwrap();
    assert_eq!(platform.output().as_deref(), Some("spk-2"));
}

#[tokio::test]
async fn test_change_resolution_applies_in_place() {
    let (platform, _, capture) = manager();
    capture.start().await.unwrap();

    capture.change_resolution(640, 480).await;

    assert_eq!(platform.acquisitions().len(), 1);
    let video = platform
        .issued_tracks()
        .into_iter()
        .find(|t| t.kind() == TrackKind::Video)
        .unwrap();
    assert_eq!(
        video.applied(),
        Some(VideoConstraints {
            device_id: None,
            width: 640,
            height: 480,
        })
    );
    let stored = capture.constraints().await.video.unwrap();
    assert_eq!((stored.width, stored.height), (640, 480));
}

#[tokio::test]
async fn test_change_resolution_while_idle_only_stores() {
    let (platform, _, capture) = manager();
    capture.change_resolution(320, 240).await;

    assert!(platform.issued_tracks().is_empty());
    capture.start().await.unwrap();
    let requested = platform.acquisitions()[0].video.clone().unwrap();
    assert_eq!((requested.width, requested.height), (320, 240));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (platform, _, capture) = manager();
    capture.stop().await;
    assert_eq!(capture.state(), CaptureState::Stopped);

    let mut preview = capture.subscribe();
    capture.start().await.unwrap();
    assert!(preview.borrow_and_update().is_some());

    capture.stop().await;
    capture.stop().await;
    assert_eq!(capture.state(), CaptureState::Stopped);
    assert!(capture.current_stream().is_none());
    assert!(!capture.is_active());
    assert_eq!(platform.live_tracks(), 0);
    assert!(preview.borrow_and_update().is_none());
}

#[tokio::test]
async fn test_directory_groups_devices() {
    let (platform, _, capture) = manager();
    let devices = capture.directory().list_devices().await.unwrap();

    assert_eq!(devices.video_source.len(), 2);
    assert_eq!(devices.audio_source.len(), 1);
    assert_eq!(devices.output_audio.len(), 2);
    assert_eq!(
        devices.find(DeviceKind::OutputAudio, "spk-2").unwrap().label,
        "Headphones"
    );

    platform.deny_permission(true);
    let err = capture.directory().list_devices().await.unwrap_err();
    assert!(err.is_permission_denied());
}

#[tokio::test]
async fn test_preferences_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prefs").join("devices.json");

    {
        let prefs = Arc::new(JsonFilePreferences::open(&path));
        let capture = capture_manager(FakePlatform::new(), prefs);
        capture
            .switch_device(DeviceKind::CaptureVideo, "cam-2")
            .await
            .unwrap();
        capture
            .switch_device(DeviceKind::OutputAudio, "spk-1")
            .await
            .unwrap();
    }

    let platform = FakePlatform::new();
    let capture = capture_manager(platform.clone(), Arc::new(JsonFilePreferences::open(&path)));
    let constraints = capture.constraints().await;
    assert_eq!(
        constraints.video.unwrap().device_id.as_deref(),
        Some("cam-2")
    );

    capture.start().await.unwrap();
    assert_eq!(video_device(&platform).as_deref(), Some("cam-2"));
    assert_eq!(platform.output().as_deref(), Some("spk-1"));
}
