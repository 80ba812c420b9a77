//! Integration tests for the acquisition engine state machine.

use async_trait::async_trait;
use labdaq::camera::CameraEngine;
use labdaq::config::{CameraSettings, DriverConfig};
use labdaq::core::{BroadcastSink, ExperimentLink};
use labdaq::error::{DaqError, DaqResult};
use labdaq::metadata::MetaMap;
use labdaq::sim::SimCamera;
use labdaq::sink::{FrameBus, MemorySink};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Experiment stub: no scan running, empty aggregate.
struct NoScan;

#[async_trait]
impl ExperimentLink for NoScan {
    async fn scan_path(&self) -> Option<PathBuf> {
        None
    }

    async fn scan_name(&self) -> Option<String> {
        None
    }

    async fn next_prefix(&self) -> DaqResult<String> {
        Err(DaqError::Precondition("no scan currently running".into()))
    }

    async fn aggregate_meta(&self, _window: Duration) -> MetaMap {
        MetaMap::new()
    }
}

/// Experiment stub with a running scan and a shared counter.
struct FixedScan {
    counter: AtomicU64,
}

impl FixedScan {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ExperimentLink for FixedScan {
    async fn scan_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("inv/exp/000003_25-01-01_test"))
    }

    async fn scan_name(&self) -> Option<String> {
        Some("000003_25-01-01_test".to_string())
    }

    async fn next_prefix(&self) -> DaqResult<String> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("000003_25-01-01_test_{index:06}"))
    }

    async fn aggregate_meta(&self, _window: Duration) -> MetaMap {
        let mut meta = MetaMap::new();
        meta.insert("manager".into(), serde_json::json!({"experiment": "exp"}));
        meta
    }
}

struct Rig {
    camera: Arc<SimCamera>,
    storage: Arc<MemorySink>,
    bus: Arc<FrameBus>,
    engine: Arc<CameraEngine>,
    _dir: tempfile::TempDir,
}

fn fast_settings() -> CameraSettings {
    CameraSettings {
        poll_interval: Duration::from_millis(20),
        meta_window: Duration::from_millis(10),
    }
}

fn build_rig(experiment: Arc<dyn ExperimentLink>) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let config = DriverConfig::open(dir.path(), "camera").unwrap();
    let camera = Arc::new(SimCamera::new("camera", 8, 6));
    let storage = Arc::new(MemorySink::new());
    let bus = Arc::new(FrameBus::new(16));
    let engine = CameraEngine::new(
        camera.clone(),
        experiment,
        storage.clone(),
        bus.clone(),
        config,
        fast_settings(),
        dir.path().join("data"),
    )
    .unwrap();
    Rig {
        camera,
        storage,
        bus,
        engine,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_arm_then_disarm_without_trigger() {
    let rig = build_rig(Arc::new(NoScan));
    rig.engine.arm(None, None).await.unwrap();
    assert!(rig.engine.armed());

    rig.engine.disarm().await.unwrap();
    rig.engine.wait_idle().await;

    assert!(!rig.engine.armed());
    assert!(!rig.engine.in_scan());
    assert_eq!(rig.storage.len(), 0);
    assert_eq!(rig.bus.published(), 0);
    assert_eq!(rig.camera.trigger_count(), 0);
}

#[tokio::test]
async fn test_arming_twice_is_rejected() {
    let rig = build_rig(Arc::new(NoScan));
    rig.engine.arm(None, None).await.unwrap();
    let err = rig.engine.arm(None, None).await.unwrap_err();
    assert!(matches!(err, DaqError::Precondition(_)), "got {err}");

    rig.engine.disarm().await.unwrap();
    rig.engine.wait_idle().await;
}

#[tokio::test]
async fn test_single_snap_round_trip() {
    let rig = build_rig(Arc::new(NoScan));
    assert!(!rig.engine.armed());

    let filename = rig.engine.snap(Some(0.01), None).await.unwrap();
    rig.engine.wait_idle().await;

    // Auto-arm ran exactly one cycle and returned to disarmed.
    assert!(!rig.engine.armed());
    assert_eq!(rig.camera.trigger_count(), 1);

    // Exactly one stored and one broadcast frame.
    assert_eq!(rig.storage.len(), 1);
    assert_eq!(rig.bus.published(), 1);

    let stored = &rig.storage.frames()[0];
    assert_eq!(stored.filename, filename);
    assert!(filename.to_string_lossy().ends_with("frame_000001.h5"));

    // The camera's own metadata rides along with the frame.
    let detector = stored.meta.get("camera").unwrap();
    assert_eq!(detector["detector"], "camera");
    assert!(detector.get("acquisition_end").is_some());
}

#[tokio::test]
async fn test_snap_increments_local_counter() {
    let rig = build_rig(Arc::new(NoScan));
    let first = rig.engine.snap(None, None).await.unwrap();
    rig.engine.wait_idle().await;
    let second = rig.engine.snap(None, None).await.unwrap();
    rig.engine.wait_idle().await;

    assert!(first.to_string_lossy().ends_with("frame_000001.h5"));
    assert!(second.to_string_lossy().ends_with("frame_000002.h5"));
    assert_eq!(rig.engine.counter(), 2);
    assert_eq!(rig.storage.len(), 2);
}

#[tokio::test]
async fn test_snap_inside_scan_uses_shared_prefix() {
    let rig = build_rig(Arc::new(FixedScan::new()));
    let filename = rig.engine.snap(None, None).await.unwrap();
    rig.engine.wait_idle().await;

    let name = filename.to_string_lossy().into_owned();
    assert!(
        name.ends_with("inv/exp/000003_25-01-01_test/000003_25-01-01_test_000000.h5"),
        "unexpected filename {name}"
    );
    // The local counter is untouched inside a scan.
    assert_eq!(rig.engine.counter(), 0);

    // Aggregated metadata was attached to the stored frame.
    let stored = &rig.storage.frames()[0];
    assert_eq!(stored.meta["manager"]["experiment"], "exp");
}

#[tokio::test]
async fn test_roll_frames_go_to_broadcast_only() {
    let rig = build_rig(Arc::new(NoScan));

    rig.engine.roll(true, Some(50.0)).await.unwrap();
    assert!(rig.engine.rolling());
    assert!(rig.engine.armed());
    assert!(rig.engine.is_live());

    // Requested 50 fps is clamped to the device maximum of 20.
    tokio::time::sleep(Duration::from_millis(300)).await;

    rig.engine.roll(false, None).await.unwrap();
    rig.engine.wait_idle().await;

    assert!(!rig.engine.rolling());
    assert!(!rig.engine.armed());
    assert!(rig.bus.published() >= 2, "expected a stream of live frames");
    assert_eq!(rig.storage.len(), 0, "rolling frames must not be stored");
}

#[tokio::test]
async fn test_roll_is_idempotent() {
    let rig = build_rig(Arc::new(NoScan));
    rig.engine.roll(false, None).await.unwrap();
    assert!(!rig.engine.rolling());

    rig.engine.roll(true, None).await.unwrap();
    rig.engine.roll(true, None).await.unwrap();
    assert!(rig.engine.rolling());

    rig.engine.roll(false, None).await.unwrap();
    rig.engine.wait_idle().await;
    assert!(!rig.engine.rolling());
}

#[tokio::test]
async fn test_trigger_failure_ends_session() {
    let rig = build_rig(Arc::new(NoScan));
    rig.camera.fail_next_trigger();

    let err = rig.engine.snap(None, None).await.unwrap_err();
    assert!(matches!(err, DaqError::Protocol(_)), "got {err}");

    rig.engine.wait_idle().await;
    assert!(!rig.engine.armed(), "failed session must end disarmed");
    assert_eq!(rig.storage.len(), 0);
    assert_eq!(rig.bus.published(), 0);
}

#[tokio::test]
async fn test_live_toggle_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    {
        let rig_config = DriverConfig::open(dir.path(), "camera").unwrap();
        let engine = CameraEngine::new(
            Arc::new(SimCamera::new("camera", 4, 4)),
            Arc::new(NoScan),
            Arc::new(MemorySink::new()),
            Arc::new(FrameBus::new(4)),
            rig_config,
            fast_settings(),
            dir.path().join("data"),
        )
        .unwrap();
        assert!(engine.is_live(), "broadcast defaults to on");
        engine.live_off().unwrap();
        engine.shutdown().await.unwrap();
    }

    // A fresh engine over the same config file starts with live off.
    let config = DriverConfig::open(dir.path(), "camera").unwrap();
    let bus = Arc::new(FrameBus::new(4));
    let _engine = CameraEngine::new(
        Arc::new(SimCamera::new("camera", 4, 4)),
        Arc::new(NoScan),
        Arc::new(MemorySink::new()),
        bus.clone(),
        config,
        fast_settings(),
        dir.path().join("data"),
    )
    .unwrap();
    assert!(!bus.is_live());
}

#[tokio::test]
async fn test_settings_json_lists_current_values() {
    let rig = build_rig(Arc::new(NoScan));
    let settings = rig.engine.settings_json().await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&settings).unwrap();
    assert_eq!(parsed["file_format"], "hdf5");
    assert_eq!(parsed["operation_mode"]["bit_depth"], 12);
}
