//! The acquisition engine: arm/trigger/readout/store/broadcast cycle.
//!
//! [`CameraEngine`] wraps a device-specific [`CameraDevice`] in a uniform
//! state machine:
//!
//! ```text
//! Disarmed -> Armed -> (Triggering <-> Rolling) -> Disarmed
//! ```
//!
//! Two background tasks do the work. The acquisition loop waits for a
//! trigger signal, runs the device trigger, flips the acquisition-done flag
//! *before* readout (so a blocked `snap` caller is released while the data
//! is still being read), merges metadata, and hands the frame to the sinks.
//! The metadata loop waits for a grab signal and pulls the process-wide
//! aggregate from all live sources concurrently with the exposure, so
//! collection never delays the next trigger.
//!
//! # Error policy
//!
//! A device `trigger`, `readout`, or `rearm` failure terminates the armed
//! session: the loop logs the error, breaks, and exits through its
//! disarm-on-exit path. A `snap` caller blocked on that cycle observes the
//! loop's completion and receives an error instead of hanging.
//!
//! Re-arming an already armed engine is rejected as a precondition
//! violation, not treated as a no-op.

use crate::config::{CameraSettings, DriverConfig};
use crate::core::{BroadcastSink, CameraDevice, ExperimentLink, StorageSink};
use crate::error::{DaqError, DaqResult};
use crate::event::Event;
use crate::metadata::{self, merge, MetaMap};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_FILE_FORMAT: &str = "hdf5";
const DEFAULT_FILE_PREFIX: &str = "frame_{index:06}";

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Uniform acquisition front-end for one detector.
pub struct CameraEngine {
    /// Back-reference handed to the background loops at spawn time.
    self_ref: std::sync::Weak<CameraEngine>,
    device: Arc<dyn CameraDevice>,
    experiment: Arc<dyn ExperimentLink>,
    storage: Arc<dyn StorageSink>,
    broadcast: Arc<dyn BroadcastSink>,
    config: Arc<DriverConfig>,
    settings: CameraSettings,
    /// All data lands in subdirectories of this root.
    base_path: PathBuf,

    armed: AtomicBool,
    rolling: AtomicBool,
    in_scan: AtomicBool,
    auto_armed: AtomicBool,
    end_acquisition: AtomicBool,
    closing: AtomicBool,

    do_acquire: Event,
    acquire_done: Event,
    grab_meta: Event,
    /// Set while no acquisition loop is running.
    loop_done: Event,

    /// Scan path frozen at arming time for the whole armed session.
    scan_path: Mutex<Option<PathBuf>>,
    filename: Mutex<Option<PathBuf>>,
    metadata: Mutex<MetaMap>,
    localmeta: Mutex<MetaMap>,

    /// Serializes snap callers; one capture request at a time.
    snap_gate: tokio::sync::Mutex<()>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    meta_task: Mutex<Option<JoinHandle<()>>>,
}

impl CameraEngine {
    pub fn new(
        device: Arc<dyn CameraDevice>,
        experiment: Arc<dyn ExperimentLink>,
        storage: Arc<dyn StorageSink>,
        broadcast: Arc<dyn BroadcastSink>,
        config: DriverConfig,
        settings: CameraSettings,
        base_path: PathBuf,
    ) -> DaqResult<Arc<Self>> {
        // First-run defaults; operator changes persist across restarts.
        config.set_default("do_save", json!(true))?;
        config.set_default("do_broadcast", json!(true))?;
        config.set_default("file_format", json!(DEFAULT_FILE_FORMAT))?;
        config.set_default("file_prefix", json!(DEFAULT_FILE_PREFIX))?;
        config.set_default("save_path", json!("snapshots"))?;
        config.set_default("magnification", json!(1.0))?;
        config.set_default("counter", json!(0))?;

        let config = Arc::new(config);
        let engine = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            device,
            experiment,
            storage,
            broadcast,
            config,
            settings,
            base_path,
            armed: AtomicBool::new(false),
            rolling: AtomicBool::new(false),
            in_scan: AtomicBool::new(false),
            auto_armed: AtomicBool::new(false),
            end_acquisition: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            do_acquire: Event::new(),
            acquire_done: Event::new(),
            grab_meta: Event::new(),
            loop_done: Event::new(),
            scan_path: Mutex::new(None),
            filename: Mutex::new(None),
            metadata: Mutex::new(MetaMap::new()),
            localmeta: Mutex::new(MetaMap::new()),
            snap_gate: tokio::sync::Mutex::new(()),
            loop_task: Mutex::new(None),
            meta_task: Mutex::new(None),
        });

        engine.loop_done.set();
        if engine.config.get_bool("do_broadcast").unwrap_or(true) {
            engine.broadcast.set_live(true);
        }

        let handle = tokio::spawn(Arc::clone(&engine).metadata_loop());
        *locked(&engine.meta_task) = Some(handle);

        Ok(engine)
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    pub fn armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn rolling(&self) -> bool {
        self.rolling.load(Ordering::Acquire)
    }

    pub fn in_scan(&self) -> bool {
        self.in_scan.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.broadcast.is_live()
    }

    /// Internal counter for file naming outside of scans.
    pub fn counter(&self) -> u64 {
        self.config.get_u64("counter").unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Arming
    // ------------------------------------------------------------------

    /// Prepare the camera for acquisition and start the acquisition loop.
    pub async fn arm(&self, exp_time: Option<f64>, exp_num: Option<u32>) -> DaqResult<()> {
        if self.armed() {
            return Err(DaqError::Precondition(format!(
                "{} is already armed",
                self.device.name()
            )));
        }

        self.apply_exposure(exp_time, exp_num).await?;

        // Capture whether a scan is active and freeze its path for this
        // arming session.
        let scan_path = self.experiment.scan_path().await;
        self.in_scan.store(scan_path.is_some(), Ordering::Release);
        *locked(&self.scan_path) = scan_path;

        self.device.arm().await?;

        let engine = self
            .self_ref
            .upgrade()
            .ok_or_else(|| DaqError::Protocol("engine is shutting down".into()))?;
        self.end_acquisition.store(false, Ordering::Release);
        self.loop_done.clear();
        let handle = tokio::spawn(engine.acquisition_loop());
        *locked(&self.loop_task) = Some(handle);

        self.armed.store(true, Ordering::Release);
        Ok(())
    }

    /// Apply exposure overrides, writing to the device only on change.
    async fn apply_exposure(&self, exp_time: Option<f64>, exp_num: Option<u32>) -> DaqResult<()> {
        if let Some(t) = exp_time {
            let current = self.device.exposure_time().await?;
            if (t - current).abs() > f64::EPSILON {
                info!(from = current, to = t, "exposure time change");
                self.device.set_exposure_time(t).await?;
                self.config.set("exposure_time", json!(t))?;
            }
        }
        if let Some(n) = exp_num {
            let current = self.device.exposure_number().await?;
            if n != current {
                info!(from = current, to = n, "exposure number change");
                self.device.set_exposure_number(n).await?;
                self.config.set("exposure_number", json!(n))?;
            }
        }
        Ok(())
    }

    /// Terminate acquisition. Non-blocking: the loop observes the flag on
    /// its own polling cadence; use [`CameraEngine::wait_idle`] when a
    /// synchronous disarm is needed.
    pub async fn disarm(&self) -> DaqResult<()> {
        self.end_acquisition.store(true, Ordering::Release);
        self.device.disarm().await?;
        self.in_scan.store(false, Ordering::Release);
        self.armed.store(false, Ordering::Release);
        Ok(())
    }

    /// Wait until the acquisition loop has exited.
    pub async fn wait_idle(&self) {
        while !self.loop_done.wait_timeout(self.settings.poll_interval).await {}
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    /// Capture one or multiple images and return the target filename.
    ///
    /// Optional exposure overrides are applied before the acquisition and
    /// are not reset afterwards. Returns once the frame is captured and
    /// handed off, not once it is stored or broadcast.
    pub async fn snap(&self, exp_time: Option<f64>, exp_num: Option<u32>) -> DaqResult<PathBuf> {
        let _gate = self.snap_gate.lock().await;

        // If the camera is not armed, arm it and remember that this was
        // done automatically: the loop then runs exactly one cycle.
        if !self.armed() {
            debug!("camera was not armed when calling snap, arming first");
            self.auto_armed.store(true, Ordering::Release);
            if let Err(e) = self.arm(exp_time, exp_num).await {
                self.auto_armed.store(false, Ordering::Release);
                return Err(e);
            }
        }

        let filename = self.next_filename().await?;
        info!(path = %filename.display(), "save path");
        *locked(&self.filename) = Some(filename.clone());

        // Trigger the acquisition now.
        self.do_acquire.set();

        // Wipe previous metadata and start collecting anew immediately,
        // in parallel with the exposure.
        locked(&self.metadata).clear();
        self.grab_meta.set();

        // Wait for the end of the acquisition.
        loop {
            if self.acquire_done.wait_timeout(self.settings.poll_interval).await {
                break;
            }
            if self.loop_done.is_set() {
                return Err(DaqError::Protocol(
                    "acquisition loop ended before the frame was captured".into(),
                ));
            }
        }
        self.acquire_done.clear();

        Ok(filename)
    }

    /// Build the target filename: inside a scan the prefix comes from the
    /// shared experiment counter, outside from the local file counter.
    async fn next_filename(&self) -> DaqResult<PathBuf> {
        if self.in_scan() {
            let prefix = self.experiment.next_prefix().await?;
            let path = locked(&self.scan_path).clone().unwrap_or_default();
            self.build_filename(&prefix, &path)
        } else {
            let counter = self.counter() + 1;
            self.config.set("counter", json!(counter))?;
            let template = self
                .config
                .get_str("file_prefix")
                .unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string());
            let prefix = render_prefix(&template, counter);
            let path = PathBuf::from(self.config.get_str("save_path").unwrap_or_default());
            self.build_filename(&prefix, &path)
        }
    }

    fn build_filename(&self, prefix: &str, path: &std::path::Path) -> DaqResult<PathBuf> {
        let format = self
            .config
            .get_str("file_format")
            .unwrap_or_else(|| DEFAULT_FILE_FORMAT.to_string());
        let ext = match format.as_str() {
            "hdf5" => "h5",
            "tiff" => "tif",
            other => {
                return Err(DaqError::Configuration(format!(
                    "unknown file format: {other}"
                )))
            }
        };
        Ok(self.base_path.join(path).join(format!("{prefix}.{ext}")))
    }

    // ------------------------------------------------------------------
    // Rolling / live mode
    // ------------------------------------------------------------------

    /// Toggle continuous acquisition for live preview. Rolling frames go
    /// to the broadcast sink only. Calling with the current state is a
    /// no-op.
    pub async fn roll(&self, on: bool, fps: Option<f64>) -> DaqResult<()> {
        if self.rolling() {
            if on {
                return Ok(());
            }
            // Stop rolling and disarm the camera.
            self.rolling.store(false, Ordering::Release);
            return self.disarm().await;
        }
        if !on {
            return Ok(());
        }

        if !self.is_live() {
            self.live_on()?;
        }
        self.rolling.store(true, Ordering::Release);

        let mut fps = fps.unwrap_or_else(|| self.device.default_fps());
        let max = self.device.max_fps();
        if fps > max {
            warn!(requested = fps, max, "requested fps above maximum, clamping");
            fps = max;
        }
        let exposure = 1.0 / fps;
        self.device.set_exposure_time(exposure).await?;
        self.config.set("exposure_time", json!(exposure))?;

        // Trigger the first acquisition immediately, then arm.
        self.do_acquire.set();
        if !self.armed() {
            self.arm(None, None).await?;
        }
        Ok(())
    }

    /// Enable the live broadcaster.
    pub fn live_on(&self) -> DaqResult<()> {
        self.broadcast.set_live(true);
        self.config.set("do_broadcast", json!(true))
    }

    /// Disable the live broadcaster.
    pub fn live_off(&self) -> DaqResult<()> {
        self.broadcast.set_live(false);
        self.config.set("do_broadcast", json!(false))
    }

    // ------------------------------------------------------------------
    // Operator settings
    // ------------------------------------------------------------------

    /// If false, frames are not meant to be kept; persisted for operators
    /// and external tooling.
    pub fn save(&self) -> bool {
        self.config.get_bool("do_save").unwrap_or(true)
    }

    pub fn set_save(&self, value: bool) -> DaqResult<()> {
        self.config.set("do_save", json!(value))
    }

    /// Reset the local file counter to 0 (or to the given value).
    pub fn reset_counter(&self, value: u64) -> DaqResult<()> {
        self.config.set("counter", json!(value))
    }

    /// All current settings as a JSON string.
    pub async fn settings_json(&self) -> DaqResult<String> {
        let settings = json!({
            "exposure_time": self.device.exposure_time().await?,
            "exposure_number": self.device.exposure_number().await?,
            "operation_mode": self.device.operation_mode().await?,
            "file_format": self.config.get_str("file_format"),
            "file_prefix": self.config.get_str("file_prefix"),
            "save_path": self.config.get_str("save_path"),
            "magnification": self.config.get_f64("magnification"),
        });
        Ok(settings.to_string())
    }

    /// Camera-specific metadata contributed to every aggregate.
    pub async fn get_meta(&self) -> MetaMap {
        let mut meta = self.local_meta().await;
        meta.remove("acquisition_start");
        meta
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    async fn acquisition_loop(self: Arc<Self>) {
        debug!("acquisition loop started");
        loop {
            // Wait for the next trigger.
            if !self.do_acquire.wait_timeout(self.settings.poll_interval).await {
                if self.end_acquisition.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            self.do_acquire.clear();

            // A pending trigger is abandoned once the end of the
            // acquisition has been requested (rolling re-triggers race
            // with the stop request).
            if self.end_acquisition.load(Ordering::Acquire) {
                break;
            }

            // Frames triggered while rolling never go to storage, even if
            // rolling is switched off mid-cycle.
            let rolling = self.rolling();

            if let Err(e) = self.device.trigger().await {
                error!(error = %e, "trigger failed, ending armed session");
                break;
            }

            // Flip flag immediately so a waiting snap caller returns
            // before readout starts.
            self.acquire_done.set();

            let (frame, frame_meta) = match self.device.readout().await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "readout failed, ending armed session");
                    break;
                }
            };

            // Combine local, per-frame and aggregated metadata.
            let combined = {
                let mut local = locked(&self.localmeta).clone();
                local.insert("acquisition_end".into(), json!(metadata::now()));
                merge(&mut local, frame_meta);
                let mut meta = locked(&self.metadata);
                meta.insert(self.device.name().to_string(), Value::Object(local));
                meta.clone()
            };

            // Broadcast unconditionally; the sink honors its live toggle.
            self.broadcast
                .publish(self.device.name(), &combined, &frame)
                .await;

            if rolling {
                // Ask immediately for another frame.
                self.do_acquire.set();
                continue;
            }

            // Not rolling, so saving.
            let filename = locked(&self.filename)
                .clone()
                .unwrap_or_else(|| PathBuf::from("unnamed"));
            self.storage.store(&filename, &combined, &frame).await;

            // Automatically armed - this was a single shot.
            if self.auto_armed.swap(false, Ordering::AcqRel) {
                break;
            }

            // Get ready for the next acquisition.
            if let Err(e) = self.device.rearm().await {
                error!(error = %e, "re-arm failed, ending armed session");
                break;
            }
        }

        // The loop is closed, so we disarm.
        if let Err(e) = self.disarm().await {
            warn!(error = %e, "disarm on loop exit failed");
        }
        self.loop_done.set();
        debug!("acquisition loop completed");
    }

    async fn metadata_loop(self: Arc<Self>) {
        debug!("metadata loop started");
        loop {
            if !self.grab_meta.wait_timeout(self.settings.poll_interval).await {
                if self.closing.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            self.grab_meta.clear();

            // Global metadata from all live sources, best-effort.
            let aggregate = self.experiment.aggregate_meta(self.settings.meta_window).await;
            merge(&mut locked(&self.metadata), aggregate);

            // Local metadata, stamped at acquisition start.
            let mut local = self.local_meta().await;
            local.insert("acquisition_start".into(), json!(metadata::now()));
            *locked(&self.localmeta) = local;
        }
        debug!("metadata loop completed");
    }

    async fn local_meta(&self) -> MetaMap {
        let mut meta = MetaMap::new();
        meta.insert("detector".into(), json!(self.device.name()));
        meta.insert(
            "scan_name".into(),
            self.experiment
                .scan_name()
                .await
                .map_or(Value::Null, |s| json!(s)),
        );
        let psize = self.device.pixel_size();
        let magnification = self.config.get_f64("magnification").unwrap_or(1.0);
        meta.insert("psize".into(), json!(psize));
        meta.insert("epsize".into(), json!(psize / magnification));
        match self.device.exposure_time().await {
            Ok(t) => {
                meta.insert("exposure_time".into(), json!(t));
            }
            Err(e) => warn!(error = %e, "could not read exposure time for metadata"),
        }
        match self.device.exposure_number().await {
            Ok(n) => {
                meta.insert("exposure_number".into(), json!(n));
            }
            Err(e) => warn!(error = %e, "could not read exposure number for metadata"),
        }
        match self.device.operation_mode().await {
            Ok(mode) => {
                meta.insert("operation_mode".into(), Value::Object(mode));
            }
            Err(e) => warn!(error = %e, "could not read operation mode for metadata"),
        }
        meta
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop rolling, disarm if needed, and end both background loops.
    pub async fn shutdown(&self) -> DaqResult<()> {
        self.roll(false, None).await?;
        if self.armed() {
            self.disarm().await?;
        }
        self.closing.store(true, Ordering::Release);
        self.wait_idle().await;

        // Both loops observe their flags within one poll interval.
        let loop_task = locked(&self.loop_task).take();
        if let Some(task) = loop_task {
            let _ = task.await;
        }
        let meta_task = locked(&self.meta_task).take();
        if let Some(task) = meta_task {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Render a file prefix template, substituting the `{index}` field. A
/// template without the field is returned as-is.
fn render_prefix(template: &str, index: u64) -> String {
    let mut vars: HashMap<String, u64> = HashMap::new();
    vars.insert("index".to_string(), index);
    strfmt::strfmt(template, &vars).unwrap_or_else(|_| template.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prefix_pads() {
        assert_eq!(render_prefix("frame_{index:06}", 42), "frame_000042");
    }

    #[test]
    fn test_render_prefix_without_field() {
        assert_eq!(render_prefix("still", 7), "still");
    }
}
