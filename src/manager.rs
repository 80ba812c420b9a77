//! Experiment management: scan ledger and metadata fan-out.
//!
//! The [`Manager`] owns two tightly related duties:
//!
//! 1. **Scan ledger** — investigation/experiment naming, scan numbering
//!    derived from the on-disk directory layout, the date-stamped scan
//!    name, and the shared per-scan frame counter that all armed cameras
//!    draw prefixes from.
//! 2. **Metadata fan-out** — a registry of client connections to every
//!    other device process, health-checked and reconnected by a background
//!    reconciliation loop, plus correlated concurrent metadata pulls:
//!    `request_meta` dispatches one fetch task per live source and returns
//!    immediately; `return_meta` collects whatever has finished. The
//!    manager enforces no deadline of its own — the caller chooses how
//!    long to wait between the two calls.
//!
//! Collection is best-effort by design: a slow or dead source costs a
//! warning and a missing entry, never a failed acquisition.

use crate::config::DriverConfig;
use crate::core::{ExperimentLink, ScanInfo, ScanSummary};
use crate::error::{DaqError, DaqResult};
use crate::event::Event;
use crate::metadata::{FetchReply, MetaMap};
use crate::remote::{ClientConnector, RemoteClient};
use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Characters allowed in investigation and experiment names (they become
/// path components).
const VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-:";

/// Scan directories start with a fixed-width zero-padded number; the
/// numbering algorithm parses it back.
static SCAN_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{6})").expect("static pattern")
});

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ScanState {
    running: bool,
    scan_number: u32,
    scan_name: Option<String>,
    /// Filename template rendered by `next_prefix`.
    template: Option<String>,
}

/// One pending fan-out: source name to its in-flight fetch.
type PendingRequest = HashMap<String, JoinHandle<Option<FetchReply>>>;

/// Central coordinator for experiment structure and metadata collection.
pub struct Manager {
    /// Back-reference handed to the reconciliation loop and the manager's
    /// own registry entry.
    self_ref: Weak<Manager>,
    name: String,
    data_path: PathBuf,
    config: DriverConfig,
    scan: Mutex<ScanState>,
    /// Shared frame counter; the single point of contention for frame
    /// numbering across all acquiring cameras during a scan.
    counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<dyn RemoteClient>>>,
    requests: Mutex<HashMap<String, PendingRequest>>,
    connector: Arc<dyn ClientConnector>,
    /// All device-class names the reconciliation loop should try to reach.
    known: Vec<String>,
    client_loop_interval: Duration,
    stop: Event,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        data_path: PathBuf,
        config: DriverConfig,
        connector: Arc<dyn ClientConnector>,
        known: Vec<String>,
        client_loop_interval: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak: &Weak<Manager>| Self {
            self_ref: weak.clone(),
            name: "manager".to_string(),
            data_path,
            config,
            scan: Mutex::new(ScanState::default()),
            counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            connector,
            known,
            client_loop_interval,
            stop: Event::new(),
            loop_task: Mutex::new(None),
        });

        // The manager contributes its own metadata to every aggregate,
        // through the same client interface as everyone else. The lock is
        // uncontended at construction time.
        let self_handle: Arc<dyn RemoteClient> = Arc::new(SelfHandle {
            manager: manager.self_ref.clone(),
        });
        if let Ok(mut clients) = manager.clients.try_write() {
            clients.insert(manager.name.clone(), self_handle);
        }

        manager
    }

    // ------------------------------------------------------------------
    // Registry reconciliation
    // ------------------------------------------------------------------

    /// Start the background loop that connects missing clients and drops
    /// dead ones.
    pub fn spawn_clients_loop(&self) {
        let Some(manager) = self.self_ref.upgrade() else {
            return;
        };
        let handle = tokio::spawn(manager.clients_loop());
        *locked(&self.loop_task) = Some(handle);
    }

    async fn clients_loop(self: Arc<Self>) {
        loop {
            if self.stop.is_set() {
                break;
            }

            // Missing entries: attempt a connection probe. Failures are
            // logged, not raised.
            for name in &self.known {
                if name.eq_ignore_ascii_case(&self.name) {
                    continue;
                }
                if self.clients.read().await.contains_key(name) {
                    continue;
                }
                match self.connector.connect(name).await {
                    Ok(client) => {
                        info!(client = %name, "client connected");
                        self.clients.write().await.insert(name.clone(), client);
                    }
                    Err(e) => debug!(client = %name, error = %e, "client not reachable"),
                }
            }

            // Existing entries: cheap liveness probes, all at once.
            let entries: Vec<(String, Arc<dyn RemoteClient>)> = self
                .clients
                .read()
                .await
                .iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case(&self.name))
                .map(|(name, client)| (name.clone(), Arc::clone(client)))
                .collect();
            let probes = entries.into_iter().map(|(name, client)| async move {
                let alive = client.ping().await.is_ok();
                (name, alive)
            });
            for (name, alive) in join_all(probes).await {
                if !alive {
                    warn!(client = %name, "client failed liveness probe, discarding");
                    self.clients.write().await.remove(&name);
                }
            }

            if self.stop.wait_timeout(self.client_loop_interval).await {
                break;
            }
        }
        info!("exiting client connection loop");
    }

    /// Names of the currently registered clients.
    pub async fn registered(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Metadata fan-out
    // ------------------------------------------------------------------

    /// Dispatch a metadata fetch to every registered source not excluded,
    /// stored under `request_id` until [`Manager::return_meta`] collects
    /// it. Returns immediately; the fetches run concurrently.
    pub async fn request_meta(&self, request_id: &str, exclude: &[String]) {
        let clients: Vec<(String, Arc<dyn RemoteClient>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(name, client)| (name.clone(), Arc::clone(client)))
            .collect();

        let mut pending = PendingRequest::new();
        for (name, client) in clients {
            if exclude.contains(&name) {
                continue;
            }
            let source = name.clone();
            let handle = tokio::spawn(async move {
                let t0 = Instant::now();
                match client.get_meta().await {
                    Ok(meta) => {
                        let elapsed = t0.elapsed();
                        debug!(source = %source, ?elapsed, "metadata collection completed");
                        Some(FetchReply { meta, elapsed })
                    }
                    Err(e) => {
                        warn!(source = %source, error = %e, "metadata collection failed");
                        None
                    }
                }
            });
            pending.insert(name, handle);
        }

        let mut requests = locked(&self.requests);
        if requests.contains_key(request_id) {
            warn!(
                request_id = %request_id,
                "request has not been claimed and will be overwritten"
            );
        }
        requests.insert(request_id.to_string(), pending);
    }

    /// Remove and return the aggregate accumulated under `request_id`.
    ///
    /// Sources whose fetch has not finished are omitted with a warning and
    /// left running detached; this call never waits for stragglers. An
    /// unknown ID is logged as an error and yields an empty aggregate.
    pub async fn return_meta(&self, request_id: &str) -> MetaMap {
        let pending = locked(&self.requests).remove(request_id);
        let Some(pending) = pending else {
            error!(request_id = %request_id, "unknown request ID");
            return MetaMap::new();
        };

        let mut meta = MetaMap::new();
        for (name, handle) in pending {
            if !handle.is_finished() {
                warn!(source = %name, "metadata collection not completed in time");
                continue;
            }
            match handle.await {
                Ok(Some(reply)) => {
                    meta.insert(name, Value::Object(reply.meta));
                }
                Ok(None) => {} // fetch already logged its failure
                Err(e) => warn!(source = %name, error = %e, "metadata fetch task failed"),
            }
        }
        meta
    }

    /// Convenience fan-out: request under a fresh correlation ID, wait
    /// `window`, collect the partial aggregate.
    pub async fn collect_all_meta(&self, window: Duration) -> MetaMap {
        let request_id = format!("auto-{}", uuid::Uuid::new_v4());
        self.request_meta(&request_id, &[]).await;
        sleep(window).await;
        self.return_meta(&request_id).await
    }

    /// The manager's own metadata contribution.
    pub fn get_meta(&self) -> MetaMap {
        let mut meta = MetaMap::new();
        meta.insert(
            "investigation".into(),
            self.investigation().map_or(Value::Null, |v| json!(v)),
        );
        meta.insert(
            "experiment".into(),
            self.experiment().map_or(Value::Null, |v| json!(v)),
        );
        meta.insert(
            "last_scan".into(),
            self.next_scan()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .map_or(Value::Null, |n| json!(n)),
        );
        meta
    }

    // ------------------------------------------------------------------
    // Scan lifecycle
    // ------------------------------------------------------------------

    /// Start a new scan: derive the next number from the experiment
    /// directory, build the date-stamped name, create the directory and
    /// reset the shared frame counter.
    pub fn start_scan(&self, label: Option<&str>) -> DaqResult<ScanInfo> {
        {
            let scan = locked(&self.scan);
            if scan.running {
                return Err(DaqError::Precondition(format!(
                    "scan {} already running",
                    scan.scan_name.clone().unwrap_or_default()
                )));
            }
        }

        let path = self.path()?;
        let scan_number = self.next_scan()?;

        let today = chrono::Local::now().format("%y-%m-%d");
        let mut scan_name = format!("{scan_number:06}_{today}");
        if let Some(label) = label {
            scan_name.push('_');
            scan_name.push_str(label);
        }

        std::fs::create_dir_all(self.data_path.join(&path).join(&scan_name))?;

        {
            let mut scan = locked(&self.scan);
            if scan.running {
                return Err(DaqError::Precondition(
                    "scan started concurrently".into(),
                ));
            }
            scan.running = true;
            scan.scan_number = scan_number;
            scan.scan_name = Some(scan_name.clone());
            scan.template = Some(format!("{scan_name}_{{index:06}}"));
        }
        self.counter.store(0, Ordering::SeqCst);

        info!(scan = %scan_name, "scan started");
        Ok(ScanInfo {
            scan_number,
            scan_name,
            investigation: self.investigation().unwrap_or_default(),
            experiment: self.experiment().unwrap_or_default(),
            path,
        })
    }

    /// Finalize the scan and return a summary including the frame count.
    pub fn end_scan(&self) -> DaqResult<ScanSummary> {
        let path = self.path()?;
        let mut scan = locked(&self.scan);
        if !scan.running {
            return Err(DaqError::Precondition("no scan currently running".into()));
        }
        scan.running = false;
        let summary = ScanSummary {
            scan_number: scan.scan_number,
            scan_name: scan.scan_name.clone().unwrap_or_default(),
            investigation: self.investigation().unwrap_or_default(),
            experiment: self.experiment().unwrap_or_default(),
            path,
            count: self.counter.load(Ordering::SeqCst),
        };
        info!(scan = %summary.scan_name, count = summary.count, "scan ended");
        Ok(summary)
    }

    /// Next available scan number, from the highest numeric prefix among
    /// the experiment's scan directories.
    pub fn next_scan(&self) -> DaqResult<u32> {
        let exp_path = self.data_path.join(self.path()?);
        if !exp_path.exists() {
            return Ok(0);
        }
        let mut highest: Option<u32> = None;
        for entry in std::fs::read_dir(&exp_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(m) = SCAN_PREFIX.captures(&name.to_string_lossy()) {
                if let Ok(n) = m[1].parse::<u32>() {
                    highest = Some(highest.map_or(n, |h| h.max(n)));
                }
            }
        }
        Ok(highest.map_or(0, |h| h + 1))
    }

    /// Render the shared filename prefix and increment the counter, as one
    /// indivisible step.
    pub fn next_prefix(&self) -> DaqResult<String> {
        let template = {
            let scan = locked(&self.scan);
            if !scan.running {
                return Err(DaqError::Precondition("no scan currently running".into()));
            }
            scan.template.clone().unwrap_or_default()
        };
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut vars: HashMap<String, u64> = HashMap::new();
        vars.insert("index".to_string(), index);
        strfmt::strfmt(&template, &vars)
            .map_err(|e| DaqError::Configuration(format!("bad filename template: {e}")))
    }

    /// Current counter value without incrementing it.
    pub fn get_counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Summary of the current configuration.
    pub fn status(&self) -> String {
        let next = self.next_scan().ok();
        let last = match next {
            Some(0) | None => "[none]".to_string(),
            Some(n) => (n - 1).to_string(),
        };
        format!(
            " * Investigation: {}\n * Experiment: {}\n * Last scan number: {}",
            self.investigation().unwrap_or_else(|| "[unset]".into()),
            self.experiment().unwrap_or_else(|| "[unset]".into()),
            last
        )
    }

    // ------------------------------------------------------------------
    // Investigation / experiment
    // ------------------------------------------------------------------

    pub fn investigation(&self) -> Option<String> {
        self.config.get_str("investigation")
    }

    /// Set the investigation. Resets the experiment, which must be chosen
    /// anew underneath it.
    pub fn set_investigation(&self, name: &str) -> DaqResult<()> {
        if locked(&self.scan).running {
            return Err(DaqError::Precondition(
                "investigation cannot be modified while a scan is running".into(),
            ));
        }
        if !valid_name(name) {
            return Err(DaqError::Precondition(format!(
                "invalid investigation name: {name}"
            )));
        }
        self.config.set("investigation", json!(name))?;
        self.config.set("experiment", Value::Null)?;
        Ok(())
    }

    pub fn experiment(&self) -> Option<String> {
        self.config.get_str("experiment")
    }

    pub fn set_experiment(&self, name: &str) -> DaqResult<()> {
        if locked(&self.scan).running {
            return Err(DaqError::Precondition(
                "experiment cannot be modified while a scan is running".into(),
            ));
        }
        if self.investigation().is_none() {
            return Err(DaqError::Precondition("investigation is not set".into()));
        }
        if !valid_name(name) {
            return Err(DaqError::Precondition(format!(
                "invalid experiment name: {name}"
            )));
        }
        self.config.set("experiment", json!(name))?;
        self.check_path();
        Ok(())
    }

    /// Experiment path relative to the data root.
    pub fn path(&self) -> DaqResult<PathBuf> {
        match (self.investigation(), self.experiment()) {
            (Some(inv), Some(exp)) => Ok(PathBuf::from(inv).join(exp)),
            _ => Err(DaqError::Precondition(
                "experiment or investigation not set".into(),
            )),
        }
    }

    fn check_path(&self) {
        match self.path() {
            Ok(path) => {
                let full = self.data_path.join(path);
                if full.exists() {
                    info!(path = %full.display(), "path selected (exists)");
                } else if let Err(e) = std::fs::create_dir_all(&full) {
                    warn!(path = %full.display(), error = %e, "could not create path");
                } else {
                    info!(path = %full.display(), "created path");
                }
            }
            Err(e) => warn!(error = %e, "path not available"),
        }
    }

    pub fn scanning(&self) -> bool {
        locked(&self.scan).running
    }

    /// Full scan name - `None` if no scan is running.
    pub fn current_scan_name(&self) -> Option<String> {
        let scan = locked(&self.scan);
        if scan.running {
            scan.scan_name.clone()
        } else {
            None
        }
    }

    pub fn scan_number(&self) -> Option<u32> {
        let scan = locked(&self.scan);
        if scan.running {
            Some(scan.scan_number)
        } else {
            None
        }
    }

    /// Scan path relative to the data root - `None` if no scan is running.
    pub fn current_scan_path(&self) -> Option<PathBuf> {
        let name = self.current_scan_name()?;
        self.path().ok().map(|p| p.join(name))
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Best-effort broadcast shutdown to every registered remote source.
    pub async fn killall(&self) {
        self.stop.set();
        let entries: Vec<(String, Arc<dyn RemoteClient>)> =
            self.clients.write().await.drain().collect();
        for (name, client) in entries {
            if name.eq_ignore_ascii_case(&self.name) {
                // We don't kill ourselves.
                continue;
            }
            if let Err(e) = client.ask_admin(true).await {
                warn!(client = %name, error = %e, "could not elevate permission");
            }
            match client.kill().await {
                Ok(()) => info!(client = %name, "killed"),
                Err(e) => warn!(client = %name, error = %e, "kill failed"),
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    /// Stop the reconciliation loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop.set();
        let task = locked(&self.loop_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// The manager's own entry in its client registry.
struct SelfHandle {
    manager: Weak<Manager>,
}

#[async_trait]
impl RemoteClient for SelfHandle {
    fn name(&self) -> &str {
        "manager"
    }

    async fn ping(&self) -> DaqResult<()> {
        Ok(())
    }

    async fn get_meta(&self) -> DaqResult<MetaMap> {
        self.manager
            .upgrade()
            .map(|m| m.get_meta())
            .ok_or_else(|| DaqError::Remote("manager is gone".into()))
    }

    async fn ask_admin(&self, _force: bool) -> DaqResult<()> {
        Ok(())
    }

    async fn kill(&self) -> DaqResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ExperimentLink for Manager {
    async fn scan_path(&self) -> Option<PathBuf> {
        self.current_scan_path()
    }

    async fn scan_name(&self) -> Option<String> {
        self.current_scan_name()
    }

    async fn next_prefix(&self) -> DaqResult<String> {
        Manager::next_prefix(self)
    }

    async fn aggregate_meta(&self, window: Duration) -> MetaMap {
        self.collect_all_meta(window).await
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| VALID_CHARS.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_name() {
        assert!(valid_name("speckle_long-branch:2"));
        assert!(!valid_name("bad/name"));
        assert!(!valid_name("spaced name"));
        assert!(!valid_name(""));
    }

    #[test]
    fn test_scan_prefix_pattern() {
        assert!(SCAN_PREFIX.is_match("000123_25-08-06_label"));
        assert!(!SCAN_PREFIX.is_match("scan_000123"));
        assert!(!SCAN_PREFIX.is_match("12345"));
    }
}
