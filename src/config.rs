//! Configuration for the DAQ processes.
//!
//! Two layers, loaded differently:
//!
//! 1. [`Settings`] — strongly-typed process configuration loaded with
//!    Figment from a TOML file plus `LABDAQ_`-prefixed environment
//!    variables. Covers network endpoints, retry budgets, poll intervals,
//!    and storage paths.
//! 2. [`DriverConfig`] — a small JSON-file-backed key/value store, one file
//!    per driver, read at startup and written through on every setter call.
//!    Holds the mutable operator-facing state: exposure settings, save and
//!    broadcast toggles, file format, and the per-device file counter.
//!
//! # Example
//! ```no_run
//! use labdaq::config::Settings;
//!
//! let settings = Settings::load().unwrap();
//! println!("data root: {}", settings.storage.data_path.display());
//! ```

use crate::error::{DaqError, DaqResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub link: LinkSettings,
    #[serde(default)]
    pub camera: CameraSettings,
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Device link tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Attempts before `connect` gives up.
    pub connect_retries: u32,
    /// Delay between connection attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Per-call reply window for `send_and_wait`.
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
    /// Poll interval of the receiver task and all flag waits.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Interval between keep-alive probes.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            retry_delay: Duration::from_millis(50),
            reply_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// Acquisition engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Poll interval of the acquisition and metadata loops.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long the metadata aggregation waits between dispatching the
    /// fan-out and collecting the partial result.
    #[serde(with = "humantime_serde")]
    pub meta_window: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            meta_window: Duration::from_millis(500),
        }
    }
}

/// Manager / coordinator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Interval between registry reconciliation passes.
    #[serde(with = "humantime_serde")]
    pub client_loop_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            client_loop_interval: Duration::from_secs(20),
        }
    }
}

/// Data and configuration roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root under which investigation/experiment/scan directories live.
    pub data_path: PathBuf,
    /// Root for per-driver config files.
    pub conf_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let conf = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("labdaq");
        Self {
            data_path: home.join("data"),
            conf_path: conf,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            link: LinkSettings::default(),
            camera: CameraSettings::default(),
            manager: ManagerSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load configuration from `labdaq.toml` and the environment.
    ///
    /// Environment variables override file values with prefix `LABDAQ_`,
    /// e.g. `LABDAQ_MANAGER_CLIENT_LOOP_INTERVAL=5s`.
    pub fn load() -> DaqResult<Self> {
        Self::load_from("labdaq.toml")
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABDAQ_").split("_"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> DaqResult<()> {
        if self.link.connect_retries == 0 {
            return Err(DaqError::Configuration(
                "link.connect_retries must be at least 1".into(),
            ));
        }
        if self.link.poll_interval.is_zero() || self.camera.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "poll intervals must be non-zero".into(),
            ));
        }
        if self.link.reply_timeout < self.link.poll_interval {
            return Err(DaqError::Configuration(
                "link.reply_timeout must not be shorter than link.poll_interval".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Per-driver persisted key/value store
// =============================================================================

/// A JSON-file-backed key/value store, one file per driver.
///
/// Loaded once at driver start; every `set` rewrites the file so operator
/// changes survive a process restart. The interior mutex is held only for
/// map access and the (small) file write, never across awaits.
#[derive(Debug)]
pub struct DriverConfig {
    path: PathBuf,
    values: Mutex<serde_json::Map<String, Value>>,
}

impl DriverConfig {
    /// Open (or create) the config file for `name` under `conf_path`.
    pub fn open(conf_path: &Path, name: &str) -> DaqResult<Self> {
        let dir = conf_path.join("drivers");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.json"));
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .lock()
            .map(|v| v.contains_key(key))
            .unwrap_or(false)
    }

    /// Set a key and write the whole store back to disk.
    pub fn set(&self, key: &str, value: Value) -> DaqResult<()> {
        let snapshot = {
            let mut values = self
                .values
                .lock()
                .map_err(|_| DaqError::Configuration("config store poisoned".into()))?;
            values.insert(key.to_string(), value);
            serde_json::to_string_pretty(&*values)?
        };
        std::fs::write(&self.path, snapshot)?;
        Ok(())
    }

    /// Insert `value` only if `key` is absent; used for first-run defaults.
    pub fn set_default(&self, key: &str, value: Value) -> DaqResult<()> {
        if !self.contains(key) {
            self.set(key, value)?;
        }
        Ok(())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }
}
