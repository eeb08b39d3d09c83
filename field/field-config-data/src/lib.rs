use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// The field capture configuration error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {source}")]
    TomlSerError {
        #[from]
        source: toml::ser::Error,
    },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, Error>;

/// The default value for [SchedulerConfig::interval_meters].
pub const DEFAULT_INTERVAL_METERS: f64 = 10.0;
/// The default value for [SchedulerConfig::high_speed_threshold_mps].
pub const DEFAULT_HIGH_SPEED_THRESHOLD_MPS: f64 = 10.0;
/// The default value for [SchedulerConfig::safety_floor_msec].
pub const DEFAULT_SAFETY_FLOOR_MSEC: u64 = 200;
/// The default value for [SchedulerConfig::poll_period_msec].
pub const DEFAULT_POLL_PERIOD_MSEC: u64 = 500;

/// The default value for [SmootherConfig::base_noise_mps].
pub const DEFAULT_BASE_NOISE_MPS: f64 = 3.0;
/// The default value for [SmootherConfig::speed_noise_divisor].
pub const DEFAULT_SPEED_NOISE_DIVISOR: f64 = 10.0;
/// The default value for [SmootherConfig::min_accuracy_m].
pub const DEFAULT_MIN_ACCURACY_M: f64 = 1.0;

/// The default value for [StorageConfig::data_dir].
pub const DEFAULT_DATA_DIR: &str = "~/FIELD-DATA";

/// The default value for [RemoteConfig::base_url].
pub const DEFAULT_REMOTE_BASE_URL: &str = "http://127.0.0.1:8080/";

// serde default functions -------------------------------------------------

fn default_interval_meters() -> f64 {
    DEFAULT_INTERVAL_METERS
}

fn default_high_speed_threshold_mps() -> f64 {
    DEFAULT_HIGH_SPEED_THRESHOLD_MPS
}

fn default_safety_floor_msec() -> u64 {
    DEFAULT_SAFETY_FLOOR_MSEC
}

fn default_poll_period_msec() -> u64 {
    DEFAULT_POLL_PERIOD_MSEC
}

fn default_base_noise_mps() -> f64 {
    DEFAULT_BASE_NOISE_MPS
}

fn default_speed_noise_divisor() -> f64 {
    DEFAULT_SPEED_NOISE_DIVISOR
}

fn default_min_accuracy_m() -> f64 {
    DEFAULT_MIN_ACCURACY_M
}

fn default_upload_base_backoff_secs() -> u64 {
    60
}

fn default_delete_base_backoff_secs() -> u64 {
    10
}

fn default_max_backoff_secs() -> u64 {
    5 * 60 * 60
}

fn default_cleanup_period_secs() -> u64 {
    24 * 60 * 60
}

fn default_constraint_recheck_secs() -> u64 {
    15 * 60
}

fn default_retention_days() -> u32 {
    1
}

fn default_inspector_id() -> String {
    "inspector".to_string()
}

fn default_data_dir() -> PathBuf {
    DEFAULT_DATA_DIR.into()
}

fn default_remote_base_url() -> String {
    DEFAULT_REMOTE_BASE_URL.to_string()
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is expanded
/// to the home directory.
fn fixup_relative_path(path: &mut PathBuf, dirname: &Path) -> Result<()> {
    let pathstr = path
        .as_os_str()
        .to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.clone()))?;
    let expanded = shellexpand::full(pathstr)?;
    *path = PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

// sub-configurations -----------------------------------------------------

/// When to fire automatic captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Distance between automatic captures, in meters.
    #[serde(default = "default_interval_meters")]
    pub interval_meters: f64,
    /// Above this speed (m/s), captures are timed by prediction rather than
    /// confirmed by the odometer.
    #[serde(default = "default_high_speed_threshold_mps")]
    pub high_speed_threshold_mps: f64,
    /// Minimum wait between predicted captures (msec).
    #[serde(default = "default_safety_floor_msec")]
    pub safety_floor_msec: u64,
    /// Odometer polling period at low speed (msec).
    #[serde(default = "default_poll_period_msec")]
    pub poll_period_msec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_meters: default_interval_meters(),
            high_speed_threshold_mps: default_high_speed_threshold_mps(),
            safety_floor_msec: default_safety_floor_msec(),
            poll_period_msec: default_poll_period_msec(),
        }
    }
}

impl SchedulerConfig {
    pub fn safety_floor(&self) -> Duration {
        Duration::from_millis(self.safety_floor_msec)
    }
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_msec)
    }
    fn validate(&self) -> Result<()> {
        if !(self.interval_meters.is_finite() && self.interval_meters > 0.0) {
            return Err(Error::Invalid(format!(
                "scheduler.interval_meters must be positive, not {}",
                self.interval_meters
            )));
        }
        if !(self.high_speed_threshold_mps.is_finite() && self.high_speed_threshold_mps > 0.0) {
            return Err(Error::Invalid(
                "scheduler.high_speed_threshold_mps must be positive".into(),
            ));
        }
        if self.poll_period_msec == 0 {
            return Err(Error::Invalid("scheduler.poll_period_msec must be nonzero".into()));
        }
        Ok(())
    }
}

/// Tuning of the position smoother.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmootherConfig {
    /// Process noise at standstill (m/s).
    #[serde(default = "default_base_noise_mps")]
    pub base_noise_mps: f64,
    /// Divisor `k` in `base_noise + speed * elapsed / k`.
    #[serde(default = "default_speed_noise_divisor")]
    pub speed_noise_divisor: f64,
    /// Reported accuracies below this (m) are raised to it.
    #[serde(default = "default_min_accuracy_m")]
    pub min_accuracy_m: f64,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            base_noise_mps: default_base_noise_mps(),
            speed_noise_divisor: default_speed_noise_divisor(),
            min_accuracy_m: default_min_accuracy_m(),
        }
    }
}

/// Background synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Initial retry delay of the upload task (sec). Doubles per attempt.
    #[serde(default = "default_upload_base_backoff_secs")]
    pub upload_base_backoff_secs: u64,
    /// Initial retry delay of delete tasks (sec). Doubles per attempt.
    #[serde(default = "default_delete_base_backoff_secs")]
    pub delete_base_backoff_secs: u64,
    /// Upper bound for any retry delay (sec).
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Period of the cleanup job (sec).
    #[serde(default = "default_cleanup_period_secs")]
    pub cleanup_period_secs: u64,
    /// How soon to look again when the device is not ready for cleanup (sec).
    #[serde(default = "default_constraint_recheck_secs")]
    pub constraint_recheck_secs: u64,
    /// Synced and deleted records older than this are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Identifies this inspector to the remote service.
    #[serde(default = "default_inspector_id")]
    pub inspector_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upload_base_backoff_secs: default_upload_base_backoff_secs(),
            delete_base_backoff_secs: default_delete_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            cleanup_period_secs: default_cleanup_period_secs(),
            constraint_recheck_secs: default_constraint_recheck_secs(),
            retention_days: default_retention_days(),
            inspector_id: default_inspector_id(),
        }
    }
}

impl SyncConfig {
    pub fn upload_base_backoff(&self) -> Duration {
        Duration::from_secs(self.upload_base_backoff_secs)
    }
    pub fn delete_base_backoff(&self) -> Duration {
        Duration::from_secs(self.delete_base_backoff_secs)
    }
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_period_secs)
    }
    pub fn constraint_recheck(&self) -> Duration {
        Duration::from_secs(self.constraint_recheck_secs)
    }
}

/// Local storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding records, media and the sync task table. Can contain
    /// shell variables. Defaults to [DEFAULT_DATA_DIR].
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }
    pub fn sync_dir(&self) -> PathBuf {
        self.data_dir.join("sync")
    }
}

/// The remote service receiving records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Base URL, e.g. `http://host:port/`. Must end at the root path.
    #[serde(default = "default_remote_base_url")]
    pub base_url: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_base_url(),
        }
    }
}

/// The configuration format of the field capture `TOML` file.
///
/// Every section and every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub smoother: SmootherConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl FieldConfig {
    /// For all paths which are relative, make them relative to `dirname`.
    fn fixup_relative_paths(&mut self, dirname: &Path) -> Result<()> {
        fixup_relative_path(&mut self.storage.data_dir, dirname)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()
    }

    /// Render as TOML, e.g. to show the defaults.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

/// Parse a configuration from a TOML string.
///
/// Relative paths are resolved against `dirname`.
pub fn parse_config_str(contents: &str, dirname: &Path) -> Result<FieldConfig> {
    let mut cfg: FieldConfig = toml::from_str(contents)?;
    cfg.fixup_relative_paths(dirname)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parse a `.toml` file and return a [FieldConfig] structure.
pub fn parse_config_file<P: AsRef<Path>>(fname: P) -> Result<FieldConfig> {
    let fname = fname.as_ref();
    let contents = std::fs::read_to_string(fname)?;
    let dirname = fname.parent().unwrap_or_else(|| Path::new("."));
    tracing::debug!("parsing config file {}", fname.display());
    parse_config_str(&contents, dirname)
}
