//! Configuration for the input sentinel agent.
//!
//! Settings live in a JSON file and are re-read on an interval while the agent
//! runs. Each reload produces a complete, immutable [`Settings`] value that
//! replaces the previous one in a single swap, so readers always see one
//! consistent snapshot.

use crate::shutdown::Shutdown;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// What the producer does when the upload queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest pending entry from memory; its staged copy stays on
    /// disk and is picked up by the next recovery scan.
    DropOldest,
    /// Wait until a worker frees a slot.
    Block,
    /// Refuse the new artifact; its staged copy stays on disk.
    Reject,
}

/// Complete agent settings snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Time between screenshots
    #[serde(with = "duration_serde")]
    pub screenshot_interval: Duration,
    pub capture_screenshots: bool,
    pub blur_screenshots: bool,
    pub blur_sigma: f32,
    pub resize_width: u32,
    pub resize_height: u32,
    /// External command that writes a PNG to the path given as `{output}`
    pub capture_command: Option<String>,

    /// Pointer speed above which movement is flagged (points per second)
    pub pointer_speed_threshold: f64,
    /// Key interval spread (seconds) below which typing is flagged
    pub key_dispersion_threshold: f64,
    /// Minimum number of key intervals before timing is judged
    pub min_key_samples: usize,
    /// Length of the rolling activity window
    #[serde(with = "duration_serde")]
    pub activity_window: Duration,
    #[serde(with = "duration_serde")]
    pub evaluate_interval: Duration,

    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub backoff_base: Duration,
    #[serde(with = "duration_serde")]
    pub backoff_cap: Duration,
    pub backoff_multiplier: f64,

    /// Size of the upload pool; read once at start
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,

    pub encrypt_at_rest: bool,
    pub compress: bool,
    pub key_prefix: String,

    #[serde(with = "duration_serde")]
    pub settings_poll_interval: Duration,
    #[serde(with = "duration_serde")]
    pub timezone_poll_interval: Duration,
    #[serde(with = "duration_serde")]
    pub credential_check_interval: Duration,
    pub max_credential_refreshes: u32,
    /// How often the staging directory is re-scanned for artifacts the
    /// queue had no room for
    #[serde(with = "duration_serde")]
    pub staging_scan_interval: Duration,

    /// Whether capture and classification are currently paused
    pub paused: bool,

    /// Staging area for artifacts awaiting upload
    pub staging_path: PathBuf,
    /// Path for transparency statistics
    pub data_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("input-sentinel");

        Self {
            screenshot_interval: Duration::from_secs(300),
            capture_screenshots: true,
            blur_screenshots: false,
            blur_sigma: 15.0,
            resize_width: 800,
            resize_height: 600,
            capture_command: None,

            pointer_speed_threshold: 1000.0,
            key_dispersion_threshold: 0.05,
            min_key_samples: 5,
            activity_window: Duration::from_secs(10),
            evaluate_interval: Duration::from_secs(1),

            max_attempts: 8,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(600),
            backoff_multiplier: 2.0,

            workers: 2,
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,

            encrypt_at_rest: true,
            compress: true,
            key_prefix: "uploads".to_string(),

            settings_poll_interval: Duration::from_secs(10),
            timezone_poll_interval: Duration::from_secs(60),
            credential_check_interval: Duration::from_secs(10),
            max_credential_refreshes: 6,
            staging_scan_interval: Duration::from_secs(30),

            paused: false,

            staging_path: data_dir.join("staging"),
            data_path: data_dir,
        }
    }
}

impl Settings {
    /// Get the path to the default settings file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("input-sentinel")
            .join("config.json")
    }

    /// Load settings from a file. A missing file is an error; see
    /// [`FileSettingsProvider::load_or_init`] for first-run defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a file.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.staging_path)?;
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    /// Look up one setting by its JSON field name.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut fields)) => fields.remove(key),
            _ => None,
        }
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.screenshot_interval.is_zero() || self.evaluate_interval.is_zero() {
            return Err(ConfigError::Invalid("intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Supplies settings snapshots.
pub trait SettingsProvider: Send + Sync {
    /// Produce a fresh, complete snapshot.
    fn reload(&self) -> Result<Settings, ConfigError>;

    /// Read a single key from a fresh snapshot.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, ConfigError> {
        Ok(self.reload()?.get(key))
    }
}

/// Settings backed by a JSON file on disk.
#[derive(Debug, Clone)]
pub struct FileSettingsProvider {
    path: PathBuf,
}

impl FileSettingsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Provider for the default settings location.
    pub fn default_location() -> Self {
        Self::new(Settings::config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, writing the defaults out if no file exists yet.
    pub fn load_or_init(&self) -> Result<Settings, ConfigError> {
        if !self.path.exists() {
            let settings = Settings::default();
            settings.save_to(&self.path)?;
            return Ok(settings);
        }
        Settings::load_from(&self.path)
    }
}

impl SettingsProvider for FileSettingsProvider {
    fn reload(&self) -> Result<Settings, ConfigError> {
        Settings::load_from(&self.path)
    }
}

/// Values pinned for the life of the process, e.g. from command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub workers: Option<usize>,
}

impl SettingsOverrides {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
    }

    /// Wrap a provider so every snapshot it produces carries these overrides.
    pub fn wrap<P: SettingsProvider>(self, inner: P) -> OverriddenProvider<P> {
        OverriddenProvider {
            inner,
            overrides: self,
        }
    }
}

pub struct OverriddenProvider<P> {
    inner: P,
    overrides: SettingsOverrides,
}

impl<P: SettingsProvider> SettingsProvider for OverriddenProvider<P> {
    fn reload(&self) -> Result<Settings, ConfigError> {
        let mut settings = self.inner.reload()?;
        self.overrides.apply(&mut settings);
        Ok(settings)
    }
}

/// The current settings snapshot, shared by every task.
///
/// Cloning is cheap; all clones observe the same swaps.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    tx: Arc<watch::Sender<Arc<Settings>>>,
}

impl SharedSettings {
    pub fn new(initial: Settings) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    /// Replace the snapshot. Returns `true` if the contents changed.
    pub fn replace(&self, next: Settings) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == next {
                return false;
            }
            *current = Arc::new(next);
            true
        })
    }

    /// Receiver that wakes on every effective change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }
}

/// Re-read settings until shutdown. A failed reload keeps the last-known
/// snapshot.
pub async fn poll_settings(
    provider: Arc<dyn SettingsProvider>,
    settings: SharedSettings,
    mut shutdown: Shutdown,
) {
    loop {
        let interval = settings.current().settings_poll_interval;
        if !shutdown.sleep(interval).await {
            break;
        }
        match provider.reload().and_then(|next| next.validate().map(|_| next)) {
            Ok(next) => {
                if settings.replace(next) {
                    tracing::info!("settings reloaded");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "settings unavailable, keeping last-known snapshot");
            }
        }
    }
    tracing::debug!("settings poller stopped");
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.screenshot_interval, Duration::from_secs(300));
        assert!(settings.capture_screenshots);
        assert!(!settings.blur_screenshots);
        assert_eq!(settings.pointer_speed_threshold, 1000.0);
        assert_eq!(settings.min_key_samples, 5);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_get_single_key() {
        let settings = Settings {
            workers: 4,
            ..Settings::default()
        };
        assert_eq!(settings.get("workers"), Some(serde_json::json!(4)));
        assert_eq!(settings.get("overflow_policy"), Some(serde_json::json!("drop_oldest")));
        assert_eq!(settings.get("no_such_key"), None);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"screenshot_interval": 30, "blur_screenshots": true}"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.screenshot_interval, Duration::from_secs(30));
        assert!(settings.blur_screenshots);
        assert_eq!(settings.max_attempts, Settings::default().max_attempts);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"workers": 0}"#).unwrap();
        assert!(matches!(
            Settings::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Settings::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSettingsProvider::new(dir.path().join("nested").join("config.json"));
        let settings = provider.load_or_init().unwrap();
        assert!(provider.path().exists());
        assert_eq!(provider.reload().unwrap(), settings);
    }

    #[test]
    fn test_shared_settings_swap() {
        let shared = SharedSettings::new(Settings::default());
        let before = shared.current();

        let mut next = Settings::default();
        next.screenshot_interval = Duration::from_secs(5);
        assert!(shared.replace(next.clone()));
        assert!(!shared.replace(next));

        // Old readers keep their consistent snapshot.
        assert_eq!(before.screenshot_interval, Duration::from_secs(300));
        assert_eq!(shared.current().screenshot_interval, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_keeps_last_known_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut initial = Settings::default();
        initial.settings_poll_interval = Duration::from_secs(1);
        initial.save_to(&path).unwrap();

        let shared = SharedSettings::new(initial.clone());
        let (trigger, shutdown) = crate::shutdown::channel();
        let provider: Arc<dyn SettingsProvider> = Arc::new(FileSettingsProvider::new(&path));
        let handle = tokio::spawn(poll_settings(provider, shared.clone(), shutdown));

        std::fs::write(&path, "{ broken").unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*shared.current(), initial);

        let mut updated = initial.clone();
        updated.blur_screenshots = true;
        updated.save_to(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(shared.current().blur_screenshots);

        trigger.trigger();
        handle.await.unwrap();
    }

    #[test]
    fn test_reload_of_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSettingsProvider::new(dir.path().join("config.json"));
        match provider.reload() {
            Err(ConfigError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(!provider.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_keeps_snapshot_when_file_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let initial = Settings {
            paused: true,
            pointer_speed_threshold: 42.0,
            settings_poll_interval: Duration::from_secs(1),
            ..Settings::default()
        };
        initial.save_to(&path).unwrap();

        let shared = SharedSettings::new(initial.clone());
        let (trigger, shutdown) = crate::shutdown::channel();
        let provider: Arc<dyn SettingsProvider> = Arc::new(FileSettingsProvider::new(&path));
        let handle = tokio::spawn(poll_settings(provider, shared.clone(), shutdown));

        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(*shared.current(), initial);
        assert!(shared.current().paused);
        assert_eq!(shared.current().pointer_speed_threshold, 42.0);

        trigger.trigger();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrides_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let on_disk = Settings {
            workers: 2,
            settings_poll_interval: Duration::from_secs(1),
            ..Settings::default()
        };
        on_disk.save_to(&path).unwrap();

        let overrides = SettingsOverrides { workers: Some(5) };
        let mut initial = on_disk.clone();
        overrides.apply(&mut initial);
        let shared = SharedSettings::new(initial);
        let provider: Arc<dyn SettingsProvider> =
            Arc::new(overrides.wrap(FileSettingsProvider::new(&path)));
        let (trigger, shutdown) = crate::shutdown::channel();
        let handle = tokio::spawn(poll_settings(provider, shared.clone(), shutdown));

        let edited = Settings {
            blur_screenshots: true,
            ..on_disk
        };
        edited.save_to(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(shared.current().blur_screenshots);
        assert_eq!(shared.current().workers, 5);

        trigger.trigger();
        handle.await.unwrap();
    }
}
