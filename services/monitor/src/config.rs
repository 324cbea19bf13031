//! Configuration management for the machine room monitor.
//!
//! Configuration is read once at startup, validated, and then shared as an
//! immutable snapshot for the lifetime of the process. Changing it requires a
//! restart.

use crate::sensor::{ChannelSpec, SensorKind, TriggerRule};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for the monitor service.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Sensor channels and debounce policy
    pub sensors: SensorsConfig,

    /// Camera capture and frame buffer
    #[serde(default)]
    pub camera: CameraConfig,

    /// Alert gating, queueing and retry policy
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Email delivery
    pub email: EmailConfig,

    /// Persisted artifact quotas
    #[serde(default)]
    pub storage: StorageConfig,

    /// Restart budget and health ceilings
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sensor polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorsConfig {
    /// Interval between poll ticks in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive read failures before a channel is marked degraded
    #[serde(default = "default_degrade_after_failures")]
    pub degrade_after_failures: u32,

    /// Debounce threshold per sensor kind (e.g. `flame = 3`)
    #[serde(default)]
    pub thresholds: HashMap<String, u32>,

    /// Configured channels
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// A single sensor channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel identifier
    pub id: String,

    /// Sensor kind (smoke, flame, temperature, humidity, water)
    pub kind: String,

    /// File the raw value is read from (sysfs GPIO value, IIO attribute, ...)
    pub source: PathBuf,

    /// Digital line reads low when active
    #[serde(default)]
    pub active_low: bool,

    /// Multiplier applied to analog values
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Per-channel debounce threshold override
    #[serde(default)]
    pub threshold: Option<u32>,

    /// Analog upper bound
    #[serde(default)]
    pub trigger_above: Option<f64>,

    /// Analog lower bound
    #[serde(default)]
    pub trigger_below: Option<f64>,
}

/// Camera configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Whether frames are captured at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Still capture program writing one encoded image to stdout
    #[serde(default = "default_camera_command")]
    pub command: String,

    /// Arguments for the capture program
    #[serde(default = "default_camera_args")]
    pub args: Vec<String>,

    /// Interval between captures in milliseconds
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,

    /// Timeout for one capture in seconds
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,

    /// Number of recent frames kept in memory
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Write every captured frame under `captures_dir/frames`
    #[serde(default = "default_true")]
    pub persist_frames: bool,
}

/// Alert dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Minimum seconds between two dispatches of the same kind
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Per-kind cooldown overrides in seconds
    #[serde(default)]
    pub cooldown_overrides: HashMap<String, u64>,

    /// Maximum number of pending jobs
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum delivery attempts per job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between retries
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Randomization factor applied to retry delays (0.0 - 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Timeout for a single delivery attempt in seconds
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Time allowed to flush pending jobs on shutdown in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Attach the frame archive to alert emails
    #[serde(default = "default_true")]
    pub include_images: bool,

    /// Number of finished jobs kept for inspection
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Location line rendered into alert bodies
    #[serde(default = "default_location")]
    pub location: String,
}

/// Supported email transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Pipe messages to a local `sendmail` binary
    Sendmail,
    /// Drop `.eml` files into a pickup directory
    Spool,
    /// Relay through an SMTP server
    Smtp,
}

/// Email delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    /// Transport used for delivery
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Sender address
    #[serde(default = "default_from")]
    pub from: String,

    /// Alert recipients
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Path to the sendmail binary
    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: PathBuf,

    /// Pickup directory for the spool transport
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// Relay settings for the smtp transport
    #[serde(default)]
    pub smtp: SmtpConfig,
}

/// SMTP relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Relay host name
    #[serde(default)]
    pub host: String,

    /// Relay port (587 for submission with STARTTLS)
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Login user, if the relay requires authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Login password
    #[serde(default)]
    pub password: Option<String>,

    /// Upgrade the connection with STARTTLS before authenticating
    #[serde(default = "default_true")]
    pub starttls: bool,

    /// Connection and command timeout in seconds
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
}

/// Storage quota configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root for persisted frames and alert archives
    #[serde(default = "default_captures_dir")]
    pub captures_dir: PathBuf,

    /// Directory holding log files
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Artifacts older than this are deleted
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,

    /// Total size quota across captures and logs in megabytes
    #[serde(default = "default_max_total_mb")]
    pub max_total_mb: u64,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Report deletions without performing them
    #[serde(default)]
    pub dry_run: bool,

    /// Remove empty sub-directories after a sweep
    #[serde(default = "default_true")]
    pub prune_empty_dirs: bool,
}

/// Watchdog configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Unplanned exits tolerated inside the window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Sliding restart window in seconds
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// First restart delay in milliseconds
    #[serde(default = "default_restart_backoff_base_ms")]
    pub restart_backoff_base_ms: u64,

    /// Restart delay ceiling in seconds
    #[serde(default = "default_restart_backoff_max_secs")]
    pub restart_backoff_max_secs: u64,

    /// Seconds between health samples
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Resident memory ceiling in megabytes
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// CPU usage ceiling in percent
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f32,

    /// Consecutive breaching samples before a planned restart
    #[serde(default = "default_breach_samples")]
    pub breach_samples: u32,

    /// Time a monitor incarnation gets to stop in seconds
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// JSON status file for external process managers
    #[serde(default)]
    pub status_file: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional log file with size-based rotation
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Rotate once the file reaches this size in megabytes
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Rotated files kept next to the active one
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_degrade_after_failures() -> u32 {
    5
}
fn default_scale() -> f64 {
    1.0
}
fn default_camera_command() -> String {
    "rpicam-still".to_string()
}
fn default_camera_args() -> Vec<String> {
    [
        "-n", "-t", "1", "--width", "640", "--height", "480", "-e", "jpg", "-o", "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_capture_interval_ms() -> u64 {
    5000
}
fn default_capture_timeout_secs() -> u64 {
    10
}
fn default_buffer_capacity() -> usize {
    20
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_queue_capacity() -> usize {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    2000
}
fn default_max_backoff_ms() -> u64 {
    60000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_jitter() -> f64 {
    0.1
}
fn default_attempt_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    15
}
fn default_history_size() -> usize {
    100
}
fn default_location() -> String {
    "Machine Room".to_string()
}
fn default_transport() -> TransportKind {
    TransportKind::Sendmail
}
fn default_from() -> String {
    "roomguard@localhost".to_string()
}
fn default_sendmail_path() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}
fn default_spool_dir() -> PathBuf {
    PathBuf::from("data/outbox")
}
fn default_smtp_port() -> u16 {
    587
}
fn default_smtp_timeout_secs() -> u64 {
    30
}
fn default_captures_dir() -> PathBuf {
    PathBuf::from("data/captures")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_max_age_days() -> u64 {
    7
}
fn default_max_total_mb() -> u64 {
    10240
}
fn default_sweep_interval_secs() -> u64 {
    3600
}
fn default_max_restarts() -> u32 {
    10
}
fn default_restart_window_secs() -> u64 {
    3600
}
fn default_restart_backoff_base_ms() -> u64 {
    1000
}
fn default_restart_backoff_max_secs() -> u64 {
    300
}
fn default_health_interval_secs() -> u64 {
    30
}
fn default_max_memory_mb() -> u64 {
    512
}
fn default_max_cpu_percent() -> f32 {
    90.0
}
fn default_breach_samples() -> u32 {
    3
}
fn default_stop_grace_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_max_file_size_mb() -> u64 {
    10
}
fn default_backup_count() -> usize {
    5
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_camera_command(),
            args: default_camera_args(),
            capture_interval_ms: default_capture_interval_ms(),
            capture_timeout_secs: default_capture_timeout_secs(),
            buffer_capacity: default_buffer_capacity(),
            persist_frames: true,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            cooldown_overrides: HashMap::new(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_jitter: default_backoff_jitter(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            include_images: true,
            history_size: default_history_size(),
            location: default_location(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_smtp_port(),
            username: None,
            password: None,
            starttls: true,
            timeout_secs: default_smtp_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            captures_dir: default_captures_dir(),
            logs_dir: default_logs_dir(),
            max_age_days: default_max_age_days(),
            max_total_mb: default_max_total_mb(),
            sweep_interval_secs: default_sweep_interval_secs(),
            dry_run: false,
            prune_empty_dirs: true,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            restart_backoff_base_ms: default_restart_backoff_base_ms(),
            restart_backoff_max_secs: default_restart_backoff_max_secs(),
            health_interval_secs: default_health_interval_secs(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            breach_samples: default_breach_samples(),
            stop_grace_secs: default_stop_grace_secs(),
            status_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            max_file_size_mb: default_max_file_size_mb(),
            backup_count: default_backup_count(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config/default.toml`
    /// 2. `config/{RUN_MODE}.toml`
    /// 3. the file named by `ROOMGUARD_CONFIG`
    /// 4. environment variables (e.g. `ROOMGUARD__ALERTS__COOLDOWN_SECS`)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Ok(path) = std::env::var("ROOMGUARD_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("ROOMGUARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("ROOMGUARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.sensors.validate()?;
        self.camera.validate()?;
        self.alerts.validate()?;
        self.email.validate()?;
        self.storage.validate()?;
        self.watchdog.validate()?;
        Ok(())
    }
}

impl SensorsConfig {
    /// Interval between poll ticks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Debounce threshold configured for a kind, falling back to the kind's default.
    pub fn threshold_for(&self, kind: SensorKind) -> u32 {
        self.thresholds
            .iter()
            .find(|(k, _)| SensorKind::from_str(k).ok() == Some(kind))
            .map(|(_, v)| *v)
            .unwrap_or_else(|| kind.default_threshold())
    }

    /// Resolve the configured channels into validated channel specs.
    pub fn channel_specs(&self) -> Result<Vec<ChannelSpec>, ConfigValidationError> {
        self.channels
            .iter()
            .map(|channel| {
                let kind = SensorKind::from_str(&channel.kind).map_err(|_| {
                    ConfigValidationError::InvalidValue {
                        field: format!("sensors.channels.{}.kind", channel.id),
                        message: format!("unknown sensor kind '{}'", channel.kind),
                    }
                })?;

                let rule = if kind.is_digital() {
                    TriggerRule::Active
                } else {
                    let (low, high) = kind.default_bounds();
                    TriggerRule::from_bounds(
                        channel.trigger_below.or(low),
                        channel.trigger_above.or(high),
                    )
                    .ok_or_else(|| ConfigValidationError::InvalidValue {
                        field: format!("sensors.channels.{}", channel.id),
                        message: "analog channel needs trigger_above or trigger_below".to_string(),
                    })?
                };

                Ok(ChannelSpec {
                    id: channel.id.clone(),
                    kind,
                    source: channel.source.clone(),
                    active_low: channel.active_low,
                    scale: channel.scale,
                    threshold: channel.threshold.unwrap_or_else(|| self.threshold_for(kind)),
                    rule,
                })
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.channels.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "sensors.channels".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sensors.poll_interval_ms".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.degrade_after_failures == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sensors.degrade_after_failures".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        for (key, value) in &self.thresholds {
            if SensorKind::from_str(key).is_err() {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("sensors.thresholds.{}", key),
                    message: "unknown sensor kind".to_string(),
                });
            }
            if *value == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("sensors.thresholds.{}", key),
                    message: "Threshold must be at least 1".to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.id.is_empty() {
                return Err(ConfigValidationError::MissingField(
                    "sensors.channels.id".to_string(),
                ));
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("sensors.channels.{}", channel.id),
                    message: "duplicate channel id".to_string(),
                });
            }
            if channel.threshold == Some(0) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("sensors.channels.{}.threshold", channel.id),
                    message: "Threshold must be at least 1".to_string(),
                });
            }
        }

        self.channel_specs().map(|_| ())
    }
}

impl CameraConfig {
    /// Interval between captures.
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }

    /// Timeout for a single capture.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.buffer_capacity".to_string(),
                message: "Capacity must be greater than 0".to_string(),
            });
        }

        if self.enabled && self.command.is_empty() {
            return Err(ConfigValidationError::MissingField("camera.command".to_string()));
        }

        if self.enabled && self.capture_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.capture_interval_ms".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl AlertsConfig {
    /// Cooldown window for a kind, honouring overrides.
    pub fn cooldown_for(&self, kind: SensorKind) -> Duration {
        let secs = self
            .cooldown_overrides
            .iter()
            .find(|(k, _)| SensorKind::from_str(k).ok() == Some(kind))
            .map(|(_, v)| *v)
            .unwrap_or(self.cooldown_secs);
        Duration::from_secs(secs)
    }

    /// Cooldown windows for every kind.
    pub fn cooldowns(&self) -> HashMap<SensorKind, Duration> {
        SensorKind::ALL
            .iter()
            .map(|kind| (*kind, self.cooldown_for(*kind)))
            .collect()
    }

    /// First retry delay.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Retry delay ceiling.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Timeout for one delivery attempt.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Shutdown flush budget.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        for key in self.cooldown_overrides.keys() {
            if SensorKind::from_str(key).is_err() {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("alerts.cooldown_overrides.{}", key),
                    message: "unknown sensor kind".to_string(),
                });
            }
        }

        if self.queue_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "alerts.queue_capacity".to_string(),
                message: "Capacity must be greater than 0".to_string(),
            });
        }

        if self.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "alerts.max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if self.backoff_multiplier < 1.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "alerts.backoff_multiplier".to_string(),
                message: "Multiplier must be at least 1.0".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigValidationError::InvalidValue {
                field: "alerts.backoff_jitter".to_string(),
                message: "Jitter must be between 0.0 and 1.0".to_string(),
            });
        }

        if self.attempt_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "alerts.attempt_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl EmailConfig {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.recipients.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "email.recipients".to_string(),
            ));
        }

        if let Some(bad) = self.recipients.iter().find(|r| !looks_like_address(r)) {
            return Err(ConfigValidationError::InvalidValue {
                field: "email.recipients".to_string(),
                message: format!("'{}' is not an email address", bad),
            });
        }

        if !looks_like_address(&self.from) {
            return Err(ConfigValidationError::InvalidValue {
                field: "email.from".to_string(),
                message: format!("'{}' is not an email address", self.from),
            });
        }

        if self.transport == TransportKind::Smtp {
            self.smtp.validate()?;
        }

        Ok(())
    }
}

impl SmtpConfig {
    /// Connection and command timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.host.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("email.smtp.host".to_string()));
        }

        if self.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "email.smtp.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigValidationError::InvalidValue {
                field: "email.smtp.username/password".to_string(),
                message: "Set both or neither".to_string(),
            });
        }

        if self.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "email.smtp.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn looks_like_address(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !value.contains(' '),
        None => false,
    }
}

impl StorageConfig {
    /// Directory persisted frames are written to.
    pub fn frames_dir(&self) -> PathBuf {
        self.captures_dir.join("frames")
    }

    /// Directory alert archives are written to.
    pub fn archives_dir(&self) -> PathBuf {
        self.captures_dir.join("alerts")
    }

    /// Maximum artifact age.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days.saturating_mul(24 * 3600))
    }

    /// Size quota in bytes.
    pub fn quota_bytes(&self) -> u64 {
        self.max_total_mb.saturating_mul(1024 * 1024)
    }

    /// Interval between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.sweep_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.max_total_mb == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.max_total_mb".to_string(),
                message: "Quota must be greater than 0".to_string(),
            });
        }

        if self.max_total_mb > u64::MAX / (1024 * 1024) {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.max_total_mb".to_string(),
                message: "Quota is out of range".to_string(),
            });
        }

        if self.max_age_days > u64::MAX / (24 * 3600) {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.max_age_days".to_string(),
                message: "Age is out of range".to_string(),
            });
        }

        // A root inside the other would be swept twice
        if self.captures_dir.starts_with(&self.logs_dir)
            || self.logs_dir.starts_with(&self.captures_dir)
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.captures_dir/logs_dir".to_string(),
                message: format!(
                    "'{}' and '{}' must not be the same or nested",
                    self.captures_dir.display(),
                    self.logs_dir.display()
                ),
            });
        }

        Ok(())
    }
}

impl WatchdogConfig {
    /// Sliding restart window.
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    /// First restart delay.
    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_base_ms)
    }

    /// Restart delay ceiling.
    pub fn restart_backoff_max(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_max_secs)
    }

    /// Interval between health samples.
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Stop budget for one monitor incarnation.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_restarts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "watchdog.max_restarts".to_string(),
                message: "Restart budget must be at least 1".to_string(),
            });
        }

        if self.restart_window_secs == 0 || self.health_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "watchdog.restart_window_secs/health_interval_secs".to_string(),
                message: "Intervals must be greater than 0".to_string(),
            });
        }

        if self.breach_samples == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "watchdog.breach_samples".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if self.max_memory_mb > u64::MAX / (1024 * 1024) {
            return Err(ConfigValidationError::InvalidValue {
                field: "watchdog.max_memory_mb".to_string(),
                message: "Ceiling is out of range".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
