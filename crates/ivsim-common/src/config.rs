//! ---
//! ivsim_section: "01-core-functionality"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Shared primitives and utilities for the simulator runtime."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;

/// Device template identifier announced during provisioning when none is configured.
pub const DEFAULT_MODEL_ID: &str = "dtmi:azureiot:iv2go_device;1";

/// Global device provisioning endpoint.
pub const DEFAULT_PROVISIONING_HOST: &str = "global.azure-devices-provisioning.net";

/// Longest accepted telemetry interval.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(3600);

/// Longest accepted idle or charging window.
pub const MAX_PHASE_DURATION: Duration = Duration::from_secs(7 * 86_400);

/// Longest treatment the bag size and flow rate may describe, in seconds.
pub const MAX_TREATMENT_SECS: f64 = 30.0 * 86_400.0;

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_owned()
}

fn default_provisioning_host() -> String {
    DEFAULT_PROVISIONING_HOST.to_owned()
}

fn default_provisioning_api_version() -> String {
    "2021-06-01".to_owned()
}

fn default_max_poll_attempts() -> u32 {
    10
}

fn default_sas_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_bag_size_ml() -> f64 {
    840.0
}

fn default_flowrate() -> f64 {
    70.0
}

fn default_idle_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_charging_duration() -> Duration {
    Duration::from_secs(120)
}

fn default_battery_drain() -> f64 {
    0.02
}

fn default_battery_charge() -> f64 {
    0.25
}

fn default_transport_kind() -> TransportKind {
    TransportKind::Mqtt
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_tls() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_file_logging() -> bool {
    true
}

/// Validation failures raised before any connection attempt is made.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A required setting was not supplied by file, environment or CLI.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    /// A setting was supplied but is outside its valid domain.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending setting.
        field: &'static str,
        /// Human-readable explanation.
        reason: String,
    },
}

/// Primary configuration object for the simulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "IVSIM_CONFIG";

    /// Load configuration together with the effective source path.
    ///
    /// `IVSIM_CONFIG` takes precedence and must point at a readable file. Otherwise the
    /// first existing candidate is used; when none exists the defaults are returned so
    /// that a device can be driven purely from CLI flags and environment variables.
    /// Validation is deferred to [`AppConfig::validate`] so callers can apply overrides first.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate(self.transport.kind)?;
        self.simulation.validate()?;
        self.transport.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity and credential material for the simulated device.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub id_scope: Option<String>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Per-device symmetric key (base64).
    #[serde(default)]
    pub device_key: Option<String>,
    /// Enrollment group key (base64) from which a per-device key is derived.
    #[serde(default)]
    pub group_key: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            id_scope: None,
            model_id: default_model_id(),
            device_key: None,
            group_key: None,
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("device_id", &self.device_id)
            .field("id_scope", &self.id_scope)
            .field("model_id", &self.model_id)
            .field("device_key", &self.device_key.as_ref().map(|_| "<redacted>"))
            .field("group_key", &self.group_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DeviceConfig {
    pub fn validate(&self, transport: TransportKind) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Missing("device.device_id"));
        }
        if transport == TransportKind::Loopback {
            return Ok(());
        }
        if self.id_scope.as_deref().map_or(true, |scope| scope.trim().is_empty()) {
            return Err(ConfigError::Missing("device.id_scope"));
        }
        if self.model_id.trim().is_empty() {
            return Err(ConfigError::Missing("device.model_id"));
        }
        if self.device_key.is_none() && self.group_key.is_none() {
            return Err(ConfigError::Missing("device.device_key"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default = "default_provisioning_host")]
    pub global_endpoint: String,
    #[serde(default = "default_provisioning_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_sas_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sas_ttl: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            global_endpoint: default_provisioning_host(),
            api_version: default_provisioning_api_version(),
            max_poll_attempts: default_max_poll_attempts(),
            sas_ttl: default_sas_ttl(),
        }
    }
}

/// Physical model and lifecycle timing parameters.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_bag_size_ml")]
    pub bag_size_ml: f64,
    #[serde(default = "default_flowrate")]
    pub flowrate_ml_per_hour: f64,
    #[serde(default = "default_idle_duration")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub idle_duration: Duration,
    #[serde(default = "default_charging_duration")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub charging_duration: Duration,
    #[serde(default = "default_battery_drain")]
    pub battery_drain_per_tick: f64,
    #[serde(default = "default_battery_charge")]
    pub battery_charge_per_tick: f64,
    /// Seed for the initial battery level; entropy is used when unset.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Re-arm the phase schedule on every successful connect instead of once per run.
    #[serde(default)]
    pub rearm_lifecycle_on_reconnect: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            bag_size_ml: default_bag_size_ml(),
            flowrate_ml_per_hour: default_flowrate(),
            idle_duration: default_idle_duration(),
            charging_duration: default_charging_duration(),
            battery_drain_per_tick: default_battery_drain(),
            battery_charge_per_tick: default_battery_charge(),
            random_seed: None,
            rearm_lifecycle_on_reconnect: false,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() || self.tick_interval > MAX_TICK_INTERVAL {
            return Err(ConfigError::Invalid {
                field: "simulation.tick_interval",
                reason: format!(
                    "must be between 1 and {} seconds, got {}",
                    MAX_TICK_INTERVAL.as_secs(),
                    self.tick_interval.as_secs()
                ),
            });
        }
        for (field, duration) in [
            ("simulation.idle_duration", self.idle_duration),
            ("simulation.charging_duration", self.charging_duration),
        ] {
            if duration > MAX_PHASE_DURATION {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!(
                        "must not exceed {} seconds, got {}",
                        MAX_PHASE_DURATION.as_secs(),
                        duration.as_secs()
                    ),
                });
            }
        }
        if !(self.flowrate_ml_per_hour.is_finite() && self.flowrate_ml_per_hour > 0.0) {
            return Err(ConfigError::Invalid {
                field: "simulation.flowrate_ml_per_hour",
                reason: format!("must be positive, got {}", self.flowrate_ml_per_hour),
            });
        }
        if !(self.bag_size_ml.is_finite() && self.bag_size_ml >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "simulation.bag_size_ml",
                reason: format!("must not be negative, got {}", self.bag_size_ml),
            });
        }
        let treatment_secs = self.bag_size_ml / self.flowrate_ml_per_hour * 3600.0;
        if treatment_secs > MAX_TREATMENT_SECS {
            return Err(ConfigError::Invalid {
                field: "simulation.flowrate_ml_per_hour",
                reason: format!(
                    "{} mL at {} mL/h lasts {:.0} seconds, more than {:.0}",
                    self.bag_size_ml, self.flowrate_ml_per_hour, treatment_secs, MAX_TREATMENT_SECS
                ),
            });
        }
        Ok(())
    }
}

/// Backend the simulated device talks to.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Provision through DPS and talk to the assigned IoT hub over MQTT, twin included.
    #[default]
    Mqtt,
    /// Provision through DPS and use the hub's HTTPS device API (no twin).
    Https,
    /// In-process loopback backend; nothing leaves the machine.
    Loopback,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mqtt" => Ok(TransportKind::Mqtt),
            "https" => Ok(TransportKind::Https),
            "loopback" => Ok(TransportKind::Loopback),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,
    /// Interval between cloud-to-device polls on the HTTPS transport.
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Broker port on the assigned hub.
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    /// Plain TCP is only meant for local brokers.
    #[serde(default = "default_tls")]
    pub tls: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            poll_interval: default_poll_interval(),
            request_timeout: default_request_timeout(),
            mqtt_port: default_mqtt_port(),
            keep_alive: default_keep_alive(),
            tls: default_tls(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == TransportKind::Https && self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "transport.poll_interval",
                reason: "must be at least one second".to_owned(),
            });
        }
        if self.kind == TransportKind::Mqtt && self.keep_alive < Duration::from_secs(5) {
            return Err(ConfigError::Invalid {
                field: "transport.keep_alive",
                reason: "must be at least five seconds".to_owned(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "transport.request_timeout",
                reason: "must be at least one second".to_owned(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_file_logging")]
    pub file_enabled: bool,
    /// Only warnings and errors reach stdout.
    #[serde(default)]
    pub quiet: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: default_file_logging(),
            quiet: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::str::FromStr;

    const HUB_CONFIG: &str = r#"
        [device]
        device_id = "iv-pump-01"
        id_scope = "0ne00000000"
        group_key = "c2VjcmV0"

        [simulation]
        tick_interval = 5
        bag_size_ml = 500.0
        flowrate_ml_per_hour = 70.0
        rearm_lifecycle_on_reconnect = true

        [logging]
        format = "structured-json"
        quiet = true
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = AppConfig::from_str(HUB_CONFIG).expect("valid config");
        assert_eq!(config.device.device_id, "iv-pump-01");
        assert_eq!(config.device.model_id, DEFAULT_MODEL_ID);
        assert_eq!(config.simulation.tick_interval, Duration::from_secs(5));
        assert_eq!(config.simulation.idle_duration, Duration::from_secs(30));
        assert_eq!(config.simulation.charging_duration, Duration::from_secs(120));
        assert!(config.simulation.rearm_lifecycle_on_reconnect);
        assert_eq!(config.transport.kind, TransportKind::Mqtt);
        assert_eq!(config.transport.mqtt_port, 8883);
        assert!(config.transport.tls);
        assert_eq!(config.provisioning.global_endpoint, DEFAULT_PROVISIONING_HOST);
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
        assert!(config.logging.quiet);
    }

    #[test]
    fn cloud_transports_require_scope_and_key() {
        let mut config = AppConfig::default();
        config.device.device_id = "iv-pump-01".into();
        assert_eq!(config.validate(), Err(ConfigError::Missing("device.id_scope")));

        config.device.id_scope = Some("0ne00000000".into());
        assert_eq!(config.validate(), Err(ConfigError::Missing("device.device_key")));

        config.device.device_key = Some("a2V5".into());
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn loopback_transport_only_requires_identity() {
        let mut config = AppConfig::default();
        config.transport.kind = TransportKind::Loopback;
        assert_eq!(config.validate(), Err(ConfigError::Missing("device.device_id")));
        config.device.device_id = "bench-device".into();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_non_positive_flowrate_and_zero_tick() {
        let mut config = SimulationConfig::default();
        config.flowrate_ml_per_hour = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "simulation.flowrate_ml_per_hour", .. })
        ));

        let mut config = SimulationConfig::default();
        config.tick_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "simulation.tick_interval", .. })
        ));
    }

    #[test]
    fn rejects_settings_that_cannot_be_scheduled() {
        let mut config = SimulationConfig::default();
        config.tick_interval = Duration::from_secs(u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "simulation.tick_interval", .. })
        ));

        let mut config = SimulationConfig::default();
        config.flowrate_ml_per_hour = 1e-20;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "simulation.flowrate_ml_per_hour", .. })
        ));

        let mut config = SimulationConfig::default();
        config.charging_duration = Duration::from_secs(u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "simulation.charging_duration", .. })
        ));

        let mut config = SimulationConfig::default();
        config.tick_interval = MAX_TICK_INTERVAL;
        config.flowrate_ml_per_hour = 1.2;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn transport_kind_parses_from_text() {
        assert_eq!("MQTT".parse::<TransportKind>(), Ok(TransportKind::Mqtt));
        assert_eq!("https".parse::<TransportKind>(), Ok(TransportKind::Https));
        assert!("hub".parse::<TransportKind>().is_err());

        let mut config = TransportConfig::default();
        config.keep_alive = Duration::from_secs(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "transport.keep_alive", .. })
        ));
    }

    #[test]
    fn load_falls_back_to_defaults_without_files() {
        let loaded = AppConfig::load_with_source(&["does/not/exist.toml"]).expect("defaults");
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config.simulation.bag_size_ml, 840.0);
    }

    #[test]
    fn load_reads_first_existing_candidate() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "{}", HUB_CONFIG)?;
        file.flush()?;
        let candidates = [PathBuf::from("missing.toml"), file.path().to_path_buf()];
        let loaded = AppConfig::load_with_source(&candidates)?;
        assert_eq!(loaded.source.as_deref(), Some(file.path()));
        assert_eq!(loaded.config.simulation.bag_size_ml, 500.0);
        Ok(())
    }

    #[test]
    fn debug_output_redacts_keys() {
        let device = DeviceConfig {
            device_id: "iv-pump-01".into(),
            device_key: Some("super-secret".into()),
            ..DeviceConfig::default()
        };
        let rendered = format!("{:?}", device);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("super-secret"));
    }
}
