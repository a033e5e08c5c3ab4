//! Bench configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/bench.toml` by default)
//! 2. Environment variables prefixed with `HIL_BENCH_`, nested keys separated by
//!    a double underscore
//!
//! # Example
//! ```no_run
//! use hil_bench::config::BenchConfig;
//!
//! let config = BenchConfig::load()?;
//! println!("Station: {}", config.application.name);
//! # Ok::<(), hil_bench::config::ConfigError>(())
//! ```

use crate::interface::paced_rest::{Credential, CredentialSource};
use crate::interface::serial::{DataBits, FlowControl, Parity, SerialConfig, StopBits};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HIL_BENCH_";

/// Configuration loading or validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or did not match the schema.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values were read but are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bench configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial port defaults
    #[serde(default)]
    pub serial: SerialSettings,
    /// Telemetry logger settings
    #[serde(default)]
    pub logger: LoggerSettings,
    /// REST platform endpoints
    #[serde(default)]
    pub rest: Vec<RestEndpointConfig>,
    /// Per-service credentials
    #[serde(default)]
    pub credentials: HashMap<String, Credential>,
    /// SCPI instrument resources
    #[serde(default)]
    pub scpi: ScpiSettings,
    /// Serial-attached devices
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Station name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Serial defaults applied to every port unless a device overrides them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Character size
    #[serde(default)]
    pub data_bits: DataBits,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Flow control
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Command terminator
    #[serde(default = "default_eol")]
    pub eol: String,
    /// Idle bound on reads
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Bound on opening a port
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Telemetry logger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerSettings {
    /// Folder for `<name>_serial_data.csv` files
    #[serde(default = "default_log_folder")]
    pub log_folder: PathBuf,
    /// Prefix records with a UTC timestamp
    #[serde(default = "default_true")]
    pub timestamps: bool,
    /// Start capturing on attach
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Bound on waiting for the capture task to stop
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

/// REST platform endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestEndpointConfig {
    /// Unique endpoint name
    pub name: String,
    /// Base API URL
    pub base_url: String,
    /// Minimum spacing between requests, for throttled APIs
    #[serde(default, with = "humantime_serde")]
    pub min_interval: Option<Duration>,
}

/// SCPI bus configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScpiSettings {
    /// Raw socket resources, e.g. `TCPIP::192.168.1.20::5025::SOCKET`
    #[serde(default)]
    pub resources: Vec<String>,
    /// Connect and I/O timeout
    #[serde(default = "default_scpi_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Serial-attached device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device label
    pub name: String,
    /// Serial port
    pub port: String,
    /// Baud rate override
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Whether telemetry is captured for this device
    #[serde(default = "default_true")]
    pub log: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_eol() -> String {
    "\r".to_string()
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_folder() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_scpi_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
            eol: default_eol(),
            read_timeout: default_read_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            log_folder: default_log_folder(),
            timestamps: true,
            auto_start: true,
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl SerialSettings {
    /// Serial configuration for `port` with these defaults.
    pub fn serial_config(&self, port: impl Into<String>) -> SerialConfig {
        SerialConfig::new(port)
            .with_baud_rate(self.baud_rate)
            .with_framing(self.data_bits, self.parity, self.stop_bits)
            .with_flow_control(self.flow_control)
            .with_eol(self.eol.clone())
            .with_read_timeout(self.read_timeout)
            .with_connect_timeout(self.connect_timeout)
    }
}

impl BenchConfig {
    /// Load configuration from `config/bench.toml` and environment variables
    ///
    /// Example override: `HIL_BENCH_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref()).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Provider stack used by [`BenchConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be non-zero".into()));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.port.is_empty() {
                return Err(ConfigError::Invalid(format!("Device '{}' has no port", device.name)));
            }
            if !names.insert(&device.name) {
                return Err(ConfigError::Invalid(format!("Duplicate device name: {}", device.name)));
            }
        }

        let mut rest_names = HashSet::new();
        for endpoint in &self.rest {
            if endpoint.base_url.is_empty() {
                return Err(ConfigError::Invalid(format!("REST endpoint '{}' has no base_url", endpoint.name)));
            }
            if !rest_names.insert(&endpoint.name) {
                return Err(ConfigError::Invalid(format!("Duplicate REST endpoint: {}", endpoint.name)));
            }
        }

        Ok(())
    }

    /// Serial configuration for a configured device.
    pub fn device_serial_config(&self, name: &str) -> Option<SerialConfig> {
        self.devices.iter().find(|d| d.name == name).map(|device| {
            let config = self.serial.serial_config(device.port.clone());
            match device.baud_rate {
                Some(baud) => config.with_baud_rate(baud),
                None => config,
            }
        })
    }

    /// REST endpoint by name.
    pub fn rest_endpoint(&self, name: &str) -> Option<&RestEndpointConfig> {
        self.rest.iter().find(|r| r.name == name)
    }
}

impl CredentialSource for BenchConfig {
    fn credential(&self, service: &str) -> Option<Credential> {
        self.credentials.get(service).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "NSTA bench 2"
log_level = "debug"

[serial]
baud_rate = 9600
read_timeout = "250ms"

[logger]
log_folder = "logs"
stop_timeout = "2s"

[[rest]]
name = "platform"
base_url = "https://stickntrack.example.com/rest/api/v2"

[credentials.Sigfox]
type = "basic"
user = "station"
password = "secret"

[[devices]]
name = "HATI"
port = "/dev/ttyUSB0"
baud_rate = 115200
"#;

    fn write_sample(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample_config() {
        let file = write_sample(SAMPLE);
        let config = BenchConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "NSTA bench 2");
        assert_eq!(config.serial.read_timeout, Duration::from_millis(250));
        assert_eq!(config.logger.stop_timeout, Duration::from_secs(2));
        assert!(config.logger.timestamps);

        let serial = config.device_serial_config("HATI").unwrap();
        assert_eq!(serial.baud_rate, 115_200);
        assert_eq!(serial.read_timeout, Duration::from_millis(250));

        assert!(matches!(
            config.credential("Sigfox"),
            Some(Credential::Basic { ref user, .. }) if user == "station"
        ));
        assert!(config.credential("Unknown").is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_environment_overrides_file() {
        let file = write_sample(SAMPLE);
        std::env::set_var("HIL_BENCH_APPLICATION__LOG_LEVEL", "warn");
        let result = BenchConfig::load_from(file.path());
        std::env::remove_var("HIL_BENCH_APPLICATION__LOG_LEVEL");
        assert_eq!(result.unwrap().application.log_level, "warn");
    }

    #[test]
    fn test_invalid_log_level() {
        let file = write_sample(&SAMPLE.replace("\"debug\"", "\"loud\""));
        assert!(matches!(BenchConfig::load_from(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_device_names() {
        let duplicated = format!("{}\n[[devices]]\nname = \"HATI\"\nport = \"/dev/ttyUSB1\"\n", SAMPLE);
        let file = write_sample(&duplicated);
        assert!(BenchConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_missing_application_section_fails_to_load() {
        let file = write_sample("[serial]\nbaud_rate = 9600\n");
        assert!(matches!(BenchConfig::load_from(file.path()), Err(ConfigError::Load(_))));
    }
}
