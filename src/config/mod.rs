//! Configuration loading and validation.
//!
//! Library users build a [`DeviceConfig`] and [`ClientSettings`] directly.
//! The demo binary reads everything from one TOML file:
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [settings]
//! connect_timeout_secs = 30
//!
//! [device]
//! device_config_json = "iotcDeviceConfig.json"
//! device_cert_path = "device-cert.pem"
//! device_pkey_path = "device-pkey.pem"
//!
//! [demo]
//! interval_secs = 10
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    device::{DeviceConfig, Platform},
    logger::LoggerConfig,
    settings::ClientSettings,
};

pub mod device;
pub mod logger;
pub mod settings;

/// Timestamp prefix for the early print macros.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

/// Prints before the tracing subscriber is installed.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Configuration errors, including discovery and identity failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Certificate or key file unreadable or not PEM.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Discovery or identity resolution failed. The message is complete on
    /// its own.
    #[error("{0}")]
    Discovery(String),
}

/// Device section of the application config.
///
/// Either points at the platform's `iotcDeviceConfig.json` or lists the
/// identifiers inline. Certificate and key paths are always given here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub device_config_json: Option<PathBuf>,
    pub platform: Option<Platform>,
    pub env: Option<String>,
    pub cpid: Option<String>,
    pub duid: Option<String>,
    pub device_cert_path: PathBuf,
    pub device_pkey_path: PathBuf,
    pub server_ca_cert_path: Option<PathBuf>,
    pub discovery_url: Option<String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        DeviceSection {
            device_config_json: None,
            platform: None,
            env: None,
            cpid: None,
            duid: None,
            device_cert_path: PathBuf::from("device-cert.pem"),
            device_pkey_path: PathBuf::from("device-pkey.pem"),
            server_ca_cert_path: None,
            discovery_url: None,
        }
    }
}

impl DeviceSection {
    /// Resolves the section into a checked [`DeviceConfig`]. Explicit
    /// `server_ca_cert_path` and `discovery_url` win over the JSON file.
    pub fn to_device_config(&self) -> Result<DeviceConfig, ConfigError> {
        let mut config = match &self.device_config_json {
            Some(json) => DeviceConfig::from_iotc_device_config_json_file(
                json,
                &self.device_cert_path,
                &self.device_pkey_path,
            )?,
            None => {
                let missing = |name: &str| ConfigError::Config(format!("[device] {name} is required"));
                DeviceConfig::new(
                    self.platform.ok_or_else(|| missing("platform"))?,
                    self.env.clone().ok_or_else(|| missing("env"))?,
                    self.cpid.clone().ok_or_else(|| missing("cpid"))?,
                    self.duid.clone().ok_or_else(|| missing("duid"))?,
                    &self.device_cert_path,
                    &self.device_pkey_path,
                )?
            }
        };

        if let Some(ca) = &self.server_ca_cert_path {
            config = config.with_server_ca(ca);
        }
        if let Some(url) = &self.discovery_url {
            config = config.with_discovery_url(url);
        }
        Ok(config)
    }
}

/// Demo loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DemoConfig {
    /// Seconds between telemetry sends.
    #[validate(range(min = 1))]
    pub interval_secs: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig { interval_secs: 10 }
    }
}

/// Application configuration of the demo binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub settings: ClientSettings,

    pub device: DeviceSection,

    #[validate(nested)]
    pub demo: DemoConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if no file is found or it fails to load.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `IOTC_CONFIG` if set, else `/etc/iotc-lite/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var("IOTC_CONFIG") {
            let path = PathBuf::from(config_path);
            print_info!("Using config from IOTC_CONFIG: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new("/etc/iotc-lite/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found. Set IOTC_CONFIG.".to_string(),
        ))
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}
