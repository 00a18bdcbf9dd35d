//! Runtime configuration loaded from a JSON file.
//! Defaults point at the public Honeywell Home endpoints.

use crate::models::honeywell::Units;
use crate::utils::{round_half, round_whole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_AUTH_URL: &str = "https://api.honeywellhome.com/oauth2/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://api.honeywellhome.com/oauth2/token";
pub const DEFAULT_API_BASE_URL: &str = "https://api.honeywellhome.com";
pub const DEFAULT_REDIRECT_PORT: u16 = 8080;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Json { path: PathBuf, source: serde_path_to_error::Error<serde_json::Error> },
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Json { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Json { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// A temperature known in both units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSetting {
    pub fahrenheit: f64,
    pub celsius: f64,
}

impl TemperatureSetting {
    /// Build from whichever units are present, back-filling the other one.
    /// Fahrenheit rounds to whole degrees, Celsius to half degrees.
    pub fn from_units(fahrenheit: Option<f64>, celsius: Option<f64>) -> Option<Self> {
        match (fahrenheit, celsius) {
            (Some(fahrenheit), Some(celsius)) => Some(TemperatureSetting { fahrenheit, celsius }),
            (Some(fahrenheit), None) => Some(TemperatureSetting {
                fahrenheit,
                celsius: celsius_from_fahrenheit(fahrenheit),
            }),
            (None, Some(celsius)) => Some(TemperatureSetting {
                fahrenheit: fahrenheit_from_celsius(celsius),
                celsius,
            }),
            (None, None) => None,
        }
    }

    pub fn in_units(&self, units: &Units) -> Option<f64> {
        match units {
            Units::Fahrenheit => Some(self.fahrenheit),
            Units::Celsius => Some(self.celsius),
            Units::Other(_) => None,
        }
    }
}

pub fn fahrenheit_from_celsius(celsius: f64) -> f64 {
    round_whole(celsius * 9.0 / 5.0 + 32.0)
}

pub fn celsius_from_fahrenheit(fahrenheit: f64) -> f64 {
    round_half((fahrenheit - 32.0) * 5.0 / 9.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceThresholds {
    pub lowest: TemperatureSetting,
    pub preferred: TemperatureSetting,
    pub highest: TemperatureSetting,
}

/// Location id -> device id -> thresholds. Location ids are kept as strings
/// since JSON object keys are strings.
pub type LocationPrefs = BTreeMap<String, BTreeMap<String, DeviceThresholds>>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port of the local listener receiving the OAuth redirect.
    pub redirect_port: u16,
    pub client_id: String,
    pub client_secret: String,
    /// Where the token set lives. Relative paths are resolved against the
    /// config file's directory.
    pub credentials_fpath: PathBuf,
    pub auth_url: String,
    pub token_url: String,
    pub api_base_url: String,
    /// Global timeout for each vendor HTTP call.
    pub http_timeout: Duration,
    /// Give up on the interactive authorization after this long.
    pub auth_timeout: Option<Duration>,
    pub location_prefs: LocationPrefs,
}

// On-disk shape.

#[derive(Debug, Default, Serialize, Deserialize)]
struct UnitValues {
    #[serde(rename = "Fahrenheit", default, skip_serializing_if = "Option::is_none")]
    fahrenheit: Option<f64>,
    #[serde(rename = "Celsius", default, skip_serializing_if = "Option::is_none")]
    celsius: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawTemperatures {
    lowest: UnitValues,
    preferred: UnitValues,
    highest: UnitValues,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawDevicePrefs {
    temperatures: RawTemperatures,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawConfig {
    redirect_port: u16,
    client_id: String,
    client_secret: String,
    credentials_fpath: String,
    location_prefs: BTreeMap<String, BTreeMap<String, RawDevicePrefs>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_timeout_secs: Option<u64>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_json(&text, base_dir).map_err(|e| match e {
            ConfigError::Json { source, .. } => ConfigError::Json {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate config text. `base_dir` anchors a relative
    /// `credentials_fpath`.
    pub fn from_json(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let de = &mut serde_json::Deserializer::from_str(text);
        let raw: RawConfig = serde_path_to_error::deserialize(de).map_err(|source| ConfigError::Json {
            path: PathBuf::from("<config>"),
            source,
        })?;

        if raw.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("client_id is empty".into()));
        }
        if raw.client_secret.trim().is_empty() {
            return Err(ConfigError::Invalid("client_secret is empty".into()));
        }
        if raw.credentials_fpath.trim().is_empty() {
            return Err(ConfigError::Invalid("credentials_fpath is empty".into()));
        }

        let mut location_prefs = LocationPrefs::new();
        for (loc_id, devices) in raw.location_prefs {
            let mut parsed = BTreeMap::new();
            for (dev_id, prefs) in devices {
                let t = prefs.temperatures;
                let setting = |name: &str, v: UnitValues| {
                    TemperatureSetting::from_units(v.fahrenheit, v.celsius).ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "location {loc_id} device {dev_id}: {name} needs Fahrenheit or Celsius"
                        ))
                    })
                };
                let thresholds = DeviceThresholds {
                    lowest: setting("lowest", t.lowest)?,
                    preferred: setting("preferred", t.preferred)?,
                    highest: setting("highest", t.highest)?,
                };
                parsed.insert(dev_id, thresholds);
            }
            location_prefs.insert(loc_id, parsed);
        }

        let credentials_fpath = PathBuf::from(raw.credentials_fpath);
        let credentials_fpath = if credentials_fpath.is_relative() {
            base_dir.join(credentials_fpath)
        } else {
            credentials_fpath
        };

        Ok(Config {
            redirect_port: raw.redirect_port,
            client_id: raw.client_id,
            client_secret: raw.client_secret,
            credentials_fpath,
            auth_url: raw.auth_url.unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            token_url: raw.token_url.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            api_base_url: raw.api_base_url.unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            http_timeout: Duration::from_secs(raw.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)),
            auth_timeout: raw.auth_timeout_secs.map(Duration::from_secs),
            location_prefs,
        })
    }

    pub fn thresholds(&self, location_id: &str, device_id: &str) -> Option<&DeviceThresholds> {
        self.location_prefs.get(location_id)?.get(device_id)
    }
}

/// Write an empty config skeleton for the user to fill in. Refuses to clobber
/// an existing file.
pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    let template = RawConfig {
        redirect_port: DEFAULT_REDIRECT_PORT,
        client_id: String::new(),
        client_secret: String::new(),
        credentials_fpath: String::new(),
        location_prefs: BTreeMap::new(),
        auth_url: None,
        token_url: None,
        api_base_url: None,
        http_timeout_secs: None,
        auth_timeout_secs: None,
    };
    let text = serde_json::to_string_pretty(&template).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path).map_err(io_err)?;
    io::Write::write_all(&mut file, text.as_bytes()).map_err(io_err)?;
    Ok(())
}
