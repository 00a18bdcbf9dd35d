//! Models for the subset of the Honeywell Home (Resideo) v2 API used here.
//!
//! Notes
//! - Only the fields the controller reads are typed; everything else inside
//!   `changeableValues` is kept in `extra` so a push echoes it back untouched.
//! - Enums carry an `Other` variant so unknown vendor strings do not fail the
//!   whole locations response.
//! - Per-device thermostat fields are decoded leniently. A malformed device
//!   is reported when it is evaluated, not while decoding the response.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl Display for LocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================
// Enums
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Units {
    Fahrenheit,
    Celsius,
    #[serde(untagged)]
    Other(String),
}

impl Display for Units {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Units::Fahrenheit => f.write_str("Fahrenheit"),
            Units::Celsius => f.write_str("Celsius"),
            Units::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThermostatMode {
    Heat,
    Cool,
    Off,
    Auto,
    #[serde(untagged)]
    Other(String),
}

/// `thermostatSetpointStatus` as reported by the vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetpointStatus {
    /// Manual setpoint held until `nextPeriodTime`, then the schedule resumes.
    HoldUntil,
    PermanentHold,
    #[default]
    NoHold,
    VacationHold,
    #[serde(untagged)]
    Other(String),
}

// =====================
// Locations and devices
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "locationID")]
    pub location_id: LocationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A device attached to a location. Non-thermostat devices (leak detectors,
/// cameras) share the list, so the thermostat fields are optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(rename = "deviceID")]
    pub device_id: DeviceId,
    #[serde(default)]
    pub user_defined_device_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub indoor_temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub units: Option<Units>,
    /// Raw `changeableValues`; see [`Device::thermostat_values`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeable_values: Option<Value>,
}

impl Device {
    /// Typed view of `changeableValues`. `None` when the device has none.
    pub fn thermostat_values(&self) -> Option<Result<ChangeableValues, serde_json::Error>> {
        self.changeable_values
            .as_ref()
            .filter(|v| !v.is_null())
            .map(|v| ChangeableValues::deserialize(v))
    }
}

/// A value of the wrong shape reads as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Value::deserialize(deserializer)?;
    if raw.is_null() {
        return Ok(None);
    }
    Ok(T::deserialize(raw).ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeableValues {
    pub mode: ThermostatMode,
    pub heat_setpoint: f64,
    pub cool_setpoint: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_cool_mode: Option<ThermostatMode>,
    #[serde(default)]
    pub thermostat_setpoint_status: SetpointStatus,
    /// Local time of day (`HH:MM:SS`) at which a `HoldUntil` ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_period_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
