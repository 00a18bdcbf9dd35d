//! Setpoint decisions for one thermostat per polling pass.

use crate::config::DeviceThresholds;
use crate::models::honeywell::{ChangeableValues, Device, SetpointStatus, ThermostatMode, Units};
use crate::utils::{Clock, TIME_OF_DAY_FORMAT, is_at_least_minutes_in_future, round_up_to_quarter_hour};
use chrono::{Duration, NaiveDateTime};
use log::{debug, warn};
use std::fmt::{Display, Formatter};

/// Length of a hold and the minimum remaining hold worth keeping.
pub const HOLD_MINUTES: i64 = 15;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Band {
    InRange,
    BelowLowest,
    AboveHighest,
}

/// Which side of the thermostat to drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HoldMode {
    Heat,
    Cool,
}

impl HoldMode {
    fn thermostat_mode(self) -> ThermostatMode {
        match self {
            HoldMode::Heat => ThermostatMode::Heat,
            HoldMode::Cool => ThermostatMode::Cool,
        }
    }

    fn setpoint_mut(self, values: &mut ChangeableValues) -> &mut f64 {
        match self {
            HoldMode::Heat => &mut values.heat_setpoint,
            HoldMode::Cool => &mut values.cool_setpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerError {
    UnsupportedUnits(Units),
    MissingField(&'static str),
    /// `changeableValues` is present but not shaped as expected.
    InvalidValues(String),
}

impl Display for SchedulerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::UnsupportedUnits(u) => write!(f, "unsupported temperature units {}", u),
            SchedulerError::MissingField(name) => write!(f, "device does not report {}", name),
            SchedulerError::InvalidValues(msg) => write!(f, "unreadable changeableValues: {}", msg),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub band: Band,
    pub indoor: f64,
    pub units: Units,
    /// Values to push, if anything needs to change.
    pub update: Option<ChangeableValues>,
}

/// Place `indoor` relative to the configured comfort band. Bounds are
/// exclusive: sitting exactly on a bound is in range.
pub fn classify(indoor: f64, thresholds: &DeviceThresholds, units: &Units) -> Result<Band, SchedulerError> {
    let unsupported = || SchedulerError::UnsupportedUnits(units.clone());
    let lowest = thresholds.lowest.in_units(units).ok_or_else(unsupported)?;
    let highest = thresholds.highest.in_units(units).ok_or_else(unsupported)?;
    Ok(if indoor < lowest {
        Band::BelowLowest
    } else if indoor > highest {
        Band::AboveHighest
    } else {
        Band::InRange
    })
}

pub struct SetpointScheduler<'a> {
    clock: &'a dyn Clock,
}

impl<'a> SetpointScheduler<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        SetpointScheduler { clock }
    }

    pub fn decide(&self, device: &Device, thresholds: &DeviceThresholds) -> Result<Decision, SchedulerError> {
        let indoor = device
            .indoor_temperature
            .ok_or(SchedulerError::MissingField("indoorTemperature"))?;
        let units = device.units.clone().ok_or(SchedulerError::MissingField("units"))?;
        let current = match device.thermostat_values() {
            None => return Err(SchedulerError::MissingField("changeableValues")),
            Some(Err(e)) => return Err(SchedulerError::InvalidValues(e.to_string())),
            Some(Ok(v)) => v,
        };

        let band = classify(indoor, thresholds, &units)?;
        let update = match band {
            Band::InRange => None,
            Band::BelowLowest => update_values(&current, thresholds, &units, HoldMode::Heat, self.clock.now())?,
            Band::AboveHighest => update_values(&current, thresholds, &units, HoldMode::Cool, self.clock.now())?,
        };
        Ok(Decision {
            band,
            indoor,
            units,
            update,
        })
    }
}

/// Compute the values to push to drive the thermostat to the preferred
/// temperature in `mode`. `None` when the device already has exactly these
/// settings. The hold window is only touched when the current hold is not
/// `HoldUntil` or ends within [`HOLD_MINUTES`].
pub fn update_values(
    current: &ChangeableValues,
    thresholds: &DeviceThresholds,
    units: &Units,
    mode: HoldMode,
    now: NaiveDateTime,
) -> Result<Option<ChangeableValues>, SchedulerError> {
    let preferred = thresholds
        .preferred
        .in_units(units)
        .ok_or_else(|| SchedulerError::UnsupportedUnits(units.clone()))?;

    let mut values = current.clone();
    let mut changed = false;

    let target_mode = mode.thermostat_mode();
    if values.mode != target_mode {
        values.mode = target_mode.clone();
        changed = true;
    }
    if let Some(hcm) = values.heat_cool_mode.as_mut()
        && *hcm != target_mode
    {
        *hcm = target_mode;
        changed = true;
    }

    let setpoint = mode.setpoint_mut(&mut values);
    if *setpoint != preferred {
        *setpoint = preferred;
        changed = true;
    }

    if !changed {
        return Ok(None);
    }

    if !hold_still_running(&values, now) {
        values.thermostat_setpoint_status = SetpointStatus::HoldUntil;
        let until = round_up_to_quarter_hour(now + Duration::minutes(HOLD_MINUTES));
        values.next_period_time = Some(until.format(TIME_OF_DAY_FORMAT).to_string());
    } else {
        debug!(
            "Keeping existing hold until {}",
            values.next_period_time.as_deref().unwrap_or("-")
        );
    }
    Ok(Some(values))
}

fn hold_still_running(values: &ChangeableValues, now: NaiveDateTime) -> bool {
    if values.thermostat_setpoint_status != SetpointStatus::HoldUntil {
        return false;
    }
    let Some(next) = values.next_period_time.as_deref() else {
        return false;
    };
    match is_at_least_minutes_in_future(next, HOLD_MINUTES, now) {
        Ok(running) => running,
        Err(e) => {
            warn!("Unreadable nextPeriodTime {:?} ({}); starting a new hold", next, e);
            false
        }
    }
}
