//! One polling pass over every configured location and device.
//!
//! Each device is its own error boundary: a failed push is recorded and the
//! pass moves on. Only a failed token refresh (or a failure to store a
//! refreshed token) stops the pass, since every later call would need the
//! same credentials.

use crate::config::Config;
use crate::models::honeywell::{ChangeableValues, Device, DeviceId, Location, LocationId};
use crate::services::scheduler::{Band, SetpointScheduler};
use crate::services::session::{AuthenticatedSession, RetryError};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::BTreeMap;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FETCH_REFRESH_FAILED: i32 = 1;
pub const EXIT_FETCH_FAILED: i32 = 2;
pub const EXIT_PUSH_REFRESH_FAILED: i32 = 3;
pub const EXIT_PUSH_FAILED: i32 = 4;
pub const EXIT_LOCAL_STATE: i32 = 5;

/// How the pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    FetchRefreshFailed,
    FetchFailed,
    PushRefreshFailed,
    /// Refreshed tokens could not be written to the credential store.
    PersistFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    InRange,
    /// Out of range, but the device already carries the wanted settings.
    Unchanged,
    Updated(Value),
    /// The push failed even after a token refresh, or failed in a way a
    /// refresh cannot fix.
    Failed(String),
    /// The device could not be evaluated (not a thermostat, unknown units).
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub location_id: String,
    pub device_id: String,
    pub outcome: DeviceOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub status: RunStatus,
    pub devices: Vec<DeviceReport>,
    pub locations_found: BTreeMap<String, bool>,
    /// (location id, device id) -> seen in the API response
    pub devices_found: BTreeMap<(String, String), bool>,
}

impl RunReport {
    fn new(config: &Config) -> Self {
        let mut locations_found = BTreeMap::new();
        let mut devices_found = BTreeMap::new();
        for (loc_id, devices) in &config.location_prefs {
            locations_found.insert(loc_id.clone(), false);
            for dev_id in devices.keys() {
                devices_found.insert((loc_id.clone(), dev_id.clone()), false);
            }
        }
        RunReport {
            status: RunStatus::Completed,
            devices: Vec::new(),
            locations_found,
            devices_found,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::FetchRefreshFailed => EXIT_FETCH_REFRESH_FAILED,
            RunStatus::FetchFailed => EXIT_FETCH_FAILED,
            RunStatus::PushRefreshFailed => EXIT_PUSH_REFRESH_FAILED,
            RunStatus::PersistFailed => EXIT_LOCAL_STATE,
            RunStatus::Completed => {
                if self.devices.iter().any(|d| matches!(d.outcome, DeviceOutcome::Failed(_))) {
                    EXIT_PUSH_FAILED
                } else {
                    EXIT_OK
                }
            }
        }
    }

    /// Found entries are logged as they are seen; this covers the rest.
    fn log_missing(&self) {
        for (loc_id, _) in self.locations_found.iter().filter(|(_, found)| !**found) {
            warn!("Location {} NOT found.", loc_id);
        }
        for ((loc_id, dev_id), _) in self.devices_found.iter().filter(|(_, found)| !**found) {
            warn!("Device {} NOT found in location {}.", dev_id, loc_id);
        }
    }
}

pub struct Controller<'a> {
    config: &'a Config,
    session: &'a AuthenticatedSession<'a>,
    scheduler: SetpointScheduler<'a>,
}

impl<'a> Controller<'a> {
    pub fn new(config: &'a Config, session: &'a AuthenticatedSession<'a>, scheduler: SetpointScheduler<'a>) -> Self {
        Controller {
            config,
            session,
            scheduler,
        }
    }

    pub fn run(&self) -> RunReport {
        let mut report = RunReport::new(self.config);

        let locations = match self.session.fetch_locations() {
            Ok(l) => l,
            Err(e) => {
                report.status = match e {
                    RetryError::NotRetried(_) => {
                        error!("Failed to get locations and devices: {}", e);
                        RunStatus::FetchFailed
                    }
                    RetryError::RefreshFailed { .. } => {
                        error!("Failed to refresh access token and get locations and devices: {}", e);
                        RunStatus::FetchRefreshFailed
                    }
                    RetryError::RetryFailed { .. } => {
                        error!("Failed to get locations and devices: {}", e);
                        RunStatus::FetchFailed
                    }
                    RetryError::Persist { .. } => {
                        error!("Failed to store refreshed credentials: {}", e);
                        RunStatus::PersistFailed
                    }
                };
                return report;
            }
        };
        debug!("Fetched {} location(s)", locations.len());

        if let Err(status) = self.process_locations(&locations, &mut report) {
            report.status = status;
        }
        report.log_missing();
        report
    }

    fn process_locations(&self, locations: &[Location], report: &mut RunReport) -> Result<(), RunStatus> {
        for location in locations {
            let loc_id = location.location_id.to_string();
            let Some(prefs) = self.config.location_prefs.get(&loc_id) else {
                continue;
            };
            report.locations_found.insert(loc_id.clone(), true);
            info!("Location {} found.", loc_id);

            for device in &location.devices {
                if !prefs.contains_key(&device.device_id.0) {
                    continue;
                }
                report
                    .devices_found
                    .insert((loc_id.clone(), device.device_id.0.clone()), true);
                info!("Device {} found.", device.device_id);

                let outcome = self.process_device(location.location_id, device)?;
                report.devices.push(DeviceReport {
                    location_id: loc_id.clone(),
                    device_id: device.device_id.0.clone(),
                    outcome,
                });
            }
        }
        Ok(())
    }

    fn process_device(&self, location_id: LocationId, device: &Device) -> Result<DeviceOutcome, RunStatus> {
        let loc_key = location_id.to_string();
        let Some(thresholds) = self.config.thresholds(&loc_key, &device.device_id.0) else {
            return Ok(DeviceOutcome::Skipped("not configured".into()));
        };

        let decision = match self.scheduler.decide(device, thresholds) {
            Ok(d) => d,
            Err(e) => {
                error!("Device {}: {}", device.device_id, e);
                return Ok(DeviceOutcome::Skipped(e.to_string()));
            }
        };

        match decision.band {
            Band::InRange => {
                info!(
                    "Indoor temperature ({} {}) is within range, no update needed.",
                    decision.indoor, decision.units
                );
                return Ok(DeviceOutcome::InRange);
            }
            Band::BelowLowest => info!(
                "Indoor temperature ({} {}) is lower than lowest temperature ({} {}), updating values...",
                decision.indoor,
                decision.units,
                thresholds.lowest.in_units(&decision.units).unwrap_or_default(),
                decision.units
            ),
            Band::AboveHighest => info!(
                "Indoor temperature ({} {}) is higher than highest temperature ({} {}), updating values...",
                decision.indoor,
                decision.units,
                thresholds.highest.in_units(&decision.units).unwrap_or_default(),
                decision.units
            ),
        }

        let Some(values) = decision.update else {
            info!("Device {} already has the wanted settings.", device.device_id);
            return Ok(DeviceOutcome::Unchanged);
        };
        debug!("Pushing settings to {}/{}: {:?}", location_id, device.device_id, values);

        self.push(location_id, &device.device_id, &values)
    }

    fn push(
        &self,
        location_id: LocationId,
        device_id: &DeviceId,
        values: &ChangeableValues,
    ) -> Result<DeviceOutcome, RunStatus> {
        match self.session.push_device_settings(location_id, device_id, values) {
            Ok(response) => {
                info!("Success. Device settings updated for {}.", device_id);
                debug!("response: {}", response);
                Ok(DeviceOutcome::Updated(response))
            }
            Err(e @ (RetryError::RetryFailed { .. } | RetryError::NotRetried(_))) => {
                warn!("Failed to update device settings for {}: {}", device_id, e);
                Ok(DeviceOutcome::Failed(e.to_string()))
            }
            Err(e @ RetryError::RefreshFailed { .. }) => {
                error!("Failed to refresh access token and update device settings: {}", e);
                Err(RunStatus::PushRefreshFailed)
            }
            Err(e @ RetryError::Persist { .. }) => {
                error!("Failed to store refreshed credentials: {}", e);
                Err(RunStatus::PersistFailed)
            }
        }
    }
}
