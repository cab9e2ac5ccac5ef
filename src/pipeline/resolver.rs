// Configuration resolver
//
// Turns the accumulated (possibly partial) requests plus the attached modules'
// requirements into a concrete device + stream profile selection:
// 1. Pick candidate devices (explicit serial, devices supporting a request,
//    or every device when nothing was requested)
// 2. Per candidate, bind every request to a native profile (don't-care fields
//    take the device default)
// 3. Fold in module requirements, adding streams but never replacing an
//    application-requested one
// 4. The first candidate that works wins
//
// Resolution is a pure function of its inputs and touches no device.

use colored::*;
use tracing::{info, warn};

use super::accumulator::ConfigurationAccumulator;
use crate::error::{PipelineError, Result};
use crate::types::{preferred_profile, DeviceInfo, ModuleRequirement, StreamProfile, StreamRequest};

/// Concrete device + stream selection produced by a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConfiguration {
    device: DeviceInfo,
    profiles: Vec<StreamProfile>,
}

impl ActiveConfiguration {
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Selected profiles ordered by stream key, pairwise distinct by key
    pub fn profiles(&self) -> &[StreamProfile] {
        &self.profiles
    }

    /// Slowest selected frame rate, the lowest common frame interval of the set
    pub fn slowest_fps(&self) -> u32 {
        self.profiles.iter().map(|p| p.fps).min().unwrap_or(0)
    }
}

/// Resolve requests and module requirements against the available devices
pub fn resolve(
    accumulator: &ConfigurationAccumulator,
    requirements: &[ModuleRequirement],
    devices: &[DeviceInfo],
) -> Result<ActiveConfiguration> {
    let requests: Vec<StreamRequest> = accumulator.requests().copied().collect();
    let candidates = candidate_devices(accumulator, &requests, devices)?;

    if candidates.is_empty() {
        let reason = if devices.is_empty() {
            "no devices connected".to_string()
        } else {
            format!(
                "none of {} connected devices supports the requested streams",
                devices.len()
            )
        };
        return Err(PipelineError::ConfigurationUnsatisfiable { reason });
    }

    let mut failures = Vec::new();
    for device in candidates {
        match resolve_for_device(device, &requests, requirements) {
            Ok(profiles) => {
                info!(
                    "{}: Selected device '{}' ({}) with {} streams",
                    "RESOLVER".on_blue().cyan(),
                    device.serial,
                    device.name,
                    profiles.len()
                );
                return Ok(ActiveConfiguration {
                    device: device.clone(),
                    profiles,
                });
            }
            Err(reason) => {
                crate::pipeline_debug!("Device '{}' rejected: {}", device.serial, reason);
                failures.push(format!("device '{}': {}", device.serial, reason));
            }
        }
    }

    warn!(
        "{}: No device satisfies the configuration ({} candidates)",
        "RESOLVER".on_blue().cyan(),
        failures.len()
    );
    Err(PipelineError::ConfigurationUnsatisfiable {
        reason: failures.join("; "),
    })
}

fn candidate_devices<'a>(
    accumulator: &ConfigurationAccumulator,
    requests: &[StreamRequest],
    devices: &'a [DeviceInfo],
) -> Result<Vec<&'a DeviceInfo>> {
    if let Some(serial) = accumulator.device_serial() {
        let selected: Vec<&DeviceInfo> = devices.iter().filter(|d| d.serial == serial).collect();
        if selected.is_empty() {
            return Err(PipelineError::DeviceSelectorNotFound {
                serial: serial.to_string(),
            });
        }
        return Ok(selected);
    }

    if requests.is_empty() {
        return Ok(devices.iter().collect());
    }

    Ok(devices
        .iter()
        .filter(|device| requests.iter().any(|request| device.supports(request)))
        .collect())
}

/// Bind requests and requirements to one device, or explain why it cannot
fn resolve_for_device(
    device: &DeviceInfo,
    requests: &[StreamRequest],
    requirements: &[ModuleRequirement],
) -> std::result::Result<Vec<StreamProfile>, String> {
    let mut selected: Vec<StreamProfile> = Vec::new();

    // Explicit indices claim their streams before wildcard requests pick among the rest
    let ordered = requests
        .iter()
        .filter(|r| !r.has_wildcard_index())
        .chain(requests.iter().filter(|r| r.has_wildcard_index()));

    for request in ordered {
        let profile = pick_profile(device, request, &selected)
            .ok_or_else(|| format!("no free native stream matches {}", request))?;
        selected.push(profile);
    }

    for requirement in requirements {
        if selected.iter().any(|p| requirement.request.matches(p)) {
            continue;
        }
        let profile = pick_profile(device, &requirement.request, &selected).ok_or_else(|| {
            format!(
                "module '{}' needs {} which conflicts with the selected streams",
                requirement.module, requirement.request
            )
        })?;
        selected.push(profile);
    }

    if requests.is_empty() {
        for profile in device.default_profiles() {
            if !selected.iter().any(|p| p.key() == profile.key()) {
                selected.push(profile);
            }
        }
    }

    if selected.is_empty() {
        return Err("device exposes no streams".to_string());
    }

    selected.sort_by_key(|p| p.key());
    Ok(selected)
}

/// Device-preferred native profile matching `request` whose stream is still free
fn pick_profile(
    device: &DeviceInfo,
    request: &StreamRequest,
    selected: &[StreamProfile],
) -> Option<StreamProfile> {
    let candidates: Vec<&StreamProfile> = device
        .profiles
        .iter()
        .filter(|p| request.matches(p))
        .filter(|p| !selected.iter().any(|s| s.key() == p.key()))
        .collect();
    preferred_profile(&candidates).cloned()
}
