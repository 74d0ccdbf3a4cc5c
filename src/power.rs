//! Runtime power management of the discrete GPU.

use crate::{actions::SystemActions, config::Config, pci::DeviceRecord, rtd3::RuntimePmEligibility};
use std::{io, path::PathBuf};
use thiserror::Error;

const RUNTIMEPM_SNIPPET: &str = "options nvidia \"NVreg_DynamicPowerManagement=0x02\"\n";

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("failed to set runtime power control at {:?}", _0)]
    Control(PathBuf, #[source] io::Error),
    #[error("failed to update the runtime PM modprobe snippet at {:?}", _0)]
    Snippet(PathBuf, #[source] io::Error),
}

pub fn control_path(config: &Config, device: &DeviceRecord) -> PathBuf {
    config.sysfs_pci_path.join(device.bus_id.to_string()).join("power/control")
}

/// Sets `power/control` to `auto` or `on`, unless the device is not `on_bus`.
///
/// Enabling also installs the driver's dynamic power management option when the device
/// is eligible and the driver hasn't already enabled it. Disabling removes the option.
pub fn set_runtime_pm(
    config: &Config,
    actions: &mut dyn SystemActions,
    device: &DeviceRecord,
    enabled: bool,
    eligibility: RuntimePmEligibility,
    on_bus: bool,
) -> Result<(), PowerError> {
    let control = control_path(config, device);

    if on_bus {
        actions
            .write_attribute(&control, if enabled { "auto\n" } else { "on\n" })
            .map_err(|why| PowerError::Control(control, why))?;
    } else {
        info!("{} is not on the bus. Leaving {} alone", device.bus_id, control.display());
    }

    let snippet = &config.runtimepm_conf_path;

    if enabled {
        if eligibility.supported && !eligibility.currently_enabled {
            info!("Enabling dynamic power management in {}", snippet.display());
            crate::misc::write_creating_parent(snippet, RUNTIMEPM_SNIPPET.as_bytes())
                .map_err(|why| PowerError::Snippet(snippet.clone(), why))?;
        }
    } else if crate::misc::remove_if_exists(snippet)
        .map_err(|why| PowerError::Snippet(snippet.clone(), why))?
    {
        info!("Removed {}", snippet.display());
    }

    Ok(())
}
