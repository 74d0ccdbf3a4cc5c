//! Whether runtime D3 power management may be attempted on a discrete NVIDIA device.

use crate::{
    config::Config,
    pci::{BusId, CapabilityInfo},
};
use procfs::sys::kernel::Version;
use serde_derive::Deserialize;
use std::{fs, path::PathBuf};

/// Chassis types, as reported by DMI, of portable machines.
const LAPTOP_CHASSIS_TYPES: &[u32] = &[8, 9, 10, 14, 31, 32];

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RuntimePmEligibility {
    pub supported:         bool,
    pub currently_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct Database {
    chips: Vec<Chip>,
}

#[derive(Debug, Deserialize)]
struct Chip {
    devid:    String,
    #[serde(default)]
    name:     String,
    #[serde(default)]
    features: Vec<String>,
}

pub struct Resolver<'a> {
    config:       &'a Config,
    driver_major: Option<u32>,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a Config, driver_major: Option<u32>) -> Self {
        Resolver { config, driver_major }
    }

    pub fn resolve(
        &self,
        bus_id: BusId,
        device_id: u16,
        capability: CapabilityInfo,
    ) -> RuntimePmEligibility {
        let supported = if self.config.runtimepm_override_path.exists() {
            info!("Runtime D3 override found at {}", self.config.runtimepm_override_path.display());
            true
        } else {
            let listed = self.database_supports(device_id);
            let supported = listed || capability.supports_d3hot;
            if !listed && supported {
                info!("{:04x} is not listed for runtimepm; falling back to D3hot support", device_id);
            }

            supported && self.is_laptop()
        };

        let supported = supported && self.kernel_supports_rtd3();
        let currently_enabled = self.currently_enabled(bus_id);

        info!("Is RTD3 supported? {}", if supported { "yes" } else { "no" });
        info!("Is RTD3 enabled? {}", if currently_enabled { "yes" } else { "no" });

        RuntimePmEligibility { supported, currently_enabled }
    }

    fn database_paths(&self) -> Vec<PathBuf> {
        let major = match self.driver_major {
            Some(major) => major.to_string(),
            None => return Vec::new(),
        };

        let doc = &self.config.nvidia_doc_path;
        vec![
            doc.join(["nvidia-driver-", &major].concat()).join("supported-gpus.json"),
            doc.join(["nvidia-driver-", &major, "-server"].concat()).join("supported-gpus.json"),
        ]
    }

    fn database_supports(&self, device_id: u16) -> bool {
        let path = match self.database_paths().into_iter().find(|path| path.exists()) {
            Some(path) => path,
            None => {
                warn!("no supported-gpus.json found for the installed NVIDIA driver");
                return false;
            }
        };

        let database = match fs::read(&path)
            .map_err(|why| why.to_string())
            .and_then(|data| serde_json::from_slice::<Database>(&data).map_err(|why| why.to_string()))
        {
            Ok(database) => database,
            Err(why) => {
                warn!("failed to parse {}: {}", path.display(), why);
                return false;
            }
        };

        chip_supports_runtimepm(&database, device_id)
    }

    fn is_laptop(&self) -> bool {
        let chassis = crate::misc::read_first_line(&self.config.chassis_type_path)
            .and_then(|line| line.parse::<u32>().ok());

        match chassis {
            Some(chassis) => {
                let laptop = LAPTOP_CHASSIS_TYPES.contains(&chassis);
                info!("Chassis type {} is a laptop? {}", chassis, if laptop { "yes" } else { "no" });
                laptop
            }
            None => {
                warn!("unable to read chassis type from {}", self.config.chassis_type_path.display());
                false
            }
        }
    }

    fn kernel_supports_rtd3(&self) -> bool {
        let release = crate::misc::read_first_line(&self.config.kernel_release_path);
        match release.as_deref().map(Version::from_str) {
            Some(Ok(version)) => kernel_gate(version),
            _ => {
                warn!("unable to determine the kernel version");
                false
            }
        }
    }

    /// Reads `Runtime D3 status:` from the driver's per-device power file.
    fn currently_enabled(&self, bus_id: BusId) -> bool {
        let path = self.config.nvidia_proc_gpus_path.join(bus_id.to_string()).join("power");
        fs::read_to_string(path)
            .map(|contents| runtime_d3_enabled(&contents))
            .unwrap_or(false)
    }
}

fn chip_supports_runtimepm(database: &Database, device_id: u16) -> bool {
    let chip = database.chips.iter().find(|chip| {
        u16::from_str_radix(chip.devid.trim_start_matches("0x").trim_start_matches("0X"), 16)
            .map_or(false, |id| id == device_id)
    });

    match chip {
        Some(chip) => {
            let supported = chip.features.iter().any(|feature| feature == "runtimepm");
            info!("{} ({}) supports runtimepm? {}", chip.name, chip.devid, if supported { "yes" } else { "no" });
            supported
        }
        None => {
            warn!("{:04x} is not in the supported GPU list", device_id);
            false
        }
    }
}

fn kernel_gate(version: Version) -> bool { version >= Version::new(4, 18, 0) }

fn runtime_d3_enabled(contents: &str) -> bool {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("Runtime D3 status:"))
        .map_or(false, |status| status.trim().to_ascii_lowercase().starts_with("enabled"))
}
