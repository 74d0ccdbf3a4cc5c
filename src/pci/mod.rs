//! Enumeration of display-class PCI devices.

pub mod capability;
pub mod outputs;

pub use self::{
    capability::{CapabilityInfo, ConfigSpace},
    outputs::ConnectedOutputs,
};

use std::{
    fmt::{self, Display, Formatter},
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};
use sysfs_class::{PciDevice, SysClass};
use thiserror::Error;

pub const AMD: u16 = 0x1002;
pub const INTEL: u16 = 0x8086;
pub const NVIDIA: u16 = 0x10de;

/// Devices past this count are ignored.
pub const MAX_CARDS: usize = 10;

const PCI_CLASS_DISPLAY: u32 = 0x03;

/// Drivers which reserve a device for a guest instead of the host.
const PASSTHROUGH_DRIVERS: &[&str] = &["pci-stub", "pciback"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read the PCI device directory {:?}", _0)]
    ReadDir(PathBuf, #[source] io::Error),
}

/// A PCI bus address, which doubles as the identity of a device.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct BusId {
    pub domain: u16,
    pub bus:    u8,
    pub slot:   u8,
    pub func:   u8,
}

impl Display for BusId {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{:04x}:{:02x}:{:02x}.{:x}", self.domain, self.bus, self.slot, self.func)
    }
}

impl FromStr for BusId {
    type Err = ();

    /// Parses the sysfs form, `dddd:bb:ss.f`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut fields = input.trim().splitn(3, ':');
        let domain = fields.next().ok_or(())?;
        let bus = fields.next().ok_or(())?;
        let (slot, func) = fields.next().and_then(|rest| rest.split_once('.')).ok_or(())?;

        Ok(BusId {
            domain: u16::from_str_radix(domain, 16).map_err(|_| ())?,
            bus:    u8::from_str_radix(bus, 16).map_err(|_| ())?,
            slot:   u8::from_str_radix(slot, 16).map_err(|_| ())?,
            func:   u8::from_str_radix(func, 16).map_err(|_| ())?,
        })
    }
}

impl BusId {
    /// The `PCI:bus@domain:slot:func` form used by X server configuration.
    pub fn xorg(&self) -> String {
        fomat!("PCI:"(self.bus)"@"(self.domain)":"(self.slot)":"(self.func))
    }
}

/// One display-class device as seen during a single boot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceRecord {
    pub vendor_id:         u16,
    pub device_id:         u16,
    pub bus_id:            BusId,
    pub is_boot_vga:       bool,
    pub connected_outputs: ConnectedOutputs,
}

impl DeviceRecord {
    /// Fields compared when deciding whether the system changed between boots.
    pub fn same_identity(&self, other: &DeviceRecord) -> bool {
        self.is_boot_vga == other.is_boot_vga
            && self.vendor_id == other.vendor_id
            && self.device_id == other.device_id
            && self.bus_id == other.bus_id
    }
}

/// A scan result, plus the power management capabilities of discrete NVIDIA devices.
#[derive(Debug, Default)]
pub struct Scan {
    pub devices:      Vec<DeviceRecord>,
    pub capabilities: Vec<(BusId, CapabilityInfo)>,
}

impl Scan {
    pub fn capability_of(&self, bus_id: BusId) -> CapabilityInfo {
        self.capabilities
            .iter()
            .find(|(id, _)| *id == bus_id)
            .map(|&(_, info)| info)
            .unwrap_or_default()
    }
}

/// Enumerates display-class devices beneath `sysfs_pci`, which is normally
/// `/sys/bus/pci/devices`.
pub fn scan(sysfs_pci: &Path) -> Result<Scan, ScanError> {
    let entries =
        fs::read_dir(sysfs_pci).map_err(|why| ScanError::ReadDir(sysfs_pci.to_owned(), why))?;

    let mut paths = entries.filter_map(|entry| entry.ok().map(|e| e.path())).collect::<Vec<_>>();
    paths.sort();

    let mut scan = Scan::default();

    for path in paths {
        if !path.is_dir() {
            warn!("skipping {}: not a device directory", path.display());
            continue;
        }

        // `from_path` only accepts children of `/sys/bus/pci/devices`.
        let device = unsafe { PciDevice::from_path_unchecked(path) };

        match device.class() {
            Ok(class) if class >> 16 == PCI_CLASS_DISPLAY => (),
            Ok(_) => continue,
            Err(why) => {
                warn!("{}: unable to read class: {}", device.id(), why);
                continue;
            }
        }

        let bus_id = match device.id().parse::<BusId>() {
            Ok(bus_id) => bus_id,
            Err(()) => {
                warn!("{}: not a PCI bus address", device.id());
                continue;
            }
        };

        let (vendor_id, device_id) = match (device.vendor(), device.device()) {
            (Ok(vendor), Ok(device)) => (vendor, device),
            (Err(why), _) | (_, Err(why)) => {
                warn!("{}: unable to read vendor and device ids: {}", bus_id, why);
                continue;
            }
        };

        let is_boot_vga = is_boot_vga(device.path());

        info!("Vendor/Device Id: {:x}:{:x}", vendor_id, device_id);
        info!("BusID \"{}\"", bus_id.xorg());
        info!("Is boot vga? {}", if is_boot_vga { "yes" } else { "no" });

        match device.driver() {
            Ok(driver) => {
                if PASSTHROUGH_DRIVERS.contains(&driver.id()) {
                    info!("{} is bound to {}. Skipping...", bus_id, driver.id());
                    continue;
                }
            }
            Err(_) => {
                warn!("The device is not bound to any driver. Skipping...");
                continue;
            }
        }

        if scan.devices.len() == MAX_CARDS {
            warn!("too many devices. Max supported {}. Ignoring the rest.", MAX_CARDS);
            break;
        }

        if !is_boot_vga && vendor_id == NVIDIA {
            let info = ConfigSpace::open(&device.path().join("config"))
                .map(|mut config| config.power_management())
                .unwrap_or_else(|why| {
                    error!("{}: can't read PCI configuration space: {}", bus_id, why);
                    CapabilityInfo::default()
                });

            info!(
                "Does {} support D3hot? {}. D3cold? {}",
                bus_id,
                if info.supports_d3hot { "yes" } else { "no" },
                if info.supports_d3cold { "yes" } else { "no" }
            );

            scan.capabilities.push((bus_id, info));
        }

        scan.devices.push(DeviceRecord {
            vendor_id,
            device_id,
            bus_id,
            is_boot_vga,
            connected_outputs: outputs::connected_outputs(device.path()),
        });
    }

    Ok(scan)
}

/// Exactly `1\n` in the `boot_vga` attribute marks the firmware's primary device.
fn is_boot_vga(device: &Path) -> bool {
    fs::read(device.join("boot_vga")).map_or(false, |contents| contents == b"1\n")
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::{fs, os::unix::fs::symlink, path::Path};

    /// Builds a sysfs-like PCI device directory.
    pub fn device(
        root: &Path,
        bus_id: &str,
        class: u32,
        vendor: u16,
        device: u16,
        boot_vga: bool,
        driver: Option<&str>,
    ) -> std::path::PathBuf {
        let path = root.join(bus_id);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("class"), format!("0x{:06x}\n", class)).unwrap();
        fs::write(path.join("vendor"), format!("0x{:04x}\n", vendor)).unwrap();
        fs::write(path.join("device"), format!("0x{:04x}\n", device)).unwrap();
        fs::write(path.join("boot_vga"), if boot_vga { "1\n" } else { "0\n" }).unwrap();

        if let Some(driver) = driver {
            let driver_dir = root.join("drivers").join(driver);
            fs::create_dir_all(&driver_dir).unwrap();
            symlink(&driver_dir, path.join("driver")).unwrap();
        }

        path
    }
}
