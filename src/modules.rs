//! Kernel module state and the unload protocol for drivers pinned by a display server.

use crate::{
    actions::SystemActions,
    config::Config,
    pci::{BusId, DeviceRecord},
};
use regex::Regex;
use std::{fs, io, path::Path};
use thiserror::Error;

/// Loaded alongside the proprietary NVIDIA driver, and holding references to it.
pub const NVIDIA_COMPANIONS: &[&str] = &["nvidia_drm", "nvidia_modeset", "nvidia_uvm"];

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("failed to load {}", _0)]
    Load(String, #[source] io::Error),
    #[error("{} is still loaded after terminating the display session", _0)]
    StillLoaded(String),
    #[error("{} is in use, and no display session could be terminated", _0)]
    NoSession(String),
    #[error("failed to terminate the display session")]
    Terminate(#[source] io::Error),
}

/// True if `name` is the first field of any line in the module listing.
pub fn is_loaded(actions: &mut dyn SystemActions, name: &str) -> bool {
    match actions.module_listing() {
        Ok(listing) => listing_contains(&listing, name),
        Err(why) => {
            warn!("unable to read the module listing: {}", why);
            false
        }
    }
}

fn listing_contains(listing: &str, name: &str) -> bool {
    listing.lines().any(|line| line.split_whitespace().next() == Some(name))
}

/// Searches the modprobe configuration directories for `blacklist <name>`.
pub fn is_blacklisted(config: &Config, name: &str) -> bool {
    let pattern = match Regex::new(&["(?m)^blacklist[ \\t]+", &regex::escape(name), "[ \\t]*$"].concat())
    {
        Ok(pattern) => pattern,
        Err(why) => {
            error!("invalid blacklist pattern for {}: {}", name, why);
            return false;
        }
    };

    config.modprobe_d_paths.iter().any(|dir| directory_blacklists(dir, &pattern))
}

fn directory_blacklists(dir: &Path, pattern: &Regex) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    entries.filter_map(Result::ok).any(|entry| {
        let path = entry.path();
        let is_conf = path.extension().map_or(false, |ext| ext == "conf");
        is_conf
            && fs::read_to_string(&path).map_or(false, |contents| {
                let found = pattern.is_match(&contents);
                if found {
                    info!("{} blacklisted in {}", pattern.as_str(), path.display());
                }
                found
            })
    })
}

fn loaded_marker(config: &Config, name: &str) -> std::path::PathBuf {
    config.gpu_detection_path.join(["u-d-c-", name, "-was-loaded"].concat())
}

/// True if a previous boot saw `name` loaded, and it no longer is.
pub fn was_unloaded_since_last_boot(
    config: &Config,
    actions: &mut dyn SystemActions,
    name: &str,
) -> bool {
    let unloaded = loaded_marker(config, name).exists() && !is_loaded(actions, name);
    info!("Was {} unloaded? {}", name, if unloaded { "yes" } else { "no" });
    unloaded
}

/// Recovers the discrete device recorded by a `u-d-c-gpu-<bus>-0x<vendor>-0x<device>` marker.
pub fn residual_gpu(config: &Config, vendor_id: u16) -> Option<DeviceRecord> {
    let entries = fs::read_dir(&config.gpu_detection_path).ok()?;

    let mut names = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect::<Vec<_>>();
    names.sort();

    names
        .iter()
        .filter_map(|name| parse_gpu_marker(name))
        .find(|record| record.vendor_id == vendor_id)
}

fn parse_gpu_marker(name: &str) -> Option<DeviceRecord> {
    let rest = name.strip_prefix("u-d-c-gpu-")?;
    let mut fields = rest.rsplitn(3, '-');
    let device = fields.next()?.strip_prefix("0x")?;
    let vendor = fields.next()?.strip_prefix("0x")?;
    let bus_id = fields.next()?.parse::<BusId>().ok()?;

    Some(DeviceRecord {
        vendor_id: u16::from_str_radix(vendor, 16).ok()?,
        device_id: u16::from_str_radix(device, 16).ok()?,
        bus_id,
        is_boot_vga: false,
        ..DeviceRecord::default()
    })
}

pub fn load(
    actions: &mut dyn SystemActions,
    name: &str,
    params: Option<&str>,
) -> Result<(), ModuleError> {
    actions.load_module(name, params).map_err(|why| ModuleError::Load(name.to_owned(), why))
}

/// Unloads `name`, and on failure terminates the display session once before trying again.
pub fn unload_with_retry(
    config: &Config,
    actions: &mut dyn SystemActions,
    name: &str,
) -> Result<(), ModuleError> {
    unload_stack_with_retry(config, actions, &[name])
}

/// Unloads the NVIDIA companions, then the driver itself. If anything remains, the display
/// session is terminated once and the whole stack is unloaded again in the same order.
pub fn unload_nvidia_stack(
    config: &Config,
    actions: &mut dyn SystemActions,
) -> Result<(), ModuleError> {
    let stack = [NVIDIA_COMPANIONS, &["nvidia"]].concat();
    unload_stack_with_retry(config, actions, &stack)
}

fn unload_stack_with_retry(
    config: &Config,
    actions: &mut dyn SystemActions,
    stack: &[&str],
) -> Result<(), ModuleError> {
    let pinned = match unload_in_order(actions, stack) {
        Some(name) => name,
        None => return Ok(()),
    };

    warn!("{} is still in use; terminating the display session", pinned);

    let terminated = actions
        .terminate_session(&config.display_servers, &config.session_user)
        .map_err(ModuleError::Terminate)?;

    if !terminated {
        return Err(ModuleError::NoSession(pinned.to_owned()));
    }

    match unload_in_order(actions, stack) {
        Some(name) => Err(ModuleError::StillLoaded(name.to_owned())),
        None => Ok(()),
    }
}

/// Unloads every loaded module of `stack` in order, and returns the first one left loaded.
fn unload_in_order<'a>(actions: &mut dyn SystemActions, stack: &[&'a str]) -> Option<&'a str> {
    for &name in stack {
        if is_loaded(actions, name) {
            if let Err(why) = actions.unload_module(name) {
                warn!("failed to unload {}: {}", name, why);
            }
        }
    }

    for &name in stack {
        if is_loaded(actions, name) {
            return Some(name);
        }
    }

    None
}
