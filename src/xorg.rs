//! Generated X server configuration fragments.

use crate::{config::Config, pci::DeviceRecord};
use std::{fs, io, path::PathBuf};
use thiserror::Error;

const HEADER: &str = "# DO NOT EDIT. AUTOMATICALLY GENERATED BY pop-gpu-manager\n";

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("failed to write {:?}", _0)]
    Write(PathBuf, #[source] io::Error),
    #[error("failed to remove {:?}", _0)]
    Remove(PathBuf, #[source] io::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fragment {
    /// Makes the NVIDIA driver the primary GPU for every output.
    PrimeOutputClass,
    /// Lets the NVIDIA driver provide offload screens to the integrated GPU's session.
    OffloadLayout,
}

impl Fragment {
    pub fn path(self, config: &Config) -> PathBuf {
        match self {
            Fragment::PrimeOutputClass => config.xorg_conf_d_path.join("11-nvidia-prime.conf"),
            Fragment::OffloadLayout => config.xorg_layout_d_path.join("11-nvidia-offload.conf"),
        }
    }

    pub fn exists(self, config: &Config) -> bool { self.path(config).exists() }
}

/// How a fragment on disk compares with what would be generated now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FragmentState {
    Missing,
    Current,
    /// Edited by hand, or generated for other hardware.
    Stale,
}

impl Default for FragmentState {
    fn default() -> Self { FragmentState::Missing }
}

impl FragmentState {
    pub fn exists(self) -> bool { self != FragmentState::Missing }
}

/// Without a discrete device to generate for, any OutputClass on disk is stale.
pub fn output_class_state(
    config: &Config,
    triplet: &str,
    discrete: Option<&DeviceRecord>,
) -> FragmentState {
    let expected = discrete.map(|discrete| prime_output_class(triplet, discrete));
    state(config, Fragment::PrimeOutputClass, expected.as_deref())
}

pub fn offload_layout_state(config: &Config) -> FragmentState {
    state(config, Fragment::OffloadLayout, Some(&offload_layout()))
}

fn state(config: &Config, fragment: Fragment, expected: Option<&str>) -> FragmentState {
    let path = fragment.path(config);
    let state = match fs::read_to_string(&path) {
        Ok(contents) if expected == Some(contents.as_str()) => FragmentState::Current,
        Ok(_) => FragmentState::Stale,
        Err(why) if why.kind() == io::ErrorKind::NotFound => FragmentState::Missing,
        Err(why) => {
            warn!("unable to read {}: {}", path.display(), why);
            FragmentState::Stale
        }
    };

    info!("{}: {:?}", path.display(), state);
    state
}

fn prime_output_class(triplet: &str, discrete: &DeviceRecord) -> String {
    let ids = format!("{:04x}:{:04x}", discrete.vendor_id, discrete.device_id);
    fomat!(
        (HEADER)
        "# Discrete GPU " (ids) " at " (discrete.bus_id.xorg()) "\n"
        "Section \"OutputClass\"\n"
        "    Identifier \"Nvidia Prime\"\n"
        "    MatchDriver \"nvidia-drm\"\n"
        "    Driver \"nvidia\"\n"
        "    Option \"AllowEmptyInitialConfiguration\"\n"
        "    Option \"IgnoreDisplayDevices\" \"CRT\"\n"
        "    Option \"PrimaryGPU\" \"Yes\"\n"
        "    ModulePath \"/usr/lib/" (triplet) "/nvidia/xorg\"\n"
        "EndSection\n"
    )
}

fn offload_layout() -> String {
    fomat!(
        (HEADER)
        "Section \"ServerLayout\"\n"
        "    Identifier \"layout\"\n"
        "    Option \"AllowNVIDIAGPUScreens\"\n"
        "EndSection\n"
    )
}

fn write(config: &Config, fragment: Fragment, contents: &str) -> Result<(), FragmentError> {
    let path = fragment.path(config);
    info!("Writing {}", path.display());
    crate::misc::write_creating_parent(&path, contents.as_bytes())
        .map_err(|why| FragmentError::Write(path, why))
}

/// Overwrites the OutputClass fragment which makes the discrete GPU primary.
pub fn write_prime_on(
    config: &Config,
    triplet: &str,
    discrete: &DeviceRecord,
) -> Result<(), FragmentError> {
    write(config, Fragment::PrimeOutputClass, &prime_output_class(triplet, discrete))
}

/// Overwrites the ServerLayout fragment which enables render offload.
pub fn write_prime_on_demand(config: &Config) -> Result<(), FragmentError> {
    write(config, Fragment::OffloadLayout, &offload_layout())
}

/// Removes a fragment. Returns `false` if it was already absent.
pub fn remove(config: &Config, fragment: Fragment) -> Result<bool, FragmentError> {
    let path = fragment.path(config);
    let removed =
        crate::misc::remove_if_exists(&path).map_err(|why| FragmentError::Remove(path.clone(), why))?;

    if removed {
        info!("Removed {}", path.display());
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{BusId, NVIDIA};
    use std::fs;

    fn discrete() -> DeviceRecord {
        DeviceRecord {
            vendor_id: NVIDIA,
            device_id: 0x1f91,
            bus_id: BusId { domain: 0, bus: 1, slot: 0, func: 0 },
            ..DeviceRecord::default()
        }
    }

    #[test]
    fn output_class() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());

        write_prime_on(&config, "x86_64-linux-gnu", &discrete()).unwrap();

        let contents = fs::read_to_string(Fragment::PrimeOutputClass.path(&config)).unwrap();
        assert!(contents.starts_with(HEADER));
        assert!(contents.contains("# Discrete GPU 10de:1f91 at PCI:1@0:0:0\n"));
        assert!(contents.contains("    MatchDriver \"nvidia-drm\"\n"));
        assert!(contents.contains("    ModulePath \"/usr/lib/x86_64-linux-gnu/nvidia/xorg\"\n"));
        assert!(contents.ends_with("EndSection\n"));
    }

    #[test]
    fn offload() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());

        write_prime_on_demand(&config).unwrap();

        assert_eq!(
            fs::read_to_string(Fragment::OffloadLayout.path(&config)).unwrap(),
            [
                HEADER,
                "Section \"ServerLayout\"\n",
                "    Identifier \"layout\"\n",
                "    Option \"AllowNVIDIAGPUScreens\"\n",
                "EndSection\n"
            ]
            .concat()
        );
    }

    #[test]
    fn overwrites_hand_edits() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let path = Fragment::OffloadLayout.path(&config);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "Section \"ServerLayout\"\n# edited\nEndSection\n").unwrap();

        write_prime_on_demand(&config).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("# edited"));
    }

    #[test]
    fn states() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());
        let triplet = "x86_64-linux-gnu";

        assert_eq!(output_class_state(&config, triplet, Some(&discrete())), FragmentState::Missing);
        assert_eq!(offload_layout_state(&config), FragmentState::Missing);

        write_prime_on(&config, triplet, &discrete()).unwrap();
        write_prime_on_demand(&config).unwrap();
        assert_eq!(output_class_state(&config, triplet, Some(&discrete())), FragmentState::Current);
        assert_eq!(offload_layout_state(&config), FragmentState::Current);

        // Generated for another architecture, or with nothing to generate for.
        assert_eq!(output_class_state(&config, "i386-linux-gnu", Some(&discrete())), FragmentState::Stale);
        assert_eq!(output_class_state(&config, triplet, None), FragmentState::Stale);

        fs::write(Fragment::OffloadLayout.path(&config), "# hand written\n").unwrap();
        assert_eq!(offload_layout_state(&config), FragmentState::Stale);
    }

    #[test]
    fn removal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted_at(dir.path());

        write_prime_on_demand(&config).unwrap();
        assert!(remove(&config, Fragment::OffloadLayout).unwrap());
        assert!(!remove(&config, Fragment::OffloadLayout).unwrap());
        assert!(!Fragment::OffloadLayout.exists(&config));
    }
}
