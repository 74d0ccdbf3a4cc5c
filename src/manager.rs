//! Gathers the state of the system, asks the engine what to do, and does it.

use crate::{
    actions::SystemActions,
    arch::{self, ArchError},
    config::Config,
    engine::{self, Decision, Effect, Inputs, ModuleStates, OperatingMode},
    misc, modules,
    pci::{self, DeviceRecord, Scan, ScanError, AMD, INTEL, NVIDIA},
    policy, power,
    rtd3::{Resolver, RuntimePmEligibility},
    snapshot::{self, FileStatus, SnapshotError},
    udev,
    xorg::{self, Fragment},
};
use anyhow::Context;
use std::{fs::File, io, io::BufReader, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unable to determine the system architecture")]
    Arch(#[from] ArchError),
    #[error("unable to scan for graphics devices")]
    Scan(#[from] ScanError),
    #[error("unable to read the PCI listing at {:?}", _0)]
    FakeLspci(PathBuf, #[source] io::Error),
    #[error("unable to record the graphics devices of this boot")]
    Snapshot(#[from] SnapshotError),
}

pub struct Manager<'a> {
    config:  &'a Config,
    actions: &'a mut dyn SystemActions,
}

fn yes_no(value: bool) -> &'static str { if value { "yes" } else { "no" } }

impl<'a> Manager<'a> {
    pub fn new(config: &'a Config, actions: &'a mut dyn SystemActions) -> Self {
        Manager { config, actions }
    }

    /// Runs once, returning the mode the system was left in.
    pub fn run(&mut self) -> Result<OperatingMode, ManagerError> {
        if misc::is_disabled_in_cmdline(&self.config.kernel_cmdline_path) {
            info!("Disabled by the {} kernel parameter. Nothing to do", misc::KERNEL_OPT_OUT);
            return Ok(OperatingMode::NoAction);
        }

        if self.config.fake_lspci.is_none() {
            udev::settle(&self.config.udev_queue_path);
        }

        let triplet = arch::multiarch_triplet(self.config.fake_architecture.as_deref())?;
        let inputs = self.gather(triplet)?;

        let decision = engine::decide(&inputs);
        info!("Selected mode: {}", decision.mode);

        Ok(self.execute(decision, triplet))
    }

    fn scan(&self) -> Result<Scan, ManagerError> {
        match self.config.fake_lspci.as_ref() {
            Some(path) => {
                let file = File::open(path).map_err(|why| ManagerError::FakeLspci(path.clone(), why))?;
                let devices = snapshot::parse(BufReader::new(file))
                    .map_err(|why| ManagerError::FakeLspci(path.clone(), why))?;
                Ok(Scan { devices, capabilities: Vec::new() })
            }
            None => pci::scan(&self.config.sysfs_pci_path).map_err(ManagerError::from),
        }
    }

    fn gather(&mut self, triplet: &str) -> Result<Inputs, ManagerError> {
        let config = self.config;
        let scan = self.scan()?;
        let devices = &scan.devices;

        if devices.len() == 1 {
            info!("Single card detected");
        }

        let has = |vendor| devices.iter().any(|device| device.vendor_id == vendor);
        info!("Has amd? {}", yes_no(has(AMD)));
        info!("Has intel? {}", yes_no(has(INTEL)));
        info!("Has nvidia? {}", yes_no(has(NVIDIA)));

        let requires_offloading = match config.fake_requires_offloading {
            Some(fake) => fake,
            None => devices
                .iter()
                .find(|device| device.is_boot_vga)
                .map_or(false, |boot| boot.connected_outputs.is_connected()),
        };
        info!("Does it require offloading? {}", yes_no(requires_offloading));

        let offloading_was_required = misc::read_first_line(&config.offloading_marker)
            .map_or(false, |marker| marker.eq_ignore_ascii_case("on"));

        let (last_boot, status) = snapshot::load(&config.last_boot_file)?;
        snapshot::save(&config.new_boot_file, devices)?;

        let has_changed = snapshot::diff(&last_boot, devices);
        info!("Has the system changed? {}", yes_no(has_changed));

        let first_boot = status == FileStatus::CreatedFresh;
        if first_boot {
            info!("First boot with this device snapshot");
        }

        let modules = self.module_states(devices);
        let policy = policy::read(&config.prime_settings);

        let driver_major = misc::read_first_line(&config.nvidia_driver_version_path)
            .and_then(|version| version.split('.').next().and_then(|major| major.parse::<u32>().ok()));
        if let Some(major) = driver_major {
            info!("NVIDIA driver series {}", major);
        }

        let residual_discrete = if devices.len() == 1 {
            modules::residual_gpu(config, NVIDIA)
        } else {
            None
        };

        let discrete = devices
            .iter()
            .chain(residual_discrete.iter())
            .find(|device| device.vendor_id == NVIDIA && !device.is_boot_vga);

        let eligibility = discrete.map_or_else(RuntimePmEligibility::default, |device| {
            Resolver::new(config, driver_major).resolve(
                device.bus_id,
                device.device_id,
                scan.capability_of(device.bus_id),
            )
        });

        Ok(Inputs {
            devices: scan.devices.clone(),
            has_changed,
            first_boot,
            last_boot_had_intel: last_boot.iter().any(|device| device.vendor_id == INTEL),
            requires_offloading,
            offloading_was_required,
            policy,
            driver_major,
            modules,
            output_class: xorg::output_class_state(config, triplet, discrete),
            offload_layout: xorg::offload_layout_state(config),
            eligibility,
            residual_discrete,
            px_script_available: config.amdgpu_pro_px_file.exists(),
        })
    }

    fn module_states(&mut self, devices: &[DeviceRecord]) -> ModuleStates {
        let config = self.config;
        let actions = &mut *self.actions;

        let mut loaded = |name: &str| {
            let loaded = modules::is_loaded(actions, name);
            info!("Is {} loaded? {}", name, yes_no(loaded));
            loaded
        };

        let nvidia_loaded = loaded("nvidia");
        let nouveau_loaded = loaded("nouveau");
        let amdgpu_loaded = loaded("amdgpu");
        let radeon_loaded = loaded("radeon");

        let nvidia_unloaded = modules::was_unloaded_since_last_boot(config, actions, "nvidia");
        let amdgpu_unloaded = modules::was_unloaded_since_last_boot(config, actions, "amdgpu");

        let nvidia_blacklisted = modules::is_blacklisted(config, "nvidia");
        info!("Is nvidia blacklisted? {}", yes_no(nvidia_blacklisted));

        let nvidia_available = nvidia_loaded || actions.module_available("nvidia");
        info!("Is nvidia available? {}", yes_no(nvidia_available));

        let amdgpu_versioned = (amdgpu_loaded || devices.iter().any(|d| d.vendor_id == AMD))
            && actions.module_is_versioned("amdgpu");
        info!("Is amdgpu versioned? {}", yes_no(amdgpu_versioned));

        ModuleStates {
            nvidia_loaded,
            nvidia_unloaded,
            nvidia_blacklisted,
            nvidia_available,
            nouveau_loaded,
            amdgpu_loaded,
            amdgpu_unloaded,
            amdgpu_versioned,
            radeon_loaded,
        }
    }

    /// Applies each effect in order. If the fragments or the driver for the discrete GPU
    /// can't be put in place, the system falls back to the integrated GPU without any
    /// generated fragments. Other failures are logged, and the run continues.
    fn execute(&mut self, decision: Decision, triplet: &str) -> OperatingMode {
        let mut mode = decision.mode;

        for effect in &decision.effects {
            if mode != decision.mode && enables_discrete(effect) {
                continue;
            }

            if let Err(why) = self.apply(effect, triplet) {
                error!("{}", misc::format_error(&*why));

                if matches!(mode, OperatingMode::PrimeOn | OperatingMode::PrimeOnDemand)
                    && enables_discrete(effect)
                {
                    warn!("unable to enable the discrete GPU; falling back to integrated only");
                    self.fall_back();
                    mode = OperatingMode::IntegratedOnly;
                }
            }
        }

        mode
    }

    fn fall_back(&mut self) {
        for fragment in [Fragment::PrimeOutputClass, Fragment::OffloadLayout] {
            if let Err(why) = xorg::remove(self.config, fragment) {
                error!("{}", misc::format_error(&why));
            }
        }
    }

    fn apply(&mut self, effect: &Effect, triplet: &str) -> anyhow::Result<()> {
        let config = self.config;

        match effect {
            Effect::WritePrimeOutputClass(discrete) => {
                xorg::write_prime_on(config, triplet, discrete)?
            }
            Effect::WriteOffloadLayout => xorg::write_prime_on_demand(config)?,
            Effect::RemoveFragment(fragment) => {
                xorg::remove(config, *fragment)?;
            }
            Effect::LoadModule(name) => modules::load(self.actions, name, None)?,
            Effect::UnloadDiscreteStack => modules::unload_nvidia_stack(config, self.actions)?,
            Effect::SetRuntimePm { device, enabled, eligibility, on_bus } => {
                power::set_runtime_pm(config, self.actions, device, *enabled, *eligibility, *on_bus)?
            }
            Effect::PersistPolicy(mode) => policy::write(&config.prime_settings, *mode)?,
            Effect::SetOffloadingMarker(required) => self.set_offloading_marker(*required)?,
            Effect::RunPxScript(mode) => self
                .actions
                .run_px_script(&config.amdgpu_pro_px_file, *mode)
                .context("amdgpu-pro-px failed")?,
        }

        Ok(())
    }

    fn set_offloading_marker(&self, required: bool) -> anyhow::Result<()> {
        let marker = &self.config.offloading_marker;

        if self.config.dry_run {
            info!("dry run: leaving {} as is", marker.display());
            return Ok(());
        }

        if required {
            misc::write_creating_parent(marker, b"ON\n")
                .with_context(|| fomat!("failed to write " (marker.display())))
        } else {
            misc::remove_if_exists(marker)
                .map(|_| ())
                .with_context(|| fomat!("failed to remove " (marker.display())))
        }
    }
}

fn enables_discrete(effect: &Effect) -> bool {
    matches!(
        effect,
        Effect::WritePrimeOutputClass(_) | Effect::WriteOffloadLayout | Effect::LoadModule(_)
    )
}
