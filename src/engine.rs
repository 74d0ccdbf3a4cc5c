//! Maps what was detected onto an operating mode, and the effects needed to reach it.
//!
//! `decide` is pure. Everything it knows arrives through `Inputs`, and everything it
//! wants done leaves as an `Effect` for the manager to carry out.

use crate::{
    pci::{DeviceRecord, AMD, INTEL, NVIDIA},
    policy::PolicyMode,
    rtd3::RuntimePmEligibility,
    xorg::{Fragment, FragmentState},
};
use std::fmt::{self, Display, Formatter};

/// The first NVIDIA driver series which supports render offload.
pub const ON_DEMAND_MIN_DRIVER: u32 = 450;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PxMode {
    PowerSaving,
    Performance,
    Reset,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperatingMode {
    DiscreteOnly,
    IntegratedOnly,
    PrimeOn,
    PrimeOnDemand,
    PowerXpress(PxMode),
    NoAction,
}

impl Display for OperatingMode {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            OperatingMode::DiscreteOnly => fmt.write_str("discrete only"),
            OperatingMode::IntegratedOnly => fmt.write_str("integrated only"),
            OperatingMode::PrimeOn => fmt.write_str("PRIME on"),
            OperatingMode::PrimeOnDemand => fmt.write_str("PRIME on-demand"),
            OperatingMode::PowerXpress(mode) => write!(fmt, "PowerXpress ({:?})", mode),
            OperatingMode::NoAction => fmt.write_str("no action"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    WritePrimeOutputClass(DeviceRecord),
    WriteOffloadLayout,
    RemoveFragment(Fragment),
    LoadModule(&'static str),
    /// The NVIDIA companions, then `nvidia` through the retry protocol.
    UnloadDiscreteStack,
    /// `on_bus` is false for a discrete GPU known only from the residual markers.
    SetRuntimePm {
        device:      DeviceRecord,
        enabled:     bool,
        eligibility: RuntimePmEligibility,
        on_bus:      bool,
    },
    PersistPolicy(PolicyMode),
    SetOffloadingMarker(bool),
    RunPxScript(PxMode),
}

#[derive(Clone, Debug, Default)]
pub struct ModuleStates {
    pub nvidia_loaded:      bool,
    /// Loaded during a previous boot, but not now.
    pub nvidia_unloaded:    bool,
    pub nvidia_blacklisted: bool,
    pub nvidia_available:   bool,
    pub nouveau_loaded:     bool,
    pub amdgpu_loaded:      bool,
    pub amdgpu_unloaded:    bool,
    pub amdgpu_versioned:   bool,
    pub radeon_loaded:      bool,
}

#[derive(Clone, Debug, Default)]
pub struct Inputs {
    pub devices:                 Vec<DeviceRecord>,
    pub has_changed:             bool,
    /// There was no snapshot from a previous boot.
    pub first_boot:              bool,
    pub last_boot_had_intel:     bool,
    pub requires_offloading:     bool,
    /// The offloading marker left by the previous run.
    pub offloading_was_required: bool,
    pub policy:                  PolicyMode,
    pub driver_major:            Option<u32>,
    pub modules:                 ModuleStates,
    pub output_class:            FragmentState,
    pub offload_layout:          FragmentState,
    pub eligibility:             RuntimePmEligibility,
    /// A discrete GPU recovered from the residual markers, when it has disappeared from the bus.
    pub residual_discrete:       Option<DeviceRecord>,
    pub px_script_available:     bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Decision {
    pub mode:    OperatingMode,
    pub effects: Vec<Effect>,
}

impl Decision {
    fn no_action() -> Self { Decision { mode: OperatingMode::NoAction, effects: Vec::new() } }
}

impl Inputs {
    /// A hardware change only counts once a previous boot has been recorded. A
    /// proprietary and open driver loaded side by side always counts.
    pub fn changed(&self) -> bool {
        let conflict = (self.modules.nvidia_loaded && self.modules.nouveau_loaded)
            || (self.modules.amdgpu_versioned && self.modules.amdgpu_loaded && self.modules.radeon_loaded);

        (self.has_changed && !self.first_boot) || conflict
    }

    fn prime_capable(&self) -> bool {
        let modules = &self.modules;
        self.requires_offloading
            && !modules.nouveau_loaded
            && !modules.nvidia_blacklisted
            && (modules.nvidia_loaded || modules.nvidia_available)
    }

    fn on_demand_capable(&self) -> bool {
        self.driver_major.map_or(true, |major| major >= ON_DEMAND_MIN_DRIVER)
    }
}

pub fn decide(inputs: &Inputs) -> Decision {
    let decision = match inputs.devices.len() {
        0 => Decision::no_action(),
        1 => single_card(inputs, &inputs.devices[0]),
        _ => multiple_cards(inputs),
    };

    match decision.mode {
        OperatingMode::NoAction => decision,
        _ => {
            let mut decision = decision;
            decision.effects.push(Effect::SetOffloadingMarker(inputs.requires_offloading));
            decision
        }
    }
}

fn single_card(inputs: &Inputs, device: &DeviceRecord) -> Decision {
    match device.vendor_id {
        INTEL => {
            if inputs.offloading_was_required && inputs.modules.nvidia_unloaded {
                if let Some(discrete) = inputs.residual_discrete.as_ref() {
                    if discrete.vendor_id == NVIDIA && inputs.policy != PolicyMode::Off {
                        info!("The discrete NVIDIA GPU was powered off. Restoring PRIME");
                        return prime(inputs, discrete);
                    }
                }
            }

            if inputs.offloading_was_required
                && inputs.modules.amdgpu_unloaded
                && inputs.px_script_available
            {
                return Decision {
                    mode:    OperatingMode::PowerXpress(PxMode::Reset),
                    effects: vec![Effect::RunPxScript(PxMode::Reset)],
                };
            }

            integrated_only(inputs)
        }
        NVIDIA | AMD => {
            if device.vendor_id == AMD
                && inputs.modules.amdgpu_versioned
                && inputs.last_boot_had_intel
                && inputs.px_script_available
            {
                return Decision {
                    mode:    OperatingMode::PowerXpress(PxMode::Reset),
                    effects: vec![Effect::RunPxScript(PxMode::Reset)],
                };
            }

            let mut effects = Vec::new();
            if inputs.offload_layout.exists() {
                effects.push(Effect::RemoveFragment(Fragment::OffloadLayout));
            }

            Decision { mode: OperatingMode::DiscreteOnly, effects }
        }
        vendor => {
            warn!("unsupported vendor {:04x}", vendor);
            Decision::no_action()
        }
    }
}

fn multiple_cards(inputs: &Inputs) -> Decision {
    let boot = inputs.devices.iter().find(|device| device.is_boot_vga);
    let discrete = inputs.devices.iter().find(|device| !device.is_boot_vga);

    let (boot, discrete) = match (boot, discrete) {
        (Some(boot), Some(discrete)) => (boot, discrete),
        _ => {
            warn!("no boot VGA device among multiple GPUs");
            return muxed(inputs);
        }
    };

    if !matches!(boot.vendor_id, INTEL | AMD) || boot.vendor_id == discrete.vendor_id {
        return muxed(inputs);
    }

    match discrete.vendor_id {
        NVIDIA if inputs.prime_capable() => prime(inputs, discrete),
        AMD if inputs.modules.amdgpu_versioned
            && inputs.px_script_available
            && inputs.requires_offloading =>
        {
            let mode = match inputs.policy {
                PolicyMode::On => PxMode::Performance,
                PolicyMode::Off | PolicyMode::OnDemand => PxMode::PowerSaving,
            };

            Decision { mode: OperatingMode::PowerXpress(mode), effects: vec![Effect::RunPxScript(mode)] }
        }
        _ => muxed(inputs),
    }
}

/// Hybrid graphics with an NVIDIA discrete GPU, per the operator's policy.
fn prime(inputs: &Inputs, discrete: &DeviceRecord) -> Decision {
    match inputs.policy {
        PolicyMode::On => prime_on(inputs, discrete, Vec::new()),
        PolicyMode::OnDemand if !inputs.on_demand_capable() => {
            info!(
                "NVIDIA driver {} does not support on-demand offload; falling back to PRIME on",
                inputs.driver_major.unwrap_or(0)
            );

            prime_on(inputs, discrete, vec![Effect::PersistPolicy(PolicyMode::On)])
        }
        PolicyMode::OnDemand => prime_on_demand(inputs, discrete),
        PolicyMode::Off => {
            let mut decision = integrated_only(inputs);
            if inputs.modules.nvidia_loaded {
                decision.effects.push(Effect::UnloadDiscreteStack);
            }

            decision.effects.push(runtime_pm(inputs, discrete, true));

            decision
        }
    }
}

fn prime_on(inputs: &Inputs, discrete: &DeviceRecord, mut effects: Vec<Effect>) -> Decision {
    if inputs.output_class != FragmentState::Current || inputs.changed() {
        effects.push(Effect::WritePrimeOutputClass(discrete.clone()));
    }

    if inputs.offload_layout.exists() {
        effects.push(Effect::RemoveFragment(Fragment::OffloadLayout));
    }

    effects.push(runtime_pm(inputs, discrete, false));

    if !inputs.modules.nvidia_loaded {
        effects.push(Effect::LoadModule("nvidia"));
    }

    Decision { mode: OperatingMode::PrimeOn, effects }
}

fn prime_on_demand(inputs: &Inputs, discrete: &DeviceRecord) -> Decision {
    let mut effects = Vec::new();

    if inputs.offload_layout != FragmentState::Current || inputs.changed() {
        effects.push(Effect::WriteOffloadLayout);
    }

    if inputs.output_class.exists() {
        effects.push(Effect::RemoveFragment(Fragment::PrimeOutputClass));
    }

    effects.push(runtime_pm(inputs, discrete, true));

    if !inputs.modules.nvidia_loaded {
        effects.push(Effect::LoadModule("nvidia"));
    }

    Decision { mode: OperatingMode::PrimeOnDemand, effects }
}

fn runtime_pm(inputs: &Inputs, discrete: &DeviceRecord, enabled: bool) -> Effect {
    Effect::SetRuntimePm {
        device: discrete.clone(),
        enabled,
        eligibility: inputs.eligibility,
        on_bus: inputs.devices.iter().any(|device| device.same_identity(discrete)),
    }
}

fn integrated_only(inputs: &Inputs) -> Decision {
    Decision { mode: OperatingMode::IntegratedOnly, effects: remove_fragments(inputs) }
}

/// Multiple GPUs without a usable hybrid configuration: whichever driver is loaded wins.
fn muxed(inputs: &Inputs) -> Decision {
    let discrete_driver = inputs.modules.nvidia_loaded
        || (inputs.modules.amdgpu_loaded && inputs.modules.amdgpu_versioned);

    let mode =
        if discrete_driver { OperatingMode::DiscreteOnly } else { OperatingMode::IntegratedOnly };

    Decision { mode, effects: remove_fragments(inputs) }
}

fn remove_fragments(inputs: &Inputs) -> Vec<Effect> {
    let mut effects = Vec::new();

    if inputs.output_class.exists() {
        effects.push(Effect::RemoveFragment(Fragment::PrimeOutputClass));
    }

    if inputs.offload_layout.exists() {
        effects.push(Effect::RemoveFragment(Fragment::OffloadLayout));
    }

    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{BusId, ConnectedOutputs};

    fn intel() -> DeviceRecord {
        DeviceRecord {
            vendor_id: INTEL,
            device_id: 0x3e9b,
            bus_id: BusId { domain: 0, bus: 0, slot: 2, func: 0 },
            is_boot_vga: true,
            connected_outputs: ConnectedOutputs::HasConnected,
        }
    }

    fn nvidia() -> DeviceRecord {
        DeviceRecord {
            vendor_id: NVIDIA,
            device_id: 0x1f91,
            bus_id: BusId { domain: 0, bus: 1, slot: 0, func: 0 },
            is_boot_vga: false,
            connected_outputs: ConnectedOutputs::Unknown,
        }
    }

    fn amd() -> DeviceRecord {
        DeviceRecord {
            vendor_id: AMD,
            device_id: 0x67df,
            bus_id: BusId { domain: 0, bus: 1, slot: 0, func: 0 },
            is_boot_vga: false,
            connected_outputs: ConnectedOutputs::Unknown,
        }
    }

    const ELIGIBLE: RuntimePmEligibility =
        RuntimePmEligibility { supported: true, currently_enabled: false };

    fn hybrid(policy: PolicyMode, driver_major: u32) -> Inputs {
        Inputs {
            devices: vec![intel(), nvidia()],
            requires_offloading: true,
            policy,
            driver_major: Some(driver_major),
            modules: ModuleStates {
                nvidia_loaded: true,
                nvidia_available: true,
                ..ModuleStates::default()
            },
            eligibility: ELIGIBLE,
            ..Inputs::default()
        }
    }

    fn runtime_pm(enabled: bool) -> Effect {
        Effect::SetRuntimePm { device: nvidia(), enabled, eligibility: ELIGIBLE, on_bus: true }
    }

    #[test]
    fn nothing_detected() {
        assert_eq!(decide(&Inputs::default()), Decision::no_action());
    }

    #[test]
    fn single_integrated() {
        let inputs = Inputs {
            devices: vec![intel()],
            offload_layout: FragmentState::Current,
            ..Inputs::default()
        };

        assert_eq!(decide(&inputs), Decision {
            mode:    OperatingMode::IntegratedOnly,
            effects: vec![
                Effect::RemoveFragment(Fragment::OffloadLayout),
                Effect::SetOffloadingMarker(false),
            ],
        });
    }

    #[test]
    fn single_discrete() {
        let mut only = nvidia();
        only.is_boot_vga = true;

        let inputs = Inputs {
            devices: vec![only],
            output_class: FragmentState::Current,
            offload_layout: FragmentState::Current,
            ..Inputs::default()
        };

        assert_eq!(decide(&inputs), Decision {
            mode:    OperatingMode::DiscreteOnly,
            effects: vec![
                Effect::RemoveFragment(Fragment::OffloadLayout),
                Effect::SetOffloadingMarker(false),
            ],
        });
    }

    #[test]
    fn unsupported_vendor() {
        let mut other = intel();
        other.vendor_id = 0x1234;
        assert_eq!(decide(&Inputs { devices: vec![other], ..Inputs::default() }).mode, OperatingMode::NoAction);
    }

    #[test]
    fn on_demand() {
        let decision = decide(&hybrid(PolicyMode::OnDemand, 470));

        assert_eq!(decision, Decision {
            mode:    OperatingMode::PrimeOnDemand,
            effects: vec![
                Effect::WriteOffloadLayout,
                runtime_pm(true),
                Effect::SetOffloadingMarker(true),
            ],
        });
    }

    #[test]
    fn on_demand_removes_output_class() {
        let inputs = Inputs { output_class: FragmentState::Current, ..hybrid(PolicyMode::OnDemand, 470) };
        assert!(decide(&inputs).effects.contains(&Effect::RemoveFragment(Fragment::PrimeOutputClass)));
    }

    #[test]
    fn old_driver_falls_back_to_prime_on() {
        let decision = decide(&hybrid(PolicyMode::OnDemand, 325));

        assert_eq!(decision, Decision {
            mode:    OperatingMode::PrimeOn,
            effects: vec![
                Effect::PersistPolicy(PolicyMode::On),
                Effect::WritePrimeOutputClass(nvidia()),
                runtime_pm(false),
                Effect::SetOffloadingMarker(true),
            ],
        });
    }

    #[test]
    fn prime_on_loads_driver() {
        let mut inputs = hybrid(PolicyMode::On, 470);
        inputs.modules.nvidia_loaded = false;
        inputs.offload_layout = FragmentState::Current;

        assert_eq!(decide(&inputs), Decision {
            mode:    OperatingMode::PrimeOn,
            effects: vec![
                Effect::WritePrimeOutputClass(nvidia()),
                Effect::RemoveFragment(Fragment::OffloadLayout),
                runtime_pm(false),
                Effect::LoadModule("nvidia"),
                Effect::SetOffloadingMarker(true),
            ],
        });
    }

    #[test]
    fn existing_fragment_is_kept_on_first_boot() {
        let inputs = Inputs {
            output_class: FragmentState::Current,
            has_changed: true,
            first_boot: true,
            ..hybrid(PolicyMode::On, 470)
        };

        assert!(!decide(&inputs).effects.iter().any(|e| matches!(e, Effect::WritePrimeOutputClass(_))));
    }

    #[test]
    fn stale_fragment_is_rewritten_on_first_boot() {
        let inputs = Inputs {
            output_class: FragmentState::Stale,
            first_boot: true,
            ..hybrid(PolicyMode::On, 470)
        };
        assert!(decide(&inputs).effects.contains(&Effect::WritePrimeOutputClass(nvidia())));

        let inputs = Inputs {
            offload_layout: FragmentState::Stale,
            first_boot: true,
            ..hybrid(PolicyMode::OnDemand, 470)
        };
        assert!(decide(&inputs).effects.contains(&Effect::WriteOffloadLayout));
    }

    #[test]
    fn existing_fragment_is_rewritten_after_change() {
        let inputs =
            Inputs { output_class: FragmentState::Current, has_changed: true, ..hybrid(PolicyMode::On, 470) };

        assert!(decide(&inputs).effects.contains(&Effect::WritePrimeOutputClass(nvidia())));
    }

    #[test]
    fn off_unloads_driver() {
        let inputs = Inputs { output_class: FragmentState::Current, ..hybrid(PolicyMode::Off, 470) };

        assert_eq!(decide(&inputs), Decision {
            mode:    OperatingMode::IntegratedOnly,
            effects: vec![
                Effect::RemoveFragment(Fragment::PrimeOutputClass),
                Effect::UnloadDiscreteStack,
                runtime_pm(true),
                Effect::SetOffloadingMarker(true),
            ],
        });
    }

    #[test]
    fn off_is_idempotent() {
        let mut inputs = hybrid(PolicyMode::Off, 470);
        let first = decide(&inputs);
        assert!(first.effects.contains(&Effect::UnloadDiscreteStack));

        inputs.modules.nvidia_loaded = false;
        let second = decide(&inputs);
        assert_eq!(second.mode, first.mode);
        assert!(!second.effects.contains(&Effect::UnloadDiscreteStack));
    }

    #[test]
    fn nouveau_blocks_prime() {
        let mut inputs = hybrid(PolicyMode::OnDemand, 470);
        inputs.modules.nvidia_loaded = false;
        inputs.modules.nouveau_loaded = true;
        inputs.offload_layout = FragmentState::Current;

        assert_eq!(decide(&inputs), Decision {
            mode:    OperatingMode::IntegratedOnly,
            effects: vec![
                Effect::RemoveFragment(Fragment::OffloadLayout),
                Effect::SetOffloadingMarker(true),
            ],
        });
    }

    #[test]
    fn blacklisted_without_offloading_is_muxed() {
        let mut inputs = hybrid(PolicyMode::On, 470);
        inputs.modules.nvidia_blacklisted = true;
        assert_eq!(decide(&inputs).mode, OperatingMode::DiscreteOnly);

        let mut inputs = hybrid(PolicyMode::On, 470);
        inputs.requires_offloading = false;
        inputs.modules.nvidia_loaded = false;
        assert_eq!(decide(&inputs).mode, OperatingMode::IntegratedOnly);
    }

    #[test]
    fn conflicting_drivers_count_as_change() {
        let mut inputs = hybrid(PolicyMode::On, 470);
        inputs.modules.nouveau_loaded = true;
        assert!(inputs.changed());

        inputs.modules.nouveau_loaded = false;
        inputs.has_changed = true;
        inputs.first_boot = true;
        assert!(!inputs.changed());
    }

    #[test]
    fn restores_powered_off_gpu() {
        let inputs = Inputs {
            devices: vec![intel()],
            offloading_was_required: true,
            requires_offloading: true,
            policy: PolicyMode::On,
            driver_major: Some(470),
            modules: ModuleStates { nvidia_unloaded: true, nvidia_available: true, ..ModuleStates::default() },
            eligibility: ELIGIBLE,
            residual_discrete: Some(nvidia()),
            ..Inputs::default()
        };

        let decision = decide(&inputs);
        assert_eq!(decision.mode, OperatingMode::PrimeOn);
        assert!(decision.effects.contains(&Effect::LoadModule("nvidia")));
        assert!(decision.effects.contains(&Effect::SetRuntimePm {
            device:      nvidia(),
            enabled:     false,
            eligibility: ELIGIBLE,
            on_bus:      false,
        }));

        let inputs = Inputs { policy: PolicyMode::Off, ..inputs };
        assert_eq!(decide(&inputs).mode, OperatingMode::IntegratedOnly);
    }

    #[test]
    fn powerxpress_follows_policy() {
        let inputs = |policy| Inputs {
            devices: vec![intel(), amd()],
            requires_offloading: true,
            policy,
            px_script_available: true,
            modules: ModuleStates { amdgpu_loaded: true, amdgpu_versioned: true, ..ModuleStates::default() },
            ..Inputs::default()
        };

        assert_eq!(decide(&inputs(PolicyMode::On)).mode, OperatingMode::PowerXpress(PxMode::Performance));
        assert_eq!(decide(&inputs(PolicyMode::Off)).mode, OperatingMode::PowerXpress(PxMode::PowerSaving));
        assert_eq!(
            decide(&inputs(PolicyMode::OnDemand)).effects[0],
            Effect::RunPxScript(PxMode::PowerSaving)
        );
    }

    #[test]
    fn powerxpress_reset_when_integrated_disappears() {
        let mut only = amd();
        only.is_boot_vga = true;

        let inputs = Inputs {
            devices: vec![only],
            last_boot_had_intel: true,
            px_script_available: true,
            modules: ModuleStates { amdgpu_loaded: true, amdgpu_versioned: true, ..ModuleStates::default() },
            ..Inputs::default()
        };

        assert_eq!(decide(&inputs).effects, vec![
            Effect::RunPxScript(PxMode::Reset),
            Effect::SetOffloadingMarker(false),
        ]);
    }
}
