//! Every path and flag the manager consults, bundled once at startup.
//!
//! Production defaults come from `Config::default()`. Each path can be pointed at a
//! fixture from the command line, which is how the whole pipeline is exercised
//! without root or real hardware.

use std::path::PathBuf;

pub const LAST_BOOT: &str = "/var/lib/pop-gpu-manager/last_gfx_boot";
pub const OFFLOADING_MARKER: &str = "/var/lib/pop-gpu-manager/requires_offloading";
pub const PRIME_SETTINGS: &str = "/etc/prime-discrete";
pub const RUNTIMEPM_OVERRIDE: &str = "/etc/u-d-c-nvidia-runtimepm-override";
pub const RUNTIMEPM_CONF: &str = "/lib/modprobe.d/nvidia-runtimepm.conf";

#[derive(Clone, Debug)]
pub struct Config {
    /// Skip every privileged action, reporting success instead.
    pub dry_run: bool,

    pub last_boot_file: PathBuf,
    /// Where the current snapshot is written; usually the same as `last_boot_file`.
    pub new_boot_file: PathBuf,
    pub offloading_marker: PathBuf,

    /// A snapshot-formatted file that replaces the sysfs scan.
    pub fake_lspci: Option<PathBuf>,
    pub fake_requires_offloading: Option<bool>,
    pub fake_module_available: Option<bool>,
    pub fake_module_versioned: bool,
    pub fake_architecture: Option<String>,

    pub modules_path: PathBuf,
    pub modprobe_d_paths: Vec<PathBuf>,
    pub gpu_detection_path: PathBuf,
    pub prime_settings: PathBuf,
    pub nvidia_driver_version_path: PathBuf,

    pub xorg_conf_d_path: PathBuf,
    pub xorg_layout_d_path: PathBuf,

    pub runtimepm_conf_path: PathBuf,
    pub runtimepm_override_path: PathBuf,
    pub nvidia_doc_path: PathBuf,
    pub nvidia_proc_gpus_path: PathBuf,
    pub chassis_type_path: PathBuf,
    pub kernel_release_path: PathBuf,

    pub sysfs_pci_path: PathBuf,
    pub udev_queue_path: PathBuf,
    pub kernel_cmdline_path: PathBuf,
    pub amdgpu_pro_px_file: PathBuf,

    /// Display servers that may pin the discrete driver, in lookup order.
    pub display_servers: Vec<String>,
    /// The account the login screen's display server runs as.
    pub session_user: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dry_run: false,
            last_boot_file: PathBuf::from(LAST_BOOT),
            new_boot_file: PathBuf::from(LAST_BOOT),
            offloading_marker: PathBuf::from(OFFLOADING_MARKER),
            fake_lspci: None,
            fake_requires_offloading: None,
            fake_module_available: None,
            fake_module_versioned: false,
            fake_architecture: None,
            modules_path: PathBuf::from("/proc/modules"),
            modprobe_d_paths: vec![
                PathBuf::from("/etc/modprobe.d"),
                PathBuf::from("/lib/modprobe.d"),
            ],
            gpu_detection_path: PathBuf::from("/run"),
            prime_settings: PathBuf::from(PRIME_SETTINGS),
            nvidia_driver_version_path: PathBuf::from("/sys/module/nvidia/version"),
            xorg_conf_d_path: PathBuf::from("/usr/share/X11/xorg.conf.d"),
            xorg_layout_d_path: PathBuf::from("/etc/X11/xorg.conf.d"),
            runtimepm_conf_path: PathBuf::from(RUNTIMEPM_CONF),
            runtimepm_override_path: PathBuf::from(RUNTIMEPM_OVERRIDE),
            nvidia_doc_path: PathBuf::from("/usr/share/doc"),
            nvidia_proc_gpus_path: PathBuf::from("/proc/driver/nvidia/gpus"),
            chassis_type_path: PathBuf::from("/sys/devices/virtual/dmi/id/chassis_type"),
            kernel_release_path: PathBuf::from("/proc/sys/kernel/osrelease"),
            sysfs_pci_path: PathBuf::from("/sys/bus/pci/devices"),
            udev_queue_path: PathBuf::from("/run/udev/queue"),
            kernel_cmdline_path: PathBuf::from("/proc/cmdline"),
            amdgpu_pro_px_file: PathBuf::from("/opt/amdgpu-pro/bin/amdgpu-pro-px"),
            display_servers: vec!["Xorg".into(), "Xwayland".into()],
            session_user: "gdm".into(),
        }
    }
}

impl Config {
    /// A configuration whose every path lives beneath `root`, for fixtures.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        let at = |path: &str| root.join(path);

        Config {
            dry_run: false,
            last_boot_file: at("last_gfx_boot"),
            new_boot_file: at("last_gfx_boot"),
            offloading_marker: at("requires_offloading"),
            fake_lspci: None,
            fake_requires_offloading: None,
            fake_module_available: None,
            fake_module_versioned: false,
            fake_architecture: Some("amd64".into()),
            modules_path: at("modules"),
            modprobe_d_paths: vec![at("modprobe.d")],
            gpu_detection_path: at("run"),
            prime_settings: at("prime-discrete"),
            nvidia_driver_version_path: at("nvidia-version"),
            xorg_conf_d_path: at("xorg.conf.d"),
            xorg_layout_d_path: at("etc-xorg.conf.d"),
            runtimepm_conf_path: at("nvidia-runtimepm.conf"),
            runtimepm_override_path: at("runtimepm-override"),
            nvidia_doc_path: at("doc"),
            nvidia_proc_gpus_path: at("nvidia-gpus"),
            chassis_type_path: at("chassis_type"),
            kernel_release_path: at("osrelease"),
            sysfs_pci_path: at("pci-devices"),
            udev_queue_path: at("udev-queue"),
            kernel_cmdline_path: at("cmdline"),
            amdgpu_pro_px_file: at("amdgpu-pro-px"),
            display_servers: vec!["Xorg".into()],
            session_user: "gdm".into(),
        }
    }
}
