#[macro_use]
extern crate log;

mod logging;

use crate::logging::setup_logging;
use clap::{App, Arg, ArgMatches};
use pop_gpu_manager::{actions::HostActions, config::Config, manager::Manager, misc::format_error};
use std::path::{Path, PathBuf};

/// Flags which replace one path of the configuration, usually with a test fixture.
const PATH_FLAGS: &[(&str, &str)] = &[
    ("last-boot-file", "snapshot of the graphics devices seen during the last boot"),
    ("new-boot-file", "where to record the graphics devices seen during this boot"),
    ("fake-lspci", "read devices from a snapshot-formatted file instead of sysfs"),
    ("fake-modules-path", "a file in the format of /proc/modules"),
    ("gpu-detection-path", "directory holding the u-d-c-* markers"),
    ("prime-settings", "the PRIME policy file"),
    ("nvidia-driver-version-path", "file holding the loaded NVIDIA driver version"),
    ("xorg-conf-d-path", "directory for the OutputClass fragment"),
    ("xorg-layout-d-path", "directory for the ServerLayout fragment"),
    ("runtimepm-conf-path", "modprobe snippet enabling NVIDIA dynamic power management"),
    ("runtimepm-override-path", "marker which forces runtime D3 support"),
    ("nvidia-doc-path", "directory containing nvidia-driver-*/supported-gpus.json"),
    ("chassis-type-path", "DMI chassis type"),
    ("kernel-release-path", "kernel release string"),
    ("nvidia-proc-gpus-path", "the NVIDIA driver's per-GPU procfs directory"),
    ("sysfs-pci-path", "directory of PCI devices"),
    ("udev-queue-path", "file which exists while udev is processing events"),
    ("kernel-cmdline-path", "kernel command line"),
    ("amdgpu-pro-px-file", "the amdgpu-pro PowerXpress helper"),
    ("offloading-marker-path", "marker recording that offloading was required"),
];

fn main() {
    let mut app = App::new("pop-gpu-manager")
        .about("Configures hybrid graphics at boot")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(Arg::with_name("log").help("log to this file").long("log").takes_value(true))
        .arg(
            Arg::with_name("backup-log")
                .help("move an existing log file to <log>.old first")
                .long("backup-log"),
        )
        .arg(
            Arg::with_name("dry-run")
                .help("decide what to do, without loading or unloading modules")
                .long("dry-run"),
        )
        .arg(
            Arg::with_name("fake-requires-offloading")
                .long("fake-requires-offloading")
                .conflicts_with("fake-no-requires-offloading"),
        )
        .arg(Arg::with_name("fake-no-requires-offloading").long("fake-no-requires-offloading"))
        .arg(
            Arg::with_name("fake-module-is-available")
                .long("fake-module-is-available")
                .conflicts_with("fake-module-is-not-available"),
        )
        .arg(Arg::with_name("fake-module-is-not-available").long("fake-module-is-not-available"))
        .arg(Arg::with_name("fake-module-is-versioned").long("fake-module-is-versioned"))
        .arg(
            Arg::with_name("fake-architecture")
                .help("architecture as dpkg would print it")
                .long("fake-architecture")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("modprobe-d-path")
                .help("modprobe configuration directory searched for blacklists")
                .long("modprobe-d-path")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::with_name("display-server")
                .help("process name of a display server which may hold the NVIDIA driver")
                .long("display-server")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::with_name("session-user")
                .help("account the login screen's display server runs as")
                .long("session-user")
                .takes_value(true),
        );

    for &(name, help) in PATH_FLAGS {
        app = app.arg(Arg::with_name(name).help(help).long(name).takes_value(true));
    }

    let matches = app.get_matches();

    let log = matches.value_of_os("log").map(Path::new);
    if let Err(why) = setup_logging(log::LevelFilter::Debug, log, matches.is_present("backup-log"))
    {
        eprintln!("failed to set up logging: {}", why);
    }

    let config = config_from(&matches);

    info!("pop-gpu-manager {}", env!("CARGO_PKG_VERSION"));
    info!("last boot: {}", config.last_boot_file.display());
    info!("new boot: {}", config.new_boot_file.display());

    let mut actions = HostActions::new(&config);
    match Manager::new(&config, &mut actions).run() {
        Ok(mode) => info!("Finished in {} mode", mode),
        Err(why) => error!("{}", format_error(&why)),
    }
}

fn config_from(matches: &ArgMatches) -> Config {
    let mut config = Config::default();
    let path = |name: &str| matches.value_of_os(name).map(PathBuf::from);

    config.dry_run = matches.is_present("dry-run");

    if let Some(last_boot) = path("last-boot-file") {
        // Unless told otherwise, the snapshot is updated in place.
        if !matches.is_present("new-boot-file") {
            config.new_boot_file = last_boot.clone();
        }
        config.last_boot_file = last_boot;
    }

    let overrides: &mut [(&str, &mut PathBuf)] = &mut [
        ("new-boot-file", &mut config.new_boot_file),
        ("fake-modules-path", &mut config.modules_path),
        ("gpu-detection-path", &mut config.gpu_detection_path),
        ("prime-settings", &mut config.prime_settings),
        ("nvidia-driver-version-path", &mut config.nvidia_driver_version_path),
        ("xorg-conf-d-path", &mut config.xorg_conf_d_path),
        ("xorg-layout-d-path", &mut config.xorg_layout_d_path),
        ("runtimepm-conf-path", &mut config.runtimepm_conf_path),
        ("runtimepm-override-path", &mut config.runtimepm_override_path),
        ("nvidia-doc-path", &mut config.nvidia_doc_path),
        ("chassis-type-path", &mut config.chassis_type_path),
        ("kernel-release-path", &mut config.kernel_release_path),
        ("nvidia-proc-gpus-path", &mut config.nvidia_proc_gpus_path),
        ("sysfs-pci-path", &mut config.sysfs_pci_path),
        ("udev-queue-path", &mut config.udev_queue_path),
        ("kernel-cmdline-path", &mut config.kernel_cmdline_path),
        ("amdgpu-pro-px-file", &mut config.amdgpu_pro_px_file),
        ("offloading-marker-path", &mut config.offloading_marker),
    ];

    for (name, target) in overrides.iter_mut() {
        if let Some(value) = path(*name) {
            **target = value;
        }
    }

    config.fake_lspci = path("fake-lspci");

    config.fake_requires_offloading = if matches.is_present("fake-requires-offloading") {
        Some(true)
    } else if matches.is_present("fake-no-requires-offloading") {
        Some(false)
    } else {
        None
    };

    config.fake_module_available = if matches.is_present("fake-module-is-available") {
        Some(true)
    } else if matches.is_present("fake-module-is-not-available") {
        Some(false)
    } else {
        None
    };

    config.fake_module_versioned = matches.is_present("fake-module-is-versioned");
    config.fake_architecture = matches.value_of("fake-architecture").map(String::from);

    if let Some(dirs) = matches.values_of_os("modprobe-d-path") {
        config.modprobe_d_paths = dirs.map(PathBuf::from).collect();
    }

    if let Some(servers) = matches.values_of("display-server") {
        config.display_servers = servers.map(String::from).collect();
    }

    if let Some(user) = matches.value_of("session-user") {
        config.session_user = user.to_owned();
    }

    config
}
