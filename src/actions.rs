//! Privileged operations on the host, behind one narrow interface.

use crate::{config::Config, engine::PxMode};
use as_result::{IntoResult, MapResult};
use cascade::cascade;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use procfs::process::Process;
use std::{
    collections::HashSet,
    fs, io,
    path::Path,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

/// Everything the manager does to the system goes through this trait.
pub trait SystemActions {
    fn load_module(&mut self, name: &str, params: Option<&str>) -> io::Result<()>;

    fn unload_module(&mut self, name: &str) -> io::Result<()>;

    /// Contents in the format of `/proc/modules`.
    fn module_listing(&mut self) -> io::Result<String>;

    fn module_available(&mut self, name: &str) -> bool;

    /// True if the installed module carries a version, as the amdgpu-pro module does.
    fn module_is_versioned(&mut self, name: &str) -> bool;

    /// Sends SIGTERM to the first display server in `servers` owned by `user`.
    ///
    /// Returns `false` if no such process was found.
    fn terminate_session(&mut self, servers: &[String], user: &str) -> io::Result<bool>;

    fn write_attribute(&mut self, path: &Path, value: &str) -> io::Result<()>;

    fn run_px_script(&mut self, script: &Path, mode: PxMode) -> io::Result<()>;
}

/// Acts on the real system. With `dry_run`, mutating actions are logged and skipped.
pub struct HostActions<'a> {
    config:    &'a Config,
    /// Modules whose unload was skipped by a dry run.
    unloaded:  HashSet<String>,
    exit_wait: Duration,
}

impl<'a> HostActions<'a> {
    pub fn new(config: &'a Config) -> Self {
        HostActions { config, unloaded: HashSet::new(), exit_wait: Duration::from_secs(5) }
    }

    fn dry_run(&self, what: &str) -> bool {
        if self.config.dry_run {
            info!("dry run: skipping {}", what);
        }

        self.config.dry_run
    }
}

impl<'a> SystemActions for HostActions<'a> {
    fn load_module(&mut self, name: &str, params: Option<&str>) -> io::Result<()> {
        info!("Loading {} with \"{}\" parameters", name, params.unwrap_or(""));

        if self.dry_run(&["modprobe ", name].concat()) {
            self.unloaded.remove(name);
            return Ok(());
        }

        let mut cmd = cascade! {
            Command::new("modprobe");
            ..arg(name);
        };

        if let Some(params) = params {
            cmd.args(params.split_whitespace());
        }

        cmd.status().map_result()
    }

    fn unload_module(&mut self, name: &str) -> io::Result<()> {
        info!("Unloading {}", name);

        if self.dry_run(&["rmmod ", name].concat()) {
            self.unloaded.insert(name.to_owned());
            return Ok(());
        }

        let mut cmd = cascade! {
            Command::new("rmmod");
            ..arg(name);
        };

        cmd.status().map_result()
    }

    fn module_listing(&mut self) -> io::Result<String> {
        let listing = fs::read_to_string(&self.config.modules_path)?;
        if self.unloaded.is_empty() {
            return Ok(listing);
        }

        let unloaded = &self.unloaded;
        Ok(listing
            .lines()
            .filter(|line| line.split_whitespace().next().map_or(true, |name| !unloaded.contains(name)))
            .map(|line| [line, "\n"].concat())
            .collect())
    }

    fn module_available(&mut self, name: &str) -> bool {
        if let Some(available) = self.config.fake_module_available {
            return available;
        }

        let mut cmd = cascade! {
            Command::new("modinfo");
            ..arg(name);
            ..stdout(Stdio::null());
            ..stderr(Stdio::null());
        };

        cmd.status().map_result().is_ok()
    }

    fn module_is_versioned(&mut self, name: &str) -> bool {
        if self.config.fake_module_versioned {
            return true;
        }

        let mut cmd = cascade! {
            Command::new("modinfo");
            ..args(&["-F", "version", name]);
            ..stderr(Stdio::null());
        };

        cmd.output()
            .and_then(IntoResult::into_result)
            .map_or(false, |output| !String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    fn terminate_session(&mut self, servers: &[String], user: &str) -> io::Result<bool> {
        let processes = procfs::process::all_processes()
            .map_err(|why| io::Error::new(io::ErrorKind::Other, why.to_string()))?;

        let session = servers.iter().find_map(|server| {
            processes.iter().find(|process| {
                process.stat.comm == *server && owned_by(process, user)
            })
        });

        let session = match session {
            Some(process) => process,
            None => {
                warn!("no display server owned by {} was found", user);
                return Ok(false);
            }
        };

        let pid = session.pid;
        info!("Terminating {} ({}) owned by {}", session.stat.comm, pid, user);

        if self.dry_run(&["kill ", &pid.to_string()].concat()) {
            return Ok(true);
        }

        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|why| io::Error::new(io::ErrorKind::Other, why))?;

        let mut waited = Duration::from_millis(0);
        let step = Duration::from_millis(100);
        while Process::new(pid).is_ok() {
            if waited >= self.exit_wait {
                warn!("{} did not exit within {:?}", pid, self.exit_wait);
                break;
            }

            thread::sleep(step);
            waited += step;
        }

        Ok(true)
    }

    fn write_attribute(&mut self, path: &Path, value: &str) -> io::Result<()> {
        info!("Writing {:?} to {}", value.trim(), path.display());

        if self.dry_run(&["write to ", &path.display().to_string()].concat()) {
            return Ok(());
        }

        fs::write(path, value)
    }

    fn run_px_script(&mut self, script: &Path, mode: PxMode) -> io::Result<()> {
        let args: &[&str] = match mode {
            PxMode::PowerSaving => &["--mode", "powersaving"],
            PxMode::Performance => &["--mode", "performance"],
            PxMode::Reset => &["--reset"],
        };

        info!("Running {} {}", script.display(), args.join(" "));

        if self.dry_run(&script.display().to_string()) {
            return Ok(());
        }

        let mut cmd = cascade! {
            Command::new(script);
            ..args(args);
        };

        cmd.status().map_result()
    }
}

/// Compares the real UID of a process against the account name in the password database.
fn owned_by(process: &Process, user: &str) -> bool {
    let uid = match process.status() {
        Ok(status) => status.ruid,
        Err(_) => return false,
    };

    users::get_user_by_uid(uid).map_or(false, |owner| owner.name() == user)
}
