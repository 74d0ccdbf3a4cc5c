use std::{
    fmt::{self, Display, Formatter},
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to write the PRIME policy to {:?}", path)]
pub struct PolicyError {
    path:   PathBuf,
    #[source]
    source: io::Error,
}

/// The operator's choice for the discrete GPU, read from `/etc/prime-discrete`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PolicyMode {
    Off,
    On,
    OnDemand,
}

impl Default for PolicyMode {
    fn default() -> Self { PolicyMode::Off }
}

impl Display for PolicyMode {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.write_str(match self {
            PolicyMode::Off => "off",
            PolicyMode::On => "on",
            PolicyMode::OnDemand => "on-demand",
        })
    }
}

impl From<&str> for PolicyMode {
    fn from(input: &str) -> Self {
        let input = input.to_ascii_lowercase();
        if input.contains("on-demand") {
            PolicyMode::OnDemand
        } else if input.contains("on") {
            PolicyMode::On
        } else {
            PolicyMode::Off
        }
    }
}

/// Reads the policy file. Absent, unreadable, or unrecognized content is `Off`.
pub fn read(path: &Path) -> PolicyMode {
    if !crate::misc::exists_not_empty(path) {
        info!("No PRIME policy at {}. Assuming off", path.display());
        return PolicyMode::Off;
    }

    let mode = match fs::read_to_string(path) {
        Ok(contents) => PolicyMode::from(contents.lines().next().unwrap_or("")),
        Err(why) => {
            warn!("unable to read {}: {}", path.display(), why);
            PolicyMode::Off
        }
    };

    info!("PRIME policy: {}", mode);
    mode
}

pub fn write(path: &Path, mode: PolicyMode) -> Result<(), PolicyError> {
    info!("Setting the PRIME policy to {}", mode);
    crate::misc::write_creating_parent(path, [&mode.to_string(), "\n"].concat().as_bytes())
        .map_err(|source| PolicyError { path: path.to_owned(), source })
}
