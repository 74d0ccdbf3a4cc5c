use as_result::IntoResult;
use cascade::cascade;
use std::{io, process::Command};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchError {
    #[error("failed to run dpkg --print-architecture")]
    Dpkg(#[source] io::Error),
    #[error("the {} architecture is not supported", _0)]
    Unsupported(String),
}

/// The multiarch library directory of the system's primary architecture.
pub fn multiarch_triplet(fake_architecture: Option<&str>) -> Result<&'static str, ArchError> {
    let arch = match fake_architecture {
        Some(arch) => arch.to_owned(),
        None => dpkg_architecture()?,
    };

    info!("Architecture: {}", arch);
    triplet(&arch).ok_or(ArchError::Unsupported(arch))
}

fn dpkg_architecture() -> Result<String, ArchError> {
    let mut cmd = cascade! {
        Command::new("dpkg");
        ..arg("--print-architecture");
    };

    let output = cmd.output().and_then(IntoResult::into_result).map_err(ArchError::Dpkg)?;

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

fn triplet(arch: &str) -> Option<&'static str> {
    match arch {
        "amd64" => Some("x86_64-linux-gnu"),
        "i386" => Some("i386-linux-gnu"),
        "arm64" => Some("aarch64-linux-gnu"),
        _ => None,
    }
}
