#![deny(clippy::all)]

#[macro_use]
extern crate fomat_macros;
#[macro_use]
extern crate log;

pub mod actions;
pub mod arch;
pub mod config;
pub mod engine;
pub mod manager;
pub mod misc;
pub mod modules;
pub mod pci;
pub mod policy;
pub mod power;
pub mod rtd3;
pub mod snapshot;
pub mod udev;
pub mod xorg;
