//! The per-boot device fingerprint, persisted one device per line:
//!
//! ```text
//! 8086:3e9b;0000:00:02:0;1
//! 10de:1f91;0000:01:00:0;0
//! ```
//!
//! Comparison between boots is positional. The same devices enumerated in a different
//! bus order count as a change, which forces reconfiguration after some firmware
//! updates renumber buses.

use crate::pci::{BusId, DeviceRecord, MAX_CARDS};
use std::{
    fs::File,
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to create the device snapshot at {:?}", _0)]
    Create(PathBuf, #[source] io::Error),
    #[error("failed to read the device snapshot at {:?}", _0)]
    Read(PathBuf, #[source] io::Error),
    #[error("failed to write the device snapshot at {:?}", _0)]
    Write(PathBuf, #[source] io::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileStatus {
    Existed,
    /// No prior boot was recorded; the file now holds a placeholder record.
    CreatedFresh,
}

/// Reads the snapshot at `path`, seeding it with a placeholder on the first run.
pub fn load(path: &Path) -> Result<(Vec<DeviceRecord>, FileStatus), SnapshotError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(why) if why.kind() == io::ErrorKind::NotFound => {
            info!("{} not found, creating it", path.display());
            let placeholder = vec![DeviceRecord::default()];
            crate::misc::write_creating_parent(path, serialize(&placeholder).as_bytes())
                .map_err(|why| SnapshotError::Create(path.to_owned(), why))?;
            return Ok((placeholder, FileStatus::CreatedFresh));
        }
        Err(why) => return Err(SnapshotError::Read(path.to_owned(), why)),
    };

    let records = parse(BufReader::new(file))
        .map_err(|why| SnapshotError::Read(path.to_owned(), why))?;

    Ok((records, FileStatus::Existed))
}

/// Reads records from any line source, skipping lines that don't parse.
pub fn parse<R: BufRead>(reader: R) -> io::Result<Vec<DeviceRecord>> {
    let mut records = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_record(line) {
            Some(record) => {
                if records.len() == MAX_CARDS {
                    warn!("ignoring snapshot records past {}", MAX_CARDS);
                    break;
                }

                records.push(record);
            }
            None => debug!("skipping malformed snapshot line: {}", line),
        }
    }

    Ok(records)
}

/// Parses `vvvv:dddd;dddd:bb:ss:f;b`.
fn parse_record(line: &str) -> Option<DeviceRecord> {
    let mut fields = line.split(';');
    let ids = fields.next()?;
    let address = fields.next()?;
    let flag = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    let (vendor, device) = ids.split_once(':')?;

    let mut address = address.split(':');
    let domain = address.next()?;
    let bus = address.next()?;
    let slot = address.next()?;
    let func = address.next()?;
    if address.next().is_some() {
        return None;
    }

    let is_boot_vga = match flag.trim() {
        "0" => false,
        "1" => true,
        _ => return None,
    };

    Some(DeviceRecord {
        vendor_id: u16::from_str_radix(vendor, 16).ok()?,
        device_id: u16::from_str_radix(device, 16).ok()?,
        bus_id: BusId {
            domain: u16::from_str_radix(domain, 16).ok()?,
            bus:    u8::from_str_radix(bus, 16).ok()?,
            slot:   u8::from_str_radix(slot, 16).ok()?,
            func:   u8::from_str_radix(func, 16).ok()?,
        },
        is_boot_vga,
        ..DeviceRecord::default()
    })
}

pub fn serialize(records: &[DeviceRecord]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&format!(
            "{:04x}:{:04x};{:04x}:{:02x}:{:02x}:{:x};{}\n",
            record.vendor_id,
            record.device_id,
            record.bus_id.domain,
            record.bus_id.bus,
            record.bus_id.slot,
            record.bus_id.func,
            record.is_boot_vga as u8
        ));
    }

    out
}

/// Overwrites the snapshot at `path` with `records`.
pub fn save(path: &Path, records: &[DeviceRecord]) -> Result<(), SnapshotError> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(path)?;
        file.write_all(serialize(records).as_bytes())?;
        file.flush()?;
        file.sync_all()
    };

    write().map_err(|why| SnapshotError::Write(path.to_owned(), why))
}

/// True if the devices differ in count, or in identity at any position.
pub fn diff(old: &[DeviceRecord], new: &[DeviceRecord]) -> bool {
    old.len() != new.len() || old.iter().zip(new).any(|(old, new)| !old.same_identity(new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{INTEL, NVIDIA};
    use std::fs;

    fn hybrid() -> Vec<DeviceRecord> {
        vec![
            DeviceRecord {
                vendor_id: INTEL,
                device_id: 0x3e9b,
                bus_id: BusId { domain: 0, bus: 0, slot: 2, func: 0 },
                is_boot_vga: true,
                ..DeviceRecord::default()
            },
            DeviceRecord {
                vendor_id: NVIDIA,
                device_id: 0x1f91,
                bus_id: BusId { domain: 0, bus: 1, slot: 0, func: 0 },
                is_boot_vga: false,
                ..DeviceRecord::default()
            },
        ]
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_gfx_boot");

        save(&path, &hybrid()).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "8086:3e9b;0000:00:02:0;1\n10de:1f91;0000:01:00:0;0\n"
        );

        let (records, status) = load(&path).unwrap();
        assert_eq!(status, FileStatus::Existed);
        assert_eq!(records, hybrid());
    }

    #[test]
    fn first_boot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/last_gfx_boot");

        let (records, status) = load(&path).unwrap();
        assert_eq!(status, FileStatus::CreatedFresh);
        assert_eq!(records, vec![DeviceRecord::default()]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "0000:0000;0000:00:00:0;0\n");

        let (_, status) = load(&path).unwrap();
        assert_eq!(status, FileStatus::Existed);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let input = "garbage\n\
                     8086:3e9b;0000:00:02:0;1\n\
                     10de:1f91;0000:01:00;0\n\
                     10de:zzzz;0000:01:00:0;0\n\
                     10de:1f91;0000:01:00:0;7\n";

        let records = parse(input.as_bytes()).unwrap();
        assert_eq!(records, hybrid()[..1].to_vec());
    }

    #[test]
    fn record_limit() {
        let input = "8086:3e9b;0000:00:02:0;1\n".repeat(MAX_CARDS + 3);
        assert_eq!(parse(input.as_bytes()).unwrap().len(), MAX_CARDS);
    }

    #[test]
    fn diff_is_positional() {
        let a = hybrid();
        assert!(!diff(&a, &a));
        assert!(diff(&a, &a[..1]));
        assert!(diff(&a[..1], &a));

        let mut reordered = a.clone();
        reordered.reverse();
        assert!(diff(&a, &reordered));

        let mut moved = a.clone();
        moved[1].bus_id.bus = 2;
        assert!(diff(&a, &moved));

        let mut boot_vga = a.clone();
        boot_vga[0].is_boot_vga = false;
        assert!(diff(&a, &boot_vga));
    }

    #[test]
    fn outputs_are_not_part_of_identity() {
        let a = hybrid();
        let mut b = a.clone();
        b[0].connected_outputs = crate::pci::ConnectedOutputs::HasConnected;
        assert!(!diff(&a, &b));
    }

    #[test]
    fn garbage_against_garbage_is_unchanged() {
        let old = parse("not a snapshot\n".as_bytes()).unwrap();
        let new = parse("nor is this\n".as_bytes()).unwrap();
        assert!(!diff(&old, &new));
    }
}
