//! A bounded walk of the PCI capability list in configuration space.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

const PCI_HEADER_TYPE: usize = 0x0e;
const PCI_HEADER_TYPE_CARDBUS: u8 = 2;
const PCI_STATUS: usize = 0x06;
const PCI_STATUS_CAP_LIST: u8 = 0x10;
const PCI_CAPABILITY_LIST: usize = 0x34;
const PCI_CB_CAPABILITY_LIST: usize = 0x14;

const PCI_CAP_ID_PM: u8 = 0x01;
const PCI_PM_CAP_OFFSET: usize = 2;
const PCI_PM_CAP_PME_D3HOT: u16 = 0x4000;
const PCI_PM_CAP_PME_D3COLD: u16 = 0x8000;

const CONFIG_SPACE_SIZE: usize = 256;

/// Power management states a device claims to support.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CapabilityInfo {
    pub supports_d3hot:  bool,
    pub supports_d3cold: bool,
}

/// A source of configuration space bytes.
pub trait ConfigSource {
    /// Reads bytes from `offset` into `buf`, returning how many were read.
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize>;
}

impl ConfigSource for File {
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset as u64)
    }
}

impl ConfigSource for Vec<u8> {
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len() {
            return Ok(0);
        }

        let available = &self[offset..];
        let read = available.len().min(buf.len());
        buf[..read].copy_from_slice(&available[..read]);
        Ok(read)
    }
}

/// A lazily filled cache over a device's configuration space.
pub struct ConfigSpace<S> {
    source: S,
    cache:  Vec<u8>,
}

impl ConfigSpace<File> {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        // Reading the header up front surfaces permission problems here.
        let mut header = [0u8; 64];
        file.read_exact(&mut header)?;
        Ok(ConfigSpace { source: file, cache: header.to_vec() }.with_cardbus_header())
    }
}

impl<S: ConfigSource> ConfigSpace<S> {
    pub fn new(mut source: S) -> Self {
        let mut header = vec![0u8; 64];
        let read = source.read_at(0, &mut header).unwrap_or(0);
        header.truncate(read);
        ConfigSpace { source, cache: header }.with_cardbus_header()
    }

    fn header_type(&self) -> u8 { self.cache.get(PCI_HEADER_TYPE).map_or(0, |b| b & 0x7f) }

    /// CardBus bridges keep their capability pointer past the standard header.
    fn with_cardbus_header(mut self) -> Self {
        if self.header_type() == PCI_HEADER_TYPE_CARDBUS {
            self.grow_to(128);
        }
        self
    }

    /// Extends the cache to cover `len` bytes, doubling up to the size of configuration space.
    fn grow_to(&mut self, len: usize) -> bool {
        if len <= self.cache.len() {
            return true;
        }

        let mut size = self.cache.len().max(64);
        while size < len && size < CONFIG_SPACE_SIZE {
            size *= 2;
        }

        let size = size.min(CONFIG_SPACE_SIZE);
        if size < len {
            return false;
        }

        let start = self.cache.len();
        let mut extra = vec![0u8; size - start];
        let read = match self.source.read_at(start, &mut extra) {
            Ok(read) => read,
            Err(why) => {
                debug!("configuration space read at {:#x} failed: {}", start, why);
                return false;
            }
        };

        extra.truncate(read);
        self.cache.extend_from_slice(&extra);
        self.cache.len() >= len
    }

    fn byte(&mut self, offset: usize) -> Option<u8> {
        if self.grow_to(offset + 1) {
            self.cache.get(offset).copied()
        } else {
            None
        }
    }

    fn word(&mut self, offset: usize) -> Option<u16> {
        let low = self.byte(offset)?;
        let high = self.byte(offset + 1)?;
        Some(u16::from_le_bytes([low, high]))
    }

    /// Locates a capability by its ID, returning its offset.
    pub fn find_capability(&mut self, cap_id: u8) -> Option<usize> {
        if self.byte(PCI_STATUS)? & PCI_STATUS_CAP_LIST == 0 {
            return None;
        }

        let pointer = if self.header_type() == PCI_HEADER_TYPE_CARDBUS {
            PCI_CB_CAPABILITY_LIST
        } else {
            PCI_CAPABILITY_LIST
        };

        let mut visited = [false; CONFIG_SPACE_SIZE];
        let mut offset = usize::from(self.byte(pointer)? & !3);

        while offset != 0 {
            if visited[offset] {
                warn!("PCI capability list loops back to {:#x}", offset);
                return None;
            }
            visited[offset] = true;

            let id = self.byte(offset)?;
            if id == 0xff {
                return None;
            }

            if id == cap_id {
                return Some(offset);
            }

            offset = usize::from(self.byte(offset + 1)? & !3);
        }

        None
    }

    pub fn power_management(&mut self) -> CapabilityInfo {
        let pmc = self
            .find_capability(PCI_CAP_ID_PM)
            .and_then(|offset| self.word(offset + PCI_PM_CAP_OFFSET));

        match pmc {
            Some(pmc) => CapabilityInfo {
                supports_d3hot:  pmc & PCI_PM_CAP_PME_D3HOT != 0,
                supports_d3cold: pmc & PCI_PM_CAP_PME_D3COLD != 0,
            },
            None => CapabilityInfo::default(),
        }
    }
}
