//! The memory access contract exposed to external tooling.

use serde::{Deserialize, Serialize};

use crate::error::HostResult;
use crate::patch::{AddressKind, Durability};

/// Which view a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Live machine memory, through the core's memory map.
    Ram,
    /// The host-owned game image.
    Rom,
}

/// Where a write lands and whether it survives the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Pending RAM edit, applied at the next reset, never saved.
    TemporaryRam,
    /// Pending ROM edit, applied at the next reset, never saved.
    TemporaryRom,
    /// RAM edit applied immediately and saved with the project.
    PersistedRam,
    /// ROM edit applied immediately and saved with the project.
    PersistedRom,
}

impl WriteKind {
    pub fn durability(self) -> Durability {
        match self {
            Self::TemporaryRam | Self::TemporaryRom => Durability::Temporary,
            Self::PersistedRam | Self::PersistedRom => Durability::Persisted,
        }
    }

    pub fn address_kind(self) -> AddressKind {
        match self {
            Self::TemporaryRam | Self::PersistedRam => AddressKind::Ram,
            Self::TemporaryRom | Self::PersistedRom => AddressKind::Rom,
        }
    }
}

/// Byte order of the emulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            Self::Little => u16::from_le_bytes(raw),
            Self::Big => u16::from_be_bytes(raw),
        }
    }

    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            Self::Little => u32::from_le_bytes(raw),
            Self::Big => u32::from_be_bytes(raw),
        }
    }

    pub fn write_u16(self, bytes: &mut [u8], value: u16) {
        let raw = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        bytes[..2].copy_from_slice(&raw);
    }

    pub fn write_u32(self, bytes: &mut [u8], value: u32) {
        let raw = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        bytes[..4].copy_from_slice(&raw);
    }
}

/// Virtual memory of a hosted machine.
///
/// This is the only surface game-specific tooling sees: it reads RAM or ROM
/// and writes with a durability policy, without knowing how the core lays
/// its buffers out or when patches are applied.
pub trait MemoryAccess {
    /// Read `length` bytes at `address`.
    fn read_bytes(&self, kind: ReadKind, address: u32, length: usize) -> HostResult<Vec<u8>>;

    /// Write `bytes` at `address` with the given policy.
    fn write_bytes(&mut self, kind: WriteKind, address: u32, bytes: &[u8]) -> HostResult<()>;

    /// Size of the loaded game image in bytes.
    fn rom_size(&self) -> usize;

    /// Byte order of the emulated machine.
    fn endian(&self) -> Endian;

    /// Read a 16-bit value at `offset` of `bytes` in machine order.
    fn fetch_u16(&self, bytes: &[u8], offset: usize) -> u16 {
        self.endian().read_u16(&bytes[offset..])
    }

    /// Read a 32-bit value at `offset` of `bytes` in machine order.
    fn fetch_u32(&self, bytes: &[u8], offset: usize) -> u32 {
        self.endian().read_u32(&bytes[offset..])
    }

    /// Store a 16-bit value at `offset` of `bytes` in machine order.
    fn store_u16(&self, bytes: &mut [u8], offset: usize, value: u16) {
        self.endian().write_u16(&mut bytes[offset..], value);
    }

    /// Store a 32-bit value at `offset` of `bytes` in machine order.
    fn store_u32(&self, bytes: &mut [u8], offset: usize, value: u32) {
        self.endian().write_u32(&mut bytes[offset..], value);
    }
}
