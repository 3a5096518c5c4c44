//! Checksum strategies run over the ROM image during reset.

use crate::error::HostResult;
use crate::memory::{MemoryAccess, ReadKind};

/// Bytes to write into the ROM image so its embedded checksum stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumPatch {
    pub address: u32,
    pub bytes: Vec<u8>,
}

/// Recomputes a system's ROM checksum from the current memory view.
///
/// Returning `Ok(None)` means the image needs no fix-up.
pub trait ChecksumRecalculator {
    fn recalculate(&self, memory: &dyn MemoryAccess) -> HostResult<Option<ChecksumPatch>>;
}

/// Mega Drive header checksum: 16-bit word sum of the image from `0x200`,
/// stored at `0x18E` in machine order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MegadriveChecksum;

impl MegadriveChecksum {
    pub const SUM_START: usize = 0x200;
    pub const HEADER_ADDRESS: u32 = 0x18E;
}

impl ChecksumRecalculator for MegadriveChecksum {
    fn recalculate(&self, memory: &dyn MemoryAccess) -> HostResult<Option<ChecksumPatch>> {
        let size = memory.rom_size();
        if size < Self::HEADER_ADDRESS as usize + 2 {
            return Ok(None);
        }
        let rom = memory.read_bytes(ReadKind::Rom, 0, size)?;

        // A trailing odd byte is not part of any word.
        let sum = (Self::SUM_START..size.saturating_sub(1))
            .step_by(2)
            .fold(0u16, |acc, at| acc.wrapping_add(memory.fetch_u16(&rom, at)));

        let mut bytes = vec![0u8; 2];
        memory.store_u16(&mut bytes, 0, sum);
        Ok(Some(ChecksumPatch {
            address: Self::HEADER_ADDRESS,
            bytes,
        }))
    }
}
