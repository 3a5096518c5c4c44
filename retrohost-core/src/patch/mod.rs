//! Two-tier patch store.
//!
//! Edits are kept in four independent pools: temporary or persisted, for
//! RAM or ROM addresses. Temporary pools hold edits that only matter for the
//! running session (cheats, forced jumps); persisted pools are the project's
//! real modifications and round-trip to disk.

mod pool;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HostResult;

pub use pool::{PatchPool, PatchRegion};

/// Whether a patch survives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Durability {
    Temporary,
    Persisted,
}

/// Which address space a patch applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressKind {
    Ram,
    Rom,
}

impl AddressKind {
    /// Name used in persisted file names.
    pub fn file_tag(self) -> &'static str {
        match self {
            Self::Ram => "Ram",
            Self::Rom => "Rom",
        }
    }
}

/// The four patch pools of a session.
#[derive(Debug, Clone, Default)]
pub struct PatchLayer {
    temporary_ram: PatchPool,
    temporary_rom: PatchPool,
    persisted_ram: PatchPool,
    persisted_rom: PatchPool,
}

impl PatchLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self, durability: Durability, kind: AddressKind) -> &PatchPool {
        match (durability, kind) {
            (Durability::Temporary, AddressKind::Ram) => &self.temporary_ram,
            (Durability::Temporary, AddressKind::Rom) => &self.temporary_rom,
            (Durability::Persisted, AddressKind::Ram) => &self.persisted_ram,
            (Durability::Persisted, AddressKind::Rom) => &self.persisted_rom,
        }
    }

    fn pool_mut(&mut self, durability: Durability, kind: AddressKind) -> &mut PatchPool {
        match (durability, kind) {
            (Durability::Temporary, AddressKind::Ram) => &mut self.temporary_ram,
            (Durability::Temporary, AddressKind::Rom) => &mut self.temporary_rom,
            (Durability::Persisted, AddressKind::Ram) => &mut self.persisted_ram,
            (Durability::Persisted, AddressKind::Rom) => &mut self.persisted_rom,
        }
    }

    pub fn insert(&mut self, durability: Durability, kind: AddressKind, address: u32, bytes: &[u8]) {
        self.pool_mut(durability, kind).insert(address, bytes);
    }

    /// Empty both temporary pools. Persisted pools are untouched.
    pub fn clear_temporary(&mut self) {
        self.temporary_ram.clear();
        self.temporary_rom.clear();
    }

    /// Replace a persisted pool with the contents of `path` (empty if absent).
    pub fn load_persisted(&mut self, kind: AddressKind, path: &Path) -> HostResult<()> {
        *self.pool_mut(Durability::Persisted, kind) = PatchPool::load(path)?;
        Ok(())
    }

    pub fn save_persisted(&self, kind: AddressKind, path: &Path) -> HostResult<()> {
        self.pool(Durability::Persisted, kind).save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_are_independent() {
        let mut layer = PatchLayer::new();
        layer.insert(Durability::Temporary, AddressKind::Ram, 0x10, &[1]);
        layer.insert(Durability::Persisted, AddressKind::Ram, 0x10, &[2]);
        layer.insert(Durability::Temporary, AddressKind::Rom, 0x10, &[3]);

        let first = |d, k| layer.pool(d, k).regions().next().map(|r| r.bytes[0]);
        assert_eq!(first(Durability::Temporary, AddressKind::Ram), Some(1));
        assert_eq!(first(Durability::Persisted, AddressKind::Ram), Some(2));
        assert_eq!(first(Durability::Temporary, AddressKind::Rom), Some(3));
        assert_eq!(first(Durability::Persisted, AddressKind::Rom), None);
    }

    #[test]
    fn test_clear_temporary_keeps_persisted() {
        let mut layer = PatchLayer::new();
        layer.insert(Durability::Temporary, AddressKind::Ram, 0, &[1]);
        layer.insert(Durability::Temporary, AddressKind::Rom, 0, &[1]);
        layer.insert(Durability::Persisted, AddressKind::Rom, 0, &[1]);

        layer.clear_temporary();
        assert!(layer.pool(Durability::Temporary, AddressKind::Ram).is_empty());
        assert!(layer.pool(Durability::Temporary, AddressKind::Rom).is_empty());
        assert_eq!(layer.pool(Durability::Persisted, AddressKind::Rom).len(), 1);
    }
}
