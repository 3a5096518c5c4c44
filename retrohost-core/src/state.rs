//! Opaque core save states.

use std::path::Path;

use tracing::debug;

use crate::core::Core;
use crate::error::{HostError, HostResult};

/// A serialized machine snapshot.
///
/// The bytes are whatever the core produced; their length is fixed by the
/// core once a game is loaded. On disk the blob is stored raw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreState {
    data: Vec<u8>,
}

impl CoreState {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot the core's current machine state.
    pub fn capture<C: Core + ?Sized>(core: &mut C) -> HostResult<Self> {
        let mut data = vec![0u8; core.state_size()?];
        core.save_state(&mut data)?;
        debug!(bytes = data.len(), "captured core state");
        Ok(Self { data })
    }

    /// Put the core back into this snapshot.
    ///
    /// The length is checked against the core's current state size before
    /// the core is touched.
    pub fn restore_into<C: Core + ?Sized>(&self, core: &mut C) -> HostResult<()> {
        let expected = core.state_size()?;
        if expected != self.data.len() {
            return Err(HostError::StateSizeMismatch {
                expected,
                actual: self.data.len(),
            });
        }
        core.restore_state(&self.data)
    }

    /// Read a state file. A missing file yields an empty state.
    pub fn load(path: &Path) -> HostResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(Self {
            data: std::fs::read(path)?,
        })
    }

    pub fn save(&self, path: &Path) -> HostResult<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessCore;

    #[test]
    fn test_capture_and_restore() {
        let mut core = HeadlessCore::new(0x100);
        core.load_game("game", vec![0; 16]).unwrap();
        core.memory_map_mut().write(0, &[1, 2, 3]).unwrap();
        let state = CoreState::capture(&mut core).unwrap();

        core.memory_map_mut().write(0, &[9, 9, 9]).unwrap();
        state.restore_into(&mut core).unwrap();
        assert_eq!(core.memory_map().read(0, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_restore_rejects_wrong_size() {
        let mut core = HeadlessCore::new(0x100);
        core.load_game("game", vec![0; 16]).unwrap();
        let expected = core.state_size().unwrap();

        let state = CoreState::from_bytes(vec![0; 3]);
        match state.restore_into(&mut core) {
            Err(HostError::StateSizeMismatch { expected: e, actual: 3 }) => assert_eq!(e, expected),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        assert!(CoreState::load(&path).unwrap().is_empty());

        CoreState::from_bytes(vec![4, 5, 6]).save(&path).unwrap();
        assert_eq!(CoreState::load(&path).unwrap().as_bytes(), &[4, 5, 6]);
    }
}
