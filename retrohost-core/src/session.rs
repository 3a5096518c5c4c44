//! Edit sessions.
//!
//! A [`Session`] ties one loaded core to its patch pools and its saved
//! machine state, and is the [`MemoryAccess`] handed to game tooling.
//!
//! Edits accumulate in the patch pools and are replayed by [`Session::reset`],
//! which rebuilds the machine in a fixed order:
//!
//! 1. temporary ROM patches into the image (when requested)
//! 2. checksum fix-up over the resulting image
//! 3. reload of the core, for systems that copy the image at load
//! 4. restore of the saved state
//! 5. temporary RAM patches (when requested)
//! 6. persisted RAM patches, then persisted ROM patches
//!
//! Persisted patches go last so neither the snapshot nor a temporary patch
//! can shadow them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::checksum::ChecksumRecalculator;
use crate::core::Core;
use crate::error::{HostError, HostResult};
use crate::memory::{Endian, MemoryAccess, ReadKind, WriteKind};
use crate::patch::{AddressKind, Durability, PatchLayer};
use crate::project::{md5_hex, Project};
use crate::state::CoreState;
use crate::system::SystemProfile;

/// Where a session is in its edit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No game loaded.
    Closed,
    /// Game loaded, nothing applied yet.
    Loaded,
    /// Writes made since the last reset.
    Patched,
    /// A reset started and did not finish; the machine is inconsistent.
    ResetInProgress,
    /// Reset completed; the machine reflects every pool.
    Ready,
}

/// Optional bounds on [`Session::auto_load_with`].
#[derive(Debug, Clone, Default)]
pub struct AutoLoadLimits {
    /// Give up after this many frames.
    pub max_frames: Option<u64>,
    /// Give up once this flag is set; checked between frames.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl AutoLoadLimits {
    pub fn with_max_frames(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn exceeded(&self, frames: u64) -> bool {
        self.max_frames.is_some_and(|max| frames >= max)
            || self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Auto-load condition: the MD5 of `length` RAM bytes at `address` equals
/// `expected` (hex, any case). Unreadable memory never matches.
pub fn ram_fingerprint(
    address: u32,
    length: usize,
    expected: &str,
) -> impl FnMut(&dyn MemoryAccess) -> bool {
    let expected = expected.to_ascii_uppercase();
    move |memory| {
        memory
            .read_bytes(ReadKind::Ram, address, length)
            .is_ok_and(|bytes| md5_hex(&bytes) == expected)
    }
}

/// One core, its patches and its saved state.
pub struct Session<C: Core> {
    core: C,
    endian: Endian,
    requires_reload: bool,
    checksum: Option<Box<dyn ChecksumRecalculator>>,
    patches: PatchLayer,
    state: CoreState,
    /// The imported image with persisted ROM patches folded in.
    base_rom: Vec<u8>,
    status: SessionState,
}

impl<C: Core> Session<C> {
    /// Wrap `core` with the hosting policy of `system`.
    pub fn new(core: C, system: SystemProfile) -> Self {
        Self {
            core,
            endian: system.endian(),
            requires_reload: system.requires_reload(),
            checksum: system.checksum(),
            patches: PatchLayer::new(),
            state: CoreState::default(),
            base_rom: Vec::new(),
            status: SessionState::Closed,
        }
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    pub fn with_reload(mut self, requires_reload: bool) -> Self {
        self.requires_reload = requires_reload;
        self
    }

    pub fn with_checksum(mut self, checksum: Option<Box<dyn ChecksumRecalculator>>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn core(&self) -> &C {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut C {
        &mut self.core
    }

    pub fn patches(&self) -> &PatchLayer {
        &self.patches
    }

    pub fn state(&self) -> &CoreState {
        &self.state
    }

    pub fn status(&self) -> SessionState {
        self.status
    }

    /// Load `rom` as the session's game.
    ///
    /// Any previous patches and state are discarded. No snapshot is taken;
    /// call [`Session::capture_state`] or [`Session::set_state`] before the
    /// first reset.
    pub fn load(&mut self, name: &str, rom: Vec<u8>) -> HostResult<()> {
        self.core.load_game(name, rom.clone())?;
        self.base_rom = rom;
        self.patches = PatchLayer::new();
        self.state = CoreState::default();
        self.status = SessionState::Loaded;
        Ok(())
    }

    /// Replace the saved state with the machine as it is now.
    pub fn capture_state(&mut self) -> HostResult<&CoreState> {
        self.state = CoreState::capture(&mut self.core)?;
        Ok(&self.state)
    }

    /// Use `state` as the snapshot restored by every reset.
    pub fn set_state(&mut self, state: CoreState) {
        self.state = state;
    }

    /// First open of a freshly created project: boot the game, snapshot it
    /// and write the snapshot and empty patch files.
    pub fn setup(&mut self, project: &Project) -> HostResult<()> {
        self.load_project_rom(project)?;
        self.capture_state()?;
        self.finish_setup(project)
    }

    /// Like [`Session::setup`], but fast-forward until `predicate` holds
    /// before taking the snapshot.
    pub fn setup_with_autoload(
        &mut self,
        project: &Project,
        predicate: impl FnMut(&dyn MemoryAccess) -> bool,
        limits: AutoLoadLimits,
    ) -> HostResult<()> {
        self.load_project_rom(project)?;
        let frames = self.auto_load_with(predicate, limits)?;
        info!(frames, "auto-load reached its condition");
        self.capture_state()?;
        self.finish_setup(project)
    }

    fn load_project_rom(&mut self, project: &Project) -> HostResult<()> {
        let rom = project.load_rom()?;
        self.load(&project.settings().original_rom_name, rom)
    }

    fn finish_setup(&mut self, project: &Project) -> HostResult<()> {
        self.state.save(&project.state_path())?;
        self.persist(project)?;
        self.status = SessionState::Ready;
        info!(project = project.name(), state_bytes = self.state.len(), "project set up");
        Ok(())
    }

    /// Later opens: boot the game, read the snapshot and persisted patches
    /// from disk and reset without temporary patches.
    pub fn reopen(&mut self, project: &Project) -> HostResult<()> {
        self.load_project_rom(project)?;

        let state = CoreState::load(&project.state_path())?;
        if state.is_empty() {
            warn!(project = project.name(), "no saved state; using the boot snapshot");
            self.capture_state()?;
        } else {
            self.state = state;
        }

        self.patches
            .load_persisted(AddressKind::Ram, &project.patch_path(AddressKind::Ram))?;
        self.patches
            .load_persisted(AddressKind::Rom, &project.patch_path(AddressKind::Rom))?;
        for region in self.patches.pool(Durability::Persisted, AddressKind::Rom).regions() {
            write_rom(&mut self.base_rom, region.address, region.bytes)?;
        }
        info!(
            project = project.name(),
            ram_regions = self.patches.pool(Durability::Persisted, AddressKind::Ram).len(),
            rom_regions = self.patches.pool(Durability::Persisted, AddressKind::Rom).len(),
            "project reopened"
        );
        self.reset(false)
    }

    /// Write both persisted pools to the project.
    pub fn persist(&self, project: &Project) -> HostResult<()> {
        self.patches
            .save_persisted(AddressKind::Ram, &project.patch_path(AddressKind::Ram))?;
        self.patches
            .save_persisted(AddressKind::Rom, &project.patch_path(AddressKind::Rom))?;
        debug!(project = project.name(), "persisted patches saved");
        Ok(())
    }

    /// Drop every pending temporary patch.
    pub fn clear_temporary(&mut self) {
        self.patches.clear_temporary();
    }

    /// Rebuild the machine from the saved state and the patch pools.
    ///
    /// Without `with_temporary` the temporary pools are cleared first. On
    /// error the session stays in [`SessionState::ResetInProgress`].
    pub fn reset(&mut self, with_temporary: bool) -> HostResult<()> {
        if !self.core.is_loaded() {
            return Err(HostError::NoGame);
        }
        self.status = SessionState::ResetInProgress;
        if !with_temporary {
            self.patches.clear_temporary();
        }

        // Start from the imported image so earlier temporary ROM patches
        // do not linger.
        let rom = self.core.rom_mut();
        if rom.len() != self.base_rom.len() {
            return Err(HostError::RomRange {
                address: 0,
                length: self.base_rom.len(),
                size: rom.len(),
            });
        }
        rom.copy_from_slice(&self.base_rom);

        if with_temporary {
            for region in self.patches.pool(Durability::Temporary, AddressKind::Rom).regions() {
                write_rom(self.core.rom_mut(), region.address, region.bytes)?;
            }
        }

        if let Some(checksum) = &self.checksum {
            if let Some(patch) = checksum.recalculate(&*self)? {
                debug!(address = patch.address, bytes = ?patch.bytes, "checksum updated");
                write_rom(self.core.rom_mut(), patch.address, &patch.bytes)?;
            }
        }

        if self.requires_reload {
            self.core.reload()?;
        }

        self.state.restore_into(&mut self.core)?;

        if with_temporary {
            for region in self.patches.pool(Durability::Temporary, AddressKind::Ram).regions() {
                self.core
                    .memory_map_mut()
                    .write(u64::from(region.address), region.bytes)?;
            }
        }

        for region in self.patches.pool(Durability::Persisted, AddressKind::Ram).regions() {
            self.core
                .memory_map_mut()
                .write(u64::from(region.address), region.bytes)?;
        }
        for region in self.patches.pool(Durability::Persisted, AddressKind::Rom).regions() {
            write_rom(self.core.rom_mut(), region.address, region.bytes)?;
        }

        self.status = SessionState::Ready;
        debug!(with_temporary, "reset complete");
        Ok(())
    }

    /// Emulate one frame.
    pub fn run_frame(&mut self) -> HostResult<()> {
        self.core.run()
    }

    /// Run with video off until `predicate` holds. Returns the frames run.
    ///
    /// The predicate is checked before every frame, so an already satisfied
    /// condition runs nothing. There is no bound; see
    /// [`Session::auto_load_with`].
    pub fn auto_load(&mut self, predicate: impl FnMut(&dyn MemoryAccess) -> bool) -> HostResult<u64> {
        self.auto_load_with(predicate, AutoLoadLimits::default())
    }

    /// [`Session::auto_load`] with a frame cap and a cancel flag.
    ///
    /// Fails with [`HostError::AutoLoadAborted`] when a limit trips. Video
    /// is re-enabled on every exit path.
    pub fn auto_load_with(
        &mut self,
        mut predicate: impl FnMut(&dyn MemoryAccess) -> bool,
        limits: AutoLoadLimits,
    ) -> HostResult<u64> {
        self.core.set_video_enabled(false);
        let result = self.auto_load_frames(&mut predicate, &limits);
        self.core.set_video_enabled(true);
        result
    }

    fn auto_load_frames(
        &mut self,
        predicate: &mut dyn FnMut(&dyn MemoryAccess) -> bool,
        limits: &AutoLoadLimits,
    ) -> HostResult<u64> {
        let mut frames = 0u64;
        loop {
            if predicate(&*self) {
                return Ok(frames);
            }
            if limits.exceeded(frames) {
                warn!(frames, "auto-load aborted");
                return Err(HostError::AutoLoadAborted { frames });
            }
            self.core.run()?;
            frames += 1;
        }
    }

    /// Unload the game. The core itself is released when the session drops.
    pub fn close(&mut self) {
        self.core.unload_game();
        self.status = SessionState::Closed;
    }

    /// Take the core back out of the session.
    pub fn into_core(self) -> C {
        self.core
    }

    fn check_rom_range(&self, address: u32, length: usize) -> HostResult<()> {
        let size = self.core.rom().len();
        match (address as usize).checked_add(length) {
            Some(end) if end <= size => Ok(()),
            _ => Err(HostError::RomRange { address, length, size }),
        }
    }
}

/// Copy `bytes` into `rom` at `address`, refusing to grow the image.
fn write_rom(rom: &mut [u8], address: u32, bytes: &[u8]) -> HostResult<()> {
    let start = address as usize;
    let size = rom.len();
    let end = start.checked_add(bytes.len()).unwrap_or(usize::MAX);
    rom.get_mut(start..end)
        .ok_or(HostError::RomRange {
            address,
            length: bytes.len(),
            size,
        })?
        .copy_from_slice(bytes);
    Ok(())
}

impl<C: Core> MemoryAccess for Session<C> {
    fn read_bytes(&self, kind: ReadKind, address: u32, length: usize) -> HostResult<Vec<u8>> {
        match kind {
            ReadKind::Ram => self.core.memory_map().read(u64::from(address), length),
            ReadKind::Rom => {
                self.check_rom_range(address, length)?;
                let start = address as usize;
                Ok(self.core.rom()[start..start + length].to_vec())
            }
        }
    }

    fn write_bytes(&mut self, kind: WriteKind, address: u32, bytes: &[u8]) -> HostResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if kind.address_kind() == AddressKind::Rom {
            self.check_rom_range(address, bytes.len())?;
        }
        match kind {
            WriteKind::TemporaryRom => {}
            WriteKind::TemporaryRam => {
                // Replayed at every reset, so it must land somewhere now.
                let length = bytes.len() as u64;
                if self.core.memory_map().translate(u64::from(address), length).is_empty() {
                    return Err(HostError::Unmapped {
                        address: u64::from(address),
                        length,
                    });
                }
            }
            WriteKind::PersistedRam => {
                self.core
                    .memory_map_mut()
                    .write(u64::from(address), bytes)?;
            }
            WriteKind::PersistedRom => {
                write_rom(&mut self.base_rom, address, bytes)?;
                write_rom(self.core.rom_mut(), address, bytes)?;
            }
        }
        self.patches
            .insert(kind.durability(), kind.address_kind(), address, bytes);
        self.status = SessionState::Patched;
        Ok(())
    }

    fn rom_size(&self) -> usize {
        self.core.rom().len()
    }

    fn endian(&self) -> Endian {
        self.endian
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HeadlessCore;

    fn session(ram: usize, rom: Vec<u8>) -> Session<HeadlessCore> {
        let mut session = Session::new(HeadlessCore::new(ram), SystemProfile::Nes);
        session.load("test.nes", rom).unwrap();
        session.capture_state().unwrap();
        session
    }

    #[test]
    fn test_temporary_writes_wait_for_reset() {
        let mut s = session(16, vec![0; 8]);
        s.write_bytes(WriteKind::TemporaryRam, 4, &[0xAA]).unwrap();
        assert_eq!(s.read_bytes(ReadKind::Ram, 4, 1).unwrap(), vec![0]);
        assert_eq!(s.status(), SessionState::Patched);

        s.reset(true).unwrap();
        assert_eq!(s.read_bytes(ReadKind::Ram, 4, 1).unwrap(), vec![0xAA]);
        assert_eq!(s.status(), SessionState::Ready);
    }

    #[test]
    fn test_persisted_writes_apply_immediately() {
        let mut s = session(16, vec![0; 8]);
        s.write_bytes(WriteKind::PersistedRam, 2, &[1, 2]).unwrap();
        s.write_bytes(WriteKind::PersistedRom, 6, &[3, 4]).unwrap();
        assert_eq!(s.read_bytes(ReadKind::Ram, 2, 2).unwrap(), vec![1, 2]);
        assert_eq!(s.read_bytes(ReadKind::Rom, 6, 2).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_reset_without_temporary_clears_pools() {
        let mut s = session(16, vec![0; 8]);
        s.write_bytes(WriteKind::TemporaryRam, 0, &[9]).unwrap();
        s.write_bytes(WriteKind::TemporaryRom, 0, &[9]).unwrap();
        s.reset(false).unwrap();

        assert!(s.patches().pool(Durability::Temporary, AddressKind::Ram).is_empty());
        assert!(s.patches().pool(Durability::Temporary, AddressKind::Rom).is_empty());
        assert_eq!(s.read_bytes(ReadKind::Ram, 0, 1).unwrap(), vec![0]);
        assert_eq!(s.read_bytes(ReadKind::Rom, 0, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_temporary_rom_patch_does_not_linger() {
        let mut s = session(16, vec![0; 8]);
        s.write_bytes(WriteKind::TemporaryRom, 1, &[7]).unwrap();
        s.reset(true).unwrap();
        assert_eq!(s.read_bytes(ReadKind::Rom, 1, 1).unwrap(), vec![7]);

        s.clear_temporary();
        s.reset(true).unwrap();
        assert_eq!(s.read_bytes(ReadKind::Rom, 1, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_rom_range_is_checked() {
        let mut s = session(16, vec![0; 8]);
        assert!(matches!(
            s.read_bytes(ReadKind::Rom, 6, 4),
            Err(HostError::RomRange { address: 6, length: 4, size: 8 })
        ));
        assert!(matches!(
            s.write_bytes(WriteKind::TemporaryRom, 8, &[1]),
            Err(HostError::RomRange { .. })
        ));
        assert!(s.patches().pool(Durability::Temporary, AddressKind::Rom).is_empty());
    }

    #[test]
    fn test_unmapped_persisted_ram_write_is_not_recorded() {
        let mut s = session(16, vec![0; 8]);
        assert!(matches!(
            s.write_bytes(WriteKind::PersistedRam, 0x8000, &[1]),
            Err(HostError::Unmapped { .. })
        ));
        assert!(s.patches().pool(Durability::Persisted, AddressKind::Ram).is_empty());
    }

    #[test]
    fn test_unmapped_temporary_ram_write_is_rejected() {
        let mut s = session(16, vec![0; 8]);
        s.write_bytes(WriteKind::PersistedRam, 0, &[0x22]).unwrap();
        assert!(matches!(
            s.write_bytes(WriteKind::TemporaryRam, 0x8000, &[1]),
            Err(HostError::Unmapped { address: 0x8000, length: 1 })
        ));
        assert!(s.patches().pool(Durability::Temporary, AddressKind::Ram).is_empty());

        s.reset(true).unwrap();
        assert_eq!(s.status(), SessionState::Ready);
        assert_eq!(s.read_bytes(ReadKind::Ram, 0, 1).unwrap(), vec![0x22]);
    }

    #[test]
    fn test_rom_range_rejects_overflowing_length() {
        let mut s = session(16, vec![0; 8]);
        assert!(matches!(
            s.read_bytes(ReadKind::Rom, 4, usize::MAX),
            Err(HostError::RomRange { address: 4, size: 8, .. })
        ));
        assert!(matches!(
            s.write_bytes(WriteKind::PersistedRom, u32::MAX, &[1]),
            Err(HostError::RomRange { .. })
        ));
        let mut rom = [0u8; 4];
        assert!(matches!(
            write_rom(&mut rom[2..], u32::MAX, &[1, 2]),
            Err(HostError::RomRange { size: 2, .. })
        ));
    }

    #[test]
    fn test_load_takes_no_snapshot() {
        let mut s = Session::new(HeadlessCore::new(4), SystemProfile::Nes);
        s.load("test.nes", vec![0; 4]).unwrap();
        assert!(s.state().is_empty());
        // Without a snapshot there is nothing to restore.
        assert!(matches!(s.reset(false), Err(HostError::StateSizeMismatch { actual: 0, .. })));

        s.capture_state().unwrap();
        s.reset(false).unwrap();
        assert_eq!(s.status(), SessionState::Ready);
    }

    #[test]
    fn test_reset_requires_a_game() {
        let mut s = Session::new(HeadlessCore::new(4), SystemProfile::Nes);
        assert!(matches!(s.reset(false), Err(HostError::NoGame)));
        assert_eq!(s.status(), SessionState::Closed);
    }

    #[test]
    fn test_auto_load_stops_when_condition_holds() {
        let core = HeadlessCore::new(4).with_frame_hook(|frame, ram| ram[0] = frame as u8);
        let mut s = Session::new(core, SystemProfile::ZxSpectrum);
        s.load("game.tap", vec![0; 4]).unwrap();

        let frames = s
            .auto_load(|m| m.read_bytes(ReadKind::Ram, 0, 1).map(|b| b[0] == 5).unwrap_or(false))
            .unwrap();
        assert_eq!(frames, 5);
        assert_eq!(s.core().suppressed_frames, 5);
        assert!(s.core().video_enabled());
    }

    #[test]
    fn test_auto_load_satisfied_condition_runs_nothing() {
        let mut s = session(4, vec![0; 4]);
        assert_eq!(s.auto_load(|_| true).unwrap(), 0);
        assert_eq!(s.core().frames_run, 0);
    }

    #[test]
    fn test_auto_load_limits() {
        let mut s = session(4, vec![0; 4]);
        let err = s
            .auto_load_with(|_| false, AutoLoadLimits::default().with_max_frames(10))
            .unwrap_err();
        assert!(matches!(err, HostError::AutoLoadAborted { frames: 10 }));
        assert!(s.core().video_enabled());

        let cancel = Arc::new(AtomicBool::new(true));
        let err = s
            .auto_load_with(|_| false, AutoLoadLimits::default().with_cancel(cancel))
            .unwrap_err();
        assert!(matches!(err, HostError::AutoLoadAborted { frames: 0 }));
    }

    #[test]
    fn test_ram_fingerprint() {
        let mut s = session(8, vec![0; 4]);
        s.write_bytes(WriteKind::PersistedRam, 0, b"abc").unwrap();
        // md5("abc")
        let mut matches = ram_fingerprint(0, 3, "900150983cd24fb0d6963f7d28e17f72");
        assert!(matches(&s));
        let mut other = ram_fingerprint(1, 3, "900150983cd24fb0d6963f7d28e17f72");
        assert!(!other(&s));
        let mut unmapped = ram_fingerprint(0x1000, 3, "900150983cd24fb0d6963f7d28e17f72");
        assert!(!unmapped(&s));
    }
}
