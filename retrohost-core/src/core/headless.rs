//! A pure-Rust core with no native code behind it.
//!
//! The machine is a flat RAM block plus a private copy of the cartridge,
//! both published through memory descriptors exactly like a libretro core
//! would. Its save state is the frame counter followed by RAM. Useful for
//! exercising sessions and tooling without a shared library.

use tracing::debug;

use super::Core;
use crate::error::{HostError, HostResult};
use crate::memory::{MemoryDescriptor, MemoryMapTable};

/// Called once per emulated frame with the frame number and RAM.
pub type FrameHook = Box<dyn FnMut(u64, &mut [u8])>;

/// Deterministic in-process machine.
pub struct HeadlessCore {
    ram: Box<[u8]>,
    cartridge: Box<[u8]>,
    rom: Vec<u8>,
    game_name: String,
    map: MemoryMapTable,
    loaded: bool,
    video_enabled: bool,
    frame: u64,
    frame_hook: Option<FrameHook>,
    /// Frames run since creation.
    pub frames_run: u64,
    /// Frames run while video was disabled.
    pub suppressed_frames: u64,
    /// Number of times a game was loaded, reloads included.
    pub loads: u32,
}

impl HeadlessCore {
    /// Logical address of the core's copy of the cartridge.
    pub const CARTRIDGE_BASE: u64 = 0x0100_0000;

    /// A machine with `ram_size` bytes of RAM mapped at address 0.
    pub fn new(ram_size: usize) -> Self {
        Self {
            ram: vec![0u8; ram_size].into_boxed_slice(),
            cartridge: Box::default(),
            rom: Vec::new(),
            game_name: String::new(),
            map: MemoryMapTable::default(),
            loaded: false,
            video_enabled: true,
            frame: 0,
            frame_hook: None,
            frames_run: 0,
            suppressed_frames: 0,
            loads: 0,
        }
    }

    /// Run `hook` on every frame, after the frame counter advances.
    pub fn with_frame_hook(mut self, hook: impl FnMut(u64, &mut [u8]) + 'static) -> Self {
        self.frame_hook = Some(Box::new(hook));
        self
    }

    /// Frame counter of the emulated machine (part of the save state).
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    fn publish_map(&mut self) {
        // SAFETY: both buffers are boxed slices owned by `self`; the map is
        // replaced before either is reallocated.
        let descriptors = unsafe {
            vec![
                MemoryDescriptor::new(self.ram.as_mut_ptr(), 0, 0, self.ram.len() as u64)
                    .with_address_space("ram"),
                MemoryDescriptor::new(
                    self.cartridge.as_mut_ptr(),
                    0,
                    Self::CARTRIDGE_BASE,
                    self.cartridge.len() as u64,
                )
                .with_address_space("cart"),
            ]
        };
        self.map = MemoryMapTable::new(descriptors);
    }

    fn require_game(&self) -> HostResult<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(HostError::NoGame)
        }
    }
}

impl Core for HeadlessCore {
    fn load_game(&mut self, name: &str, rom: Vec<u8>) -> HostResult<()> {
        if rom.is_empty() {
            return Err(HostError::LoadGame(name.to_string()));
        }
        self.map = MemoryMapTable::default();
        self.cartridge = rom.clone().into_boxed_slice();
        self.rom = rom;
        self.game_name = name.to_string();
        self.ram.iter_mut().for_each(|b| *b = 0);
        self.frame = 0;
        self.publish_map();
        self.loaded = true;
        self.loads += 1;
        debug!(game = name, loads = self.loads, "headless game loaded");
        Ok(())
    }

    fn reload(&mut self) -> HostResult<()> {
        self.require_game()?;
        let rom = std::mem::take(&mut self.rom);
        let name = std::mem::take(&mut self.game_name);
        self.unload_game();
        self.load_game(&name, rom)
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn rom(&self) -> &[u8] {
        &self.rom
    }

    fn rom_mut(&mut self) -> &mut [u8] {
        &mut self.rom
    }

    fn memory_map(&self) -> &MemoryMapTable {
        &self.map
    }

    fn memory_map_mut(&mut self) -> &mut MemoryMapTable {
        &mut self.map
    }

    fn run(&mut self) -> HostResult<()> {
        self.require_game()?;
        self.frame += 1;
        self.frames_run += 1;
        if !self.video_enabled {
            self.suppressed_frames += 1;
        }
        if let Some(hook) = self.frame_hook.as_mut() {
            hook(self.frame, &mut self.ram);
        }
        Ok(())
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
    }

    fn reset_machine(&mut self) -> HostResult<()> {
        self.require_game()?;
        self.ram.iter_mut().for_each(|b| *b = 0);
        self.frame = 0;
        Ok(())
    }

    fn state_size(&mut self) -> HostResult<usize> {
        self.require_game()?;
        Ok(8 + self.ram.len())
    }

    fn save_state(&mut self, buffer: &mut [u8]) -> HostResult<()> {
        let expected = self.state_size()?;
        if buffer.len() != expected {
            return Err(HostError::StateSizeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        buffer[..8].copy_from_slice(&self.frame.to_le_bytes());
        buffer[8..].copy_from_slice(&self.ram);
        Ok(())
    }

    fn restore_state(&mut self, buffer: &[u8]) -> HostResult<()> {
        let expected = self.state_size()?;
        if buffer.len() != expected {
            return Err(HostError::StateSizeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&buffer[..8]);
        self.frame = u64::from_le_bytes(counter);
        self.ram.copy_from_slice(&buffer[8..]);
        Ok(())
    }

    fn unload_game(&mut self) {
        if self.loaded {
            self.map = MemoryMapTable::default();
            self.loaded = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartridge_copy_only_changes_on_reload() {
        let mut core = HeadlessCore::new(16);
        core.load_game("game.bin", vec![1, 2, 3, 4]).unwrap();
        let cart = HeadlessCore::CARTRIDGE_BASE;

        core.rom_mut()[0] = 0xEE;
        assert_eq!(core.memory_map().read(cart, 1).unwrap(), vec![1]);

        core.reload().unwrap();
        assert_eq!(core.memory_map().read(cart, 1).unwrap(), vec![0xEE]);
        assert_eq!(core.loads, 2);
    }

    #[test]
    fn test_frame_hook_and_suppression() {
        let mut core = HeadlessCore::new(4).with_frame_hook(|frame, ram| ram[0] = frame as u8);
        core.load_game("game.bin", vec![0]).unwrap();
        core.set_video_enabled(false);
        core.run().unwrap();
        core.run().unwrap();
        core.set_video_enabled(true);
        core.run().unwrap();

        assert_eq!(core.memory_map().read(0, 1).unwrap(), vec![3]);
        assert_eq!(core.suppressed_frames, 2);
        assert_eq!(core.frames_run, 3);
    }

    #[test]
    fn test_state_round_trip_includes_frame_counter() {
        let mut core = HeadlessCore::new(4);
        core.load_game("game.bin", vec![0]).unwrap();
        core.run().unwrap();
        core.memory_map_mut().write(1, &[7]).unwrap();

        let mut state = vec![0u8; core.state_size().unwrap()];
        core.save_state(&mut state).unwrap();
        core.reset_machine().unwrap();
        assert_eq!(core.frame(), 0);

        core.restore_state(&state).unwrap();
        assert_eq!(core.frame(), 1);
        assert_eq!(core.memory_map().read(1, 1).unwrap(), vec![7]);
    }

    #[test]
    fn test_requires_a_game() {
        let mut core = HeadlessCore::new(4);
        assert!(matches!(core.run(), Err(HostError::NoGame)));
        assert!(matches!(core.state_size(), Err(HostError::NoGame)));
        assert!(core.memory_map().is_empty());
    }
}
