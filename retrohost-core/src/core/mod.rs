//! Hosted cores.
//!
//! [`Core`] is the seam between the session logic and an emulator. The real
//! implementation is [`LibretroCore`], which drives a libretro shared
//! library; [`HeadlessCore`] is a pure-Rust machine with the same contract.

mod binding;
mod environment;
mod headless;

use std::ffi::CString;
use std::os::raw::c_uint;
use std::path::Path;
use std::ptr::{self, NonNull};

use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::ffi::{self, *};
use crate::input::InputState;
use crate::memory::MemoryMapTable;
use crate::video::{Frame, PixelFormat};

pub use binding::CoreApi;
pub use environment::{CoreOption, HostCallbacks};
pub use headless::{FrameHook, HeadlessCore};

use environment::ActiveGuard;

/// An emulator the host can load games into, run, snapshot and patch.
pub trait Core {
    /// Load `rom` as the current game, replacing any loaded one.
    ///
    /// `name` is the image's file name; some cores use its extension.
    fn load_game(&mut self, name: &str, rom: Vec<u8>) -> HostResult<()>;

    /// Unload and load the current image again, so the core picks up edits
    /// made to [`Core::rom_mut`].
    fn reload(&mut self) -> HostResult<()>;

    fn is_loaded(&self) -> bool;

    /// The host-owned game image.
    fn rom(&self) -> &[u8];

    fn rom_mut(&mut self) -> &mut [u8];

    /// Descriptors the core reported for the loaded game.
    fn memory_map(&self) -> &MemoryMapTable;

    fn memory_map_mut(&mut self) -> &mut MemoryMapTable;

    /// Emulate exactly one frame.
    fn run(&mut self) -> HostResult<()>;

    fn set_video_enabled(&mut self, enabled: bool);

    /// The core's own soft reset.
    fn reset_machine(&mut self) -> HostResult<()>;

    /// Size of a save state for the loaded game.
    fn state_size(&mut self) -> HostResult<usize>;

    /// Serialize into `buffer`, which must be exactly [`Core::state_size`] long.
    fn save_state(&mut self, buffer: &mut [u8]) -> HostResult<()>;

    /// Restore from `buffer`, which must be exactly [`Core::state_size`] long.
    fn restore_state(&mut self, buffer: &[u8]) -> HostResult<()>;

    /// Unload the current game. The image is kept.
    fn unload_game(&mut self);
}

/// Static facts a core reports about itself.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub library_name: String,
    pub library_version: String,
    pub valid_extensions: Vec<String>,
    pub need_fullpath: bool,
    pub block_extract: bool,
}

/// Memory regions exposed through `retro_get_memory_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMemory {
    SaveRam,
    Rtc,
    SystemRam,
    VideoRam,
}

impl CoreMemory {
    fn id(self) -> c_uint {
        match self {
            Self::SaveRam => 0,
            Self::Rtc => 1,
            Self::SystemRam => 2,
            Self::VideoRam => 3,
        }
    }
}

/// A libretro core loaded from a shared library.
///
/// Owns the library, the callback state and the game image. Not `Send`:
/// cores keep thread-affine state and call back on the loading thread.
pub struct LibretroCore {
    callbacks: NonNull<HostCallbacks>,
    rom: Vec<u8>,
    game_name: String,
    system_info: SystemInfo,
    av_info: retro_system_av_info,
    initialized: bool,
    loaded: bool,
    api: CoreApi,
}

impl LibretroCore {
    /// Open the core at `path` (or the configured override), check its API
    /// version, register the callbacks and initialize it.
    pub fn open(path: &Path, config: &HostConfig) -> HostResult<Self> {
        let path = config.resolve_core_path(path);
        let api = CoreApi::load(&path)?;

        // SAFETY: resolved with the libretro.h signatures.
        let version = unsafe { (api.api_version)() };
        if version != RETRO_API_VERSION {
            return Err(HostError::ApiVersion(version));
        }

        let mut raw = retro_system_info {
            library_name: ptr::null(),
            library_version: ptr::null(),
            valid_extensions: ptr::null(),
            need_fullpath: false,
            block_extract: false,
        };
        // SAFETY: the core fills static strings into `raw`.
        let system_info = unsafe {
            (api.get_system_info)(&mut raw);
            SystemInfo {
                library_name: ffi::string_from_ptr(raw.library_name),
                library_version: ffi::string_from_ptr(raw.library_version),
                valid_extensions: ffi::string_from_ptr(raw.valid_extensions)
                    .split('|')
                    .filter(|e| !e.is_empty())
                    .map(str::to_ascii_lowercase)
                    .collect(),
                need_fullpath: raw.need_fullpath,
                block_extract: raw.block_extract,
            }
        };
        info!(
            core = %system_info.library_name,
            version = %system_info.library_version,
            "opened core"
        );

        let callbacks = NonNull::from(Box::leak(Box::new(HostCallbacks::new(config))));
        let mut core = Self {
            callbacks,
            rom: Vec::new(),
            game_name: String::new(),
            system_info,
            av_info: retro_system_av_info::default(),
            initialized: false,
            loaded: false,
            api,
        };
        core.with_callbacks(|api| unsafe {
            (api.set_environment)(environment::environment_thunk);
            (api.set_video_refresh)(environment::video_refresh_thunk);
            (api.set_audio_sample)(environment::audio_sample_thunk);
            (api.set_audio_sample_batch)(environment::audio_sample_batch_thunk);
            (api.set_input_poll)(environment::input_poll_thunk);
            (api.set_input_state)(environment::input_state_thunk);
            (api.init)();
        });
        core.initialized = true;
        Ok(core)
    }

    /// Call into the core with callbacks routed to this instance.
    fn with_callbacks<R>(&mut self, f: impl FnOnce(&CoreApi) -> R) -> R {
        // SAFETY: `callbacks` is owned by `self` and not borrowed while the
        // guard is alive; `&mut self` rules out any other access.
        let _guard = unsafe { ActiveGuard::install(self.callbacks.as_ptr()) };
        f(&self.api)
    }

    fn callbacks(&self) -> &HostCallbacks {
        // SAFETY: only aliased mutably while a guard is installed, which
        // needs `&mut self`.
        unsafe { self.callbacks.as_ref() }
    }

    fn callbacks_mut(&mut self) -> &mut HostCallbacks {
        // SAFETY: see `callbacks`.
        unsafe { self.callbacks.as_mut() }
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }

    pub fn av_info(&self) -> &retro_system_av_info {
        &self.av_info
    }

    /// Options the core declared, keyed by option name.
    pub fn options(&self) -> impl Iterator<Item = (&str, &CoreOption)> {
        self.callbacks().options.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Value the core currently sees for `key`.
    pub fn option_value(&self, key: &str) -> Option<&str> {
        self.callbacks().option_value(key)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.callbacks().pixel_format
    }

    /// Last frame shown while video was enabled.
    pub fn frame(&self) -> &Frame {
        &self.callbacks().frame
    }

    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.callbacks_mut().input
    }

    /// Frames presented while video was enabled, and audio frames received,
    /// since open.
    pub fn counters(&self) -> (u64, u64) {
        let callbacks = self.callbacks();
        (callbacks.video_frames, callbacks.audio_frames)
    }

    /// Copy out one of the core's fixed memory regions, if it has one.
    pub fn memory_region(&mut self, region: CoreMemory) -> Option<Vec<u8>> {
        let id = region.id();
        let (data, size) = self.with_callbacks(|api| unsafe {
            ((api.get_memory_data)(id), (api.get_memory_size)(id))
        });
        if data.is_null() || size == 0 {
            return None;
        }
        // SAFETY: the core reports `size` readable bytes at `data`.
        Some(unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size) }.to_vec())
    }

    fn require_game(&self) -> HostResult<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(HostError::NoGame)
        }
    }

    fn check_state_len(&mut self, actual: usize) -> HostResult<()> {
        let expected = self.state_size()?;
        if expected != actual {
            return Err(HostError::StateSizeMismatch { expected, actual });
        }
        Ok(())
    }
}

impl Core for LibretroCore {
    fn load_game(&mut self, name: &str, rom: Vec<u8>) -> HostResult<()> {
        if self.loaded {
            self.unload_game();
        }
        self.rom = rom;
        self.game_name = name.to_string();

        let data = self.rom.as_ptr();
        let size = self.rom.len();
        // SAFETY: `rom` is not resized while the game is loaded.
        self.callbacks_mut()
            .set_game(name, unsafe { std::slice::from_raw_parts(data, size) });

        let path = CString::new(name.replace('\0', "")).unwrap_or_default();
        let info = retro_game_info {
            path: path.as_ptr(),
            data: data.cast(),
            size,
            meta: ptr::null(),
        };
        let accepted = self.with_callbacks(|api| unsafe { (api.load_game)(&info) });
        if !accepted {
            self.callbacks_mut().clear_game();
            return Err(HostError::LoadGame(name.to_string()));
        }
        self.loaded = true;

        let mut av_info = retro_system_av_info::default();
        self.with_callbacks(|api| unsafe { (api.get_system_av_info)(&mut av_info) });
        self.av_info = av_info;
        self.callbacks_mut().geometry = av_info.geometry;
        info!(
            game = name,
            bytes = size,
            fps = av_info.timing.fps,
            descriptors = self.memory_map().descriptors().len(),
            "game loaded"
        );
        if self.memory_map().is_empty() {
            warn!("core reported no memory map; RAM access will fail");
        }
        Ok(())
    }

    fn reload(&mut self) -> HostResult<()> {
        self.require_game()?;
        let rom = std::mem::take(&mut self.rom);
        let name = std::mem::take(&mut self.game_name);
        self.unload_game();
        debug!(game = %name, "reloading game");
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
        &self.callbacks().memory_map
    }

    fn memory_map_mut(&mut self) -> &mut MemoryMapTable {
        &mut self.callbacks_mut().memory_map
    }

    fn run(&mut self) -> HostResult<()> {
        self.require_game()?;
        self.with_callbacks(|api| unsafe { (api.run)() });
        Ok(())
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.callbacks_mut().video_enabled = enabled;
    }

    fn reset_machine(&mut self) -> HostResult<()> {
        self.require_game()?;
        self.with_callbacks(|api| unsafe { (api.reset)() });
        Ok(())
    }

    fn state_size(&mut self) -> HostResult<usize> {
        self.require_game()?;
        Ok(self.with_callbacks(|api| unsafe { (api.serialize_size)() }))
    }

    fn save_state(&mut self, buffer: &mut [u8]) -> HostResult<()> {
        self.check_state_len(buffer.len())?;
        let ok = self.with_callbacks(|api| unsafe {
            (api.serialize)(buffer.as_mut_ptr().cast(), buffer.len())
        });
        if ok {
            Ok(())
        } else {
            Err(HostError::Serialize)
        }
    }

    fn restore_state(&mut self, buffer: &[u8]) -> HostResult<()> {
        self.check_state_len(buffer.len())?;
        let ok = self.with_callbacks(|api| unsafe {
            (api.unserialize)(buffer.as_ptr().cast(), buffer.len())
        });
        if ok {
            Ok(())
        } else {
            Err(HostError::Unserialize)
        }
    }

    fn unload_game(&mut self) {
        if !self.loaded {
            return;
        }
        self.with_callbacks(|api| unsafe { (api.unload_game)() });
        self.loaded = false;
        self.callbacks_mut().clear_game();
        debug!("game unloaded");
    }
}

impl Drop for LibretroCore {
    fn drop(&mut self) {
        self.unload_game();
        if self.initialized {
            self.with_callbacks(|api| unsafe { (api.deinit)() });
        }
        // SAFETY: allocated with `Box::leak` in `open`; the core has been
        // deinitialized, so nothing can call back any more.
        drop(unsafe { Box::from_raw(self.callbacks.as_ptr()) });
        debug!("core released");
    }
}
