//! Symbol resolution for a libretro shared library.

use std::os::raw::{c_uint, c_void};
use std::path::Path;

use libloading::Library;
use tracing::debug;

use crate::error::{HostError, HostResult};
use crate::ffi::*;

/// Every export the host calls, resolved once at load time.
///
/// The function pointers are only valid while `_library` is alive; it is the
/// last field so it drops after everything else.
pub struct CoreApi {
    pub api_version: unsafe extern "C" fn() -> c_uint,
    pub get_system_info: unsafe extern "C" fn(info: *mut retro_system_info),
    pub get_system_av_info: unsafe extern "C" fn(info: *mut retro_system_av_info),
    pub set_environment: unsafe extern "C" fn(cb: retro_environment_t),
    pub set_video_refresh: unsafe extern "C" fn(cb: retro_video_refresh_t),
    pub set_audio_sample: unsafe extern "C" fn(cb: retro_audio_sample_t),
    pub set_audio_sample_batch: unsafe extern "C" fn(cb: retro_audio_sample_batch_t),
    pub set_input_poll: unsafe extern "C" fn(cb: retro_input_poll_t),
    pub set_input_state: unsafe extern "C" fn(cb: retro_input_state_t),
    pub init: unsafe extern "C" fn(),
    pub deinit: unsafe extern "C" fn(),
    pub load_game: unsafe extern "C" fn(game: *const retro_game_info) -> bool,
    pub unload_game: unsafe extern "C" fn(),
    pub get_memory_size: unsafe extern "C" fn(id: c_uint) -> usize,
    pub get_memory_data: unsafe extern "C" fn(id: c_uint) -> *mut c_void,
    pub serialize_size: unsafe extern "C" fn() -> usize,
    pub serialize: unsafe extern "C" fn(data: *mut c_void, size: usize) -> bool,
    pub unserialize: unsafe extern "C" fn(data: *const c_void, size: usize) -> bool,
    pub reset: unsafe extern "C" fn(),
    pub run: unsafe extern "C" fn(),
    _library: Library,
}

impl CoreApi {
    /// Open `path` and resolve every required export.
    ///
    /// There is no partial mode: the first missing symbol fails the load.
    pub fn load(path: &Path) -> HostResult<Self> {
        // SAFETY: loading a library runs its initializers; libretro cores
        // have none with observable side effects beyond their own statics.
        let library = unsafe { Library::new(path) }.map_err(|source| HostError::Library {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "opened core library");

        // SAFETY: each symbol is declared with its libretro.h signature.
        unsafe {
            Ok(Self {
                api_version: symbol(&library, "retro_api_version")?,
                get_system_info: symbol(&library, "retro_get_system_info")?,
                get_system_av_info: symbol(&library, "retro_get_system_av_info")?,
                set_environment: symbol(&library, "retro_set_environment")?,
                set_video_refresh: symbol(&library, "retro_set_video_refresh")?,
                set_audio_sample: symbol(&library, "retro_set_audio_sample")?,
                set_audio_sample_batch: symbol(&library, "retro_set_audio_sample_batch")?,
                set_input_poll: symbol(&library, "retro_set_input_poll")?,
                set_input_state: symbol(&library, "retro_set_input_state")?,
                init: symbol(&library, "retro_init")?,
                deinit: symbol(&library, "retro_deinit")?,
                load_game: symbol(&library, "retro_load_game")?,
                unload_game: symbol(&library, "retro_unload_game")?,
                get_memory_size: symbol(&library, "retro_get_memory_size")?,
                get_memory_data: symbol(&library, "retro_get_memory_data")?,
                serialize_size: symbol(&library, "retro_serialize_size")?,
                serialize: symbol(&library, "retro_serialize")?,
                unserialize: symbol(&library, "retro_unserialize")?,
                reset: symbol(&library, "retro_reset")?,
                run: symbol(&library, "retro_run")?,
                _library: library,
            })
        }
    }
}

/// Copy a function pointer out of the library.
///
/// # Safety
/// `T` must match the exported symbol's real type.
unsafe fn symbol<T: Copy>(library: &Library, name: &'static str) -> HostResult<T> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    library
        .get::<T>(&bytes)
        .map(|s| *s)
        .map_err(|_| HostError::SymbolMissing(name))
}
