//! Environment negotiation and the other host callbacks.
//!
//! libretro callbacks carry no user pointer, so the thunks here find the
//! session's [`HostCallbacks`] through a thread-local slot. The slot is only
//! populated by an [`ActiveGuard`] held around native calls that may call
//! back; outside of those calls every thunk is a no-op.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::ffi::{self, env, *};
use crate::input::InputState;
use crate::memory::{MemoryDescriptor, MemoryMapTable};
use crate::video::{Frame, PixelFormat};

/// An option a core declared through `SET_VARIABLES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreOption {
    pub description: String,
    /// Allowed values, default first.
    pub values: Vec<String>,
}

impl CoreOption {
    /// Parse the `"Description; first|second|third"` form.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(';') {
            Some((description, values)) => Self {
                description: description.trim().to_string(),
                values: values.trim().split('|').map(str::to_string).collect(),
            },
            None => Self {
                description: raw.trim().to_string(),
                values: Vec::new(),
            },
        }
    }
}

/// Extended game info handed out through `GET_GAME_INFO_EXT`.
///
/// Owns every string `raw` points at.
struct GameInfoExt {
    _full_path: CString,
    _dir: CString,
    _name: CString,
    _ext: CString,
    raw: retro_game_info_ext,
}

/// State the host keeps on behalf of one core.
///
/// Lives at a fixed heap address for the whole lifetime of the core, so
/// pointers handed to the core (system directory, option values, game
/// info) stay valid until teardown.
pub struct HostCallbacks {
    pub(crate) pixel_format: PixelFormat,
    pub(crate) memory_map: MemoryMapTable,
    pub(crate) options: BTreeMap<String, CoreOption>,
    option_overrides: BTreeMap<String, String>,
    variable_cache: BTreeMap<String, CString>,
    pub(crate) video_enabled: bool,
    pub(crate) frame: Frame,
    pub(crate) geometry: retro_game_geometry,
    pub(crate) input: InputState,
    pub(crate) video_frames: u64,
    pub(crate) audio_frames: u64,
    system_dir: CString,
    game_ext: Option<GameInfoExt>,
}

impl HostCallbacks {
    pub fn new(config: &HostConfig) -> Self {
        let system_dir = config
            .system_directory
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        Self {
            pixel_format: PixelFormat::default(),
            memory_map: MemoryMapTable::default(),
            options: BTreeMap::new(),
            option_overrides: config.option_overrides.clone(),
            variable_cache: BTreeMap::new(),
            video_enabled: true,
            frame: Frame::default(),
            geometry: retro_game_geometry::default(),
            input: InputState::default(),
            video_frames: 0,
            audio_frames: 0,
            system_dir: c_string(&system_dir),
            game_ext: None,
        }
    }

    /// Describe the image the core is about to load.
    ///
    /// `data` must stay valid until the next call or until the game is
    /// unloaded.
    pub(crate) fn set_game(&mut self, name: &str, data: &[u8]) {
        let path = Path::new(name);
        let full_path = c_string(name);
        let dir = c_string(
            &path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        let stem = c_string(
            &path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        let ext = c_string(
            &path
                .extension()
                .map(|s| s.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default(),
        );
        let raw = retro_game_info_ext {
            full_path: ptr::null(),
            archive_path: ptr::null(),
            archive_file: ptr::null(),
            dir: dir.as_ptr(),
            name: stem.as_ptr(),
            ext: ext.as_ptr(),
            meta: ptr::null(),
            data: data.as_ptr().cast(),
            size: data.len(),
            file_in_archive: false,
            persistent_data: false,
        };
        self.game_ext = Some(GameInfoExt {
            _full_path: full_path,
            _dir: dir,
            _name: stem,
            _ext: ext,
            raw,
        });
    }

    pub(crate) fn clear_game(&mut self) {
        self.game_ext = None;
        self.memory_map = MemoryMapTable::default();
    }

    /// Value the core gets for `key`: an override, else the declared default.
    pub fn option_value(&self, key: &str) -> Option<&str> {
        self.option_overrides
            .get(key)
            .map(String::as_str)
            .or_else(|| {
                self.options
                    .get(key)
                    .and_then(|o| o.values.first())
                    .map(String::as_str)
            })
    }

    /// Answer one environment command.
    ///
    /// # Safety
    /// `data` must be what libretro.h specifies for `cmd`.
    pub unsafe fn handle(&mut self, cmd: c_uint, data: *mut c_void) -> bool {
        if cmd & ENVIRONMENT_EXPERIMENTAL != 0 {
            debug!(cmd, "experimental environment command");
        }
        if cmd & ENVIRONMENT_PRIVATE != 0 {
            debug!(cmd, "frontend-private environment command");
        }
        let command = cmd & 0xFFFF;

        match command {
            env::SET_ROTATION => true,
            env::GET_CAN_DUPE => write_out(data, true),
            env::GET_SYSTEM_DIRECTORY | env::GET_CORE_ASSETS_DIRECTORY | env::GET_SAVE_DIRECTORY => {
                write_out(data, self.system_dir.as_ptr())
            }
            env::SET_PIXEL_FORMAT => {
                if data.is_null() {
                    return false;
                }
                let code = *data.cast::<c_uint>();
                match PixelFormat::from_raw(code) {
                    Some(format) => {
                        debug!(?format, "pixel format");
                        self.pixel_format = format;
                        true
                    }
                    None => {
                        warn!(code, "rejected unknown pixel format");
                        false
                    }
                }
            }
            env::SET_INPUT_DESCRIPTORS => {
                let mut cursor = data.cast::<retro_input_descriptor>().cast_const();
                while !cursor.is_null() && !(*cursor).description.is_null() {
                    let d = &*cursor;
                    debug!(
                        port = d.port,
                        device = d.device,
                        id = d.id,
                        "input: {}",
                        ffi::string_from_ptr(d.description)
                    );
                    cursor = cursor.add(1);
                }
                true
            }
            env::SET_VARIABLES => {
                let mut cursor = data.cast::<retro_variable>().cast_const();
                while !cursor.is_null() && !(*cursor).key.is_null() {
                    let key = ffi::string_from_ptr((*cursor).key);
                    let option = CoreOption::parse(&ffi::string_from_ptr((*cursor).value));
                    debug!(%key, values = ?option.values, "core option");
                    self.options.insert(key, option);
                    cursor = cursor.add(1);
                }
                true
            }
            env::GET_VARIABLE => {
                if data.is_null() {
                    return false;
                }
                let variable = &mut *data.cast::<retro_variable>();
                let key = ffi::string_from_ptr(variable.key);
                match self.option_value(&key).map(c_string) {
                    Some(value) => {
                        // Keep the previous pointer valid when nothing changed.
                        let slot = self.variable_cache.entry(key).or_default();
                        if *slot != value {
                            *slot = value;
                        }
                        variable.value = slot.as_ptr();
                        true
                    }
                    None => {
                        variable.value = ptr::null();
                        false
                    }
                }
            }
            env::GET_VARIABLE_UPDATE => {
                write_out(data, false);
                false
            }
            env::SET_SUPPORT_NO_GAME => {
                debug!("core supports running without a game");
                true
            }
            env::GET_LOG_INTERFACE => write_out(
                data,
                retro_log_callback {
                    log: log_message_thunk,
                },
            ),
            env::SET_CONTROLLER_INFO => {
                debug!("controller info received");
                true
            }
            env::SET_MEMORY_MAPS => {
                if data.is_null() {
                    return false;
                }
                let map = &*data.cast::<retro_memory_map>();
                let descriptors = if map.descriptors.is_null() {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts(map.descriptors, map.num_descriptors as usize)
                        .iter()
                        .map(|raw| MemoryDescriptor::from_raw(raw))
                        .collect()
                };
                for d in &descriptors {
                    debug!(
                        start = format_args!("{:#x}", d.start),
                        length = format_args!("{:#x}", d.length),
                        offset = d.offset,
                        space = %d.address_space,
                        "memory descriptor"
                    );
                }
                info!(count = descriptors.len(), "memory map set");
                self.memory_map = MemoryMapTable::new(descriptors);
                true
            }
            env::SET_GEOMETRY => {
                if data.is_null() {
                    return false;
                }
                self.geometry = *data.cast::<retro_game_geometry>();
                debug!(
                    width = self.geometry.base_width,
                    height = self.geometry.base_height,
                    "geometry changed"
                );
                true
            }
            env::GET_AUDIO_VIDEO_ENABLE => {
                let mut bits = AV_ENABLE_AUDIO;
                if self.video_enabled {
                    bits |= AV_ENABLE_VIDEO;
                }
                write_out::<c_int>(data, bits)
            }
            env::GET_MESSAGE_INTERFACE_VERSION => write_out::<c_uint>(data, 1),
            env::GET_GAME_INFO_EXT => match &self.game_ext {
                Some(ext) => write_out(data, ptr::addr_of!(ext.raw)),
                None => false,
            },
            env::GET_LED_INTERFACE
            | env::GET_INPUT_BITMASKS
            | env::GET_CORE_OPTIONS_VERSION
            | env::SET_FASTFORWARDING_OVERRIDE => false,
            _ => {
                debug!(command, "unhandled environment command");
                false
            }
        }
    }
}

fn c_string(text: &str) -> CString {
    // Interior NULs cannot be represented; cut the string there.
    let end = text.find('\0').unwrap_or(text.len());
    CString::new(&text[..end]).unwrap_or_default()
}

/// Store `value` through an out-pointer, reporting whether it was written.
unsafe fn write_out<T>(data: *mut c_void, value: T) -> bool {
    if data.is_null() {
        return false;
    }
    data.cast::<T>().write(value);
    true
}

thread_local! {
    static ACTIVE: Cell<*mut HostCallbacks> = const { Cell::new(ptr::null_mut()) };
}

/// Routes callbacks on this thread to one [`HostCallbacks`] while alive.
///
/// Guards nest; dropping one restores whatever was active before it.
pub(crate) struct ActiveGuard {
    previous: *mut HostCallbacks,
}

impl ActiveGuard {
    /// # Safety
    /// `callbacks` must stay valid, and must not be accessed through any
    /// other path, until the guard is dropped.
    pub(crate) unsafe fn install(callbacks: *mut HostCallbacks) -> Self {
        let previous = ACTIVE.with(|slot| slot.replace(callbacks));
        Self { previous }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|slot| slot.set(self.previous));
    }
}

/// Run `f` against the active callbacks, or return `fallback`.
///
/// Panics are caught here: unwinding into the core is undefined behavior.
fn dispatch<R>(fallback: R, f: impl FnOnce(&mut HostCallbacks) -> R) -> R {
    let active = ACTIVE.with(Cell::get);
    if active.is_null() {
        return fallback;
    }
    // SAFETY: a non-null slot was installed by an `ActiveGuard` whose
    // contract makes this the only live reference.
    let callbacks = unsafe { &mut *active };
    match panic::catch_unwind(AssertUnwindSafe(|| f(callbacks))) {
        Ok(value) => value,
        Err(_) => {
            error!("panic inside core callback");
            fallback
        }
    }
}

pub(crate) unsafe extern "C" fn environment_thunk(cmd: c_uint, data: *mut c_void) -> bool {
    dispatch(false, |callbacks| unsafe { callbacks.handle(cmd, data) })
}

pub(crate) unsafe extern "C" fn video_refresh_thunk(
    data: *const c_void,
    width: c_uint,
    height: c_uint,
    pitch: usize,
) {
    dispatch((), |callbacks| {
        if !callbacks.video_enabled {
            return;
        }
        callbacks.video_frames += 1;
        // Null data is a duped frame.
        if data.is_null() || height == 0 {
            return;
        }
        let format = callbacks.pixel_format;
        let length = pitch * (height as usize - 1) + width as usize * format.bytes_per_pixel();
        // SAFETY: the core hands over `height` rows of `pitch` bytes.
        let src = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), length) };
        if !callbacks.frame.capture(format, src, width, height, pitch) {
            warn!(width, height, pitch, "frame geometry does not fit buffer");
        }
    })
}

pub(crate) unsafe extern "C" fn audio_sample_thunk(_left: i16, _right: i16) {
    dispatch((), |callbacks| callbacks.audio_frames += 1)
}

pub(crate) unsafe extern "C" fn audio_sample_batch_thunk(_data: *const i16, frames: usize) -> usize {
    dispatch(frames, |callbacks| {
        callbacks.audio_frames += frames as u64;
        frames
    })
}

pub(crate) unsafe extern "C" fn input_poll_thunk() {}

pub(crate) unsafe extern "C" fn input_state_thunk(
    port: c_uint,
    device: c_uint,
    index: c_uint,
    id: c_uint,
) -> i16 {
    dispatch(0, |callbacks| callbacks.input.state(port, device, index, id))
}

/// Forward a core log line to `tracing`. Format arguments are not expanded.
unsafe extern "C" fn log_message_thunk(level: c_uint, fmt: *const c_char) {
    let message = ffi::string_from_ptr(fmt);
    let message = message.trim_end();
    match level {
        0 => debug!(target: "retrohost::core", "{}", message),
        1 => info!(target: "retrohost::core", "{}", message),
        2 => warn!(target: "retrohost::core", "{}", message),
        _ => error!(target: "retrohost::core", "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callbacks() -> HostCallbacks {
        HostCallbacks::new(&HostConfig::new().with_option("fuse_machine", "Spectrum 128K"))
    }

    #[test]
    fn test_pixel_format_negotiation() {
        let mut cb = callbacks();
        let mut code: c_uint = 1;
        assert!(unsafe { cb.handle(env::SET_PIXEL_FORMAT, (&mut code as *mut c_uint).cast()) });
        assert_eq!(cb.pixel_format, PixelFormat::Xrgb8888);

        let mut bad: c_uint = 7;
        assert!(!unsafe { cb.handle(env::SET_PIXEL_FORMAT, (&mut bad as *mut c_uint).cast()) });
        assert_eq!(cb.pixel_format, PixelFormat::Xrgb8888);
    }

    #[test]
    fn test_unknown_command_is_declined() {
        let mut cb = callbacks();
        assert!(!unsafe { cb.handle(9999, ptr::null_mut()) });
        assert!(!unsafe { cb.handle(9999 | ENVIRONMENT_EXPERIMENTAL, ptr::null_mut()) });
    }

    #[test]
    fn test_experimental_bit_is_masked() {
        let mut cb = callbacks();
        let mut can_dupe = false;
        let handled = unsafe {
            cb.handle(
                env::GET_CAN_DUPE | ENVIRONMENT_EXPERIMENTAL,
                (&mut can_dupe as *mut bool).cast(),
            )
        };
        assert!(handled);
        assert!(can_dupe);
    }

    #[test]
    fn test_variable_update_reports_no_change() {
        let mut cb = callbacks();
        let mut updated = true;
        unsafe { cb.handle(env::GET_VARIABLE_UPDATE, (&mut updated as *mut bool).cast()) };
        assert!(!updated);
    }

    #[test]
    fn test_variables_defaults_and_overrides() {
        let mut cb = callbacks();
        let keys = [c_string("fuse_machine"), c_string("fuse_fast_load")];
        let values = [
            c_string("Model; Spectrum 48K|Spectrum 128K"),
            c_string("Tape fast load; enabled|disabled"),
        ];
        let declared = [
            retro_variable { key: keys[0].as_ptr(), value: values[0].as_ptr() },
            retro_variable { key: keys[1].as_ptr(), value: values[1].as_ptr() },
            retro_variable { key: ptr::null(), value: ptr::null() },
        ];
        assert!(unsafe { cb.handle(env::SET_VARIABLES, declared.as_ptr() as *mut c_void) });
        assert_eq!(cb.options.len(), 2);

        let mut query = retro_variable { key: keys[1].as_ptr(), value: ptr::null() };
        assert!(unsafe { cb.handle(env::GET_VARIABLE, (&mut query as *mut retro_variable).cast()) });
        assert_eq!(unsafe { ffi::string_from_ptr(query.value) }, "enabled");

        let mut query = retro_variable { key: keys[0].as_ptr(), value: ptr::null() };
        assert!(unsafe { cb.handle(env::GET_VARIABLE, (&mut query as *mut retro_variable).cast()) });
        assert_eq!(unsafe { ffi::string_from_ptr(query.value) }, "Spectrum 128K");

        let unknown = c_string("nope");
        let mut query = retro_variable { key: unknown.as_ptr(), value: ptr::null() };
        assert!(!unsafe { cb.handle(env::GET_VARIABLE, (&mut query as *mut retro_variable).cast()) });
        assert!(query.value.is_null());
    }

    #[test]
    fn test_memory_maps_replace_table() {
        let mut cb = callbacks();
        let mut ram = vec![0x5Au8; 0x4000];
        let space = c_string("ram");
        let descriptors = [retro_memory_descriptor {
            flags: 0,
            ptr: ram.as_mut_ptr().cast(),
            offset: 0,
            start: 0x4000,
            select: 0,
            disconnect: 0,
            len: 0x4000,
            addrspace: space.as_ptr(),
        }];
        let mut map = retro_memory_map {
            descriptors: descriptors.as_ptr(),
            num_descriptors: 1,
        };
        assert!(unsafe { cb.handle(env::SET_MEMORY_MAPS, (&mut map as *mut retro_memory_map).cast()) });
        assert_eq!(cb.memory_map.descriptors().len(), 1);
        assert_eq!(cb.memory_map.descriptors()[0].address_space, "ram");
        assert_eq!(cb.memory_map.read(0x4000, 2).unwrap(), vec![0x5A, 0x5A]);
    }

    #[test]
    fn test_audio_video_enable_tracks_suppression() {
        let mut cb = callbacks();
        let mut bits: c_int = 0;
        unsafe { cb.handle(env::GET_AUDIO_VIDEO_ENABLE, (&mut bits as *mut c_int).cast()) };
        assert_eq!(bits, AV_ENABLE_VIDEO | AV_ENABLE_AUDIO);

        cb.video_enabled = false;
        unsafe { cb.handle(env::GET_AUDIO_VIDEO_ENABLE, (&mut bits as *mut c_int).cast()) };
        assert_eq!(bits, AV_ENABLE_AUDIO);
    }

    #[test]
    fn test_game_info_ext() {
        let mut cb = callbacks();
        let mut out: *const retro_game_info_ext = ptr::null();
        assert!(!unsafe { cb.handle(env::GET_GAME_INFO_EXT, (&mut out as *mut *const retro_game_info_ext).cast()) });

        let rom = vec![1u8, 2, 3];
        cb.set_game("games/Jet Set Willy.TAP", &rom);
        assert!(unsafe { cb.handle(env::GET_GAME_INFO_EXT, (&mut out as *mut *const retro_game_info_ext).cast()) });
        let ext = unsafe { &*out };
        assert_eq!(ext.size, 3);
        assert_eq!(unsafe { ffi::string_from_ptr(ext.ext) }, "tap");
        assert_eq!(unsafe { ffi::string_from_ptr(ext.name) }, "Jet Set Willy");
    }

    #[test]
    fn test_thunks_are_inert_without_guard() {
        assert!(!unsafe { environment_thunk(env::GET_CAN_DUPE, ptr::null_mut()) });
        assert_eq!(unsafe { input_state_thunk(0, RETRO_DEVICE_JOYPAD, 0, 0) }, 0);
    }

    #[test]
    fn test_guard_routes_and_restores() {
        let mut cb = Box::new(callbacks());
        let raw: *mut HostCallbacks = &mut *cb;
        {
            let _guard = unsafe { ActiveGuard::install(raw) };
            let mut can_dupe = false;
            assert!(unsafe { environment_thunk(env::GET_CAN_DUPE, (&mut can_dupe as *mut bool).cast()) });
            assert!(can_dupe);
            unsafe { audio_sample_batch_thunk(ptr::null(), 735) };
        }
        assert!(ACTIVE.with(Cell::get).is_null());
        assert_eq!(cb.audio_frames, 735);
    }

    #[test]
    fn test_log_interface_forwards_every_level() {
        let mut cb = callbacks();
        let mut out = std::mem::MaybeUninit::<retro_log_callback>::uninit();
        assert!(unsafe { cb.handle(env::GET_LOG_INTERFACE, out.as_mut_ptr().cast()) });
        let log = unsafe { out.assume_init() }.log;
        assert_eq!(log as usize, log_message_thunk as usize);

        let message = CString::new("core says hello\n").unwrap();
        for level in 0..=4 {
            unsafe { log(level, message.as_ptr()) };
        }
        unsafe { log(1, ptr::null()) };
    }

    #[test]
    fn test_suppressed_video_is_not_captured() {
        let mut cb = Box::new(callbacks());
        // 2x2 RGB1555, pitch 4.
        let pixels = [0xFFu8; 8];

        cb.video_enabled = false;
        {
            let _guard = unsafe { ActiveGuard::install(&mut *cb) };
            unsafe { video_refresh_thunk(pixels.as_ptr().cast(), 2, 2, 4) };
        }
        assert_eq!(cb.video_frames, 0);
        assert!(cb.frame.pixels.is_empty());

        cb.video_enabled = true;
        {
            let _guard = unsafe { ActiveGuard::install(&mut *cb) };
            unsafe { video_refresh_thunk(pixels.as_ptr().cast(), 2, 2, 4) };
            unsafe { video_refresh_thunk(ptr::null(), 2, 2, 4) };
        }
        assert_eq!(cb.video_frames, 2);
        assert_eq!((cb.frame.width, cb.frame.height), (2, 2));
        assert_eq!(cb.frame.pixels.len(), 16);
    }
}
