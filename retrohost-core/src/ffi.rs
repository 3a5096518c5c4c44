//! libretro C ABI: function pointer types, structs and constants.
//!
//! Only the subset the host negotiates is declared here. Layouts follow
//! `libretro.h`; every struct is `#[repr(C)]`.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int, c_uint, c_void};

/// The only API revision the host speaks.
pub const RETRO_API_VERSION: c_uint = 1;

/// Environment command bits that are masked off before dispatch.
pub const ENVIRONMENT_EXPERIMENTAL: c_uint = 0x10000;
pub const ENVIRONMENT_PRIVATE: c_uint = 0x20000;

/// Environment command codes (after masking).
pub mod env {
    use std::os::raw::c_uint;

    pub const SET_ROTATION: c_uint = 1;
    pub const GET_CAN_DUPE: c_uint = 3;
    pub const GET_SYSTEM_DIRECTORY: c_uint = 9;
    pub const SET_PIXEL_FORMAT: c_uint = 10;
    pub const SET_INPUT_DESCRIPTORS: c_uint = 11;
    pub const GET_VARIABLE: c_uint = 15;
    pub const SET_VARIABLES: c_uint = 16;
    pub const GET_VARIABLE_UPDATE: c_uint = 17;
    pub const SET_SUPPORT_NO_GAME: c_uint = 18;
    pub const GET_LOG_INTERFACE: c_uint = 27;
    pub const GET_CORE_ASSETS_DIRECTORY: c_uint = 30;
    pub const GET_SAVE_DIRECTORY: c_uint = 31;
    pub const SET_CONTROLLER_INFO: c_uint = 35;
    pub const SET_MEMORY_MAPS: c_uint = 36;
    pub const SET_GEOMETRY: c_uint = 37;
    pub const GET_LED_INTERFACE: c_uint = 46;
    pub const GET_AUDIO_VIDEO_ENABLE: c_uint = 47;
    pub const GET_INPUT_BITMASKS: c_uint = 51;
    pub const GET_CORE_OPTIONS_VERSION: c_uint = 52;
    pub const GET_MESSAGE_INTERFACE_VERSION: c_uint = 59;
    pub const SET_FASTFORWARDING_OVERRIDE: c_uint = 64;
    pub const GET_GAME_INFO_EXT: c_uint = 66;
}

/// Input device classes passed to `retro_input_state_t`.
pub const RETRO_DEVICE_JOYPAD: c_uint = 1;
pub const RETRO_DEVICE_KEYBOARD: c_uint = 3;

/// Bits reported through `GET_AUDIO_VIDEO_ENABLE`.
pub const AV_ENABLE_VIDEO: c_int = 1;
pub const AV_ENABLE_AUDIO: c_int = 2;

pub type retro_environment_t = unsafe extern "C" fn(cmd: c_uint, data: *mut c_void) -> bool;
pub type retro_video_refresh_t =
    unsafe extern "C" fn(data: *const c_void, width: c_uint, height: c_uint, pitch: usize);
pub type retro_audio_sample_t = unsafe extern "C" fn(left: i16, right: i16);
pub type retro_audio_sample_batch_t = unsafe extern "C" fn(data: *const i16, frames: usize) -> usize;
pub type retro_input_poll_t = unsafe extern "C" fn();
pub type retro_input_state_t =
    unsafe extern "C" fn(port: c_uint, device: c_uint, index: c_uint, id: c_uint) -> i16;

/// Declared without the trailing varargs of `retro_log_printf_t`: the host
/// only ever logs the format string itself.
pub type retro_log_printf_t = unsafe extern "C" fn(level: c_uint, fmt: *const c_char);

#[repr(C)]
pub struct retro_system_info {
    pub library_name: *const c_char,
    pub library_version: *const c_char,
    pub valid_extensions: *const c_char,
    pub need_fullpath: bool,
    pub block_extract: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct retro_game_geometry {
    pub base_width: c_uint,
    pub base_height: c_uint,
    pub max_width: c_uint,
    pub max_height: c_uint,
    pub aspect_ratio: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct retro_system_timing {
    pub fps: f64,
    pub sample_rate: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct retro_system_av_info {
    pub geometry: retro_game_geometry,
    pub timing: retro_system_timing,
}

#[repr(C)]
pub struct retro_game_info {
    pub path: *const c_char,
    pub data: *const c_void,
    pub size: usize,
    pub meta: *const c_char,
}

#[repr(C)]
pub struct retro_game_info_ext {
    pub full_path: *const c_char,
    pub archive_path: *const c_char,
    pub archive_file: *const c_char,
    pub dir: *const c_char,
    pub name: *const c_char,
    pub ext: *const c_char,
    pub meta: *const c_char,
    pub data: *const c_void,
    pub size: usize,
    pub file_in_archive: bool,
    pub persistent_data: bool,
}

#[repr(C)]
pub struct retro_memory_descriptor {
    pub flags: u64,
    pub ptr: *mut c_void,
    pub offset: usize,
    pub start: usize,
    pub select: usize,
    pub disconnect: usize,
    pub len: usize,
    pub addrspace: *const c_char,
}

#[repr(C)]
pub struct retro_memory_map {
    pub descriptors: *const retro_memory_descriptor,
    pub num_descriptors: c_uint,
}

#[repr(C)]
pub struct retro_variable {
    pub key: *const c_char,
    pub value: *const c_char,
}

#[repr(C)]
pub struct retro_log_callback {
    pub log: retro_log_printf_t,
}

#[repr(C)]
pub struct retro_input_descriptor {
    pub port: c_uint,
    pub device: c_uint,
    pub index: c_uint,
    pub id: c_uint,
    pub description: *const c_char,
}

#[repr(C)]
pub struct retro_controller_description {
    pub desc: *const c_char,
    pub id: c_uint,
}

#[repr(C)]
pub struct retro_controller_info {
    pub types: *const retro_controller_description,
    pub num_types: c_uint,
}

/// Read a nullable C string into an owned `String` (lossy).
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
pub unsafe fn string_from_ptr(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
