//! libretro Core Host
//!
//! This crate hosts pre-built libretro emulator cores and presents the
//! emulated machine's memory as one flat, patchable address space:
//! - Native binding and environment negotiation with the core
//! - Memory map translation over the core's self-reported descriptors
//! - Two-tier (temporary / persisted) patch pools with merge-on-insert
//! - Save state capture and the reset protocol that replays patches
//!
//! # Architecture
//!
//! The host uses a layered design:
//! - `Core` trait: load, run, snapshot and expose memory of one emulator
//!   (`LibretroCore` for shared libraries, `HeadlessCore` in-process)
//! - `MemoryMapTable`: descriptor table with a pure `translate`
//! - `PatchLayer`: the four patch pools
//! - `Session`: orchestrates resets and implements `MemoryAccess`, the only
//!   surface external tooling sees

pub mod checksum;
pub mod config;
pub mod core;
pub mod error;
pub mod ffi;
pub mod input;
pub mod memory;
pub mod patch;
pub mod project;
pub mod session;
pub mod state;
pub mod system;
pub mod video;

pub use checksum::{ChecksumPatch, ChecksumRecalculator, MegadriveChecksum};
pub use config::HostConfig;
pub use crate::core::{Core, CoreMemory, HeadlessCore, LibretroCore, SystemInfo};
pub use error::{HostError, HostResult};
pub use memory::{Endian, MemoryAccess, MemoryDescriptor, MemoryMapTable, ReadKind, WriteKind};
pub use patch::{AddressKind, Durability, PatchLayer, PatchPool};
pub use project::{Project, ProjectSettings};
pub use session::{ram_fingerprint, AutoLoadLimits, Session, SessionState};
pub use state::CoreState;
pub use system::SystemProfile;
pub use video::{Frame, PixelFormat};
