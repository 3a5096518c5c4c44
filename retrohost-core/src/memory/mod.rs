//! Virtual memory: the descriptor table and the access contract built on it.
//!
//! - `MemoryMapTable`: interval translation over core-reported descriptors
//! - `MemoryAccess`: read/write contract handed to external tooling

mod access;
mod map;

pub use access::{Endian, MemoryAccess, ReadKind, WriteKind};
pub use map::{MemoryDescriptor, MemoryMapTable, Segment};
