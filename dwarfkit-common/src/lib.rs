//! Common functionality for `dwarfkit`.
//!
//! This crate exposes a small set of key types:
//!
//!  - [`ByteView`]: Gives access to binary data in-memory or on the file system, and hands out
//!    bounds-checked sub-ranges for the debug sections located by a container reader.
//!  - [`Arch`] and [`CpuFamily`]: The target architecture of a binary, parsed from the machine tag
//!    reported by the container reader. Used to name DWARF register numbers.
//!
//! # Features
//!
//! - `serde` (optional): Implements `serde::Deserialize` and `serde::Serialize` for [`Arch`].
//!   In the `dwarfkit` crate, this feature is exposed via `common-serde`.

#![warn(missing_docs)]

mod byteview;
mod types;

pub use crate::byteview::*;
pub use crate::types::*;
