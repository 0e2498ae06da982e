//! Dwarfkit is a lazy decoder for DWARF debugging information. It consists of a few largely
//! independent crates which are re-exported here behind cargo features.
//!
//! # What's in the package
//!
//! - Byte buffers for object file data and CPU architecture metadata (`common`)
//! - DWARF decoding (`dwarf`):
//!   - Compile unit headers and DIE trees, with abbreviation-driven attribute decoding
//!   - Location expressions
//!   - Location and range lists, both before and since DWARF 5
//!   - Address ranges and public name tables
//!   - Line program headers and rows
//! - Call frame information from `.debug_frame` and `.eh_frame` (`cfi`)
//!
//! Locating debug sections in an object file is not part of this library. Callers hand over the
//! raw section bytes together with a [`DwarfConfig`](dwarf::DwarfConfig) describing the target.
//!
//! # Usage
//!
//! Add `dwarfkit` as a dependency to your `Cargo.toml` and activate the features you need:
//!
//! - **`dwarf`** (default): The DWARF decoding engine.
//! - **`cfi`**: Decoding of call frame information and reconstruction of unwind tables.
//!
//! There are also alternate versions for some of the above features that additionally add
//! implementations for `serde::{Deserialize, Serialize}` on suitable types:
//!
//! - **`common-serde`**
//! - **`dwarf-serde`**

#![warn(missing_docs)]

#[doc(inline)]
pub use dwarfkit_common as common;
#[doc(inline)]
#[cfg(feature = "cfi")]
pub use dwarfkit_cfi as cfi;
#[doc(inline)]
#[cfg(feature = "dwarf")]
pub use dwarfkit_dwarf as dwarf;
