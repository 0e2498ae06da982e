//! Decoding of Call Frame Information (stack frame info).
//!
//! The root type exposed by this crate is [`CallFrameInfo`], which reads the entries of a
//! `.debug_frame` or `.eh_frame` section. The two flavors share one decoder, selected by [`Mode`].
//!
//! # Background
//!
//! Call Frame Information describes, for every address of a function, how to compute the
//! Canonical Frame Address (CFA) of the current frame and where the caller's registers were
//! saved. It is stored as bytecode: a Common Information Entry ([`Cie`]) holds the instructions
//! shared by a group of functions, and each Frame Description Entry ([`Fde`]) adds the
//! instructions for one address range.
//!
//! Executing those instructions yields a [`DecodedCallFrameTable`], whose rows map an address to
//! a [`CfaRule`] and a set of [`RegisterRule`]s:
//!
//! ```
//! use dwarfkit_cfi::{CallFrameInfo, CfiEntry, Mode};
//! use dwarfkit_dwarf::{DwarfConfig, DwarfSection};
//!
//! # fn main() -> Result<(), dwarfkit_cfi::CfiError> {
//! // A .debug_frame CIE declaring `CFA = rsp + 8`.
//! let data = [
//!     0x0c, 0x00, 0x00, 0x00, // length
//!     0xff, 0xff, 0xff, 0xff, // CIE id
//!     0x01, 0x00, // version 1, empty augmentation
//!     0x01, 0x78, 0x10, // code alignment 1, data alignment -8, return address 16
//!     0x0c, 0x07, 0x08, // DW_CFA_def_cfa rsp 8
//! ];
//!
//! let cfi = CallFrameInfo::new(DwarfSection::new(&data), DwarfConfig::default(), Mode::DebugFrame);
//! let entry = cfi.entry_at(0)?;
//! assert!(matches!(entry, CfiEntry::Cie(_)));
//!
//! let table = entry.table()?.unwrap();
//! assert_eq!(table.rows.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod encoding;
mod entry;
mod error;
mod instruction;
mod table;

pub use crate::entry::*;
pub use crate::error::*;
pub use crate::instruction::*;
pub use crate::table::*;
