//! A lazy decoder for DWARF debugging information.
//!
//! The entry point is [`DwarfInfo`], which is created from a [`DwarfConfig`] and the raw bytes of
//! the debug sections, collected in [`DwarfSections`]. Locating those sections inside an object
//! file is up to the caller, for instance through an implementation of the [`Dwarf`] trait.
//!
//! Nothing is decoded up front. Compile units, abbreviation tables, DIEs, and line programs are
//! parsed the first time they are requested and then cached inside the `DwarfInfo`, which hands
//! out references tied to its lifetime:
//!
//!  - [`DwarfInfo::units`] and [`DwarfInfo::unit_containing`] give access to [`CompileUnit`]s and
//!    their DIE trees through [`UnitRef`] and [`DieRef`].
//!  - [`ExprParser`] decodes DWARF expressions found in attributes, location lists, and call frame
//!    information.
//!  - [`LocationLists`], [`RangeLists`], and [`LocationParser`] decode `.debug_loc`,
//!    `.debug_loclists`, `.debug_ranges`, and `.debug_rnglists`.
//!  - [`ARanges`] and [`NameLut`] expose the address and name indexes.
//!  - [`LineProgram`] decodes line program headers and runs the line number state machine.
//!
//! The caches use interior mutability, so a `DwarfInfo` can be shared by reference but not across
//! threads.
//!
//! # Features
//!
//! - `serde` (optional): Implements `serde::Deserialize` and `serde::Serialize` for
//!   [`DwarfConfig`].

#![warn(missing_docs)]

mod abbrev;
mod aranges;
mod context;
mod die;
mod dwarfinfo;
mod error;
mod expr;
mod form;
mod line;
mod lists;
mod loclists;
mod namelut;
mod ranges;
mod reader;
mod sections;
mod sup;
mod unit;

pub use gimli;
pub use gimli::RunTimeEndian as Endian;

pub use crate::abbrev::*;
pub use crate::aranges::*;
pub use crate::context::*;
pub use crate::die::*;
pub use crate::dwarfinfo::*;
pub use crate::error::*;
pub use crate::expr::*;
pub use crate::form::*;
pub use crate::line::*;
pub use crate::lists::*;
pub use crate::loclists::*;
pub use crate::namelut::*;
pub use crate::ranges::*;
pub use crate::reader::*;
pub use crate::sections::*;
pub use crate::sup::*;
pub use crate::unit::*;
