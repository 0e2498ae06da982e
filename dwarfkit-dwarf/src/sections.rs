//! Decoder configuration and the debug sections handed over by a container reader.

use std::fmt;
use std::str::FromStr;

use dwarfkit_common::{Arch, ByteView, UnknownArchError};
use gimli::Format;

use crate::context::SchemaContext;
use crate::error::{DwarfError, Result};
use crate::Endian;

/// Addressing parameters of the binary that contains the debug information.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde_::Serialize, serde_::Deserialize))]
#[cfg_attr(feature = "serde", serde(crate = "serde_"))]
pub struct DwarfConfig {
    /// Whether multi-byte values are stored little-endian.
    pub little_endian: bool,
    /// The machine tag reported by the container, such as `"x64"` or `"EM_AARCH64"`.
    pub machine_arch: String,
    /// Address size in bytes for records that do not declare their own.
    pub default_address_size: u8,
}

impl DwarfConfig {
    /// Creates a configuration.
    pub fn new(little_endian: bool, machine_arch: impl Into<String>, address_size: u8) -> Self {
        DwarfConfig {
            little_endian,
            machine_arch: machine_arch.into(),
            default_address_size: address_size,
        }
    }

    /// Parses the machine tag.
    pub fn arch(&self) -> Result<Arch, UnknownArchError> {
        Arch::from_str(&self.machine_arch)
    }

    /// The byte order of the binary.
    pub fn endianness(&self) -> Endian {
        if self.little_endian {
            Endian::Little
        } else {
            Endian::Big
        }
    }

    /// The context used before a record header refines it: 32-bit DWARF, version 2.
    pub fn default_context(&self) -> SchemaContext {
        SchemaContext::new(
            self.endianness(),
            Format::Dwarf32,
            self.default_address_size,
            2,
        )
    }
}

impl Default for DwarfConfig {
    fn default() -> Self {
        DwarfConfig::new(true, "x86_64", 8)
    }
}

/// DWARF section information including its data.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct DwarfSection<'d> {
    /// Memory address of this section in virtual memory.
    pub address: u64,

    /// File offset of this section.
    pub offset: u64,

    /// Binary data of this section.
    pub data: &'d [u8],
}

impl<'d> DwarfSection<'d> {
    /// Creates a section that is not mapped at any address.
    pub fn new(data: &'d [u8]) -> Self {
        DwarfSection {
            address: 0,
            offset: 0,
            data,
        }
    }

    /// Sets the virtual address of the section.
    pub fn with_address(mut self, address: u64) -> Self {
        self.address = address;
        self
    }

    /// Borrows the section at `offset..offset + len` of a loaded file.
    ///
    /// Returns `None` if the range is out of bounds of the view.
    pub fn from_view(view: &'d ByteView<'_>, offset: u64, len: u64, address: u64) -> Option<Self> {
        Some(DwarfSection {
            address,
            offset,
            data: view.range(offset, len)?,
        })
    }

    /// Size of the section data in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the section is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for DwarfSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DwarfSection")
            .field("address", &format_args!("{:#x}", self.address))
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("len()", &self.data.len())
            .finish()
    }
}

/// Provides access to DWARF debugging information independent of the container file type.
pub trait Dwarf<'d> {
    /// Returns whether the file was compiled for a big-endian or little-endian machine.
    fn endianity(&self) -> Endian;

    /// Returns information and raw data of a section.
    ///
    /// The section name is given without leading punctuation, such dots or underscores. For
    /// instance, the name of the Debug Info section would be `"debug_info"`, which translates to
    /// `".debug_info"` in ELF and `"__debug_info"` in MachO.
    fn raw_section(&self, name: &str) -> Option<DwarfSection<'d>>;

    /// Returns information and data of a section.
    ///
    /// Containers with compressed sections override this to return decompressed data.
    fn section(&self, name: &str) -> Option<DwarfSection<'d>> {
        self.raw_section(name)
    }

    /// Determines whether the specified section exists.
    fn has_section(&self, name: &str) -> bool {
        self.raw_section(name).is_some()
    }
}

/// All sections the decoder reads from.
///
/// Every section is optional. Operations that need an absent section fail with
/// [`DwarfError::MissingSection`].
#[derive(Clone, Copy, Debug, Default)]
#[allow(missing_docs)]
pub struct DwarfSections<'d> {
    pub info: Option<DwarfSection<'d>>,
    pub abbrev: Option<DwarfSection<'d>>,
    pub str: Option<DwarfSection<'d>>,
    pub line: Option<DwarfSection<'d>>,
    pub line_str: Option<DwarfSection<'d>>,
    pub str_offsets: Option<DwarfSection<'d>>,
    pub addr: Option<DwarfSection<'d>>,
    pub loc: Option<DwarfSection<'d>>,
    pub loclists: Option<DwarfSection<'d>>,
    pub ranges: Option<DwarfSection<'d>>,
    pub rnglists: Option<DwarfSection<'d>>,
    pub frame: Option<DwarfSection<'d>>,
    pub eh_frame: Option<DwarfSection<'d>>,
    pub aranges: Option<DwarfSection<'d>>,
    pub pubnames: Option<DwarfSection<'d>>,
    pub pubtypes: Option<DwarfSection<'d>>,
    pub sup: Option<DwarfSection<'d>>,
    pub gnu_debugaltlink: Option<DwarfSection<'d>>,
}

impl<'d> DwarfSections<'d> {
    /// Loads all sections from a DWARF container.
    pub fn from_dwarf<D>(dwarf: &D) -> Self
    where
        D: Dwarf<'d>,
    {
        DwarfSections {
            info: dwarf.section("debug_info"),
            abbrev: dwarf.section("debug_abbrev"),
            str: dwarf.section("debug_str"),
            line: dwarf.section("debug_line"),
            line_str: dwarf.section("debug_line_str"),
            str_offsets: dwarf.section("debug_str_offsets"),
            addr: dwarf.section("debug_addr"),
            loc: dwarf.section("debug_loc"),
            loclists: dwarf.section("debug_loclists"),
            ranges: dwarf.section("debug_ranges"),
            rnglists: dwarf.section("debug_rnglists"),
            frame: dwarf.section("debug_frame"),
            eh_frame: dwarf.section("eh_frame"),
            aranges: dwarf.section("debug_aranges"),
            pubnames: dwarf.section("debug_pubnames"),
            pubtypes: dwarf.section("debug_pubtypes"),
            sup: dwarf.section("debug_sup"),
            gnu_debugaltlink: dwarf.section("gnu_debugaltlink"),
        }
    }
}

/// Returns the data of a required section.
pub(crate) fn require<'d>(
    section: Option<DwarfSection<'d>>,
    name: &'static str,
) -> Result<&'d [u8]> {
    section
        .map(|section| section.data)
        .ok_or(DwarfError::MissingSection(name))
}
