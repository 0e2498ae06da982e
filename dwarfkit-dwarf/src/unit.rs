//! Unit headers and compile units of `.debug_info`.

use std::cell::RefCell;
use std::fmt;

use elsa::FrozenMap;
use gimli::constants::{self, DwUt};
use gimli::Format;

use crate::context::SchemaContext;
use crate::die::{Die, DieRef, DieTree};
use crate::dwarfinfo::DwarfInfo;
use crate::error::{DwarfError, Result};
use crate::reader::Reader;
use crate::Endian;

/// The header of a unit in `.debug_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitHeader {
    /// Section offset of the header.
    pub offset: u64,
    /// Length of the unit, not including the initial length field.
    pub unit_length: u64,
    /// 32-bit or 64-bit DWARF.
    pub format: Format,
    /// DWARF version, from 2 through 5.
    pub version: u16,
    /// The unit type. Only DWARF 5 headers declare one.
    pub unit_type: Option<DwUt>,
    /// Offset of the unit's abbreviation table in `.debug_abbrev`.
    pub abbrev_offset: u64,
    /// Size of a target address in bytes.
    pub address_size: u8,
    /// The split DWARF id of skeleton and split compile units.
    pub dwo_id: Option<u64>,
    /// The signature of type units.
    pub type_signature: Option<u64>,
    /// Unit-relative offset of the type DIE in type units.
    pub type_offset: Option<u64>,
    die_offset: u64,
}

impl UnitHeader {
    /// Parses a unit header at `offset`.
    ///
    /// The initial length selects the offset width and the version selects the shape of the rest
    /// of the header, so both are decoded before any other field.
    pub fn parse(data: &[u8], offset: u64, endian: Endian) -> Result<Self> {
        let mut reader = Reader::at(data, offset, endian);
        let (unit_length, format) = reader.initial_length()?;
        let end = reader.position().saturating_add(unit_length);
        let mut reader = reader.bounded(end)?;

        let version_offset = reader.position();
        let version = reader.u16()?;
        if !(2..=5).contains(&version) {
            return Err(DwarfError::malformed(
                version_offset,
                format!("unsupported unit version {version}"),
            ));
        }

        let mut header = UnitHeader {
            offset,
            unit_length,
            format,
            version,
            unit_type: None,
            abbrev_offset: 0,
            address_size: 0,
            dwo_id: None,
            type_signature: None,
            type_offset: None,
            die_offset: 0,
        };

        if version >= 5 {
            let type_offset = reader.position();
            let unit_type = DwUt(reader.u8()?);
            header.address_size = reader.u8()?;
            header.abbrev_offset = reader.offset(format)?;

            match unit_type {
                constants::DW_UT_compile | constants::DW_UT_partial => (),
                constants::DW_UT_skeleton | constants::DW_UT_split_compile => {
                    header.dwo_id = Some(reader.u64()?);
                }
                constants::DW_UT_type | constants::DW_UT_split_type => {
                    header.type_signature = Some(reader.u64()?);
                    header.type_offset = Some(reader.offset(format)?);
                }
                other => {
                    return Err(DwarfError::malformed(
                        type_offset,
                        format!("invalid unit type {other}"),
                    ))
                }
            }

            header.unit_type = Some(unit_type);
        } else {
            header.abbrev_offset = reader.offset(format)?;
            header.address_size = reader.u8()?;
        }

        header.die_offset = reader.position();
        Ok(header)
    }

    /// Section offset of the unit's root DIE, immediately after the header.
    pub fn die_offset(&self) -> u64 {
        self.die_offset
    }

    /// Total size of the unit including its initial length field.
    pub fn size(&self) -> u64 {
        self.unit_length + u64::from(self.format.initial_length_size())
    }

    /// Section offset one past the last byte of the unit.
    pub fn end(&self) -> u64 {
        self.offset + self.size()
    }
}

/// The `DW_AT_*_base` attributes of a unit's root DIE.
///
/// Indexed attribute forms are resolved relative to these offsets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnitBases {
    /// `DW_AT_addr_base`, or `DW_AT_GNU_addr_base` in pre-standard split DWARF.
    pub addr_base: Option<u64>,
    /// `DW_AT_str_offsets_base`.
    pub str_offsets_base: Option<u64>,
    /// `DW_AT_loclists_base`.
    pub loclists_base: Option<u64>,
    /// `DW_AT_rnglists_base`.
    pub rnglists_base: Option<u64>,
}

impl UnitBases {
    pub(crate) fn from_root(root: &Die<'_>) -> Self {
        let base = |name| root.attr(name).and_then(|attr| attr.raw.as_u64());
        UnitBases {
            addr_base: base(constants::DW_AT_addr_base)
                .or_else(|| base(constants::DW_AT_GNU_addr_base)),
            str_offsets_base: base(constants::DW_AT_str_offsets_base),
            loclists_base: base(constants::DW_AT_loclists_base),
            rnglists_base: base(constants::DW_AT_rnglists_base),
        }
    }
}

/// A unit of `.debug_info` together with the DIEs parsed from it so far.
///
/// The root DIE is parsed when the unit is created. All other DIEs are parsed on first access
/// and cached by section offset, so that repeated lookups return the same entry.
pub struct CompileUnit<'d> {
    header: UnitHeader,
    ctx: SchemaContext,
    bases: UnitBases,
    dies: FrozenMap<u64, Box<Die<'d>>>,
    offsets: RefCell<Vec<u64>>,
}

impl<'d> CompileUnit<'d> {
    pub(crate) fn new(header: UnitHeader, endian: Endian) -> Self {
        CompileUnit {
            ctx: SchemaContext::new(endian, header.format, header.address_size, header.version),
            header,
            bases: UnitBases::default(),
            dies: FrozenMap::new(),
            offsets: RefCell::new(Vec::new()),
        }
    }

    /// The unit header.
    pub fn header(&self) -> &UnitHeader {
        &self.header
    }

    /// The context for decoding values of this unit.
    pub fn ctx(&self) -> SchemaContext {
        self.ctx
    }

    /// The base offsets declared by the root DIE.
    pub fn bases(&self) -> &UnitBases {
        &self.bases
    }

    /// Section offset of the unit header.
    pub fn offset(&self) -> u64 {
        self.header.offset
    }

    /// DWARF version of the unit.
    pub fn version(&self) -> u16 {
        self.header.version
    }

    /// Total size of the unit including its initial length field.
    pub fn size(&self) -> u64 {
        self.header.size()
    }

    /// Section offset one past the last byte of the unit.
    pub fn end(&self) -> u64 {
        self.header.end()
    }

    /// Whether a section offset lies within this unit, including its header.
    pub fn contains(&self, offset: u64) -> bool {
        (self.header.offset..self.header.end()).contains(&offset)
    }

    /// Offsets of all DIEs parsed so far, in ascending order.
    pub fn parsed_offsets(&self) -> Vec<u64> {
        self.offsets.borrow().clone()
    }

    pub(crate) fn set_root(&mut self, root: Die<'d>, bases: UnitBases) {
        self.bases = bases;
        self.insert(root);
    }

    pub(crate) fn cached(&self, offset: u64) -> Option<&Die<'d>> {
        self.dies.get(&offset)
    }

    pub(crate) fn insert(&self, die: Die<'d>) -> &Die<'d> {
        let offset = die.offset();
        let mut offsets = self.offsets.borrow_mut();
        if let Err(index) = offsets.binary_search(&offset) {
            offsets.insert(index, offset);
        }
        self.dies.insert(offset, Box::new(die))
    }
}

impl fmt::Debug for CompileUnit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileUnit")
            .field("header", &self.header)
            .field("bases", &self.bases)
            .field("parsed", &self.offsets.borrow().len())
            .finish()
    }
}

/// A compile unit along with the context it was parsed from.
#[derive(Clone, Copy)]
pub struct UnitRef<'d, 'a> {
    pub(crate) info: &'a DwarfInfo<'d>,
    pub(crate) unit: &'a CompileUnit<'d>,
}

impl<'d, 'a> UnitRef<'d, 'a> {
    /// The decoding context this unit belongs to.
    pub fn info(&self) -> &'a DwarfInfo<'d> {
        self.info
    }

    /// The unit itself.
    pub fn unit(&self) -> &'a CompileUnit<'d> {
        self.unit
    }

    /// The unit's root DIE, typically a `DW_TAG_compile_unit`.
    pub fn root(&self) -> Result<DieRef<'d, 'a>> {
        self.die_at(self.unit.header.die_offset)
    }

    /// Returns the DIE at a section offset within this unit.
    ///
    /// The DIE is parsed and cached on first access. The offset must point at the start of an
    /// entry; this is not verified beyond checking that it lies within the unit.
    pub fn die_at(&self, offset: u64) -> Result<DieRef<'d, 'a>> {
        if let Some(die) = self.unit.cached(offset) {
            return Ok(DieRef::new(*self, die));
        }

        if offset < self.unit.header.die_offset || offset >= self.unit.header.end() {
            return Err(DwarfError::DanglingReference {
                offset: self.unit.header.offset,
                target: offset,
            });
        }

        let die = Die::parse(*self, offset, Some(&self.unit.bases))?;
        Ok(DieRef::new(*self, self.unit.insert(die)))
    }

    /// Iterates over all DIEs of the unit in document order, including null entries that
    /// terminate lists of children.
    pub fn dies(&self) -> DieTree<'d, 'a> {
        DieTree::new(self.root())
    }
}

impl<'d> std::ops::Deref for UnitRef<'d, '_> {
    type Target = CompileUnit<'d>;

    fn deref(&self) -> &Self::Target {
        self.unit
    }
}

impl fmt::Debug for UnitRef<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.unit, f)
    }
}
