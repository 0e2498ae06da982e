//! Encoding shared by location lists and range lists.
//!
//! Both list families exist in two shapes. Units before DWARF 5 store plain address pairs in
//! `.debug_loc` and `.debug_ranges`. DWARF 5 units use `.debug_loclists` and `.debug_rnglists`,
//! which are divided into list units with a header and an offset table, and whose entries start
//! with a kind byte.

use std::fmt;

use gimli::constants;
use gimli::constants::{DwLle, DwRle};
use gimli::Format;

use crate::context::SchemaContext;
use crate::die::AttributeValue;
use crate::dwarfinfo::DwarfInfo;
use crate::error::{DwarfError, Result};
use crate::reader::Reader;
use crate::unit::{CompileUnit, UnitRef};
use crate::Endian;

/// Selects between the location list and range list encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListKind {
    /// Entries of `.debug_loc` and `.debug_loclists`, which carry location expressions.
    Location,
    /// Entries of `.debug_ranges` and `.debug_rnglists`.
    Range,
}

impl ListKind {
    fn section_name(self) -> &'static str {
        match self {
            ListKind::Location => "debug_loclists",
            ListKind::Range => "debug_rnglists",
        }
    }
}

/// The bounds of a DWARF 5 list entry as encoded, before address indexes are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawListEntryKind {
    /// `DW_*LE_base_addressx`: sets the base address to an entry of `.debug_addr`.
    BaseAddressx {
        /// Index into the unit's address table.
        index: u64,
    },
    /// `DW_*LE_startx_endx`: both bounds are address indexes.
    StartxEndx {
        /// Index of the start address.
        start_index: u64,
        /// Index of the end address.
        end_index: u64,
    },
    /// `DW_*LE_startx_length`: the start is an address index.
    StartxLength {
        /// Index of the start address.
        start_index: u64,
        /// Length of the range.
        length: u64,
    },
    /// `DW_*LE_offset_pair`: bounds relative to the current base address.
    OffsetPair {
        /// Start offset.
        start: u64,
        /// End offset.
        end: u64,
    },
    /// `DW_LLE_default_location`: applies wherever no other entry does.
    DefaultLocation,
    /// `DW_*LE_base_address`: sets the base address.
    BaseAddress {
        /// The new base address.
        address: u64,
    },
    /// `DW_*LE_start_end`: absolute bounds.
    StartEnd {
        /// Start address.
        start: u64,
        /// End address.
        end: u64,
    },
    /// `DW_*LE_start_length`: absolute start and length.
    StartLength {
        /// Start address.
        start: u64,
        /// Length of the range.
        length: u64,
    },
}

/// An entry of a DWARF 5 list as encoded in the section.
///
/// The list's terminating `end_of_list` entry is not represented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawListEntry<'d> {
    /// Section offset of the kind byte.
    pub entry_offset: u64,
    /// Size of the encoded entry in bytes.
    pub entry_length: u64,
    /// The entry kind and its bounds.
    pub kind: RawListEntryKind,
    /// The location expression. Only present in location lists, and not on base address entries.
    pub expr: Option<&'d [u8]>,
}

impl RawListEntry<'_> {
    /// Whether the entry sets the base address instead of describing a range.
    pub fn is_base_address(&self) -> bool {
        matches!(
            self.kind,
            RawListEntryKind::BaseAddress { .. } | RawListEntryKind::BaseAddressx { .. }
        )
    }
}

/// Reads a DWARF 5 list up to and including its `end_of_list` entry.
pub(crate) fn parse_raw_list<'d>(
    reader: &mut Reader<'d>,
    ctx: SchemaContext,
    kind: ListKind,
) -> Result<Vec<RawListEntry<'d>>> {
    let mut entries = Vec::new();

    loop {
        let entry_offset = reader.position();
        let code = reader.u8()?;
        let entry_kind = match kind {
            ListKind::Location => read_lle(reader, ctx, DwLle(code))?,
            ListKind::Range => read_rle(reader, ctx, DwRle(code))?,
        };

        let entry_kind = match entry_kind {
            Some(entry_kind) => entry_kind,
            None => return Ok(entries),
        };

        let has_expr = kind == ListKind::Location
            && !matches!(
                entry_kind,
                RawListEntryKind::BaseAddress { .. } | RawListEntryKind::BaseAddressx { .. }
            );

        let expr = if has_expr {
            let len = reader.uleb128()?;
            Some(reader.bytes(len)?)
        } else {
            None
        };

        entries.push(RawListEntry {
            entry_offset,
            entry_length: reader.position() - entry_offset,
            kind: entry_kind,
            expr,
        });
    }
}

fn read_lle(
    reader: &mut Reader<'_>,
    ctx: SchemaContext,
    code: DwLle,
) -> Result<Option<RawListEntryKind>> {
    let kind = match code {
        constants::DW_LLE_end_of_list => return Ok(None),
        constants::DW_LLE_base_addressx => RawListEntryKind::BaseAddressx {
            index: reader.uleb128()?,
        },
        constants::DW_LLE_startx_endx => RawListEntryKind::StartxEndx {
            start_index: reader.uleb128()?,
            end_index: reader.uleb128()?,
        },
        constants::DW_LLE_startx_length => RawListEntryKind::StartxLength {
            start_index: reader.uleb128()?,
            length: reader.uleb128()?,
        },
        constants::DW_LLE_offset_pair => RawListEntryKind::OffsetPair {
            start: reader.uleb128()?,
            end: reader.uleb128()?,
        },
        constants::DW_LLE_default_location => RawListEntryKind::DefaultLocation,
        constants::DW_LLE_base_address => RawListEntryKind::BaseAddress {
            address: reader.address(ctx.address_size)?,
        },
        constants::DW_LLE_start_end => RawListEntryKind::StartEnd {
            start: reader.address(ctx.address_size)?,
            end: reader.address(ctx.address_size)?,
        },
        constants::DW_LLE_start_length => RawListEntryKind::StartLength {
            start: reader.address(ctx.address_size)?,
            length: reader.uleb128()?,
        },
        other => {
            return Err(DwarfError::malformed(
                reader.position() - 1,
                format!("unknown location list entry kind {other}"),
            ))
        }
    };

    Ok(Some(kind))
}

fn read_rle(
    reader: &mut Reader<'_>,
    ctx: SchemaContext,
    code: DwRle,
) -> Result<Option<RawListEntryKind>> {
    let kind = match code {
        constants::DW_RLE_end_of_list => return Ok(None),
        constants::DW_RLE_base_addressx => RawListEntryKind::BaseAddressx {
            index: reader.uleb128()?,
        },
        constants::DW_RLE_startx_endx => RawListEntryKind::StartxEndx {
            start_index: reader.uleb128()?,
            end_index: reader.uleb128()?,
        },
        constants::DW_RLE_startx_length => RawListEntryKind::StartxLength {
            start_index: reader.uleb128()?,
            length: reader.uleb128()?,
        },
        constants::DW_RLE_offset_pair => RawListEntryKind::OffsetPair {
            start: reader.uleb128()?,
            end: reader.uleb128()?,
        },
        constants::DW_RLE_base_address => RawListEntryKind::BaseAddress {
            address: reader.address(ctx.address_size)?,
        },
        constants::DW_RLE_start_end => RawListEntryKind::StartEnd {
            start: reader.address(ctx.address_size)?,
            end: reader.address(ctx.address_size)?,
        },
        constants::DW_RLE_start_length => RawListEntryKind::StartLength {
            start: reader.address(ctx.address_size)?,
            length: reader.uleb128()?,
        },
        other => {
            return Err(DwarfError::malformed(
                reader.position() - 1,
                format!("unknown range list entry kind {other}"),
            ))
        }
    };

    Ok(Some(kind))
}

/// The header of a list unit in `.debug_loclists` or `.debug_rnglists`.
#[derive(Clone, PartialEq, Eq)]
pub struct ListsHeader {
    /// Section offset of the header.
    pub offset: u64,
    /// Length of the list unit, not including the initial length field.
    pub unit_length: u64,
    /// 32-bit or 64-bit DWARF.
    pub format: Format,
    /// Version of the list unit, always 5.
    pub version: u16,
    /// Size of a target address in bytes.
    pub address_size: u8,
    /// Size of a segment selector. Only zero is supported.
    pub segment_selector_size: u8,
    /// Number of entries in the offset table.
    pub offset_count: u32,
    /// Offsets of the lists, relative to the start of the offset table.
    pub offsets: Vec<u64>,
    /// Section offset of the offset table. Base attributes of units point here.
    pub offset_table_offset: u64,
}

impl ListsHeader {
    /// Parses a list unit header at `offset`.
    pub fn parse(data: &[u8], offset: u64, endian: Endian) -> Result<Self> {
        let mut reader = Reader::at(data, offset, endian);
        let (unit_length, format) = reader.initial_length()?;
        let end = reader.position().saturating_add(unit_length);
        let mut reader = reader.bounded(end)?;

        let version_offset = reader.position();
        let version = reader.u16()?;
        if version != 5 {
            return Err(DwarfError::malformed(
                version_offset,
                format!("unsupported list unit version {version}"),
            ));
        }

        let address_size = reader.u8()?;
        let segment_selector_size = reader.u8()?;
        if segment_selector_size != 0 {
            return Err(DwarfError::unsupported(
                offset,
                format!("segment selector size {segment_selector_size}"),
            ));
        }

        let offset_count = reader.u32()?;
        let offset_table_offset = reader.position();
        let offsets = (0..offset_count)
            .map(|_| reader.offset(format))
            .collect::<Result<_>>()?;

        Ok(ListsHeader {
            offset,
            unit_length,
            format,
            version,
            address_size,
            segment_selector_size,
            offset_count,
            offsets,
            offset_table_offset,
        })
    }

    /// Section offset of the first list, immediately after the offset table.
    pub fn lists_offset(&self) -> u64 {
        self.offset_table_offset
            + u64::from(self.offset_count) * u64::from(self.format.word_size())
    }

    /// Section offset one past the last byte of the list unit.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.format.initial_length_size()) + self.unit_length
    }

    /// Whether a section offset lies within this list unit.
    pub fn contains(&self, offset: u64) -> bool {
        (self.offset..self.end()).contains(&offset)
    }

    /// The context for decoding the lists of this unit.
    pub fn ctx(&self, endian: Endian) -> SchemaContext {
        SchemaContext::new(endian, self.format, self.address_size, self.version)
    }
}

impl fmt::Debug for ListsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListsHeader")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("unit_length", &self.unit_length)
            .field("format", &self.format)
            .field("address_size", &self.address_size)
            .field("offset_count", &self.offset_count)
            .finish()
    }
}

/// A DWARF 5 list section.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ListSection<'d> {
    pub data: &'d [u8],
    pub endian: Endian,
    pub kind: ListKind,
}

impl<'d> ListSection<'d> {
    pub fn headers(&self) -> ListUnits<'d> {
        ListUnits {
            data: self.data,
            endian: self.endian,
            offset: Some(0),
        }
    }

    pub fn header_containing(&self, offset: u64) -> Result<ListsHeader> {
        for header in self.headers() {
            let header = header?;
            if header.contains(offset) {
                return Ok(header);
            }
        }

        Err(DwarfError::DanglingReference {
            offset,
            target: offset,
        })
    }

    pub fn raw_list_at(&self, offset: u64) -> Result<Vec<RawListEntry<'d>>> {
        let header = self.header_containing(offset)?;
        let ctx = header.ctx(self.endian);
        let mut reader = Reader::at(self.data, offset, self.endian).bounded(header.end())?;
        parse_raw_list(&mut reader, ctx, self.kind)
    }

    pub fn unit_lists(&self, header: &ListsHeader) -> UnitLists<'d> {
        UnitLists {
            data: self.data,
            ctx: header.ctx(self.endian),
            kind: self.kind,
            offset: header.lists_offset(),
            end: header.end(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.section_name()
    }
}

/// An iterator over the list unit headers of a DWARF 5 list section.
#[derive(Clone, Debug)]
pub struct ListUnits<'d> {
    data: &'d [u8],
    endian: Endian,
    offset: Option<u64>,
}

impl Iterator for ListUnits<'_> {
    type Item = Result<ListsHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        if offset >= self.data.len() as u64 {
            return None;
        }

        let header = ListsHeader::parse(self.data, offset, self.endian);
        if let Ok(ref header) = header {
            self.offset = Some(header.end());
        }
        Some(header)
    }
}

impl std::iter::FusedIterator for ListUnits<'_> {}

/// An iterator over the lists stored in one list unit, in section order.
///
/// Yields the section offset of each list along with its untranslated entries.
#[derive(Clone, Debug)]
pub struct UnitLists<'d> {
    data: &'d [u8],
    ctx: SchemaContext,
    kind: ListKind,
    offset: u64,
    end: u64,
}

impl<'d> UnitLists<'d> {
    fn advance(&mut self) -> Result<Option<(u64, Vec<RawListEntry<'d>>)>> {
        if self.offset >= self.end {
            return Ok(None);
        }

        let offset = self.offset;
        let mut reader = self.ctx.reader_at(self.data, offset).bounded(self.end)?;
        let list = parse_raw_list(&mut reader, self.ctx, self.kind)?;
        self.offset = reader.position();
        Ok(Some((offset, list)))
    }
}

impl<'d> Iterator for UnitLists<'d> {
    type Item = Result<(u64, Vec<RawListEntry<'d>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(list) => list.map(Ok),
            Err(error) => {
                self.offset = self.end;
                Some(Err(error))
            }
        }
    }
}

impl std::iter::FusedIterator for UnitLists<'_> {}

/// Reads the pre-DWARF 5 address pairs of a list up to and including its terminating `(0, 0)`
/// pair.
///
/// Calls `entry` with the entry offset and both addresses of every other pair, and returns after
/// the terminator. A pair starting with the largest address selects a new base address.
pub(crate) fn parse_legacy_list<'d, T>(
    reader: &mut Reader<'d>,
    ctx: SchemaContext,
    mut entry: impl FnMut(&mut Reader<'d>, u64, u64, u64) -> Result<T>,
) -> Result<Vec<T>> {
    let mut entries = Vec::new();
    loop {
        let entry_offset = reader.position();
        let begin = reader.address(ctx.address_size)?;
        let end = reader.address(ctx.address_size)?;
        if begin == 0 && end == 0 {
            return Ok(entries);
        }
        entries.push(entry(reader, entry_offset, begin, end)?);
    }
}

/// An entry that sets the base address for the entries following it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BaseAddressEntry {
    /// Section offset of the entry.
    pub entry_offset: u64,
    /// Size of the encoded entry in bytes.
    pub entry_length: u64,
    /// The new base address.
    pub base_address: u64,
}

/// The initial base address for the lists of a unit: the `DW_AT_low_pc` of its root, or 0.
pub(crate) fn unit_base_address(unit: UnitRef<'_, '_>) -> Result<u64> {
    Ok(match unit.root()?.attr_value(constants::DW_AT_low_pc) {
        Some(AttributeValue::Address(address)) => address,
        _ => 0,
    })
}

/// Tracks the base address while walking a decoded list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BaseTracker {
    base: u64,
}

impl BaseTracker {
    pub(crate) fn new(unit: UnitRef<'_, '_>) -> Result<Self> {
        Ok(BaseTracker {
            base: unit_base_address(unit)?,
        })
    }

    pub(crate) fn set(&mut self, entry: &BaseAddressEntry) {
        self.base = entry.base_address;
    }

    /// Returns the address range of bounds that are absolute or relative to the current base.
    pub(crate) fn apply(&self, begin: u64, end: u64, is_absolute: bool) -> std::ops::Range<u64> {
        if is_absolute {
            begin..end
        } else {
            self.base.wrapping_add(begin)..self.base.wrapping_add(end)
        }
    }
}

/// The bounds of a list entry with address indexes resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Bounds {
    BaseAddress(u64),
    Range {
        begin: u64,
        end: u64,
        is_absolute: bool,
    },
    Default,
}

impl RawListEntryKind {
    /// Resolves address indexes through the unit's table in `.debug_addr`.
    pub(crate) fn resolve<'d>(self, info: &DwarfInfo<'d>, unit: &CompileUnit<'d>) -> Result<Bounds> {
        let absolute = |begin, end| Bounds::Range {
            begin,
            end,
            is_absolute: true,
        };

        Ok(match self {
            RawListEntryKind::BaseAddressx { index } => {
                Bounds::BaseAddress(info.get_addr(unit, index)?)
            }
            RawListEntryKind::BaseAddress { address } => Bounds::BaseAddress(address),
            RawListEntryKind::StartxEndx {
                start_index,
                end_index,
            } => absolute(info.get_addr(unit, start_index)?, info.get_addr(unit, end_index)?),
            RawListEntryKind::StartxLength {
                start_index,
                length,
            } => {
                let begin = info.get_addr(unit, start_index)?;
                absolute(begin, begin.wrapping_add(length))
            }
            RawListEntryKind::OffsetPair { start, end } => Bounds::Range {
                begin: start,
                end,
                is_absolute: false,
            },
            RawListEntryKind::StartEnd { start, end } => absolute(start, end),
            RawListEntryKind::StartLength { start, length } => {
                absolute(start, start.wrapping_add(length))
            }
            RawListEntryKind::DefaultLocation => Bounds::Default,
        })
    }
}

/// Parses every referenced list of a DWARF 5 list section in section order.
///
/// `offsets` must be sorted. The list units are walked from the start of the section, and bytes
/// between referenced lists are skipped. An offset past the last list unit is a dangling
/// reference. `parse` receives the offset of a list and returns the
/// list along with the offset following it.
pub(crate) fn walk_referenced<T>(
    section: &ListSection<'_>,
    offsets: &[u64],
    mut parse: impl FnMut(u64) -> Result<(T, u64)>,
) -> Result<Vec<T>> {
    let mut lists = Vec::with_capacity(offsets.len());
    let mut next = 0;
    let mut walked = 0;

    for header in section.headers() {
        let header = header?;
        let mut cursor = header.lists_offset();
        walked = header.end();

        while cursor < header.end() {
            match offsets.get(next) {
                Some(&offset) if offset == cursor => {
                    let (list, end) = parse(offset)?;
                    lists.push(list);
                    cursor = end;
                    next += 1;
                }
                Some(&offset) if offset < header.end() => {
                    if offset > cursor {
                        tracing::debug!(
                            section = section.name(),
                            offset = cursor,
                            len = offset - cursor,
                            "skipping unreferenced bytes"
                        );
                    }
                    cursor = offset;
                }
                _ => cursor = header.end(),
            }
        }
    }

    // Referenced lists past the last list unit were never reached.
    if let Some(&target) = offsets.get(next) {
        return Err(DwarfError::DanglingReference {
            offset: walked,
            target,
        });
    }

    Ok(lists)
}

/// A pair of GNU location view numbers.
///
/// Views are stored in front of the location list they annotate, one pair per list entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocationViewPair {
    /// Section offset of the pair.
    pub entry_offset: u64,
    /// View number at the start of the range.
    pub begin: u64,
    /// View number at the end of the range.
    pub end: u64,
}

/// Reads location view pairs until the reader reaches `list_offset`.
pub(crate) fn parse_view_pairs(
    reader: &mut Reader<'_>,
    list_offset: u64,
) -> Result<Vec<LocationViewPair>> {
    let mut views = Vec::new();
    while reader.position() < list_offset {
        let entry_offset = reader.position();
        views.push(LocationViewPair {
            entry_offset,
            begin: reader.uleb128()?,
            end: reader.uleb128()?,
        });
    }

    if reader.position() != list_offset {
        return Err(DwarfError::malformed(
            reader.position(),
            format!("location views overlap list at {list_offset:#x}"),
        ));
    }

    Ok(views)
}
