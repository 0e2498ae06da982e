//! The address range index in `.debug_aranges`.

use crate::error::{DwarfError, Result};
use crate::reader::Reader;
use crate::Endian;

/// A range of addresses covered by one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArangeEntry {
    /// First address of the range.
    pub begin_addr: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// Offset of the unit's header in `.debug_info`.
    pub info_offset: u64,
    /// Length of the set containing this entry.
    pub unit_length: u64,
    /// Version of the set.
    pub version: u16,
    /// Size of an address in the set.
    pub address_size: u8,
    /// Size of a segment selector in the set, always zero.
    pub segment_size: u8,
}

impl ArangeEntry {
    /// Whether the range contains an address.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.begin_addr && addr - self.begin_addr < self.length
    }
}

/// The address range index, sorted by start address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ARanges {
    entries: Vec<ArangeEntry>,
}

impl ARanges {
    /// Parses all sets of `.debug_aranges`.
    #[tracing::instrument(level = "trace", name = "ARanges::parse", skip_all)]
    pub fn parse(data: &[u8], endian: Endian) -> Result<Self> {
        Self::parse_sets(data, endian, false)
    }

    /// Parses all sets, reporting a set that holds only its terminator as a zero entry.
    ///
    /// The zero entry has begin address and length 0 and never matches an address lookup.
    #[tracing::instrument(level = "trace", name = "ARanges::parse_with_empty", skip_all)]
    pub fn parse_with_empty(data: &[u8], endian: Endian) -> Result<Self> {
        Self::parse_sets(data, endian, true)
    }

    fn parse_sets(data: &[u8], endian: Endian, need_empty: bool) -> Result<Self> {
        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() as u64 {
            let mut reader = Reader::at(data, offset, endian);
            let (unit_length, format) = reader.initial_length()?;
            let end = reader.position().saturating_add(unit_length);
            let mut reader = reader.bounded(end)?;

            let version = reader.u16()?;
            let info_offset = reader.offset(format)?;
            let address_size = reader.u8()?;
            let segment_size = reader.u8()?;
            if segment_size != 0 {
                return Err(DwarfError::unsupported(
                    offset,
                    format!("segment selector size {segment_size}"),
                ));
            }

            // Tuples are aligned to twice the address size, relative to the section start.
            let tuple_size = u64::from(address_size) * 2;
            if tuple_size > 0 {
                let padding = (tuple_size - reader.position() % tuple_size) % tuple_size;
                reader.skip(padding)?;
            }

            let mut is_empty = true;
            loop {
                let begin_addr = reader.address(address_size)?;
                let length = reader.address(address_size)?;
                let is_terminator = begin_addr == 0 && length == 0;
                if is_terminator && !(need_empty && is_empty) {
                    break;
                }

                is_empty = false;
                entries.push(ArangeEntry {
                    begin_addr,
                    length,
                    info_offset,
                    unit_length,
                    version,
                    address_size,
                    segment_size,
                });

                if is_terminator {
                    break;
                }
            }

            offset = end;
        }

        entries.sort_by_key(|entry| entry.begin_addr);
        Ok(ARanges { entries })
    }

    /// All entries, sorted by start address.
    pub fn entries(&self) -> &[ArangeEntry] {
        &self.entries
    }

    /// Returns the `.debug_info` offset of the unit covering an address.
    pub fn cu_offset_at_addr(&self, addr: u64) -> Option<u64> {
        let index = self.entries.partition_point(|entry| entry.begin_addr <= addr);
        let entry = self.entries.get(index.checked_sub(1)?)?;
        entry.contains(addr).then_some(entry.info_offset)
    }
}
