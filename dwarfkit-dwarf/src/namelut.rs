//! Name indexes in `.debug_pubnames` and `.debug_pubtypes`.

use gimli::Format;
use indexmap::IndexMap;

use crate::error::{DwarfError, Result};
use crate::reader::Reader;
use crate::Endian;

/// Where a named DIE is located.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NameLutEntry {
    /// Offset of the unit header in `.debug_info`.
    pub cu_offset: u64,
    /// Offset of the DIE in `.debug_info`.
    pub die_offset: u64,
}

/// The header of one set of names, covering a single unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NameLutHeader {
    /// Section offset of the header.
    pub offset: u64,
    /// Length of the set, not including the initial length field.
    pub unit_length: u64,
    /// 32-bit or 64-bit DWARF.
    pub format: Format,
    /// Version of the set.
    pub version: u16,
    /// Offset of the unit header in `.debug_info`.
    pub debug_info_offset: u64,
    /// Size of the unit in `.debug_info`.
    pub debug_info_length: u64,
}

/// A name index mapping names to DIEs, in section order.
///
/// When a name occurs more than once, the last occurrence wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameLut<'d> {
    entries: IndexMap<&'d [u8], NameLutEntry>,
    headers: Vec<NameLutHeader>,
}

impl<'d> NameLut<'d> {
    /// Parses all sets of a name index section.
    #[tracing::instrument(level = "trace", name = "NameLut::parse", skip_all)]
    pub fn parse(data: &'d [u8], endian: Endian) -> Result<Self> {
        let mut entries = IndexMap::new();
        let mut headers = Vec::new();
        let mut offset = 0;

        while offset < data.len() as u64 {
            let mut reader = Reader::at(data, offset, endian);
            let (unit_length, format) = reader.initial_length()?;
            let end = reader.position().saturating_add(unit_length);
            let mut reader = reader.bounded(end)?;

            let header = NameLutHeader {
                offset,
                unit_length,
                format,
                version: reader.u16()?,
                debug_info_offset: reader.offset(format)?,
                debug_info_length: reader.offset(format)?,
            };
            headers.push(header);

            loop {
                let entry_offset = reader.position();
                let die_offset = reader.offset(format)?;
                if die_offset == 0 {
                    break;
                }

                let target = header
                    .debug_info_offset
                    .checked_add(die_offset)
                    .ok_or(DwarfError::DanglingReference {
                        offset: entry_offset,
                        target: die_offset,
                    })?;

                let name = reader.cstr()?;
                entries.insert(
                    name,
                    NameLutEntry {
                        cu_offset: header.debug_info_offset,
                        die_offset: target,
                    },
                );
            }

            offset = end;
        }

        Ok(NameLut { entries, headers })
    }

    /// Looks up a name.
    pub fn get(&self, name: &[u8]) -> Option<&NameLutEntry> {
        self.entries.get(name)
    }

    /// Iterates over all names and their entries in section order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&'d [u8], &NameLutEntry)> {
        self.entries.iter().map(|(&name, entry)| (name, entry))
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The headers of all sets, in section order.
    pub fn unit_headers(&self) -> &[NameLutHeader] {
        &self.headers
    }
}
