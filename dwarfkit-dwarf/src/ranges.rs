//! Range lists of `.debug_ranges` and `.debug_rnglists`.

use std::collections::BTreeMap;
use std::ops::Range;

use gimli::constants;

use crate::dwarfinfo::DwarfInfo;
use crate::error::{DwarfError, Result};
use crate::lists::{
    parse_legacy_list, parse_raw_list, BaseAddressEntry, BaseTracker, Bounds, ListKind,
    ListSection, ListUnits, ListsHeader, RawListEntry, UnitLists,
};
use crate::sections::require;
use crate::unit::UnitRef;

/// A range of addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeEntry {
    /// Section offset of the entry.
    pub entry_offset: u64,
    /// Size of the encoded entry in bytes.
    pub entry_length: u64,
    /// Start of the range.
    pub begin: u64,
    /// End of the range, exclusive.
    pub end: u64,
    /// Whether the bounds are addresses, or offsets from the base address otherwise.
    pub is_absolute: bool,
}

/// An entry of a decoded range list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeListEntry {
    /// A range of addresses.
    Range(RangeEntry),
    /// A base address selection.
    BaseAddress(BaseAddressEntry),
}

/// Decodes range lists from `.debug_ranges` and `.debug_rnglists`.
///
/// Like location lists, the section is chosen by the version of the referencing unit.
#[derive(Clone, Copy, Debug)]
pub struct RangeLists<'d, 'a> {
    info: &'a DwarfInfo<'d>,
}

impl<'d, 'a> RangeLists<'d, 'a> {
    pub(crate) fn new(info: &'a DwarfInfo<'d>) -> Self {
        RangeLists { info }
    }

    fn v5_section(&self) -> Result<ListSection<'d>> {
        Ok(ListSection {
            data: self.info.rnglists_data()?,
            endian: self.info.endian(),
            kind: ListKind::Range,
        })
    }

    /// Decodes the range list at `offset`, referenced by an attribute of `unit`.
    pub fn range_list_at(&self, offset: u64, unit: UnitRef<'d, '_>) -> Result<Vec<RangeListEntry>> {
        let ctx = unit.ctx();

        if unit.version() >= 5 {
            let mut reader = ctx.reader_at(self.info.rnglists_data()?, offset);
            return parse_raw_list(&mut reader, ctx, ListKind::Range)?
                .iter()
                .map(|raw| self.translate_entry(raw, unit))
                .collect();
        }

        let data = require(self.info.sections().ranges, "debug_ranges")?;
        let mut reader = ctx.reader_at(data, offset);
        let max_address = ctx.max_address();

        parse_legacy_list(&mut reader, ctx, |reader, entry_offset, begin, end| {
            let entry_length = reader.position() - entry_offset;
            Ok(if begin == max_address {
                RangeListEntry::BaseAddress(BaseAddressEntry {
                    entry_offset,
                    entry_length,
                    base_address: end,
                })
            } else {
                RangeListEntry::Range(RangeEntry {
                    entry_offset,
                    entry_length,
                    begin,
                    end,
                    is_absolute: false,
                })
            })
        })
    }

    /// Decodes the DWARF 5 list at `offset` without resolving address indexes.
    pub fn raw_list_at(&self, offset: u64) -> Result<Vec<RawListEntry<'d>>> {
        self.v5_section()?.raw_list_at(offset)
    }

    /// Resolves the address indexes of an entry through the table of `unit`.
    pub fn translate_entry(
        &self,
        raw: &RawListEntry<'d>,
        unit: UnitRef<'d, '_>,
    ) -> Result<RangeListEntry> {
        Ok(match raw.kind.resolve(self.info, unit.unit())? {
            Bounds::BaseAddress(base_address) => RangeListEntry::BaseAddress(BaseAddressEntry {
                entry_offset: raw.entry_offset,
                entry_length: raw.entry_length,
                base_address,
            }),
            Bounds::Range {
                begin,
                end,
                is_absolute,
            } => RangeListEntry::Range(RangeEntry {
                entry_offset: raw.entry_offset,
                entry_length: raw.entry_length,
                begin,
                end,
                is_absolute,
            }),
            Bounds::Default => {
                return Err(DwarfError::malformed(
                    raw.entry_offset,
                    "default location in range list",
                ))
            }
        })
    }

    /// Applies the base addresses of a decoded list to its ranges.
    ///
    /// The base address starts out as the `DW_AT_low_pc` of the unit's root and is replaced by
    /// every base address entry.
    pub fn resolve_list(
        &self,
        list: &[RangeListEntry],
        unit: UnitRef<'d, '_>,
    ) -> Result<Vec<Range<u64>>> {
        let mut base = BaseTracker::new(unit)?;
        let mut resolved = Vec::new();

        for entry in list {
            match entry {
                RangeListEntry::BaseAddress(entry) => base.set(entry),
                RangeListEntry::Range(entry) => {
                    resolved.push(base.apply(entry.begin, entry.end, entry.is_absolute))
                }
            }
        }

        Ok(resolved)
    }

    /// Iterates over the list unit headers of `.debug_rnglists`.
    pub fn list_units(&self) -> Result<ListUnits<'d>> {
        Ok(self.v5_section()?.headers())
    }

    /// Iterates over the untranslated lists stored in one list unit of `.debug_rnglists`.
    pub fn unit_lists(&self, header: &ListsHeader) -> Result<UnitLists<'d>> {
        Ok(self.v5_section()?.unit_lists(header))
    }

    /// Decodes every range list referenced by a `DW_AT_ranges` attribute.
    ///
    /// Lists of units before DWARF 5 come first, followed by those in `.debug_rnglists`, each
    /// sorted by offset and returned along with it. A list referenced by several DIEs is decoded
    /// once.
    #[tracing::instrument(level = "trace", name = "RangeLists::lists", skip_all)]
    pub fn lists(&self) -> Result<Vec<(u64, Vec<RangeListEntry>)>> {
        let mut lists = Vec::new();

        let families = [
            (false, self.info.sections().ranges.is_some()),
            (true, self.info.sections().rnglists.is_some()),
        ];

        for (dwarf5, present) in families {
            if !present {
                continue;
            }

            for (offset, owner) in self.collect_references(dwarf5)? {
                let unit = self.info.unit_at(owner)?;
                lists.push((offset, self.range_list_at(offset, unit)?));
            }
        }

        Ok(lists)
    }

    /// Maps the offset of every referenced range list to the unit referencing it.
    fn collect_references(&self, dwarf5: bool) -> Result<BTreeMap<u64, u64>> {
        let mut refs = BTreeMap::new();

        for unit in self.info.units() {
            let unit = unit?;
            if (unit.version() >= 5) != dwarf5 {
                continue;
            }

            for die in unit.dies() {
                let offset = die?
                    .attr_value(constants::DW_AT_ranges)
                    .and_then(|value| value.as_u64());
                if let Some(offset) = offset {
                    refs.insert(offset, unit.offset());
                }
            }
        }

        Ok(refs)
    }
}
