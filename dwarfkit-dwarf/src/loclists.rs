//! Location lists and the location descriptions of DIE attributes.

use std::collections::{BTreeSet, HashMap};

use gimli::constants::{self, DwAt};

use crate::die::{Attribute, DieRef};
use crate::dwarfinfo::DwarfInfo;
use crate::error::{DwarfError, Result};
use crate::expr::{ExprOp, ExprParser};
use crate::form::Form;
use crate::lists::{
    parse_legacy_list, parse_raw_list, parse_view_pairs, walk_referenced, BaseAddressEntry,
    BaseTracker, Bounds, ListKind, ListSection, ListUnits, ListsHeader, LocationViewPair, RawListEntry,
    UnitLists,
};
use crate::reader::Reader;
use crate::sections::require;
use crate::unit::UnitRef;

/// A range of addresses along with the location of a value in that range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocationEntry<'d> {
    /// Section offset of the entry.
    pub entry_offset: u64,
    /// Size of the encoded entry in bytes.
    pub entry_length: u64,
    /// Start of the range.
    pub begin: u64,
    /// End of the range, exclusive.
    pub end: u64,
    /// The location expression.
    pub expr: &'d [u8],
    /// Whether the bounds are addresses, or offsets from the base address otherwise.
    pub is_absolute: bool,
}

/// The location of a value at addresses not covered by other entries of the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultLocationEntry<'d> {
    /// Section offset of the entry.
    pub entry_offset: u64,
    /// Size of the encoded entry in bytes.
    pub entry_length: u64,
    /// The location expression.
    pub expr: &'d [u8],
}

/// A location entry with its bounds resolved to addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLocation<'d> {
    /// The addresses covered by the entry.
    pub range: std::ops::Range<u64>,
    /// The location expression.
    pub expr: &'d [u8],
}

/// An entry of a decoded location list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationListEntry<'d> {
    /// A bounded location.
    Location(LocationEntry<'d>),
    /// `DW_LLE_default_location`.
    Default(DefaultLocationEntry<'d>),
    /// A base address selection.
    BaseAddress(BaseAddressEntry),
    /// A GNU location view pair preceding the list.
    View(LocationViewPair),
}

/// Decodes location lists from `.debug_loc` and `.debug_loclists`.
///
/// The section is chosen by the version of the unit that refers to a list, so both sections may
/// be in use within the same file.
#[derive(Clone, Copy, Debug)]
pub struct LocationLists<'d, 'a> {
    info: &'a DwarfInfo<'d>,
}

impl<'d, 'a> LocationLists<'d, 'a> {
    pub(crate) fn new(info: &'a DwarfInfo<'d>) -> Self {
        LocationLists { info }
    }

    fn v5_section(&self) -> Result<ListSection<'d>> {
        Ok(ListSection {
            data: self.info.loclists_data()?,
            endian: self.info.endian(),
            kind: ListKind::Location,
        })
    }

    /// Decodes the location list at `offset`, referenced by an attribute of `unit`.
    pub fn location_list_at(
        &self,
        offset: u64,
        unit: UnitRef<'d, '_>,
    ) -> Result<Vec<LocationListEntry<'d>>> {
        self.parse_list(offset, unit).map(|(list, _)| list)
    }

    /// Decodes a list and returns it along with the section offset following it.
    fn parse_list(
        &self,
        offset: u64,
        unit: UnitRef<'d, '_>,
    ) -> Result<(Vec<LocationListEntry<'d>>, u64)> {
        let ctx = unit.ctx();

        if unit.version() >= 5 {
            let mut reader = ctx.reader_at(self.info.loclists_data()?, offset);
            let list = parse_raw_list(&mut reader, ctx, ListKind::Location)?
                .iter()
                .map(|raw| self.translate_entry(raw, unit))
                .collect::<Result<_>>()?;
            return Ok((list, reader.position()));
        }

        let data = require(self.info.sections().loc, "debug_loc")?;
        let mut reader = ctx.reader_at(data, offset);
        let max_address = ctx.max_address();

        let list = parse_legacy_list(&mut reader, ctx, |reader, entry_offset, begin, end| {
            if begin == max_address {
                return Ok(LocationListEntry::BaseAddress(BaseAddressEntry {
                    entry_offset,
                    entry_length: reader.position() - entry_offset,
                    base_address: end,
                }));
            }

            let len = reader.u16()?;
            let expr = reader.bytes(len.into())?;
            Ok(LocationListEntry::Location(LocationEntry {
                entry_offset,
                entry_length: reader.position() - entry_offset,
                begin,
                end,
                expr,
                is_absolute: false,
            }))
        })?;

        Ok((list, reader.position()))
    }

    /// Decodes the DWARF 5 list at `offset` without resolving address indexes.
    ///
    /// The address size is taken from the list unit containing the offset.
    pub fn raw_list_at(&self, offset: u64) -> Result<Vec<RawListEntry<'d>>> {
        self.v5_section()?.raw_list_at(offset)
    }

    /// Resolves the address indexes of an entry through the table of `unit`.
    pub fn translate_entry(
        &self,
        raw: &RawListEntry<'d>,
        unit: UnitRef<'d, '_>,
    ) -> Result<LocationListEntry<'d>> {
        let expr = raw.expr.unwrap_or_default();
        Ok(match raw.kind.resolve(self.info, unit.unit())? {
            Bounds::BaseAddress(base_address) => LocationListEntry::BaseAddress(BaseAddressEntry {
                entry_offset: raw.entry_offset,
                entry_length: raw.entry_length,
                base_address,
            }),
            Bounds::Range {
                begin,
                end,
                is_absolute,
            } => LocationListEntry::Location(LocationEntry {
                entry_offset: raw.entry_offset,
                entry_length: raw.entry_length,
                begin,
                end,
                expr,
                is_absolute,
            }),
            Bounds::Default => LocationListEntry::Default(DefaultLocationEntry {
                entry_offset: raw.entry_offset,
                entry_length: raw.entry_length,
                expr,
            }),
        })
    }

    /// Applies the base addresses of a decoded list to its bounded entries.
    ///
    /// The base address starts out as the `DW_AT_low_pc` of the unit's root and is replaced by
    /// every base address entry. Default locations and view pairs are not included.
    pub fn resolve_list(
        &self,
        list: &[LocationListEntry<'d>],
        unit: UnitRef<'d, '_>,
    ) -> Result<Vec<ResolvedLocation<'d>>> {
        let mut base = BaseTracker::new(unit)?;
        let mut resolved = Vec::new();

        for entry in list {
            match entry {
                LocationListEntry::BaseAddress(entry) => base.set(entry),
                LocationListEntry::Location(entry) => resolved.push(ResolvedLocation {
                    range: base.apply(entry.begin, entry.end, entry.is_absolute),
                    expr: entry.expr,
                }),
                LocationListEntry::Default(_) | LocationListEntry::View(_) => {}
            }
        }

        Ok(resolved)
    }

    /// Iterates over the list unit headers of `.debug_loclists`.
    pub fn list_units(&self) -> Result<ListUnits<'d>> {
        Ok(self.v5_section()?.headers())
    }

    /// Iterates over the untranslated lists stored in one list unit of `.debug_loclists`.
    pub fn unit_lists(&self, header: &ListsHeader) -> Result<UnitLists<'d>> {
        Ok(self.v5_section()?.unit_lists(header))
    }

    /// Decodes every location list referenced by a DIE attribute.
    ///
    /// Lists of units before DWARF 5 come first, followed by those in `.debug_loclists`. Each
    /// list is returned with its section offset. A list annotated with GNU location views starts
    /// with its view pairs, and its offset is that of the first pair.
    #[tracing::instrument(level = "trace", name = "LocationLists::lists", skip_all)]
    pub fn lists(&self) -> Result<Vec<(u64, Vec<LocationListEntry<'d>>)>> {
        let mut lists = Vec::new();

        if self.info.sections().loc.is_some() {
            let refs = self.collect_references(false)?;
            for &offset in &refs.offsets {
                let (list, _) = self.parse_referenced(&refs, offset)?;
                lists.push((offset, list));
            }
        }

        if self.info.sections().loclists.is_some() {
            let refs = self.collect_references(true)?;
            let offsets: Vec<_> = refs.offsets.iter().copied().collect();
            let section = self.v5_section()?;
            let found = walk_referenced(&section, &offsets, |offset| {
                let (list, end) = self.parse_referenced(&refs, offset)?;
                Ok(((offset, list), end))
            })?;
            lists.extend(found);
        }

        Ok(lists)
    }

    /// Collects the offsets of all location lists referenced from units of one list family.
    fn collect_references(&self, dwarf5: bool) -> Result<References> {
        let mut refs = References::default();

        for unit in self.info.units() {
            let unit = unit?;
            if (unit.version() >= 5) != dwarf5 {
                continue;
            }

            for die in unit.dies() {
                let die = die?;
                let views = die
                    .attr_value(constants::DW_AT_GNU_locviews)
                    .and_then(|value| value.as_u64());

                if let Some(views) = views {
                    let list = die
                        .attr(constants::DW_AT_location)
                        .filter(|attr| LocationParser::has_loc_list(attr, unit.version()))
                        .and_then(|attr| attr.value.as_u64())
                        .ok_or_else(|| {
                            DwarfError::malformed(
                                die.offset(),
                                "DW_AT_GNU_locviews without a location list",
                            )
                        })?;

                    refs.views.insert(views, list);
                    refs.owners.insert(list, unit.offset());
                    refs.offsets.insert(views);
                }

                for attr in die.attributes() {
                    if views.is_some() && attr.name == constants::DW_AT_location {
                        continue;
                    }

                    if LocationParser::attribute_has_location(attr, unit.version())
                        && LocationParser::has_loc_list(attr, unit.version())
                    {
                        if let Some(offset) = attr.value.as_u64() {
                            refs.owners.insert(offset, unit.offset());
                            refs.offsets.insert(offset);
                        }
                    }
                }
            }
        }

        Ok(refs)
    }

    /// Parses the view pairs at `offset`, if any, and the list that follows them.
    ///
    /// Returns the entries along with the section offset following the list.
    fn parse_referenced(
        &self,
        refs: &References,
        offset: u64,
    ) -> Result<(Vec<LocationListEntry<'d>>, u64)> {
        let list_offset = refs.views.get(&offset).copied().unwrap_or(offset);
        let owner = refs
            .owners
            .get(&list_offset)
            .copied()
            .ok_or(DwarfError::DanglingReference {
                offset,
                target: list_offset,
            })?;
        let unit = self.info.unit_at(owner)?;

        let mut entries = Vec::new();
        if list_offset != offset {
            let data = if unit.version() >= 5 {
                self.info.loclists_data()?
            } else {
                require(self.info.sections().loc, "debug_loc")?
            };

            let mut reader = Reader::at(data, offset, self.info.endian());
            let views = parse_view_pairs(&mut reader, list_offset)?;
            entries.extend(views.into_iter().map(LocationListEntry::View));
        }

        let (list, end) = self.parse_list(list_offset, unit)?;
        entries.extend(list);
        Ok((entries, end))
    }
}

/// Location list references collected from the DIEs of one list family.
#[derive(Debug, Default)]
struct References {
    /// All referenced offsets, including those of location views.
    offsets: BTreeSet<u64>,
    /// Maps the offset of location views to the offset of their list.
    views: HashMap<u64, u64>,
    /// Maps list offsets to the offset of the unit referencing them.
    owners: HashMap<u64, u64>,
}

/// The location description of an attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location<'d> {
    /// A single location expression, valid at all addresses.
    Expression(Vec<ExprOp<'d>>),
    /// A location list.
    List(Vec<LocationListEntry<'d>>),
}

/// Decodes the location descriptions of DIE attributes.
#[derive(Clone, Copy, Debug)]
pub struct LocationParser<'d, 'a> {
    lists: LocationLists<'d, 'a>,
}

const LOCATION_ATTRIBUTES: &[DwAt] = &[
    constants::DW_AT_location,
    constants::DW_AT_string_length,
    constants::DW_AT_const_value,
    constants::DW_AT_return_addr,
    constants::DW_AT_data_member_location,
    constants::DW_AT_frame_base,
    constants::DW_AT_segment,
    constants::DW_AT_static_link,
    constants::DW_AT_use_location,
    constants::DW_AT_vtable_elem_location,
    constants::DW_AT_call_value,
    constants::DW_AT_GNU_call_site_value,
    constants::DW_AT_GNU_call_site_target,
    constants::DW_AT_GNU_call_site_data_value,
    constants::DW_AT_call_target,
    constants::DW_AT_call_target_clobbered,
    constants::DW_AT_call_data_location,
    constants::DW_AT_call_data_value,
    constants::DW_AT_upper_bound,
    constants::DW_AT_count,
];

impl<'d, 'a> LocationParser<'d, 'a> {
    /// Creates a parser that reads location lists through `lists`.
    pub fn new(lists: LocationLists<'d, 'a>) -> Self {
        LocationParser { lists }
    }

    /// Whether an attribute holds a location description, either as an expression or as a
    /// reference to a location list.
    pub fn attribute_has_location(attr: &Attribute<'_>, version: u16) -> bool {
        LOCATION_ATTRIBUTES.contains(&attr.name)
            && (Self::has_loc_expr(attr, version) || Self::has_loc_list(attr, version))
    }

    fn has_loc_expr(attr: &Attribute<'_>, version: u16) -> bool {
        attr.form == Form::Exprloc
            || (version < 4 && attr.form.is_block() && attr.name != constants::DW_AT_const_value)
    }

    fn has_loc_list(attr: &Attribute<'_>, version: u16) -> bool {
        let is_list = matches!(attr.form, Form::SecOffset | Form::Loclistx)
            || (version < 4
                && attr.form.is_fixed_data()
                && attr.name != constants::DW_AT_const_value);
        is_list && !Self::is_constant(attr, version)
    }

    /// Data member offsets, bounds, and counts are plain constants in data forms.
    fn is_constant(attr: &Attribute<'_>, version: u16) -> bool {
        let constant_attr = (version >= 3 && attr.name == constants::DW_AT_data_member_location)
            || attr.name == constants::DW_AT_upper_bound
            || attr.name == constants::DW_AT_count;

        constant_attr
            && (attr.form.is_fixed_data() || matches!(attr.form, Form::Sdata | Form::Udata))
    }

    /// Decodes the location description of an attribute of `die`.
    ///
    /// Returns `None` if the attribute does not hold a location.
    pub fn parse_from_attribute(
        &self,
        attr: &Attribute<'d>,
        version: u16,
        die: DieRef<'d, '_>,
    ) -> Result<Option<Location<'d>>> {
        if !Self::attribute_has_location(attr, version) {
            return Ok(None);
        }

        if Self::has_loc_expr(attr, version) {
            let expr = attr.value.as_bytes().unwrap_or_default();
            let ops = ExprParser::new(die.unit().ctx()).parse(expr)?;
            return Ok(Some(Location::Expression(ops)));
        }

        let offset = attr
            .value
            .as_u64()
            .ok_or_else(|| DwarfError::malformed(attr.offset, "location list offset expected"))?;
        let list = self.lists.location_list_at(offset, die.unit())?;
        Ok(Some(Location::List(list)))
    }
}
