//! The decoding context shared by all units of a file.

use std::cell::RefCell;
use std::fmt;

use elsa::FrozenMap;
use gimli::constants;
use once_cell::unsync::OnceCell;

use crate::abbrev::AbbrevTable;
use crate::aranges::ARanges;
use crate::context::SchemaContext;
use crate::die::{Die, DieRef};
use crate::error::{DwarfError, Result};
use crate::line::LineProgram;
use crate::loclists::LocationLists;
use crate::namelut::{NameLut, NameLutEntry};
use crate::ranges::RangeLists;
use crate::reader::cstr_at;
use crate::sections::{require, Dwarf, DwarfConfig, DwarfSections};
use crate::unit::{CompileUnit, UnitBases, UnitHeader, UnitRef};
use crate::Endian;

/// Entry point for decoding the debug sections of one file.
///
/// All decoded records are cached by section offset and handed out by reference, so that
/// repeated lookups are cheap and return the same value. The caches are not synchronized; share a
/// context between threads only behind an external lock.
pub struct DwarfInfo<'d> {
    config: DwarfConfig,
    endian: Endian,
    sections: DwarfSections<'d>,
    abbrevs: FrozenMap<u64, Box<AbbrevTable>>,
    units: FrozenMap<u64, Box<CompileUnit<'d>>>,
    unit_offsets: RefCell<Vec<u64>>,
    line_programs: FrozenMap<u64, Box<LineProgram<'d>>>,
    aranges: OnceCell<Option<ARanges>>,
    pubnames: OnceCell<Option<NameLut<'d>>>,
    pubtypes: OnceCell<Option<NameLut<'d>>>,
    supplementary: Option<Box<DwarfInfo<'d>>>,
}

impl<'d> DwarfInfo<'d> {
    /// Creates a context over the given sections.
    pub fn new(config: DwarfConfig, sections: DwarfSections<'d>) -> Self {
        DwarfInfo {
            endian: config.endianness(),
            config,
            sections,
            abbrevs: FrozenMap::new(),
            units: FrozenMap::new(),
            unit_offsets: RefCell::new(Vec::new()),
            line_programs: FrozenMap::new(),
            aranges: OnceCell::new(),
            pubnames: OnceCell::new(),
            pubtypes: OnceCell::new(),
            supplementary: None,
        }
    }

    /// Creates a context over all sections of a container.
    pub fn from_dwarf<D>(config: DwarfConfig, dwarf: &D) -> Self
    where
        D: Dwarf<'d>,
    {
        Self::new(config, DwarfSections::from_dwarf(dwarf))
    }

    /// Attaches the supplementary file that `DW_FORM_*_sup` and `DW_FORM_GNU_*_alt` forms refer
    /// to.
    pub fn with_supplementary(mut self, supplementary: DwarfInfo<'d>) -> Self {
        self.supplementary = Some(Box::new(supplementary));
        self
    }

    /// The attached supplementary file, if any.
    pub fn supplementary(&self) -> Option<&DwarfInfo<'d>> {
        self.supplementary.as_deref()
    }

    /// The configuration this context was created with.
    pub fn config(&self) -> &DwarfConfig {
        &self.config
    }

    /// The sections this context reads from.
    pub fn sections(&self) -> &DwarfSections<'d> {
        &self.sections
    }

    /// Byte order of all sections.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub(crate) fn info_data(&self) -> Result<&'d [u8]> {
        require(self.sections.info, "debug_info")
    }

    pub(crate) fn loclists_data(&self) -> Result<&'d [u8]> {
        require(self.sections.loclists, "debug_loclists")
    }

    pub(crate) fn rnglists_data(&self) -> Result<&'d [u8]> {
        require(self.sections.rnglists, "debug_rnglists")
    }

    /// Returns the abbreviation table at an offset of `.debug_abbrev`.
    pub fn abbrev_table(&self, offset: u64) -> Result<&AbbrevTable> {
        if let Some(table) = self.abbrevs.get(&offset) {
            return Ok(table);
        }

        let data = require(self.sections.abbrev, "debug_abbrev")?;
        let table = AbbrevTable::parse(data, offset, self.endian)?;
        Ok(self.abbrevs.insert(offset, Box::new(table)))
    }

    /// Returns the unit whose header starts at `offset`.
    ///
    /// The unit's root DIE is parsed along with the header, since it declares the bases that
    /// indexed attributes of all other DIEs are resolved against.
    #[tracing::instrument(level = "trace", name = "DwarfInfo::unit_at", skip_all, fields(offset = offset))]
    pub fn unit_at(&self, offset: u64) -> Result<UnitRef<'d, '_>> {
        if let Some(unit) = self.units.get(&offset) {
            return Ok(UnitRef { info: self, unit });
        }

        let header = UnitHeader::parse(self.info_data()?, offset, self.endian)?;
        let mut unit = CompileUnit::new(header, self.endian);

        if header.die_offset() < header.end() {
            let unit_ref = UnitRef {
                info: self,
                unit: &unit,
            };

            let mut root = Die::parse(unit_ref, header.die_offset(), None)?;
            let bases = UnitBases::from_root(&root);
            root.translate_indexed(unit_ref, &bases)?;
            unit.set_root(root, bases);
        }

        let unit = self.units.insert(offset, Box::new(unit));
        let mut offsets = self.unit_offsets.borrow_mut();
        if let Err(index) = offsets.binary_search(&offset) {
            offsets.insert(index, offset);
        }

        Ok(UnitRef { info: self, unit })
    }

    /// Iterates over all units of `.debug_info` in section order.
    ///
    /// Units parsed by an earlier iteration are reused.
    pub fn units(&self) -> Units<'d, '_> {
        Units {
            info: self,
            offset: Some(0),
        }
    }

    /// Returns the unit whose extent, including its header, contains `offset`.
    pub fn unit_containing(&self, offset: u64) -> Result<UnitRef<'d, '_>> {
        let data = self.info_data()?;

        let mut current = {
            let offsets = self.unit_offsets.borrow();
            match offsets.partition_point(|&start| start <= offset) {
                0 => 0,
                index => offsets[index - 1],
            }
        };

        while current < data.len() as u64 {
            let unit = self.unit_at(current)?;
            if unit.contains(offset) {
                return Ok(unit);
            }
            current = unit.header().end();
        }

        Err(DwarfError::DanglingReference {
            offset,
            target: offset,
        })
    }

    /// Returns the DIE at an absolute offset of `.debug_info`.
    pub fn die_at(&self, offset: u64) -> Result<DieRef<'d, '_>> {
        self.unit_containing(offset)?.die_at(offset)
    }

    /// Returns the DIE that an entry of a name index points to.
    pub fn die_from_lut_entry(&self, entry: &NameLutEntry) -> Result<DieRef<'d, '_>> {
        self.unit_at(entry.cu_offset)?.die_at(entry.die_offset)
    }

    /// Reads the address at `index` of the unit's table in `.debug_addr`.
    pub fn get_addr(&self, unit: &CompileUnit<'d>, index: u64) -> Result<u64> {
        let base = unit.bases().addr_base.ok_or(DwarfError::MissingBase {
            unit_offset: unit.offset(),
            attribute: "DW_AT_addr_base",
        })?;
        self.read_addr(unit.ctx(), base, index)
    }

    pub(crate) fn read_addr(&self, ctx: SchemaContext, base: u64, index: u64) -> Result<u64> {
        let data = require(self.sections.addr, "debug_addr")?;
        let offset = table_entry(base, index, ctx.address_size)?;
        ctx.reader_at(data, offset).address(ctx.address_size)
    }

    /// Reads entry `index` of an offset table starting at `base`.
    pub(crate) fn read_offset_entry(
        &self,
        data: &[u8],
        ctx: SchemaContext,
        base: u64,
        index: u64,
    ) -> Result<u64> {
        let offset = table_entry(base, index, ctx.offset_size())?;
        ctx.reader_at(data, offset).offset(ctx.format)
    }

    pub(crate) fn read_indexed_string(
        &self,
        ctx: SchemaContext,
        base: u64,
        index: u64,
    ) -> Result<&'d [u8]> {
        let offsets = require(self.sections.str_offsets, "debug_str_offsets")?;
        let offset = self.read_offset_entry(offsets, ctx, base, index)?;
        self.string_at(offset)
    }

    /// Reads the string at an offset of `.debug_str`.
    pub fn string_at(&self, offset: u64) -> Result<&'d [u8]> {
        cstr_at(require(self.sections.str, "debug_str")?, offset)
    }

    /// Reads the string at an offset of `.debug_line_str`.
    pub fn line_string_at(&self, offset: u64) -> Result<&'d [u8]> {
        cstr_at(require(self.sections.line_str, "debug_line_str")?, offset)
    }

    /// Reads the string at `index` of the unit's table in `.debug_str_offsets`.
    pub fn string_at_index(&self, unit: &CompileUnit<'d>, index: u64) -> Result<&'d [u8]> {
        let base = unit.bases().str_offsets_base.ok_or(DwarfError::MissingBase {
            unit_offset: unit.offset(),
            attribute: "DW_AT_str_offsets_base",
        })?;
        self.read_indexed_string(unit.ctx(), base, index)
    }

    /// Decoder for `.debug_loc` and `.debug_loclists`.
    pub fn location_lists(&self) -> LocationLists<'d, '_> {
        LocationLists::new(self)
    }

    /// Decoder for `.debug_ranges` and `.debug_rnglists`.
    pub fn range_lists(&self) -> RangeLists<'d, '_> {
        RangeLists::new(self)
    }

    /// The address range index in `.debug_aranges`, or `None` if the section is absent.
    pub fn aranges(&self) -> Result<Option<&ARanges>> {
        self.aranges
            .get_or_try_init(|| match self.sections.aranges {
                Some(section) => ARanges::parse(section.data, self.endian).map(Some),
                None => Ok(None),
            })
            .map(Option::as_ref)
    }

    /// The name index in `.debug_pubnames`, or `None` if the section is absent.
    pub fn pubnames(&self) -> Result<Option<&NameLut<'d>>> {
        self.pubnames
            .get_or_try_init(|| match self.sections.pubnames {
                Some(section) => NameLut::parse(section.data, self.endian).map(Some),
                None => Ok(None),
            })
            .map(Option::as_ref)
    }

    /// The type name index in `.debug_pubtypes`, or `None` if the section is absent.
    pub fn pubtypes(&self) -> Result<Option<&NameLut<'d>>> {
        self.pubtypes
            .get_or_try_init(|| match self.sections.pubtypes {
                Some(section) => NameLut::parse(section.data, self.endian).map(Some),
                None => Ok(None),
            })
            .map(Option::as_ref)
    }

    /// Returns the line program of a unit, located by `DW_AT_stmt_list` on its root DIE.
    ///
    /// Returns `None` if the unit has no line program.
    pub fn line_program_for_unit(&self, unit: UnitRef<'d, '_>) -> Result<Option<&LineProgram<'d>>> {
        let offset = match unit
            .root()?
            .attr_value(constants::DW_AT_stmt_list)
            .and_then(|value| value.as_u64())
        {
            Some(offset) => offset,
            None => return Ok(None),
        };

        if let Some(program) = self.line_programs.get(&offset) {
            return Ok(Some(program));
        }

        let program = LineProgram::parse(self, offset, unit.ctx())?;
        Ok(Some(self.line_programs.insert(offset, Box::new(program))))
    }
}

/// Computes the offset of entry `index` in a table of `size`-byte entries starting at `base`.
fn table_entry(base: u64, index: u64, size: u8) -> Result<u64> {
    index
        .checked_mul(u64::from(size))
        .and_then(|delta| base.checked_add(delta))
        .ok_or(DwarfError::DanglingReference {
            offset: base,
            target: index,
        })
}

impl fmt::Debug for DwarfInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DwarfInfo")
            .field("config", &self.config)
            .field("sections", &self.sections)
            .field("units", &self.unit_offsets.borrow().len())
            .field("supplementary", &self.supplementary.is_some())
            .finish()
    }
}

/// An iterator over the units of `.debug_info`.
#[derive(Clone, Debug)]
pub struct Units<'d, 'a> {
    info: &'a DwarfInfo<'d>,
    offset: Option<u64>,
}

impl<'d, 'a> Iterator for Units<'d, 'a> {
    type Item = Result<UnitRef<'d, 'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        let len = match self.info.info_data() {
            Ok(data) => data.len() as u64,
            Err(error) => return Some(Err(error)),
        };

        if offset >= len {
            return None;
        }

        let unit = self.info.unit_at(offset);
        if let Ok(ref unit) = unit {
            self.offset = Some(unit.header().end());
        }
        Some(unit)
    }
}

impl std::iter::FusedIterator for Units<'_, '_> {}
