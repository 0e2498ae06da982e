//! CIE and FDE records of `.debug_frame` and `.eh_frame`.

use std::fmt;
use std::rc::Rc;

use dwarfkit_common::{Arch, UnknownArchError};
use dwarfkit_dwarf::gimli::constants::{self, DwEhPe};
use dwarfkit_dwarf::gimli::Format;
use dwarfkit_dwarf::{DwarfConfig, DwarfSection, DwarfSections, Reader, SchemaContext};
use elsa::FrozenMap;
use once_cell::unsync::OnceCell;

use crate::encoding::PointerContext;
use crate::error::{CfiError, CfiErrorKind, Result};
use crate::instruction::{parse_instructions, CallFrameInstruction};
use crate::table::{decode_table, DecodedCallFrameTable, Factors, TableOwner};

/// CIE id of `.debug_frame` in 32-bit DWARF.
const DEBUG_FRAME_CIE_ID32: u64 = 0xffff_ffff;

/// CIE id of `.debug_frame` in 64-bit DWARF.
const DEBUG_FRAME_CIE_ID64: u64 = u64::MAX;

/// The flavor of a call frame section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The standard `.debug_frame` section.
    DebugFrame,
    /// The `.eh_frame` section used for exception handling, with relative CIE pointers, encoded
    /// pointers, and zero terminators.
    EhFrame,
}

impl Mode {
    /// The name of the section, without leading dot.
    pub fn section_name(self) -> &'static str {
        match self {
            Mode::DebugFrame => "debug_frame",
            Mode::EhFrame => "eh_frame",
        }
    }
}

/// The fields described by a CIE augmentation string starting with `z`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Augmentation {
    /// `L`: encoding of the LSDA pointer in FDE augmentation data.
    pub lsda_encoding: Option<DwEhPe>,
    /// `R`: encoding of the FDE address fields.
    pub fde_encoding: Option<DwEhPe>,
    /// `P`: encoding and value of the personality routine pointer.
    pub personality: Option<(DwEhPe, u64)>,
    /// `S`: the CIE describes a signal handler frame.
    pub signal_frame: bool,
}

/// A Common Information Entry: the state shared by the FDEs referencing it.
pub struct Cie<'d> {
    /// Section offset of the entry.
    pub offset: u64,
    /// Length of the entry after the initial length field.
    pub length: u64,
    /// DWARF format of the entry.
    pub format: Format,
    /// Version of the entry.
    pub version: u8,
    /// The augmentation string.
    pub augmentation: &'d [u8],
    /// Address size, declared since `.debug_frame` version 4 and taken from the configuration
    /// otherwise.
    pub address_size: u8,
    /// Segment selector size, declared since `.debug_frame` version 4.
    pub segment_size: u8,
    /// Factor of advance instructions.
    pub code_alignment_factor: u64,
    /// Factor of offset instructions.
    pub data_alignment_factor: i64,
    /// The register holding the return address.
    pub return_address_register: u64,
    /// Length of the augmentation data, if the augmentation string starts with `z`.
    pub augmentation_length: Option<u64>,
    /// Raw augmentation data, without its length.
    pub augmentation_data: &'d [u8],
    /// The decoded augmentation data.
    pub augmentation_fields: Augmentation,
    /// The initial instructions.
    pub instructions: Vec<CallFrameInstruction<'d>>,
    ctx: SchemaContext,
    table: OnceCell<DecodedCallFrameTable<'d>>,
}

impl<'d> Cie<'d> {
    /// Section offset one past the end of the entry.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.format.initial_length_size()) + self.length
    }

    /// The context for decoding expressions in the instructions of this entry.
    pub fn ctx(&self) -> SchemaContext {
        self.ctx
    }

    /// Whether the augmentation string starts with `z` and augmentation data follows.
    pub fn has_augmentation_data(&self) -> bool {
        self.augmentation_length.is_some()
    }

    /// Executes the initial instructions. The table is computed once.
    pub fn table(&self) -> Result<&DecodedCallFrameTable<'d>> {
        self.table.get_or_try_init(|| {
            decode_table(&self.instructions, self.factors(), TableOwner::Cie)
        })
    }

    fn factors(&self) -> Factors {
        Factors {
            code_alignment: self.code_alignment_factor,
            data_alignment: self.data_alignment_factor,
        }
    }
}

impl fmt::Debug for Cie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cie")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("version", &self.version)
            .field("augmentation", &String::from_utf8_lossy(self.augmentation))
            .field("code_alignment_factor", &self.code_alignment_factor)
            .field("data_alignment_factor", &self.data_alignment_factor)
            .field("return_address_register", &self.return_address_register)
            .field("augmentation_fields", &self.augmentation_fields)
            .field("instructions", &self.instructions.len())
            .finish()
    }
}

/// A Frame Description Entry: the unwind rules of one range of code.
pub struct Fde<'d> {
    /// Section offset of the entry.
    pub offset: u64,
    /// Length of the entry after the initial length field.
    pub length: u64,
    /// DWARF format of the entry.
    pub format: Format,
    /// The raw CIE pointer, relative to the pointer field in `.eh_frame`.
    pub cie_pointer: u64,
    /// The CIE this entry refers to.
    pub cie: Rc<Cie<'d>>,
    /// The first address covered by the entry.
    pub initial_location: u64,
    /// Number of bytes covered by the entry.
    pub address_range: u64,
    /// Raw augmentation data, without its length.
    pub augmentation_data: &'d [u8],
    /// The language-specific data area, if the CIE declares an LSDA encoding.
    pub lsda_pointer: Option<u64>,
    /// The instructions of the entry.
    pub instructions: Vec<CallFrameInstruction<'d>>,
    table: OnceCell<DecodedCallFrameTable<'d>>,
}

impl<'d> Fde<'d> {
    /// Section offset one past the end of the entry.
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.format.initial_length_size()) + self.length
    }

    /// Whether the entry covers an address.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.initial_location
            && address - self.initial_location < self.address_range
    }

    /// Executes the instructions on top of the last row of the CIE. The table is computed once.
    pub fn table(&self) -> Result<&DecodedCallFrameTable<'d>> {
        self.table.get_or_try_init(|| {
            let owner = TableOwner::Fde {
                initial_location: self.initial_location,
                cie_table: self.cie.table()?,
            };
            decode_table(&self.instructions, self.cie.factors(), owner)
        })
    }
}

impl fmt::Debug for Fde<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fde")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("cie", &format_args!("{:#x}", self.cie.offset))
            .field("initial_location", &format_args!("{:#x}", self.initial_location))
            .field("address_range", &format_args!("{:#x}", self.address_range))
            .field("lsda_pointer", &self.lsda_pointer)
            .field("instructions", &self.instructions.len())
            .finish()
    }
}

/// An entry of a call frame section.
#[derive(Debug)]
pub enum CfiEntry<'d> {
    /// A Common Information Entry.
    Cie(Rc<Cie<'d>>),
    /// A Frame Description Entry.
    Fde(Fde<'d>),
    /// The zero terminator of `.eh_frame`.
    Zero {
        /// Section offset of the terminator.
        offset: u64,
    },
}

impl<'d> CfiEntry<'d> {
    /// Section offset of the entry.
    pub fn offset(&self) -> u64 {
        match self {
            CfiEntry::Cie(cie) => cie.offset,
            CfiEntry::Fde(fde) => fde.offset,
            CfiEntry::Zero { offset } => *offset,
        }
    }

    /// Section offset one past the end of the entry.
    pub fn end(&self) -> u64 {
        match self {
            CfiEntry::Cie(cie) => cie.end(),
            CfiEntry::Fde(fde) => fde.end(),
            CfiEntry::Zero { offset } => offset + 4,
        }
    }

    /// The instructions of the entry. Empty for a terminator.
    pub fn instructions(&self) -> &[CallFrameInstruction<'d>] {
        match self {
            CfiEntry::Cie(cie) => &cie.instructions,
            CfiEntry::Fde(fde) => &fde.instructions,
            CfiEntry::Zero { .. } => &[],
        }
    }

    /// The decoded unwind table of the entry, or `None` for a terminator.
    pub fn table(&self) -> Result<Option<&DecodedCallFrameTable<'d>>> {
        match self {
            CfiEntry::Cie(cie) => cie.table().map(Some),
            CfiEntry::Fde(fde) => fde.table().map(Some),
            CfiEntry::Zero { .. } => Ok(None),
        }
    }

    /// The context for decoding expressions in the instructions of this entry.
    pub fn ctx(&self) -> Option<SchemaContext> {
        match self {
            CfiEntry::Cie(cie) => Some(cie.ctx()),
            CfiEntry::Fde(fde) => Some(fde.cie.ctx()),
            CfiEntry::Zero { .. } => None,
        }
    }

    /// Returns the entry as CIE.
    pub fn as_cie(&self) -> Option<&Cie<'d>> {
        match self {
            CfiEntry::Cie(cie) => Some(cie),
            _ => None,
        }
    }

    /// Returns the entry as FDE.
    pub fn as_fde(&self) -> Option<&Fde<'d>> {
        match self {
            CfiEntry::Fde(fde) => Some(fde),
            _ => None,
        }
    }
}

/// A decoder for the call frame information in `.debug_frame` or `.eh_frame`.
///
/// Entries are parsed on first access and cached by section offset, together with their decoded
/// tables.
pub struct CallFrameInfo<'d> {
    section: DwarfSection<'d>,
    config: DwarfConfig,
    mode: Mode,
    entries: FrozenMap<u64, Box<CfiEntry<'d>>>,
}

impl<'d> CallFrameInfo<'d> {
    /// Creates a decoder for a frame section.
    ///
    /// In [`Mode::EhFrame`], the section address is the base of `pcrel` pointers.
    pub fn new(section: DwarfSection<'d>, config: DwarfConfig, mode: Mode) -> Self {
        CallFrameInfo {
            section,
            config,
            mode,
            entries: FrozenMap::new(),
        }
    }

    /// Creates a decoder for the section of the given mode.
    pub fn from_sections(
        sections: &DwarfSections<'d>,
        config: DwarfConfig,
        mode: Mode,
    ) -> Result<Self> {
        let section = match mode {
            Mode::DebugFrame => sections.frame,
            Mode::EhFrame => sections.eh_frame,
        };

        let section = section.ok_or_else(|| {
            CfiError::new(CfiErrorKind::MissingSection, 0, mode.section_name())
        })?;
        Ok(Self::new(section, config, mode))
    }

    /// The section flavor.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The decoder configuration.
    pub fn config(&self) -> &DwarfConfig {
        &self.config
    }

    /// The architecture that names the registers in unwind tables.
    pub fn arch(&self) -> Result<Arch, UnknownArchError> {
        self.config.arch()
    }

    /// Iterates over all entries in section order.
    pub fn entries(&self) -> Entries<'d, '_> {
        Entries {
            cfi: self,
            offset: Some(0),
        }
    }

    /// Returns the entry at a section offset.
    pub fn entry_at(&self, offset: u64) -> Result<&CfiEntry<'d>> {
        if let Some(entry) = self.entries.get(&offset) {
            return Ok(entry);
        }

        let entry = self.parse_entry(offset, false)?;
        Ok(self.entries.insert(offset, Box::new(entry)))
    }

    /// Returns the FDE covering an address.
    pub fn fde_for_address(&self, address: u64) -> Result<Option<&Fde<'d>>> {
        for entry in self.entries() {
            if let Some(fde) = entry?.as_fde() {
                if fde.contains(address) {
                    return Ok(Some(fde));
                }
            }
        }
        Ok(None)
    }

    fn pointers(&self, address_size: u8) -> PointerContext {
        PointerContext {
            section_address: self.section.address,
            address_size,
        }
    }

    fn cie_at(&self, offset: u64, referrer: u64) -> Result<Rc<Cie<'d>>> {
        let entry = match self.entries.get(&offset) {
            Some(entry) => entry,
            None => {
                let entry = self.parse_entry(offset, true)?;
                self.entries.insert(offset, Box::new(entry))
            }
        };

        match entry {
            CfiEntry::Cie(cie) => Ok(Rc::clone(cie)),
            _ => Err(CfiError::new(
                CfiErrorKind::MalformedEntry,
                referrer,
                format!("CIE pointer to {offset:#x} does not name a CIE"),
            )),
        }
    }

    #[tracing::instrument(level = "trace", name = "CallFrameInfo::parse_entry", skip_all, fields(offset = offset))]
    fn parse_entry(&self, offset: u64, cie_only: bool) -> Result<CfiEntry<'d>> {
        let endian = self.config.endianness();
        let data = self.section.data;
        if offset >= data.len() as u64 {
            return Err(CfiError::new(
                CfiErrorKind::MalformedEntry,
                offset,
                "offset out of bounds",
            ));
        }

        let mut reader = Reader::at(data, offset, endian);
        let (length, format) = reader.initial_length()?;
        if self.mode == Mode::EhFrame && length == 0 {
            return Ok(CfiEntry::Zero { offset });
        }

        let end = reader.position().saturating_add(length);
        let mut reader = reader.bounded(end)?;

        let id_offset = reader.position();
        let id = match self.mode {
            Mode::EhFrame => u64::from(reader.u32()?),
            Mode::DebugFrame => reader.offset(format)?,
        };

        let is_cie = match self.mode {
            Mode::EhFrame => id == 0,
            Mode::DebugFrame => match format {
                Format::Dwarf32 => id == DEBUG_FRAME_CIE_ID32,
                Format::Dwarf64 => id == DEBUG_FRAME_CIE_ID64,
            },
        };

        if is_cie {
            let cie = self.parse_cie(reader, offset, length, format)?;
            return Ok(CfiEntry::Cie(Rc::new(cie)));
        }

        if cie_only {
            return Err(CfiError::new(
                CfiErrorKind::MalformedEntry,
                offset,
                "expected a CIE, found an FDE",
            ));
        }

        let cie_offset = match self.mode {
            Mode::EhFrame => id_offset.checked_sub(id),
            Mode::DebugFrame => Some(id),
        };
        let cie_offset = cie_offset.ok_or_else(|| {
            CfiError::new(
                CfiErrorKind::MalformedEntry,
                id_offset,
                format!("CIE pointer {id:#x} points before the section"),
            )
        })?;

        let cie = self.cie_at(cie_offset, offset)?;
        let fde = self.parse_fde(reader, offset, length, format, id, cie)?;
        Ok(CfiEntry::Fde(fde))
    }

    fn parse_cie(
        &self,
        mut reader: Reader<'d>,
        offset: u64,
        length: u64,
        format: Format,
    ) -> Result<Cie<'d>> {
        let version_offset = reader.position();
        let version = reader.u8()?;
        let supported = match self.mode {
            Mode::EhFrame => matches!(version, 1 | 3),
            Mode::DebugFrame => matches!(version, 1 | 3 | 4),
        };
        if !supported {
            return Err(CfiError::new(
                CfiErrorKind::MalformedEntry,
                version_offset,
                format!("unsupported CIE version {version}"),
            ));
        }

        let augmentation = reader.cstr()?;

        let mut address_size = self.config.default_address_size;
        let mut segment_size = 0;
        if self.mode == Mode::DebugFrame && version >= 4 {
            address_size = reader.u8()?;
            segment_size = reader.u8()?;
            if segment_size != 0 {
                return Err(CfiError::new(
                    CfiErrorKind::UnsupportedEncoding,
                    offset,
                    format!("segment selector size {segment_size}"),
                ));
            }
        }

        let code_alignment_factor = reader.uleb128()?;
        let data_alignment_factor = reader.sleb128()?;
        let return_address_register = if version == 1 {
            reader.u8()?.into()
        } else {
            reader.uleb128()?
        };

        let pointers = self.pointers(address_size);
        let mut augmentation_length = None;
        let mut augmentation_data = &[][..];
        let mut augmentation_fields = Augmentation::default();

        match augmentation.split_first() {
            None => {}
            Some((&b'z', fields)) => {
                let len = reader.uleb128()?;
                let data_offset = reader.position();
                augmentation_length = Some(len);
                augmentation_data = reader.bytes(len)?;

                let mut data = Reader::at(self.section.data, data_offset, reader.endian())
                    .bounded(data_offset + len)?;
                augmentation_fields = parse_augmentation(&mut data, fields, pointers, offset)?;
            }
            Some(_) => {
                return Err(CfiError::new(
                    CfiErrorKind::UnsupportedEncoding,
                    offset,
                    format!(
                        "augmentation {:?} without data length",
                        String::from_utf8_lossy(augmentation)
                    ),
                ))
            }
        }

        let fde_encoding = self.set_loc_encoding(&augmentation_fields);
        let instructions = parse_instructions(&mut reader, pointers, fde_encoding)?;

        Ok(Cie {
            offset,
            length,
            format,
            version,
            augmentation,
            address_size,
            segment_size,
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            augmentation_length,
            augmentation_data,
            augmentation_fields,
            instructions,
            ctx: SchemaContext::new(reader.endian(), format, address_size, version.into()),
            table: OnceCell::new(),
        })
    }

    fn parse_fde(
        &self,
        mut reader: Reader<'d>,
        offset: u64,
        length: u64,
        format: Format,
        cie_pointer: u64,
        cie: Rc<Cie<'d>>,
    ) -> Result<Fde<'d>> {
        let pointers = self.pointers(cie.address_size);

        let (initial_location, address_range) = match self.mode {
            Mode::EhFrame => {
                let encoding = cie
                    .augmentation_fields
                    .fde_encoding
                    .unwrap_or(constants::DW_EH_PE_absptr);
                let field_offset = reader.position();
                let initial_location = pointers.read(&mut reader, encoding)?.ok_or_else(|| {
                    CfiError::new(
                        CfiErrorKind::UnsupportedEncoding,
                        field_offset,
                        "omitted FDE initial location",
                    )
                })?;
                let address_range = pointers.read_value(&mut reader, encoding)?;
                (initial_location, address_range)
            }
            Mode::DebugFrame => (
                reader.address(cie.address_size)?,
                reader.address(cie.address_size)?,
            ),
        };

        let mut augmentation_data = &[][..];
        let mut lsda_pointer = None;
        if cie.has_augmentation_data() {
            let len = reader.uleb128()?;
            let data_offset = reader.position();
            augmentation_data = reader.bytes(len)?;

            if let Some(encoding) = cie.augmentation_fields.lsda_encoding {
                let mut data = Reader::at(self.section.data, data_offset, reader.endian())
                    .bounded(data_offset + len)?;
                lsda_pointer = pointers.read(&mut data, encoding)?;
            }
        }

        let fde_encoding = self.set_loc_encoding(&cie.augmentation_fields);
        let instructions = parse_instructions(&mut reader, pointers, fde_encoding)?;

        Ok(Fde {
            offset,
            length,
            format,
            cie_pointer,
            cie,
            initial_location,
            address_range,
            augmentation_data,
            lsda_pointer,
            instructions,
            table: OnceCell::new(),
        })
    }

    /// `DW_CFA_set_loc` operands follow the FDE encoding in `.eh_frame`.
    fn set_loc_encoding(&self, augmentation: &Augmentation) -> Option<DwEhPe> {
        match self.mode {
            Mode::EhFrame => Some(
                augmentation
                    .fde_encoding
                    .unwrap_or(constants::DW_EH_PE_absptr),
            ),
            Mode::DebugFrame => None,
        }
    }
}

impl fmt::Debug for CallFrameInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFrameInfo")
            .field("section", &self.section)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Reads the augmentation data fields named by an augmentation string after its leading `z`.
fn parse_augmentation(
    data: &mut Reader<'_>,
    fields: &[u8],
    pointers: PointerContext,
    offset: u64,
) -> Result<Augmentation> {
    let mut augmentation = Augmentation::default();

    for &field in fields {
        match field {
            b'L' => augmentation.lsda_encoding = Some(DwEhPe(data.u8()?)),
            b'R' => augmentation.fde_encoding = Some(DwEhPe(data.u8()?)),
            b'S' => augmentation.signal_frame = true,
            b'P' => {
                let encoding = DwEhPe(data.u8()?);
                if let Some(pointer) = pointers.read(data, encoding)? {
                    augmentation.personality = Some((encoding, pointer));
                }
            }
            _ => {
                // The remaining fields cannot be located, but the data length still is known.
                tracing::debug!(
                    offset,
                    augmentation = %char::from(field),
                    "unknown CIE augmentation"
                );
                break;
            }
        }
    }

    Ok(augmentation)
}

/// An iterator over the entries of a call frame section.
///
/// After an error, the iterator is exhausted.
#[derive(Clone, Debug)]
pub struct Entries<'d, 'a> {
    cfi: &'a CallFrameInfo<'d>,
    offset: Option<u64>,
}

impl<'d, 'a> Iterator for Entries<'d, 'a> {
    type Item = Result<&'a CfiEntry<'d>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        if offset >= self.cfi.section.data.len() as u64 {
            return None;
        }

        let entry = self.cfi.entry_at(offset);
        if let Ok(entry) = entry {
            self.offset = Some(entry.end());
        }
        Some(entry)
    }
}

impl std::iter::FusedIterator for Entries<'_, '_> {}
