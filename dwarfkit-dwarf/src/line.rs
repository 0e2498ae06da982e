//! Line number programs in `.debug_line`.
//!
//! Only the header and the raw rows produced by the line number state machine are decoded. File
//! names are not joined with their directories.

use std::fmt;

use gimli::constants::{self, DwLnct};
use gimli::Format;
use once_cell::unsync::OnceCell;

use crate::context::SchemaContext;
use crate::die::AttributeValue;
use crate::dwarfinfo::DwarfInfo;
use crate::error::{DwarfError, Result};
use crate::form::{Form, RawValue};
use crate::reader::Reader;
use crate::sections::require;

/// A file of the line program, in the shape used by all versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileEntry<'d> {
    /// The file name, possibly relative to its include directory.
    pub path: &'d [u8],
    /// Index into the include directories.
    pub directory_index: u64,
    /// Modification time, or zero.
    pub timestamp: u64,
    /// Size in bytes, or zero.
    pub size: u64,
    /// MD5 digest of the file contents, DWARF 5 only.
    pub md5: Option<&'d [u8]>,
}

/// Describes one field of a DWARF 5 directory or file name entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryFormat {
    /// The `DW_LNCT_*` content type.
    pub content_type: DwLnct,
    /// The form the field is encoded with.
    pub form: Form,
}

/// A DWARF 5 directory or file name entry, with one value per entry format.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderEntry<'d> {
    /// Decoded fields in the order of the entry formats.
    pub values: Vec<(DwLnct, AttributeValue<'d>)>,
}

impl<'d> HeaderEntry<'d> {
    /// Returns the value of a content type.
    pub fn get(&self, content_type: DwLnct) -> Option<AttributeValue<'d>> {
        self.values
            .iter()
            .find(|(lnct, _)| *lnct == content_type)
            .map(|&(_, value)| value)
    }

    fn path(&self) -> &'d [u8] {
        self.get(constants::DW_LNCT_path)
            .and_then(|value| value.as_bytes())
            .unwrap_or_default()
    }

    fn file_entry(&self) -> FileEntry<'d> {
        let number = |lnct| self.get(lnct).and_then(|v| v.as_u64()).unwrap_or(0);
        FileEntry {
            path: self.path(),
            directory_index: number(constants::DW_LNCT_directory_index),
            timestamp: number(constants::DW_LNCT_timestamp),
            size: number(constants::DW_LNCT_size),
            md5: self
                .get(constants::DW_LNCT_MD5)
                .and_then(|value| value.as_bytes()),
        }
    }
}

/// The header of a line number program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineProgramHeader<'d> {
    /// Section offset of the program.
    pub offset: u64,
    /// Length of the program, not including the initial length field.
    pub unit_length: u64,
    /// 32-bit or 64-bit DWARF.
    pub format: Format,
    /// Version of the line program, independent of the unit version.
    pub version: u16,
    /// Size of an address. Declared by DWARF 5 headers, taken from the unit otherwise.
    pub address_size: u8,
    /// Size of a segment selector. Zero before DWARF 5.
    pub segment_selector_size: u8,
    /// Number of bytes between this field and the first opcode.
    pub header_length: u64,
    /// Size of the smallest target instruction.
    pub minimum_instruction_length: u8,
    /// Operations per VLIW instruction. Always 1 before DWARF 4.
    pub maximum_operations_per_instruction: u8,
    /// Initial value of the `is_stmt` register.
    pub default_is_stmt: bool,
    /// Smallest line advance of a special opcode.
    pub line_base: i8,
    /// Number of distinct line advances of special opcodes.
    pub line_range: u8,
    /// Number of the first special opcode.
    pub opcode_base: u8,
    /// Number of ULEB128 operands of each standard opcode, starting at opcode 1.
    pub standard_opcode_lengths: Vec<u8>,
    /// Formats of the directory entries, DWARF 5 only.
    pub directory_entry_format: Vec<EntryFormat>,
    /// Directory entries, DWARF 5 only.
    pub directories: Vec<HeaderEntry<'d>>,
    /// Formats of the file name entries, DWARF 5 only.
    pub file_name_entry_format: Vec<EntryFormat>,
    /// File name entries, DWARF 5 only.
    pub file_names: Vec<HeaderEntry<'d>>,
    /// Include directories of all versions.
    ///
    /// Before DWARF 5, the compilation directory is implied and the first entry has index 1.
    pub include_directory: Vec<&'d [u8]>,
    /// File entries of all versions.
    ///
    /// Before DWARF 5, the first entry has index 1.
    pub file_entry: Vec<FileEntry<'d>>,
}

/// The registers of the line number state machine after an opcode appended a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineRow {
    /// Address of the instruction.
    pub address: u64,
    /// Index of the operation inside a VLIW instruction.
    pub op_index: u64,
    /// File index into the header's file entries.
    pub file: u64,
    /// Source line, starting at 1. Zero if unknown.
    pub line: u64,
    /// Source column, starting at 1. Zero for the left edge.
    pub column: u64,
    /// Whether the instruction is a recommended breakpoint location.
    pub is_stmt: bool,
    /// Whether the instruction begins a basic block.
    pub basic_block: bool,
    /// Whether this row ends a sequence. Its address is one past the last instruction.
    pub end_sequence: bool,
    /// Whether the instruction is where a function's prologue ends.
    pub prologue_end: bool,
    /// Whether the instruction is where a function's epilogue begins.
    pub epilogue_begin: bool,
    /// Instruction set architecture of the instruction.
    pub isa: u64,
    /// Block the instruction belongs to.
    pub discriminator: u64,
}

impl LineRow {
    fn new(default_is_stmt: bool) -> Self {
        LineRow {
            address: 0,
            op_index: 0,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: default_is_stmt,
            basic_block: false,
            end_sequence: false,
            prologue_end: false,
            epilogue_begin: false,
            isa: 0,
            discriminator: 0,
        }
    }
}

/// A row of a [`LineSequence`], with duplicate addresses merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceRow {
    /// Address of the first instruction.
    pub address: u64,
    /// File index into the header's file entries.
    pub file: u64,
    /// Source line.
    pub line: u64,
    /// Number of bytes covered, unknown for the last row of an unterminated sequence.
    pub size: Option<u64>,
}

/// A run of rows with contiguous, increasing addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineSequence {
    /// Address of the first row.
    pub start: u64,
    /// Address past the last instruction.
    pub end: u64,
    /// The rows of this sequence.
    pub rows: Vec<SequenceRow>,
}

/// The result of running the opcodes once.
#[derive(Debug)]
struct Execution<'d> {
    rows: Vec<LineRow>,
    defined_files: Vec<FileEntry<'d>>,
}

/// A line number program.
pub struct LineProgram<'d> {
    header: LineProgramHeader<'d>,
    data: &'d [u8],
    ctx: SchemaContext,
    program_offset: u64,
    end: u64,
    execution: OnceCell<Execution<'d>>,
}

impl<'d> LineProgram<'d> {
    /// Parses the header of the line program at `offset` of `.debug_line`.
    ///
    /// `ctx` is the context of the unit referring to the program. It provides the address size for
    /// versions that do not declare one.
    #[tracing::instrument(level = "trace", name = "LineProgram::parse", skip_all, fields(offset = offset))]
    pub fn parse(info: &DwarfInfo<'d>, offset: u64, ctx: SchemaContext) -> Result<Self> {
        let data = require(info.sections().line, "debug_line")?;
        let mut reader = ctx.reader_at(data, offset);

        let (unit_length, format) = reader.initial_length()?;
        let end = reader.position().saturating_add(unit_length);
        let mut reader = reader.bounded(end)?;

        let version = reader.u16()?;
        if !(2..=5).contains(&version) {
            return Err(DwarfError::malformed(
                offset,
                format!("unsupported line program version {version}"),
            ));
        }

        let (address_size, segment_selector_size) = if version >= 5 {
            (reader.u8()?, reader.u8()?)
        } else {
            (ctx.address_size, 0)
        };

        let header_length = reader.offset(format)?;
        let program_offset = reader.position().saturating_add(header_length);
        let minimum_instruction_length = reader.u8()?;
        let maximum_operations_per_instruction = if version >= 4 { reader.u8()? } else { 1 };
        let default_is_stmt = reader.u8()? != 0;
        let line_base = reader.i8()?;
        let line_range = reader.u8()?;
        let opcode_base = reader.u8()?;
        let standard_opcode_lengths = (1..opcode_base)
            .map(|_| reader.u8())
            .collect::<Result<Vec<_>>>()?;

        let ctx = ctx
            .with_format(format)
            .with_address_size(address_size)
            .with_version(version);

        let mut header = LineProgramHeader {
            offset,
            unit_length,
            format,
            version,
            address_size,
            segment_selector_size,
            header_length,
            minimum_instruction_length,
            maximum_operations_per_instruction,
            default_is_stmt,
            line_base,
            line_range,
            opcode_base,
            standard_opcode_lengths,
            directory_entry_format: Vec::new(),
            directories: Vec::new(),
            file_name_entry_format: Vec::new(),
            file_names: Vec::new(),
            include_directory: Vec::new(),
            file_entry: Vec::new(),
        };

        if version >= 5 {
            header.directory_entry_format = read_entry_formats(&mut reader)?;
            header.directories =
                read_entries(&mut reader, ctx, info, &header.directory_entry_format)?;
            header.file_name_entry_format = read_entry_formats(&mut reader)?;
            header.file_names =
                read_entries(&mut reader, ctx, info, &header.file_name_entry_format)?;

            header.include_directory = header.directories.iter().map(|d| d.path()).collect();
            header.file_entry = header.file_names.iter().map(|f| f.file_entry()).collect();
        } else {
            loop {
                let directory = reader.cstr()?;
                if directory.is_empty() {
                    break;
                }
                header.include_directory.push(directory);
            }

            loop {
                let path = reader.cstr()?;
                if path.is_empty() {
                    break;
                }
                header.file_entry.push(read_file_entry(&mut reader, path)?);
            }
        }

        if program_offset > end {
            return Err(DwarfError::malformed(
                offset,
                format!("header length {header_length:#x} exceeds the program"),
            ));
        }

        Ok(LineProgram {
            header,
            data,
            ctx,
            program_offset,
            end,
            execution: OnceCell::new(),
        })
    }

    /// The program header.
    pub fn header(&self) -> &LineProgramHeader<'d> {
        &self.header
    }

    /// Section offset of the first opcode.
    pub fn program_offset(&self) -> u64 {
        self.program_offset
    }

    /// Section offset past the last opcode.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Runs the state machine and returns every row it appended.
    ///
    /// The result is memoized.
    pub fn rows(&self) -> Result<&[LineRow]> {
        Ok(&self.execute()?.rows)
    }

    /// Files added by `DW_LNE_define_file` opcodes, in program order.
    pub fn defined_files(&self) -> Result<&[FileEntry<'d>]> {
        Ok(&self.execute()?.defined_files)
    }

    /// Looks up the file of a row's `file` register.
    ///
    /// DWARF 5 numbers files from 0, earlier versions from 1. Files added by `DW_LNE_define_file`
    /// follow those declared in the header.
    pub fn file(&self, index: u64) -> Result<Option<&FileEntry<'d>>> {
        let index = if self.header.version >= 5 {
            index
        } else {
            match index.checked_sub(1) {
                Some(index) => index,
                None => return Ok(None),
            }
        };

        let Ok(index) = usize::try_from(index) else {
            return Ok(None);
        };

        let declared = &self.header.file_entry;
        if let Some(entry) = declared.get(index) {
            return Ok(Some(entry));
        }

        Ok(self.defined_files()?.get(index - declared.len()))
    }

    /// The end of a sequence closed implicitly after a row at `address`.
    fn past_last(&self, address: u64) -> Result<u64> {
        address.checked_add(1).ok_or_else(|| {
            DwarfError::malformed(self.header.offset, "sequence ends past the address space")
        })
    }

    /// Groups the rows into sequences sorted by start address.
    ///
    /// Rows sharing an address are merged and rows whose address decreases within a sequence are
    /// dropped. A trailing sequence without `DW_LNE_end_sequence` is assumed to end one byte after
    /// its last row.
    pub fn sequences(&self) -> Result<Vec<LineSequence>> {
        let mut sequences = Vec::new();
        let mut sequence_rows = Vec::<SequenceRow>::new();
        let mut prev_address = 0;

        for row in self.rows()? {
            let address = row.address;

            if let Some(last_row) = sequence_rows.last_mut() {
                if address >= last_row.address {
                    last_row.size = Some(address - last_row.address);
                }
            }

            if row.end_sequence {
                if !sequence_rows.is_empty() {
                    sequences.push(LineSequence {
                        start: sequence_rows[0].address,
                        end: if address < prev_address {
                            self.past_last(prev_address)?
                        } else {
                            address
                        },
                        rows: std::mem::take(&mut sequence_rows),
                    });
                }
                prev_address = 0;
            } else if address < prev_address {
                // Addresses may only increase within a sequence.
            } else {
                match sequence_rows.last_mut() {
                    Some(last_row) if last_row.address == address => {
                        last_row.file = row.file;
                        last_row.line = row.line;
                    }
                    _ => sequence_rows.push(SequenceRow {
                        address,
                        file: row.file,
                        line: row.line,
                        size: None,
                    }),
                }
                prev_address = address;
            }
        }

        if !sequence_rows.is_empty() {
            sequences.push(LineSequence {
                start: sequence_rows[0].address,
                end: self.past_last(prev_address)?,
                rows: sequence_rows,
            });
        }

        dmsort::sort_by_key(&mut sequences, |x| x.start);
        Ok(sequences)
    }

    fn execute(&self) -> Result<&Execution<'d>> {
        self.execution.get_or_try_init(|| self.run())
    }

    fn run(&self) -> Result<Execution<'d>> {
        let header = &self.header;
        let mut reader = self
            .ctx
            .reader_at(self.data, self.program_offset)
            .bounded(self.end)?;

        let mut rows = Vec::new();
        let mut defined_files = Vec::new();
        let mut state = LineRow::new(header.default_is_stmt);

        while !reader.is_empty() {
            let opcode_offset = reader.position();
            let opcode = reader.u8()?;

            if opcode >= header.opcode_base {
                let adjusted = opcode - header.opcode_base;
                let line_range = self.line_range(opcode_offset)?;
                self.advance(&mut state, u64::from(adjusted / line_range));
                let line_advance = i64::from(header.line_base) + i64::from(adjusted % line_range);
                state.line = state.line.wrapping_add(line_advance as u64);

                rows.push(state);
                state.basic_block = false;
                state.prologue_end = false;
                state.epilogue_begin = false;
                state.discriminator = 0;
                continue;
            }

            match constants::DwLns(opcode) {
                constants::DW_LNS_copy => {
                    rows.push(state);
                    state.basic_block = false;
                    state.prologue_end = false;
                    state.epilogue_begin = false;
                    state.discriminator = 0;
                }
                constants::DW_LNS_advance_pc => {
                    let operation_advance = reader.uleb128()?;
                    self.advance(&mut state, operation_advance);
                }
                constants::DW_LNS_advance_line => {
                    let line_advance = reader.sleb128()?;
                    state.line = state.line.wrapping_add(line_advance as u64);
                }
                constants::DW_LNS_set_file => state.file = reader.uleb128()?,
                constants::DW_LNS_set_column => state.column = reader.uleb128()?,
                constants::DW_LNS_negate_stmt => state.is_stmt = !state.is_stmt,
                constants::DW_LNS_set_basic_block => state.basic_block = true,
                constants::DW_LNS_const_add_pc => {
                    let adjusted = 255 - header.opcode_base;
                    let line_range = self.line_range(opcode_offset)?;
                    self.advance(&mut state, u64::from(adjusted / line_range));
                }
                constants::DW_LNS_fixed_advance_pc => {
                    state.address = state.address.wrapping_add(reader.u16()?.into());
                    state.op_index = 0;
                }
                constants::DW_LNS_set_prologue_end => state.prologue_end = true,
                constants::DW_LNS_set_epilogue_begin => state.epilogue_begin = true,
                constants::DW_LNS_set_isa => state.isa = reader.uleb128()?,
                _ if opcode == 0 => {
                    let len = reader.uleb128()?;
                    let ext_end = reader.position().saturating_add(len);
                    let mut ext = reader.bounded(ext_end)?;
                    reader.seek(ext_end);

                    if len == 0 {
                        continue;
                    }

                    match constants::DwLne(ext.u8()?) {
                        constants::DW_LNE_end_sequence => {
                            state.end_sequence = true;
                            rows.push(state);
                            state = LineRow::new(header.default_is_stmt);
                        }
                        constants::DW_LNE_set_address => {
                            let size = u8::try_from(len - 1).unwrap_or(self.ctx.address_size);
                            state.address = ext.address(size)?;
                            state.op_index = 0;
                        }
                        constants::DW_LNE_define_file => {
                            let path = ext.cstr()?;
                            defined_files.push(read_file_entry(&mut ext, path)?);
                        }
                        constants::DW_LNE_set_discriminator => {
                            state.discriminator = ext.uleb128()?;
                        }
                        other => {
                            tracing::debug!(
                                offset = opcode_offset,
                                opcode = %other,
                                "skipping unknown extended line opcode",
                            );
                        }
                    }
                }
                _ => {
                    // Standard opcodes without a known meaning declare their operand count.
                    let operands = header
                        .standard_opcode_lengths
                        .get(usize::from(opcode) - 1)
                        .copied()
                        .unwrap_or(0);
                    for _ in 0..operands {
                        reader.uleb128()?;
                    }
                }
            }
        }

        Ok(Execution {
            rows,
            defined_files,
        })
    }

    fn line_range(&self, offset: u64) -> Result<u8> {
        match self.header.line_range {
            0 => Err(DwarfError::malformed(offset, "line range of zero")),
            line_range => Ok(line_range),
        }
    }

    fn advance(&self, state: &mut LineRow, operation_advance: u64) {
        let min_length = u64::from(self.header.minimum_instruction_length);
        let max_ops = u64::from(self.header.maximum_operations_per_instruction);

        if max_ops <= 1 {
            let delta = min_length.wrapping_mul(operation_advance);
            state.address = state.address.wrapping_add(delta);
        } else {
            let op_index = state.op_index.wrapping_add(operation_advance);
            let delta = min_length.wrapping_mul(op_index / max_ops);
            state.address = state.address.wrapping_add(delta);
            state.op_index = op_index % max_ops;
        }
    }
}

impl fmt::Debug for LineProgram<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineProgram")
            .field("header", &self.header)
            .field("program_offset", &format_args!("{:#x}", self.program_offset))
            .field("end", &format_args!("{:#x}", self.end))
            .finish()
    }
}

fn read_file_entry<'d>(reader: &mut Reader<'d>, path: &'d [u8]) -> Result<FileEntry<'d>> {
    Ok(FileEntry {
        path,
        directory_index: reader.uleb128()?,
        timestamp: reader.uleb128()?,
        size: reader.uleb128()?,
        md5: None,
    })
}

fn read_entry_formats(reader: &mut Reader<'_>) -> Result<Vec<EntryFormat>> {
    let count = reader.u8()?;
    (0..count)
        .map(|_| -> Result<EntryFormat> {
            let content_type = reader.uleb128()?;
            let form_offset = reader.position();
            let code = reader.uleb128()?;
            let form = Form::from_code(code).ok_or(DwarfError::UnknownForm {
                offset: form_offset,
                form: code,
            })?;

            Ok(EntryFormat {
                content_type: DwLnct(u16::try_from(content_type).unwrap_or(u16::MAX)),
                form,
            })
        })
        .collect()
}

fn read_entries<'d>(
    reader: &mut Reader<'d>,
    ctx: SchemaContext,
    info: &DwarfInfo<'d>,
    formats: &[EntryFormat],
) -> Result<Vec<HeaderEntry<'d>>> {
    let count = reader.uleb128()?;
    let mut entries = Vec::new();

    for _ in 0..count {
        let mut entry = HeaderEntry::default();
        for format in formats {
            let raw = format.form.read(reader, ctx)?;
            let value = translate_entry_value(info, format.form, raw)?;
            entry.values.push((format.content_type, value));
        }
        entries.push(entry);
    }

    Ok(entries)
}

/// Resolves string offsets of a header entry field.
///
/// Indexed strings keep their index, since the header cannot locate the unit's offset table.
fn translate_entry_value<'d>(
    info: &DwarfInfo<'d>,
    form: Form,
    raw: RawValue<'d>,
) -> Result<AttributeValue<'d>> {
    Ok(match (form, raw) {
        (Form::LineStrp, RawValue::Unsigned(offset)) => {
            AttributeValue::String(info.line_string_at(offset)?)
        }
        (Form::Strp, RawValue::Unsigned(offset)) => AttributeValue::String(info.string_at(offset)?),
        (Form::StrpSup | Form::GnuStrpAlt, RawValue::Unsigned(offset)) => {
            match info.supplementary() {
                Some(sup) => AttributeValue::String(sup.string_at(offset)?),
                None => AttributeValue::Unsigned(offset),
            }
        }
        (_, RawValue::Unsigned(value)) => AttributeValue::Unsigned(value),
        (_, RawValue::Signed(value)) => AttributeValue::Signed(value),
        (_, RawValue::Block(bytes)) => AttributeValue::Block(bytes),
        (_, RawValue::String(bytes)) => AttributeValue::String(bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use dwarfkit_testutils::SectionWriter;
    use similar_asserts::assert_eq;

    use crate::sections::{DwarfConfig, DwarfSection, DwarfSections};

    const OPCODE_LENGTHS: [u8; 12] = [0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1];

    fn info<'a>(line: &'a [u8], line_str: &'a [u8]) -> DwarfInfo<'a> {
        let sections = DwarfSections {
            line: Some(DwarfSection::new(line)),
            line_str: Some(DwarfSection::new(line_str)),
            ..Default::default()
        };
        DwarfInfo::new(DwarfConfig::default(), sections)
    }

    fn set_address(w: &mut SectionWriter, address: u64) {
        w.u8(0).uleb(9).u8(2).u64(address);
    }

    fn end_sequence(w: &mut SectionWriter) {
        w.u8(0).uleb(1).u8(1);
    }

    #[test]
    fn test_v3_program() -> Result<()> {
        let mut w = SectionWriter::little();
        let unit = w.begin_unit(false);
        w.u16(3);
        let header = w.begin_unit(false);
        w.u8(1).u8(1).i8(-5).u8(14).u8(13).bytes(&OPCODE_LENGTHS);
        w.cstr("inc").u8(0);
        w.cstr("a.c").uleb(1).uleb(0).uleb(0).u8(0);
        w.end_unit(header);

        set_address(&mut w, 0x1000);
        w.u8(18);
        w.u8(3).sleb(2);
        w.u8(75);
        w.u8(4).uleb(2);
        w.u8(0).uleb(8).u8(3).cstr("b.c").uleb(0).uleb(0).uleb(0);
        w.u8(0).uleb(3).u8(0x80).u8(0xaa).u8(0xbb);
        w.u8(8);
        w.u8(1);
        w.u8(9).u16(0x0b);
        end_sequence(&mut w);
        w.end_unit(unit);

        let data = w.finish();
        let info = info(&data, &[]);
        let ctx = info.config().default_context();
        let program = LineProgram::parse(&info, 0, ctx)?;

        let header = program.header();
        assert_eq!(header.version, 3);
        assert_eq!(header.maximum_operations_per_instruction, 1);
        assert_eq!(header.address_size, 8);
        assert_eq!(header.include_directory, vec![&b"inc"[..]]);
        assert_eq!(header.file_entry.len(), 1);
        assert_eq!(header.file_entry[0].path, &b"a.c"[..]);

        let rows: Vec<_> = program
            .rows()?
            .iter()
            .map(|r| (r.address, r.file, r.line, r.end_sequence))
            .collect();
        assert_eq!(
            rows,
            vec![
                (0x1000, 1, 1, false),
                (0x1004, 1, 4, false),
                (0x1015, 2, 4, false),
                (0x1020, 2, 4, true),
            ]
        );

        assert_eq!(program.file(1)?.map(|f| f.path), Some(&b"a.c"[..]));
        assert_eq!(program.file(2)?.map(|f| f.path), Some(&b"b.c"[..]));
        assert_eq!(program.file(0)?, None);

        let sequences = program.sequences()?;
        assert_eq!(sequences.len(), 1);
        assert_eq!((sequences[0].start, sequences[0].end), (0x1000, 0x1020));
        let sizes: Vec<_> = sequences[0].rows.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![Some(4), Some(0x11), Some(0x0b)]);
        Ok(())
    }

    #[test]
    fn test_v5_header_and_sequence_order() -> Result<()> {
        let line_str = b"/work\0src\0";

        let mut w = SectionWriter::little();
        let unit = w.begin_unit(false);
        w.u16(5).u8(8).u8(0);
        let header = w.begin_unit(false);
        w.u8(1).u8(1).u8(1).i8(-5).u8(14).u8(13).bytes(&OPCODE_LENGTHS);
        w.u8(1).uleb(1).uleb(0x1f);
        w.uleb(2).u32(0).u32(6);
        w.u8(3).uleb(1).uleb(0x08).uleb(2).uleb(0x0f).uleb(5).uleb(0x1e);
        w.uleb(1).cstr("main.c").uleb(1).bytes(&[0x11; 16]);
        w.end_unit(header);

        set_address(&mut w, 0x2000);
        w.u8(1).u8(2).uleb(4);
        end_sequence(&mut w);
        set_address(&mut w, 0x1000);
        w.u8(1).u8(2).uleb(2);
        end_sequence(&mut w);
        w.end_unit(unit);

        let data = w.finish();
        let info = info(&data, line_str);
        let ctx = info.config().default_context();
        let program = LineProgram::parse(&info, 0, ctx)?;

        let header = program.header();
        assert_eq!(header.directory_entry_format.len(), 1);
        assert_eq!(header.directory_entry_format[0].form, Form::LineStrp);
        assert_eq!(header.include_directory, vec![&b"/work"[..], &b"src"[..]]);
        assert_eq!(
            header.file_entry,
            vec![FileEntry {
                path: b"main.c",
                directory_index: 1,
                timestamp: 0,
                size: 0,
                md5: Some(&[0x11; 16]),
            }]
        );
        assert_eq!(program.file(0)?.map(|f| f.path), Some(&b"main.c"[..]));

        let bounds: Vec<_> = program
            .sequences()?
            .iter()
            .map(|s| (s.start, s.end))
            .collect();
        assert_eq!(bounds, vec![(0x1000, 0x1002), (0x2000, 0x2004)]);
        Ok(())
    }

    #[test]
    fn test_unknown_standard_opcode_skips_operands() -> Result<()> {
        let mut w = SectionWriter::little();
        let unit = w.begin_unit(false);
        w.u16(4);
        let header = w.begin_unit(false);
        w.u8(4).u8(1).u8(1).i8(-5).u8(14).u8(14).bytes(&OPCODE_LENGTHS).u8(2);
        w.u8(0).u8(0);
        w.end_unit(header);

        set_address(&mut w, 0x400);
        w.u8(13).uleb(0x1234).uleb(7);
        w.u8(2).uleb(3);
        end_sequence(&mut w);
        w.end_unit(unit);

        let data = w.finish();
        let info = info(&data, &[]);
        let program = LineProgram::parse(&info, 0, info.config().default_context())?;

        let rows = program.rows()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address, 0x40c);
        Ok(())
    }

    #[test]
    fn test_zero_line_range() -> Result<()> {
        let mut w = SectionWriter::little();
        let unit = w.begin_unit(false);
        w.u16(2);
        let header = w.begin_unit(false);
        w.u8(1).u8(1).i8(-5).u8(0).u8(13).bytes(&OPCODE_LENGTHS);
        w.u8(0).u8(0);
        w.end_unit(header);
        let special = w.position() as u64;
        w.u8(20);
        w.end_unit(unit);

        let data = w.finish();
        let info = info(&data, &[]);
        let program = LineProgram::parse(&info, 0, info.config().default_context())?;

        let err = program.rows().unwrap_err();
        assert_eq!(err.offset(), Some(special));
        Ok(())
    }
}
