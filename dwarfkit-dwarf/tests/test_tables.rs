use dwarfkit_dwarf::gimli::constants::{self, DwAt, DwForm, DwTag};
use dwarfkit_dwarf::{DwarfConfig, DwarfInfo, DwarfSection, DwarfSections, NameLutEntry};
use dwarfkit_testutils::SectionWriter;
use similar_asserts::assert_eq;

type Error = Box<dyn std::error::Error>;

const OPCODE_LENGTHS: [u8; 12] = [0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1];

fn abbrev(w: &mut SectionWriter, code: u64, tag: DwTag, children: bool, attrs: &[(DwAt, DwForm)]) {
    w.uleb(code).uleb(tag.0.into()).u8(children.into());
    for &(name, form) in attrs {
        w.uleb(name.0.into()).uleb(form.0.into());
    }
    w.uleb(0).uleb(0);
}

struct Fixture {
    info: Vec<u8>,
    abbrev: Vec<u8>,
    line: Vec<u8>,
    aranges: Vec<u8>,
    pubnames: Vec<u8>,
}

/// Two DWARF 4 units:
///
///  - at 0, a compile unit with a line program and a subprogram `main` at offset 16,
///  - at 31, an empty compile unit without line program.
fn fixture() -> Fixture {
    let mut abbrevs = SectionWriter::little();
    abbrev(
        &mut abbrevs,
        1,
        constants::DW_TAG_compile_unit,
        true,
        &[(constants::DW_AT_stmt_list, constants::DW_FORM_sec_offset)],
    );
    abbrev(
        &mut abbrevs,
        2,
        constants::DW_TAG_subprogram,
        false,
        &[
            (constants::DW_AT_name, constants::DW_FORM_string),
            (constants::DW_AT_low_pc, constants::DW_FORM_addr),
        ],
    );
    abbrev(&mut abbrevs, 3, constants::DW_TAG_compile_unit, false, &[]);
    abbrevs.u8(0);

    let mut info = SectionWriter::little();
    let unit = info.begin_unit(false);
    info.u16(4).u32(0).u8(8);
    info.u8(1).u32(0);
    info.u8(2).cstr("main").u64(0x1000);
    info.u8(0);
    info.end_unit(unit);
    let unit = info.begin_unit(false);
    info.u16(4).u32(0).u8(8);
    info.u8(3);
    info.end_unit(unit);

    let mut line = SectionWriter::little();
    let unit = line.begin_unit(false);
    line.u16(4);
    let header = line.begin_unit(false);
    line.u8(1).u8(1).u8(1).i8(-5).u8(14).u8(13).bytes(&OPCODE_LENGTHS);
    line.cstr("src").u8(0);
    line.cstr("main.c").uleb(1).uleb(0).uleb(0).u8(0);
    line.end_unit(header);
    line.u8(0).uleb(9).u8(constants::DW_LNE_set_address.0).u64(0x1000);
    line.u8(constants::DW_LNS_copy.0);
    line.u8(constants::DW_LNS_advance_pc.0).uleb(4);
    line.u8(0).uleb(1).u8(constants::DW_LNE_end_sequence.0);
    line.end_unit(unit);

    let mut aranges = SectionWriter::little();
    let set = aranges.begin_unit(false);
    aranges.u16(2).u32(0).u8(8).u8(0);
    aranges.align(16);
    aranges.u64(0x1000).u64(0x40);
    aranges.u64(0).u64(0);
    aranges.end_unit(set);
    let set = aranges.begin_unit(false);
    aranges.u16(2).u32(31).u8(8).u8(0);
    aranges.align(16);
    aranges.u64(0x2000).u64(0x10);
    aranges.u64(0).u64(0);
    aranges.end_unit(set);

    let mut pubnames = SectionWriter::little();
    let set = pubnames.begin_unit(false);
    pubnames.u16(2).u32(0).u32(31);
    pubnames.u32(16).cstr("main");
    pubnames.u32(0);
    pubnames.end_unit(set);

    Fixture {
        info: info.finish(),
        abbrev: abbrevs.finish(),
        line: line.finish(),
        aranges: aranges.finish(),
        pubnames: pubnames.finish(),
    }
}

fn dwarf_info(fixture: &Fixture) -> DwarfInfo<'_> {
    let sections = DwarfSections {
        info: Some(DwarfSection::new(&fixture.info)),
        abbrev: Some(DwarfSection::new(&fixture.abbrev)),
        line: Some(DwarfSection::new(&fixture.line)),
        aranges: Some(DwarfSection::new(&fixture.aranges)),
        pubnames: Some(DwarfSection::new(&fixture.pubnames)),
        ..Default::default()
    };
    DwarfInfo::new(DwarfConfig::default(), sections)
}

#[test]
fn test_aranges_lookup() -> Result<(), Error> {
    let fixture = fixture();
    let info = dwarf_info(&fixture);

    let aranges = info.aranges()?.ok_or("no aranges")?;
    assert_eq!(aranges.entries().len(), 2);
    assert_eq!(aranges.cu_offset_at_addr(0x1000), Some(0));
    assert_eq!(aranges.cu_offset_at_addr(0x103f), Some(0));
    assert_eq!(aranges.cu_offset_at_addr(0x1040), None);
    assert_eq!(aranges.cu_offset_at_addr(0x2008), Some(31));
    assert_eq!(aranges.cu_offset_at_addr(0x10), None);

    let unit = info.unit_at(31)?;
    assert_eq!(unit.root()?.tag(), Some(constants::DW_TAG_compile_unit));

    assert!(info.pubtypes()?.is_none());
    Ok(())
}

#[test]
fn test_pubnames_resolve_to_dies() -> Result<(), Error> {
    let fixture = fixture();
    let info = dwarf_info(&fixture);

    let pubnames = info.pubnames()?.ok_or("no pubnames")?;
    assert_eq!(pubnames.len(), 1);
    assert_eq!(pubnames.unit_headers()[0].debug_info_length, 31);

    let entry = pubnames.get(b"main").ok_or("main not indexed")?;
    assert_eq!(
        *entry,
        NameLutEntry {
            cu_offset: 0,
            die_offset: 16,
        }
    );

    let die = info.die_from_lut_entry(entry)?;
    assert_eq!(die.tag(), Some(constants::DW_TAG_subprogram));
    assert_eq!(
        die.attr_value(constants::DW_AT_name)
            .and_then(|value| value.as_bytes()),
        Some(&b"main"[..])
    );
    assert_eq!(
        die.attr_value(constants::DW_AT_low_pc)
            .and_then(|value| value.as_u64()),
        Some(0x1000)
    );
    Ok(())
}

#[test]
fn test_line_program_for_unit() -> Result<(), Error> {
    let fixture = fixture();
    let info = dwarf_info(&fixture);

    let unit = info.unit_at(0)?;
    let program = info.line_program_for_unit(unit)?.ok_or("no line program")?;
    assert_eq!(program.header().version, 4);
    assert_eq!(program.header().include_directory, vec![&b"src"[..]]);
    assert_eq!(program.file(1)?.map(|file| file.path), Some(&b"main.c"[..]));

    let rows: Vec<_> = program
        .rows()?
        .iter()
        .map(|row| (row.address, row.line, row.end_sequence))
        .collect();
    assert_eq!(rows, vec![(0x1000, 1, false), (0x1004, 1, true)]);

    let again = info.line_program_for_unit(unit)?.ok_or("no line program")?;
    assert!(std::ptr::eq(program, again));

    let empty = info.unit_at(31)?;
    assert!(info.line_program_for_unit(empty)?.is_none());
    Ok(())
}

#[test]
fn test_line_sequences() -> Result<(), Error> {
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    );

    let fixture = fixture();
    let info = dwarf_info(&fixture);

    let unit = info.unit_at(0)?;
    let program = info.line_program_for_unit(unit)?.ok_or("no line program")?;

    insta::assert_debug_snapshot!(program.sequences()?, @r###"
    [
        LineSequence {
            start: 4096,
            end: 4100,
            rows: [
                SequenceRow {
                    address: 4096,
                    file: 1,
                    line: 1,
                    size: Some(
                        4,
                    ),
                },
            ],
        },
    ]
    "###);
    Ok(())
}
