use dwarfkit_dwarf::gimli::constants::{self, DwAt, DwForm, DwTag};
use dwarfkit_dwarf::gimli::Format;
use dwarfkit_dwarf::{
    AttributeValue, DieRef, DwarfConfig, DwarfError, DwarfInfo, DwarfSection, DwarfSections, Form,
};
use dwarfkit_testutils::SectionWriter;
use similar_asserts::assert_eq;

type Error = Box<dyn std::error::Error>;

fn abbrev(w: &mut SectionWriter, code: u64, tag: DwTag, children: bool, attrs: &[(DwAt, DwForm)]) {
    w.uleb(code).uleb(tag.0.into()).u8(children.into());
    for &(name, form) in attrs {
        w.uleb(name.0.into()).uleb(form.0.into());
    }
    w.uleb(0).uleb(0);
}

fn sections<'d>(info: &'d [u8], abbrev: &'d [u8], strings: &'d [u8]) -> DwarfSections<'d> {
    DwarfSections {
        info: Some(DwarfSection::new(info)),
        abbrev: Some(DwarfSection::new(abbrev)),
        str: Some(DwarfSection::new(strings)),
        ..Default::default()
    }
}

/// Writes a DWARF 4 unit header with 8-byte addresses and the abbreviations at offset 0.
fn begin_v4_unit(w: &mut SectionWriter) -> dwarfkit_testutils::UnitMarker {
    let unit = w.begin_unit(false);
    w.u16(4).u32(0).u8(8);
    unit
}

fn tag_and_name(die: &DieRef<'_, '_>) -> (Option<DwTag>, Option<String>) {
    let name = die
        .attr_value(constants::DW_AT_name)
        .and_then(|value| value.as_str())
        .map(|name| name.into_owned());
    (die.tag(), name)
}

#[test]
fn test_subprogram_with_strp_name() -> Result<(), Error> {
    let mut abbrevs = SectionWriter::little();
    abbrev(
        &mut abbrevs,
        1,
        constants::DW_TAG_subprogram,
        true,
        &[(constants::DW_AT_name, constants::DW_FORM_strp)],
    );
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    let mut w = SectionWriter::little();
    let unit = w.begin_unit(false);
    w.u16(4).u32(0).u8(4);
    w.u8(0x01).u32(5).u8(0x00);
    w.end_unit(unit);
    let data = w.finish();

    let strings = b"init\0main\0";
    let config = DwarfConfig::new(true, "x86", 4);
    let info = DwarfInfo::new(config, sections(&data, &abbrevs, strings));

    let units = info.units().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(units.len(), 1);

    let unit = units[0];
    assert_eq!(unit.ctx().format, Format::Dwarf32);
    assert_eq!(unit.ctx().address_size, 4);
    assert_eq!(unit.size(), 17);

    let root = unit.root()?;
    assert_eq!(root.tag(), Some(constants::DW_TAG_subprogram));
    assert_eq!(root.attributes().len(), 1);

    let name = root.attr(constants::DW_AT_name).ok_or("no name")?;
    assert_eq!(name.form, Form::Strp);
    assert_eq!(name.value, AttributeValue::String(b"main"));
    assert_eq!(name.raw.as_u64(), Some(5));
    assert_eq!(name.offset, 12);

    assert_eq!(root.children().count(), 0);
    let terminator = root.terminator()?.ok_or("no terminator")?;
    assert!(terminator.is_null());
    assert_eq!(terminator.offset(), 16);

    let tree: Vec<_> = unit
        .dies()
        .map(|die| die.map(|die| (die.offset(), die.is_null())))
        .collect::<Result<_, _>>()?;
    assert_eq!(tree, vec![(11, false), (16, true)]);
    Ok(())
}

/// Writes a small tree, optionally with `DW_AT_sibling` on subprograms:
///
/// ```text
/// compile_unit "cu"
///   subprogram "a"
///     variable "x"
///     variable "y"
///   subprogram "b"
///   base_type "i"
/// ```
fn write_tree(with_siblings: bool) -> (Vec<u8>, Vec<u8>) {
    let subprogram_attrs: &[(DwAt, DwForm)] = if with_siblings {
        &[
            (constants::DW_AT_sibling, constants::DW_FORM_ref4),
            (constants::DW_AT_name, constants::DW_FORM_string),
        ]
    } else {
        &[(constants::DW_AT_name, constants::DW_FORM_string)]
    };
    let name = &[(constants::DW_AT_name, constants::DW_FORM_string)];

    let mut abbrevs = SectionWriter::little();
    abbrev(&mut abbrevs, 1, constants::DW_TAG_compile_unit, true, name);
    abbrev(&mut abbrevs, 2, constants::DW_TAG_subprogram, true, subprogram_attrs);
    abbrev(&mut abbrevs, 3, constants::DW_TAG_variable, false, name);
    abbrev(&mut abbrevs, 4, constants::DW_TAG_base_type, false, name);
    abbrevs.u8(0);

    let mut patches = Vec::new();
    let mut subprogram = |w: &mut SectionWriter, name: &str| {
        w.u8(2);
        if with_siblings {
            patches.push(w.position());
            w.u32(0);
        }
        w.cstr(name);
    };

    let mut w = SectionWriter::little();
    let unit = begin_v4_unit(&mut w);
    w.u8(1).cstr("cu");
    subprogram(&mut w, "a");
    w.u8(3).cstr("x");
    w.u8(3).cstr("y");
    w.u8(0);
    let b = w.position();
    subprogram(&mut w, "b");
    w.u8(0);
    let i = w.position();
    w.u8(4).cstr("i");
    w.u8(0);
    w.end_unit(unit);

    let mut data = w.finish();
    for (patch, target) in patches.into_iter().zip([b, i]) {
        data[patch..patch + 4].copy_from_slice(&(target as u32).to_le_bytes());
    }

    (data, abbrevs.finish())
}

#[test]
fn test_sibling_and_scan_agree() -> Result<(), Error> {
    let mut trees = Vec::new();

    for with_siblings in [true, false] {
        let (data, abbrevs) = write_tree(with_siblings);
        let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));
        let unit = info.unit_at(0)?;
        let root = unit.root()?;

        let children = root
            .children()
            .map(|child| child.map(|child| tag_and_name(&child)))
            .collect::<Result<Vec<_>, _>>()?;

        let tree = unit
            .dies()
            .map(|die| die.map(|die| tag_and_name(&die)))
            .collect::<Result<Vec<_>, _>>()?;

        trees.push((children, tree));
    }

    assert_eq!(trees[0], trees[1]);

    let (children, tree) = &trees[0];
    assert_eq!(
        children,
        &vec![
            (Some(constants::DW_TAG_subprogram), Some("a".into())),
            (Some(constants::DW_TAG_subprogram), Some("b".into())),
            (Some(constants::DW_TAG_base_type), Some("i".into())),
        ]
    );
    let tags: Vec<_> = tree.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(
        tags,
        vec![
            Some(constants::DW_TAG_compile_unit),
            Some(constants::DW_TAG_subprogram),
            Some(constants::DW_TAG_variable),
            Some(constants::DW_TAG_variable),
            None,
            Some(constants::DW_TAG_subprogram),
            None,
            Some(constants::DW_TAG_base_type),
            None,
        ]
    );
    Ok(())
}

#[test]
fn test_sibling_skips_subtree() -> Result<(), Error> {
    let (data, abbrevs) = write_tree(true);
    let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));
    let unit = info.unit_at(0)?;

    let offsets = unit
        .root()?
        .children()
        .map(|child| child.map(|child| child.offset()))
        .collect::<Result<Vec<_>, _>>()?;

    let parsed = unit.parsed_offsets();
    assert_eq!(parsed.len(), 5);
    assert!(offsets.iter().all(|offset| parsed.contains(offset)));

    // The variables of subprogram "a" were never touched.
    let a = unit.die_at(offsets[0])?;
    let x = a.children().next().ok_or("no child")??;
    assert!(!parsed.contains(&x.offset()));
    Ok(())
}

#[test]
fn test_parent_and_siblings() -> Result<(), Error> {
    let (data, abbrevs) = write_tree(false);
    let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));

    // Variable "y": header, "cu", "a", and "x" precede it.
    let y_offset = 11 + 4 + 3 + 3;
    let y = info.die_at(y_offset)?;
    assert_eq!(tag_and_name(&y).1.as_deref(), Some("y"));

    let a = y.parent()?.ok_or("no parent")?;
    assert_eq!(tag_and_name(&a).1.as_deref(), Some("a"));

    let root = a.parent()?.ok_or("no parent")?;
    assert_eq!(root.tag(), Some(constants::DW_TAG_compile_unit));
    assert!(root.parent()?.is_none());

    let siblings = a
        .siblings()?
        .map(|die| die.map(|die| tag_and_name(&die).1))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(siblings, vec![Some("b".into()), Some("i".into())]);

    // Every DIE is among the children of its parent.
    let unit = info.unit_at(0)?;
    for die in unit.dies() {
        let die = die?;
        if die.is_null() {
            continue;
        }
        if let Some(parent) = die.parent()? {
            let mut children = parent.children();
            assert!(children.any(|child| matches!(child, Ok(c) if c.offset() == die.offset())));
        }
    }
    Ok(())
}

#[test]
fn test_nested_indirect_forms() -> Result<(), Error> {
    let mut abbrevs = SectionWriter::little();
    abbrev(
        &mut abbrevs,
        1,
        constants::DW_TAG_compile_unit,
        false,
        &[
            (constants::DW_AT_name, constants::DW_FORM_indirect),
            (constants::DW_AT_byte_size, constants::DW_FORM_indirect),
        ],
    );
    abbrev(
        &mut abbrevs,
        2,
        constants::DW_TAG_compile_unit,
        false,
        &[(constants::DW_AT_name, constants::DW_FORM_indirect)],
    );
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    let mut w = SectionWriter::little();
    let unit = begin_v4_unit(&mut w);
    w.u8(1);
    w.uleb(0x16).uleb(0x16).uleb(0x08).cstr("deep");
    w.uleb(0x0b).u8(7);
    w.end_unit(unit);

    let second = w.position() as u64;
    let unit = begin_v4_unit(&mut w);
    w.u8(2);
    let bad_code = w.position() as u64;
    w.uleb(0x16).uleb(0x7f).u8(0);
    w.end_unit(unit);
    let data = w.finish();

    let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));
    let root = info.unit_at(0)?.root()?;

    let name = root.attr(constants::DW_AT_name).ok_or("no name")?;
    assert_eq!(name.form, Form::String);
    assert_eq!(name.indirection_depth, 2);
    assert_eq!(name.value, AttributeValue::String(b"deep"));

    let size = root.attr(constants::DW_AT_byte_size).ok_or("no size")?;
    assert_eq!(size.form, Form::Data1);
    assert_eq!(size.indirection_depth, 1);
    assert_eq!(size.value.as_u64(), Some(7));

    let err = info.unit_at(second).unwrap_err();
    assert_eq!(
        err,
        DwarfError::UnknownForm {
            offset: bad_code + 1,
            form: 0x7f,
        }
    );
    Ok(())
}

#[test]
fn test_unknown_form_fails_on_read() -> Result<(), Error> {
    let mut abbrevs = SectionWriter::little();
    abbrev(&mut abbrevs, 1, constants::DW_TAG_compile_unit, false, &[]);
    abbrev(
        &mut abbrevs,
        2,
        constants::DW_TAG_compile_unit,
        false,
        &[(constants::DW_AT_name, DwForm(0x7f))],
    );
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    let mut w = SectionWriter::little();
    let unit = begin_v4_unit(&mut w);
    w.u8(1);
    w.end_unit(unit);

    let second = w.position() as u64;
    let unit = begin_v4_unit(&mut w);
    w.u8(2);
    let attr_offset = w.position() as u64;
    w.u8(0);
    w.end_unit(unit);
    let data = w.finish();

    let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));

    // The unit not using the unknown form still decodes.
    let root = info.unit_at(0)?.root()?;
    assert_eq!(root.tag(), Some(constants::DW_TAG_compile_unit));

    let err = info.unit_at(second).unwrap_err();
    assert_eq!(
        err,
        DwarfError::UnknownForm {
            offset: attr_offset,
            form: 0x7f,
        }
    );
    Ok(())
}

#[test]
fn test_root_indexes_resolved_after_bases() -> Result<(), Error> {
    let mut abbrevs = SectionWriter::little();
    abbrev(
        &mut abbrevs,
        1,
        constants::DW_TAG_compile_unit,
        false,
        &[
            (constants::DW_AT_name, constants::DW_FORM_strx1),
            (constants::DW_AT_low_pc, constants::DW_FORM_addrx),
            (constants::DW_AT_str_offsets_base, constants::DW_FORM_sec_offset),
            (constants::DW_AT_addr_base, constants::DW_FORM_sec_offset),
        ],
    );
    abbrev(
        &mut abbrevs,
        2,
        constants::DW_TAG_compile_unit,
        false,
        &[(constants::DW_AT_name, constants::DW_FORM_strx1)],
    );
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    let mut w = SectionWriter::little();
    let unit = w.begin_unit(false);
    w.u16(5).u8(constants::DW_UT_compile.0).u8(8).u32(0);
    w.u8(1).u8(1).uleb(1).u32(8).u32(8);
    w.end_unit(unit);

    let second = w.position() as u64;
    let unit = w.begin_unit(false);
    w.u16(5).u8(constants::DW_UT_compile.0).u8(8).u32(0);
    w.u8(2).u8(0);
    w.end_unit(unit);
    let data = w.finish();

    let mut str_offsets = SectionWriter::little();
    let table = str_offsets.begin_unit(false);
    str_offsets.u16(5).u16(0).u32(0).u32(1);
    str_offsets.end_unit(table);
    let str_offsets = str_offsets.finish();

    let mut addr = SectionWriter::little();
    let table = addr.begin_unit(false);
    addr.u16(5).u8(8).u8(0).u64(0x1000).u64(0x2000);
    addr.end_unit(table);
    let addr = addr.finish();

    let strings = b"\0unit.c\0";
    let sections = DwarfSections {
        str_offsets: Some(DwarfSection::new(&str_offsets)),
        addr: Some(DwarfSection::new(&addr)),
        ..sections(&data, &abbrevs, strings)
    };
    let info = DwarfInfo::new(DwarfConfig::default(), sections);

    let unit = info.unit_at(0)?;
    assert_eq!(unit.bases().str_offsets_base, Some(8));
    assert_eq!(unit.bases().addr_base, Some(8));

    let root = unit.root()?;
    assert_eq!(
        root.attr_value(constants::DW_AT_name),
        Some(AttributeValue::String(b"unit.c"))
    );
    assert_eq!(
        root.attr_value(constants::DW_AT_low_pc),
        Some(AttributeValue::Address(0x2000))
    );
    assert_eq!(root.full_path(), std::path::PathBuf::from("unit.c"));

    assert_eq!(info.get_addr(&unit, 0)?, 0x1000);
    assert_eq!(info.string_at_index(&unit, 1)?, &b"unit.c"[..]);

    let err = info.unit_at(second).unwrap_err();
    assert!(matches!(
        err,
        DwarfError::MissingBase {
            unit_offset,
            attribute: "DW_AT_str_offsets_base",
        } if unit_offset == second
    ));
    Ok(())
}

#[test]
fn test_address_index_overflow() -> Result<(), Error> {
    let mut abbrevs = SectionWriter::little();
    abbrev(
        &mut abbrevs,
        1,
        constants::DW_TAG_compile_unit,
        false,
        &[
            (constants::DW_AT_low_pc, constants::DW_FORM_addrx),
            (constants::DW_AT_addr_base, constants::DW_FORM_sec_offset),
        ],
    );
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    let mut w = SectionWriter::little();
    let unit = w.begin_unit(false);
    w.u16(5).u8(constants::DW_UT_compile.0).u8(8).u32(0);
    w.u8(1).uleb(u64::MAX).u32(8);
    w.end_unit(unit);
    let data = w.finish();

    let mut addr = SectionWriter::little();
    let table = addr.begin_unit(false);
    addr.u16(5).u8(8).u8(0).u64(0x1000);
    addr.end_unit(table);
    let addr = addr.finish();

    let sections = DwarfSections {
        addr: Some(DwarfSection::new(&addr)),
        ..sections(&data, &abbrevs, &[])
    };
    let info = DwarfInfo::new(DwarfConfig::default(), sections);

    let err = info.units().find_map(Result::err).ok_or("no error")?;
    assert_eq!(
        err,
        DwarfError::DanglingReference {
            offset: 8,
            target: u64::MAX,
        }
    );
    Ok(())
}

#[test]
fn test_sibling_must_advance() -> Result<(), Error> {
    let mut abbrevs = SectionWriter::little();
    abbrev(&mut abbrevs, 1, constants::DW_TAG_compile_unit, true, &[]);
    abbrev(
        &mut abbrevs,
        2,
        constants::DW_TAG_subprogram,
        true,
        &[(constants::DW_AT_sibling, constants::DW_FORM_ref4)],
    );
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    // The subprogram at 12 names itself as its sibling.
    let mut w = SectionWriter::little();
    let unit = begin_v4_unit(&mut w);
    w.u8(1);
    w.u8(2).u32(12);
    w.u8(0).u8(0);
    w.end_unit(unit);
    let data = w.finish();

    let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));
    let root = info.unit_at(0)?.root()?;
    assert_eq!(root.offset(), 11);

    let children: Vec<_> = root.children().take(5).collect();
    assert_eq!(children.len(), 2);
    assert!(matches!(&children[0], Ok(child) if child.offset() == 12));
    assert!(matches!(
        &children[1],
        Err(DwarfError::MalformedRecord { offset: 13, .. })
    ));
    Ok(())
}

#[test]
fn test_references() -> Result<(), Error> {
    let mut abbrevs = SectionWriter::little();
    abbrev(&mut abbrevs, 1, constants::DW_TAG_compile_unit, true, &[]);
    abbrev(
        &mut abbrevs,
        2,
        constants::DW_TAG_variable,
        false,
        &[
            (constants::DW_AT_type, constants::DW_FORM_ref4),
            (constants::DW_AT_specification, constants::DW_FORM_ref_addr),
            (constants::DW_AT_signature, constants::DW_FORM_ref_sig8),
            (constants::DW_AT_name, constants::DW_FORM_string),
        ],
    );
    abbrev(&mut abbrevs, 3, constants::DW_TAG_base_type, false, &[]);
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    let mut w = SectionWriter::little();
    let first = begin_v4_unit(&mut w);
    w.u8(1);
    let variable = w.position() as u64;
    w.u8(2).u32(0x1f).u32(0x1000).u64(0xfeed).cstr("v");
    let base_type = w.position() as u64;
    w.u8(3).u8(0);
    w.end_unit(first);

    let second = w.position() as u64;
    let unit = begin_v4_unit(&mut w);
    w.u8(1).u8(0);
    w.end_unit(unit);
    let data = w.finish();

    assert_eq!(base_type, 0x1f);

    let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));
    let die = info.die_at(variable)?;

    let ty = die.resolve_reference(constants::DW_AT_type)?.ok_or("no type")?;
    assert_eq!(ty.offset(), base_type);
    assert_eq!(ty.tag(), Some(constants::DW_TAG_base_type));

    let err = die.resolve_reference(constants::DW_AT_specification).unwrap_err();
    assert!(matches!(err, DwarfError::DanglingReference { target: 0x1000, .. }));

    let err = die.resolve_reference(constants::DW_AT_signature).unwrap_err();
    assert!(matches!(err, DwarfError::UnsupportedForm { form, .. } if form == constants::DW_FORM_ref_sig8));

    let err = die.resolve_reference(constants::DW_AT_name).unwrap_err();
    assert!(matches!(err, DwarfError::MalformedRecord { .. }));

    assert!(die.resolve_reference(constants::DW_AT_import)?.is_none());

    let unit = info.unit_containing(second + 12)?;
    assert_eq!(unit.offset(), second);
    assert!(info.unit_containing(data.len() as u64 + 4).is_err());
    Ok(())
}

#[test]
fn test_abbreviation_not_found() {
    let mut abbrevs = SectionWriter::little();
    abbrev(&mut abbrevs, 1, constants::DW_TAG_compile_unit, false, &[]);
    abbrevs.u8(0);
    let abbrevs = abbrevs.finish();

    let mut w = SectionWriter::little();
    let unit = begin_v4_unit(&mut w);
    w.u8(9);
    w.end_unit(unit);
    let data = w.finish();

    let info = DwarfInfo::new(DwarfConfig::default(), sections(&data, &abbrevs, &[]));
    let err = info.unit_at(0).unwrap_err();
    assert_eq!(err, DwarfError::AbbreviationNotFound { offset: 11, code: 9 });
}
