use std::rc::Rc;

use dwarfkit_cfi::{
    CallFrameInfo, CallFrameOperation, CfaRule, CfiEntry, CfiErrorKind, CfiRow, Mode,
    RegisterRule,
};
use dwarfkit_dwarf::gimli::constants::{self, DwEhPe};
use dwarfkit_dwarf::{DwarfConfig, DwarfSection, DwarfSections};
use dwarfkit_testutils::SectionWriter;
use similar_asserts::assert_eq;

type Error = Box<dyn std::error::Error>;

const EH_FRAME_ADDRESS: u64 = 0x10000;

/// A `.debug_frame` section with one CIE producing two rows and one FDE at `0x1000`.
///
/// Returns the section and the offset of the FDE.
fn debug_frame_fixture() -> (Vec<u8>, u64) {
    let mut w = SectionWriter::little();

    let cie = w.begin_unit(false);
    w.u32(0xffff_ffff).u8(3).cstr("");
    w.uleb(1).sleb(-8).uleb(16);
    w.bytes(&[0x0c, 0x07, 0x08]); // def_cfa rsp 8
    w.bytes(&[0x90, 0x01]); // offset r16 1
    w.bytes(&[0x41]); // advance_loc 1
    w.bytes(&[0x86, 0x02]); // offset rbp 2
    w.end_unit(cie);

    let fde_offset = w.position() as u64;
    let fde = w.begin_unit(false);
    w.u32(0).u64(0x1000).u64(0x20);
    w.bytes(&[0x44]); // advance_loc 4
    w.bytes(&[0x0e, 0x10]); // def_cfa_offset 16
    w.end_unit(fde);

    (w.finish(), fde_offset)
}

#[test]
fn test_fde_inherits_last_cie_row() -> Result<(), Error> {
    let (data, fde_offset) = debug_frame_fixture();
    let cfi = CallFrameInfo::new(
        DwarfSection::new(&data),
        DwarfConfig::default(),
        Mode::DebugFrame,
    );

    let entries = cfi.entries().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(entries.len(), 2);

    let cie = entries[0].as_cie().ok_or("expected a CIE")?;
    assert_eq!(cie.version, 3);
    assert_eq!(cie.augmentation, &b""[..]);
    assert_eq!(cie.code_alignment_factor, 1);
    assert_eq!(cie.data_alignment_factor, -8);
    assert_eq!(cie.return_address_register, 16);
    assert_eq!(cie.address_size, 8);

    let cie_table = cie.table()?;
    assert_eq!(cie_table.rows.len(), 2);
    assert_eq!(cie_table.reg_order, vec![16, 6]);

    let fde = entries[1].as_fde().ok_or("expected an FDE")?;
    assert_eq!(fde.offset, fde_offset);
    assert_eq!(fde.cie.offset, 0);
    assert_eq!(fde.initial_location, 0x1000);
    assert_eq!(fde.address_range, 0x20);

    let rsp_8 = CfaRule::RegOffset { reg: Some(7), offset: 8 };
    let rules = [(6, RegisterRule::Offset(-16)), (16, RegisterRule::Offset(-8))];

    let table = fde.table()?;
    assert_eq!(
        table.rows,
        vec![
            CfiRow {
                pc: 0x1000,
                cfa: Some(rsp_8),
                rules: rules.into_iter().collect(),
            },
            CfiRow {
                pc: 0x1004,
                cfa: Some(CfaRule::RegOffset { reg: Some(7), offset: 16 }),
                rules: rules.into_iter().collect(),
            },
        ]
    );
    assert_eq!(table.rows[0].rules, cie_table.rows[1].rules);
    assert_eq!(table.reg_order, vec![16, 6]);
    Ok(())
}

#[test]
fn test_entries_are_memoized() -> Result<(), Error> {
    let (data, fde_offset) = debug_frame_fixture();
    let cfi = CallFrameInfo::new(
        DwarfSection::new(&data),
        DwarfConfig::default(),
        Mode::DebugFrame,
    );

    // Parsing the FDE first caches its CIE as well.
    let fde = cfi.entry_at(fde_offset)?.as_fde().ok_or("expected an FDE")?;
    let cie = cfi.entry_at(0)?;
    match cie {
        CfiEntry::Cie(cie) => assert!(Rc::ptr_eq(cie, &fde.cie)),
        other => panic!("expected a CIE, got {other:?}"),
    }

    assert!(std::ptr::eq(cfi.entry_at(0)?, cie));
    assert!(std::ptr::eq(fde.table()?, fde.table()?));

    assert_eq!(
        cfi.fde_for_address(0x101f)?.map(|fde| fde.offset),
        Some(fde_offset)
    );
    assert!(cfi.fde_for_address(0x1020)?.is_none());
    Ok(())
}

#[test]
fn test_eh_frame_augmentation() -> Result<(), Error> {
    let pcrel_sdata4 = DwEhPe(constants::DW_EH_PE_pcrel.0 | constants::DW_EH_PE_sdata4.0);
    let personality_encoding = DwEhPe(constants::DW_EH_PE_indirect.0 | pcrel_sdata4.0);

    let mut w = SectionWriter::little();

    let cie = w.begin_unit(false);
    w.u32(0).u8(1).cstr("zPLR");
    w.uleb(1).sleb(-8).u8(16);
    w.uleb(7).u8(personality_encoding.0);
    let personality_field = w.position() as u64;
    w.i32(0x100);
    w.u8(pcrel_sdata4.0).u8(pcrel_sdata4.0);
    w.bytes(&[0x0c, 0x07, 0x08]); // def_cfa rsp 8
    w.bytes(&[0x90, 0x01]); // offset r16 1
    w.align(4);
    w.end_unit(cie);

    let fde_offset = w.position() as u64;
    let fde = w.begin_unit(false);
    let pointer_field = w.position() as u64;
    w.u32(pointer_field as u32);
    let location_field = w.position() as i64;
    w.i32((0x1000 - (EH_FRAME_ADDRESS as i64 + location_field)) as i32);
    w.i32(0x40);
    w.uleb(4);
    let lsda_field = w.position() as i64;
    w.i32((0x20000 - (EH_FRAME_ADDRESS as i64 + lsda_field)) as i32);
    w.bytes(&[0x41]); // advance_loc 1
    w.bytes(&[0x0e, 0x10]); // def_cfa_offset 16
    w.align(4);
    w.end_unit(fde);

    let zero_offset = w.position() as u64;
    w.u32(0);
    let data = w.finish();

    let section = DwarfSection::new(&data).with_address(EH_FRAME_ADDRESS);
    let cfi = CallFrameInfo::new(section, DwarfConfig::default(), Mode::EhFrame);

    let entries = cfi.entries().collect::<Result<Vec<_>, _>>()?;
    let offsets: Vec<_> = entries.iter().map(|entry| entry.offset()).collect();
    assert_eq!(offsets, vec![0, fde_offset, zero_offset]);
    assert!(matches!(entries[2], CfiEntry::Zero { .. }));
    assert!(entries[2].table()?.is_none());

    let cie = entries[0].as_cie().ok_or("expected a CIE")?;
    assert_eq!(cie.augmentation, &b"zPLR"[..]);
    assert_eq!(cie.augmentation_length, Some(7));
    assert_eq!(cie.augmentation_data.len(), 7);

    let fields = cie.augmentation_fields;
    assert_eq!(fields.lsda_encoding, Some(pcrel_sdata4));
    assert_eq!(fields.fde_encoding, Some(pcrel_sdata4));
    assert_eq!(
        fields.personality,
        Some((personality_encoding, EH_FRAME_ADDRESS + personality_field + 0x100))
    );
    assert!(!fields.signal_frame);

    let fde = entries[1].as_fde().ok_or("expected an FDE")?;
    assert_eq!(fde.cie_pointer, pointer_field);
    assert_eq!(fde.initial_location, 0x1000);
    assert_eq!(fde.address_range, 0x40);
    assert_eq!(fde.augmentation_data.len(), 4);
    assert_eq!(fde.lsda_pointer, Some(0x20000));

    let table = fde.table()?;
    let pcs: Vec<_> = table.rows.iter().map(|row| row.pc).collect();
    assert_eq!(pcs, vec![0x1000, 0x1001]);
    assert_eq!(
        table.rows[1].cfa,
        Some(CfaRule::RegOffset { reg: Some(7), offset: 16 })
    );
    assert_eq!(table.rows[1].rule(16), Some(&RegisterRule::Offset(-8)));
    Ok(())
}

#[test]
fn test_unknown_augmentation_is_skipped() -> Result<(), Error> {
    let mut w = SectionWriter::little();
    let cie = w.begin_unit(false);
    w.u32(0).u8(1).cstr("zRX");
    w.uleb(1).sleb(-8).u8(16);
    w.uleb(3).u8(constants::DW_EH_PE_udata4.0).bytes(&[0xaa, 0xbb]);
    w.bytes(&[0x0c, 0x07, 0x08]); // def_cfa rsp 8
    w.end_unit(cie);
    let data = w.finish();

    let cfi = CallFrameInfo::new(
        DwarfSection::new(&data),
        DwarfConfig::default(),
        Mode::EhFrame,
    );
    let cie = cfi.entry_at(0)?.as_cie().ok_or("expected a CIE")?;
    assert_eq!(
        cie.augmentation_fields.fde_encoding,
        Some(constants::DW_EH_PE_udata4)
    );
    assert_eq!(cie.augmentation_data, &[0x03, 0xaa, 0xbb][..]);
    assert_eq!(
        cie.instructions[0].operation,
        CallFrameOperation::DefCfa {
            register: 7,
            offset: 8
        }
    );
    Ok(())
}

#[test]
fn test_debug_frame_v4_address_size() -> Result<(), Error> {
    let mut w = SectionWriter::little();

    let cie = w.begin_unit(false);
    w.u32(0xffff_ffff).u8(4).cstr("").u8(4).u8(0);
    w.uleb(4).sleb(-4).uleb(14);
    w.bytes(&[0x0c, 0x0d, 0x00]); // def_cfa sp 0
    w.end_unit(cie);

    let fde = w.begin_unit(false);
    w.u32(0).u32(0x8000).u32(0x10);
    w.bytes(&[0x41]); // advance_loc 1
    w.bytes(&[0x0e, 0x08]); // def_cfa_offset 8
    w.bytes(&[0x8e, 0x01]); // offset lr 1
    w.end_unit(fde);
    let data = w.finish();

    let config = DwarfConfig::new(true, "arm", 8);
    let cfi = CallFrameInfo::new(DwarfSection::new(&data), config, Mode::DebugFrame);

    let entries = cfi.entries().collect::<Result<Vec<_>, _>>()?;
    let fde = entries[1].as_fde().ok_or("expected an FDE")?;
    assert_eq!(fde.cie.address_size, 4);
    assert_eq!(fde.cie.segment_size, 0);
    assert_eq!(fde.initial_location, 0x8000);
    assert_eq!(fde.address_range, 0x10);

    let table = fde.table()?;
    let last = table.rows.last().ok_or("expected rows")?;
    assert_eq!(last.pc, 0x8004);
    assert_eq!(last.cfa, Some(CfaRule::RegOffset { reg: Some(13), offset: 8 }));
    assert_eq!(table.reg_order, vec![14]);

    let arch = cfi.arch()?;
    let rendered: Vec<_> = last
        .rules
        .iter()
        .map(|(&register, rule)| format!("{}={rule:?}", CfiRow::register_name(arch, register)))
        .collect();
    insta::assert_debug_snapshot!(rendered, @r###"
    [
        "lr=Offset(-4)",
    ]
    "###);
    Ok(())
}

#[test]
fn test_cfa_offset_before_register() -> Result<(), Error> {
    let mut w = SectionWriter::little();
    let cie = w.begin_unit(false);
    w.u32(0xffff_ffff).u8(3).cstr("");
    w.uleb(1).sleb(-8).uleb(16);
    w.bytes(&[0x0e, 0x10]); // def_cfa_offset 16
    w.end_unit(cie);
    let data = w.finish();

    let cfi = CallFrameInfo::new(
        DwarfSection::new(&data),
        DwarfConfig::default(),
        Mode::DebugFrame,
    );
    let entry = cfi.entry_at(0)?;
    let cie = entry.as_cie().ok_or("expected a CIE")?;

    let table = cie.table()?;
    assert_eq!(
        table.rows,
        vec![CfiRow {
            pc: 0,
            cfa: Some(CfaRule::RegOffset {
                reg: None,
                offset: 16,
            }),
            rules: Default::default(),
        }]
    );
    Ok(())
}

#[test]
fn test_restore_in_cie_fails() -> Result<(), Error> {
    let mut w = SectionWriter::little();
    let cie = w.begin_unit(false);
    w.u32(0xffff_ffff).u8(1).cstr("");
    w.uleb(1).sleb(-8).u8(16);
    w.bytes(&[0xc6]); // restore rbp
    w.end_unit(cie);
    let data = w.finish();

    let cfi = CallFrameInfo::new(
        DwarfSection::new(&data),
        DwarfConfig::default(),
        Mode::DebugFrame,
    );

    // The entry itself decodes, only its table cannot be built.
    let entry = cfi.entry_at(0)?;
    assert_eq!(entry.instructions().len(), 1);

    let error = entry.table().unwrap_err();
    assert_eq!(error.kind(), CfiErrorKind::RestoreInCie);
    assert_eq!(error.offset(), Some(13));
    Ok(())
}

#[test]
fn test_malformed_entries() {
    let (data, fde_offset) = debug_frame_fixture();

    // An FDE whose CIE pointer names another FDE.
    let mut w = SectionWriter::little();
    w.bytes(&data);
    let bad = w.position() as u64;
    let fde = w.begin_unit(false);
    w.u32(fde_offset as u32).u64(0x2000).u64(0x10);
    w.end_unit(fde);
    let data = w.finish();

    let cfi = CallFrameInfo::new(
        DwarfSection::new(&data),
        DwarfConfig::default(),
        Mode::DebugFrame,
    );
    let error = cfi.entry_at(bad).unwrap_err();
    assert_eq!(error.kind(), CfiErrorKind::MalformedEntry);

    let mut entries = cfi.entries();
    assert!(entries.next().is_some_and(|entry| entry.is_ok()));
    assert!(entries.next().is_some_and(|entry| entry.is_ok()));
    assert!(entries.next().is_some_and(|entry| entry.is_err()));
    assert!(entries.next().is_none());

    let error = CallFrameInfo::from_sections(
        &DwarfSections::default(),
        DwarfConfig::default(),
        Mode::EhFrame,
    )
    .unwrap_err();
    assert_eq!(error.kind(), CfiErrorKind::MissingSection);
}
