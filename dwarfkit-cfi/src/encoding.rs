//! Pointer encodings of `.eh_frame` augmentations.

use dwarfkit_dwarf::gimli::constants::{self, DwEhPe};
use dwarfkit_dwarf::Reader;

use crate::error::{CfiError, CfiErrorKind, Result};

/// Parameters needed to decode encoded pointers in one section.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PointerContext {
    /// Virtual address of the section, the base of `DW_EH_PE_pcrel` pointers.
    pub section_address: u64,
    /// Size of `DW_EH_PE_absptr` pointers.
    pub address_size: u8,
}

impl PointerContext {
    /// Reads a pointer with the given encoding.
    ///
    /// Returns `None` for `DW_EH_PE_omit`. The `DW_EH_PE_indirect` flag is accepted but not
    /// followed, since the pointed-to memory is not part of the section.
    pub fn read(&self, reader: &mut Reader<'_>, encoding: DwEhPe) -> Result<Option<u64>> {
        if encoding == constants::DW_EH_PE_omit {
            return Ok(None);
        }

        let field_offset = reader.position();
        let value = self.read_value(reader, encoding)?;

        match encoding.application() {
            constants::DW_EH_PE_absptr => Ok(Some(value)),
            constants::DW_EH_PE_pcrel => Ok(Some(
                value.wrapping_add(self.section_address.wrapping_add(field_offset)),
            )),
            _ => Err(unsupported(field_offset, encoding)),
        }
    }

    /// Reads a value with the basic format of `encoding`, ignoring how it is applied.
    pub fn read_value(&self, reader: &mut Reader<'_>, encoding: DwEhPe) -> Result<u64> {
        let field_offset = reader.position();
        let value = match encoding.format() {
            constants::DW_EH_PE_absptr => reader.address(self.address_size)?,
            constants::DW_EH_PE_uleb128 => reader.uleb128()?,
            constants::DW_EH_PE_udata2 => reader.u16()?.into(),
            constants::DW_EH_PE_udata4 => reader.u32()?.into(),
            constants::DW_EH_PE_udata8 => reader.u64()?,
            constants::DW_EH_PE_sleb128 => reader.sleb128()? as u64,
            constants::DW_EH_PE_sdata2 => i64::from(reader.i16()?) as u64,
            constants::DW_EH_PE_sdata4 => i64::from(reader.i32()?) as u64,
            constants::DW_EH_PE_sdata8 => reader.i64()? as u64,
            _ => return Err(unsupported(field_offset, encoding)),
        };

        Ok(value)
    }
}

fn unsupported(offset: u64, encoding: DwEhPe) -> CfiError {
    CfiError::new(
        CfiErrorKind::UnsupportedEncoding,
        offset,
        format!("pointer encoding {:#04x}", encoding.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use dwarfkit_dwarf::Endian;
    use dwarfkit_testutils::SectionWriter;
    use similar_asserts::assert_eq;

    const CTX: PointerContext = PointerContext {
        section_address: 0x1000,
        address_size: 8,
    };

    #[test]
    fn test_pcrel_is_relative_to_field() -> Result<()> {
        let mut w = SectionWriter::little();
        w.u32(0).i32(-0x20);
        let data = w.finish();

        let mut reader = Reader::at(&data, 4, Endian::Little);
        let encoding = DwEhPe(constants::DW_EH_PE_pcrel.0 | constants::DW_EH_PE_sdata4.0);
        assert_eq!(CTX.read(&mut reader, encoding)?, Some(0x1000 + 4 - 0x20));
        assert!(reader.is_empty());
        Ok(())
    }

    #[test]
    fn test_omit_and_indirect() -> Result<()> {
        let mut w = SectionWriter::little();
        w.uleb(0x1234);
        let data = w.finish();

        let mut reader = Reader::new(&data, Endian::Little);
        assert_eq!(CTX.read(&mut reader, constants::DW_EH_PE_omit)?, None);
        assert_eq!(reader.position(), 0);

        let encoding = DwEhPe(constants::DW_EH_PE_indirect.0 | constants::DW_EH_PE_uleb128.0);
        assert_eq!(CTX.read(&mut reader, encoding)?, Some(0x1234));
        Ok(())
    }

    #[test]
    fn test_unsupported_application() {
        let data = [0u8; 4];
        let mut reader = Reader::new(&data, Endian::Little);
        let encoding = DwEhPe(constants::DW_EH_PE_datarel.0 | constants::DW_EH_PE_udata4.0);

        let error = CTX.read(&mut reader, encoding).unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::UnsupportedEncoding);
        assert_eq!(error.offset(), Some(0));
    }
}
