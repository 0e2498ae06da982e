//! Attribute forms and their raw encodings.

use std::fmt;

use gimli::constants::{self, DwForm};

use crate::context::SchemaContext;
use crate::error::{DwarfError, Result};
use crate::reader::Reader;

/// The encoding of an attribute value inside a DIE.
///
/// Covers every form of DWARF versions 2 through 5 and the GNU extension forms emitted for split
/// DWARF and `dwz` supplementary files. Any other numeric form code is rejected while decoding the
/// abbreviation table, so decoding never needs a catch-all arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Form {
    Addr,
    Block2,
    Block4,
    Data2,
    Data4,
    Data8,
    String,
    Block,
    Block1,
    Data1,
    Flag,
    Sdata,
    Strp,
    Udata,
    RefAddr,
    Ref1,
    Ref2,
    Ref4,
    Ref8,
    RefUdata,
    Indirect,
    SecOffset,
    Exprloc,
    FlagPresent,
    Strx,
    Addrx,
    RefSup4,
    StrpSup,
    Data16,
    LineStrp,
    RefSig8,
    ImplicitConst,
    Loclistx,
    Rnglistx,
    RefSup8,
    Strx1,
    Strx2,
    Strx3,
    Strx4,
    Addrx1,
    Addrx2,
    Addrx3,
    Addrx4,
    GnuAddrIndex,
    GnuStrIndex,
    GnuRefAlt,
    GnuStrpAlt,
}

/// Every form paired with its numeric code.
const FORMS: &[(DwForm, Form)] = &[
    (constants::DW_FORM_addr, Form::Addr),
    (constants::DW_FORM_block2, Form::Block2),
    (constants::DW_FORM_block4, Form::Block4),
    (constants::DW_FORM_data2, Form::Data2),
    (constants::DW_FORM_data4, Form::Data4),
    (constants::DW_FORM_data8, Form::Data8),
    (constants::DW_FORM_string, Form::String),
    (constants::DW_FORM_block, Form::Block),
    (constants::DW_FORM_block1, Form::Block1),
    (constants::DW_FORM_data1, Form::Data1),
    (constants::DW_FORM_flag, Form::Flag),
    (constants::DW_FORM_sdata, Form::Sdata),
    (constants::DW_FORM_strp, Form::Strp),
    (constants::DW_FORM_udata, Form::Udata),
    (constants::DW_FORM_ref_addr, Form::RefAddr),
    (constants::DW_FORM_ref1, Form::Ref1),
    (constants::DW_FORM_ref2, Form::Ref2),
    (constants::DW_FORM_ref4, Form::Ref4),
    (constants::DW_FORM_ref8, Form::Ref8),
    (constants::DW_FORM_ref_udata, Form::RefUdata),
    (constants::DW_FORM_indirect, Form::Indirect),
    (constants::DW_FORM_sec_offset, Form::SecOffset),
    (constants::DW_FORM_exprloc, Form::Exprloc),
    (constants::DW_FORM_flag_present, Form::FlagPresent),
    (constants::DW_FORM_strx, Form::Strx),
    (constants::DW_FORM_addrx, Form::Addrx),
    (constants::DW_FORM_ref_sup4, Form::RefSup4),
    (constants::DW_FORM_strp_sup, Form::StrpSup),
    (constants::DW_FORM_data16, Form::Data16),
    (constants::DW_FORM_line_strp, Form::LineStrp),
    (constants::DW_FORM_ref_sig8, Form::RefSig8),
    (constants::DW_FORM_implicit_const, Form::ImplicitConst),
    (constants::DW_FORM_loclistx, Form::Loclistx),
    (constants::DW_FORM_rnglistx, Form::Rnglistx),
    (constants::DW_FORM_ref_sup8, Form::RefSup8),
    (constants::DW_FORM_strx1, Form::Strx1),
    (constants::DW_FORM_strx2, Form::Strx2),
    (constants::DW_FORM_strx3, Form::Strx3),
    (constants::DW_FORM_strx4, Form::Strx4),
    (constants::DW_FORM_addrx1, Form::Addrx1),
    (constants::DW_FORM_addrx2, Form::Addrx2),
    (constants::DW_FORM_addrx3, Form::Addrx3),
    (constants::DW_FORM_addrx4, Form::Addrx4),
    (constants::DW_FORM_GNU_addr_index, Form::GnuAddrIndex),
    (constants::DW_FORM_GNU_str_index, Form::GnuStrIndex),
    (constants::DW_FORM_GNU_ref_alt, Form::GnuRefAlt),
    (constants::DW_FORM_GNU_strp_alt, Form::GnuStrpAlt),
];

/// An attribute value as stored in `.debug_info`, before any translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawValue<'d> {
    /// Addresses, offsets, indexes, flags, and unsigned constants.
    Unsigned(u64),
    /// `DW_FORM_sdata` and `DW_FORM_implicit_const`.
    Signed(i64),
    /// Blocks, expressions, and 16-byte constants.
    Block(&'d [u8]),
    /// Inline `DW_FORM_string`, without the terminator.
    String(&'d [u8]),
}

impl RawValue<'_> {
    /// Returns the value as an unsigned integer, reinterpreting signed values.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            RawValue::Unsigned(value) => Some(value),
            RawValue::Signed(value) => Some(value as u64),
            _ => None,
        }
    }
}

impl Form {
    /// Looks up a form by its numeric code.
    pub fn from_code(code: u64) -> Option<Form> {
        let code = u16::try_from(code).ok()?;
        FORMS
            .iter()
            .find(|(dw, _)| dw.0 == code)
            .map(|&(_, form)| form)
    }

    /// The `gimli` constant for this form.
    pub fn dw(self) -> DwForm {
        FORMS
            .iter()
            .find(|&&(_, form)| form == self)
            .map(|&(dw, _)| dw)
            .unwrap_or(DwForm(0))
    }

    /// The name of this form, such as `DW_FORM_strp`.
    pub fn name(self) -> &'static str {
        self.dw().static_string().unwrap_or("DW_FORM_unknown")
    }

    /// Whether values of this form refer to another DIE.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Form::RefAddr
                | Form::Ref1
                | Form::Ref2
                | Form::Ref4
                | Form::Ref8
                | Form::RefUdata
                | Form::RefSig8
                | Form::RefSup4
                | Form::RefSup8
                | Form::GnuRefAlt
        )
    }

    /// Whether values of this form are indexes into a table located by a `DW_AT_*_base`
    /// attribute of the unit's root DIE.
    pub fn is_indexed(self) -> bool {
        matches!(
            self,
            Form::Strx
                | Form::Strx1
                | Form::Strx2
                | Form::Strx3
                | Form::Strx4
                | Form::Addrx
                | Form::Addrx1
                | Form::Addrx2
                | Form::Addrx3
                | Form::Addrx4
                | Form::Loclistx
                | Form::Rnglistx
                | Form::GnuAddrIndex
                | Form::GnuStrIndex
        )
    }

    /// Whether this is one of the length-prefixed block forms. `DW_FORM_exprloc` is not.
    pub fn is_block(self) -> bool {
        matches!(self, Form::Block | Form::Block1 | Form::Block2 | Form::Block4)
    }

    /// Whether this is a fixed-size `DW_FORM_data*` form of up to eight bytes.
    pub fn is_fixed_data(self) -> bool {
        matches!(self, Form::Data1 | Form::Data2 | Form::Data4 | Form::Data8)
    }

    /// Whether values of this form are constants.
    pub fn is_constant(self) -> bool {
        self.is_fixed_data()
            || matches!(
                self,
                Form::Data16 | Form::Sdata | Form::Udata | Form::ImplicitConst
            )
    }

    /// Whether values of this form are flags.
    pub fn is_flag(self) -> bool {
        matches!(self, Form::Flag | Form::FlagPresent)
    }

    /// Reads a raw value of this form.
    ///
    /// `DW_FORM_indirect` and `DW_FORM_implicit_const` do not have a self-contained encoding and
    /// must be resolved by the caller.
    pub fn read<'d>(self, reader: &mut Reader<'d>, ctx: SchemaContext) -> Result<RawValue<'d>> {
        use RawValue::*;

        let value = match self {
            Form::Addr => Unsigned(reader.address(ctx.address_size)?),
            Form::RefAddr if ctx.version <= 2 => Unsigned(reader.address(ctx.address_size)?),
            Form::RefAddr
            | Form::Strp
            | Form::LineStrp
            | Form::StrpSup
            | Form::SecOffset
            | Form::GnuRefAlt
            | Form::GnuStrpAlt => Unsigned(reader.offset(ctx.format)?),

            Form::Data1 | Form::Ref1 | Form::Flag | Form::Strx1 | Form::Addrx1 => {
                Unsigned(reader.u8()?.into())
            }
            Form::Data2 | Form::Ref2 | Form::Strx2 | Form::Addrx2 => {
                Unsigned(reader.u16()?.into())
            }
            Form::Strx3 | Form::Addrx3 => Unsigned(reader.u24()?.into()),
            Form::Data4 | Form::Ref4 | Form::RefSup4 | Form::Strx4 | Form::Addrx4 => {
                Unsigned(reader.u32()?.into())
            }
            Form::Data8 | Form::Ref8 | Form::RefSig8 | Form::RefSup8 => Unsigned(reader.u64()?),

            Form::Udata
            | Form::RefUdata
            | Form::Strx
            | Form::Addrx
            | Form::Loclistx
            | Form::Rnglistx
            | Form::GnuAddrIndex
            | Form::GnuStrIndex => Unsigned(reader.uleb128()?),
            Form::Sdata => Signed(reader.sleb128()?),
            Form::FlagPresent => Unsigned(1),

            Form::Data16 => Block(reader.bytes(16)?),
            Form::Block1 => {
                let len = reader.u8()?;
                Block(reader.bytes(len.into())?)
            }
            Form::Block2 => {
                let len = reader.u16()?;
                Block(reader.bytes(len.into())?)
            }
            Form::Block4 => {
                let len = reader.u32()?;
                Block(reader.bytes(len.into())?)
            }
            Form::Block | Form::Exprloc => {
                let len = reader.uleb128()?;
                Block(reader.bytes(len)?)
            }
            Form::String => String(reader.cstr()?),

            Form::Indirect | Form::ImplicitConst => {
                return Err(DwarfError::malformed(
                    reader.position(),
                    format!("{self} has no inline encoding"),
                ))
            }
        };

        Ok(value)
    }
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
