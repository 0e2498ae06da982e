//! Decoding of call frame instructions.

use std::borrow::Cow;

use dwarfkit_dwarf::gimli::constants::{self, DwCfa, DwEhPe};
use dwarfkit_dwarf::{ExprOp, ExprParser, Reader, SchemaContext};

use crate::encoding::PointerContext;
use crate::error::{CfiError, CfiErrorKind, Result};

const PRIMARY_MASK: u8 = 0b1100_0000;
const PRIMARY_ARG_MASK: u8 = 0b0011_1111;

/// The operation of a call frame instruction, with its operands.
///
/// Factored offsets are stored as encoded. They are multiplied by the alignment factors of the CIE
/// when the instructions are executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallFrameOperation<'d> {
    /// `DW_CFA_nop`.
    Nop,
    /// `DW_CFA_set_loc`: starts a new row at an absolute address.
    SetLoc {
        /// The new location.
        address: u64,
    },
    /// `DW_CFA_advance_loc` and `DW_CFA_advance_loc1/2/4`: starts a new row further down.
    AdvanceLoc {
        /// The advance in units of the code alignment factor.
        delta: u64,
    },
    /// `DW_CFA_def_cfa`.
    DefCfa {
        /// The CFA register.
        register: u64,
        /// The unfactored offset from the register.
        offset: u64,
    },
    /// `DW_CFA_def_cfa_sf`.
    DefCfaSf {
        /// The CFA register.
        register: u64,
        /// The offset in units of the data alignment factor.
        factored_offset: i64,
    },
    /// `DW_CFA_def_cfa_register`: replaces the register and keeps the offset.
    DefCfaRegister {
        /// The CFA register.
        register: u64,
    },
    /// `DW_CFA_def_cfa_offset`: replaces the offset and keeps the register.
    DefCfaOffset {
        /// The unfactored offset.
        offset: u64,
    },
    /// `DW_CFA_def_cfa_offset_sf`.
    DefCfaOffsetSf {
        /// The offset in units of the data alignment factor.
        factored_offset: i64,
    },
    /// `DW_CFA_def_cfa_expression`.
    DefCfaExpression {
        /// The expression computing the CFA.
        expression: &'d [u8],
    },
    /// `DW_CFA_undefined`.
    Undefined {
        /// The register.
        register: u64,
    },
    /// `DW_CFA_same_value`.
    SameValue {
        /// The register.
        register: u64,
    },
    /// `DW_CFA_offset` and `DW_CFA_offset_extended`.
    Offset {
        /// The register.
        register: u64,
        /// The offset from the CFA in units of the data alignment factor.
        factored_offset: u64,
    },
    /// `DW_CFA_offset_extended_sf`.
    OffsetSf {
        /// The register.
        register: u64,
        /// The offset from the CFA in units of the data alignment factor.
        factored_offset: i64,
    },
    /// `DW_CFA_GNU_negative_offset_extended`: like `Offset`, with the offset negated.
    NegativeOffset {
        /// The register.
        register: u64,
        /// The negated offset in units of the data alignment factor.
        factored_offset: u64,
    },
    /// `DW_CFA_val_offset`.
    ValOffset {
        /// The register.
        register: u64,
        /// The offset from the CFA in units of the data alignment factor.
        factored_offset: u64,
    },
    /// `DW_CFA_val_offset_sf`.
    ValOffsetSf {
        /// The register.
        register: u64,
        /// The offset from the CFA in units of the data alignment factor.
        factored_offset: i64,
    },
    /// `DW_CFA_register`: the value is stored in another register.
    Register {
        /// The register.
        register: u64,
        /// The register holding its value.
        new_register: u64,
    },
    /// `DW_CFA_expression`.
    Expression {
        /// The register.
        register: u64,
        /// The expression computing the address of the saved value.
        expression: &'d [u8],
    },
    /// `DW_CFA_val_expression`.
    ValExpression {
        /// The register.
        register: u64,
        /// The expression computing the value.
        expression: &'d [u8],
    },
    /// `DW_CFA_restore` and `DW_CFA_restore_extended`.
    Restore {
        /// The register.
        register: u64,
    },
    /// `DW_CFA_remember_state`.
    RememberState,
    /// `DW_CFA_restore_state`.
    RestoreState,
    /// `DW_CFA_GNU_args_size`.
    ArgsSize {
        /// Size of the arguments pushed on the stack.
        size: u64,
    },
    /// `DW_CFA_AARCH64_negate_ra_state`, which shares its code with `DW_CFA_GNU_window_save`.
    NegateRaState,
}

/// A decoded call frame instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallFrameInstruction<'d> {
    /// Section offset of the opcode.
    pub offset: u64,
    /// The opcode. For the primary opcodes, the operand bits are cleared.
    pub opcode: DwCfa,
    /// The decoded operation.
    pub operation: CallFrameOperation<'d>,
}

impl<'d> CallFrameInstruction<'d> {
    /// Returns the name of the opcode, such as `DW_CFA_def_cfa`.
    pub fn name(&self) -> Cow<'static, str> {
        match self.opcode.static_string() {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("DW_CFA_{:#x}", self.opcode.0)),
        }
    }

    /// Returns the expression operand of `DW_CFA_def_cfa_expression`, `DW_CFA_expression`, or
    /// `DW_CFA_val_expression`.
    pub fn expression(&self) -> Option<&'d [u8]> {
        match self.operation {
            CallFrameOperation::DefCfaExpression { expression }
            | CallFrameOperation::Expression { expression, .. }
            | CallFrameOperation::ValExpression { expression, .. } => Some(expression),
            _ => None,
        }
    }

    /// Decodes the expression operand of this instruction.
    ///
    /// Returns `None` for instructions without an expression.
    pub fn parsed_expression(&self, ctx: SchemaContext) -> Result<Option<Vec<ExprOp<'d>>>> {
        let Some(expression) = self.expression() else {
            return Ok(None);
        };

        ExprParser::new(ctx)
            .parse(expression)
            .map(Some)
            .map_err(|e| CfiError::new(CfiErrorKind::BadExpression, self.offset, e))
    }
}

/// Decodes instructions until the reader is exhausted.
///
/// `fde_encoding` is the pointer encoding of `DW_CFA_set_loc` operands in `.eh_frame`. In
/// `.debug_frame` it is `None` and the operand is a plain address.
pub(crate) fn parse_instructions<'d>(
    reader: &mut Reader<'d>,
    pointers: PointerContext,
    fde_encoding: Option<DwEhPe>,
) -> Result<Vec<CallFrameInstruction<'d>>> {
    let mut instructions = Vec::new();
    while !reader.is_empty() {
        let offset = reader.position();
        let instruction =
            parse_instruction(reader, pointers, fde_encoding).map_err(|e| match e.kind() {
                // A truncated operand surfaces as a malformed read.
                CfiErrorKind::MalformedEntry => {
                    CfiError::new(CfiErrorKind::BadInstruction, offset, e)
                }
                _ => e,
            })?;
        instructions.push(instruction);
    }
    Ok(instructions)
}

fn parse_instruction<'d>(
    reader: &mut Reader<'d>,
    pointers: PointerContext,
    fde_encoding: Option<DwEhPe>,
) -> Result<CallFrameInstruction<'d>> {
    let offset = reader.position();
    let byte = reader.u8()?;
    let primary = DwCfa(byte & PRIMARY_MASK);
    let low = u64::from(byte & PRIMARY_ARG_MASK);

    let operation = match primary {
        constants::DW_CFA_advance_loc => CallFrameOperation::AdvanceLoc { delta: low },
        constants::DW_CFA_offset => CallFrameOperation::Offset {
            register: low,
            factored_offset: reader.uleb128()?,
        },
        constants::DW_CFA_restore => CallFrameOperation::Restore { register: low },
        _ => parse_extended(reader, DwCfa(byte), pointers, fde_encoding, offset)?,
    };

    let opcode = if primary.0 == 0 { DwCfa(byte) } else { primary };
    Ok(CallFrameInstruction {
        offset,
        opcode,
        operation,
    })
}

fn parse_extended<'d>(
    reader: &mut Reader<'d>,
    opcode: DwCfa,
    pointers: PointerContext,
    fde_encoding: Option<DwEhPe>,
    offset: u64,
) -> Result<CallFrameOperation<'d>> {
    Ok(match opcode {
        constants::DW_CFA_nop => CallFrameOperation::Nop,
        constants::DW_CFA_set_loc => {
            let address = match fde_encoding {
                Some(encoding) => pointers.read(reader, encoding)?.unwrap_or_default(),
                None => reader.address(pointers.address_size)?,
            };
            CallFrameOperation::SetLoc { address }
        }
        constants::DW_CFA_advance_loc1 => CallFrameOperation::AdvanceLoc {
            delta: reader.u8()?.into(),
        },
        constants::DW_CFA_advance_loc2 => CallFrameOperation::AdvanceLoc {
            delta: reader.u16()?.into(),
        },
        constants::DW_CFA_advance_loc4 => CallFrameOperation::AdvanceLoc {
            delta: reader.u32()?.into(),
        },
        constants::DW_CFA_offset_extended => CallFrameOperation::Offset {
            register: reader.uleb128()?,
            factored_offset: reader.uleb128()?,
        },
        constants::DW_CFA_restore_extended => CallFrameOperation::Restore {
            register: reader.uleb128()?,
        },
        constants::DW_CFA_undefined => CallFrameOperation::Undefined {
            register: reader.uleb128()?,
        },
        constants::DW_CFA_same_value => CallFrameOperation::SameValue {
            register: reader.uleb128()?,
        },
        constants::DW_CFA_register => CallFrameOperation::Register {
            register: reader.uleb128()?,
            new_register: reader.uleb128()?,
        },
        constants::DW_CFA_remember_state => CallFrameOperation::RememberState,
        constants::DW_CFA_restore_state => CallFrameOperation::RestoreState,
        constants::DW_CFA_def_cfa => CallFrameOperation::DefCfa {
            register: reader.uleb128()?,
            offset: reader.uleb128()?,
        },
        constants::DW_CFA_def_cfa_register => CallFrameOperation::DefCfaRegister {
            register: reader.uleb128()?,
        },
        constants::DW_CFA_def_cfa_offset => CallFrameOperation::DefCfaOffset {
            offset: reader.uleb128()?,
        },
        constants::DW_CFA_def_cfa_expression => CallFrameOperation::DefCfaExpression {
            expression: block(reader)?,
        },
        constants::DW_CFA_expression => CallFrameOperation::Expression {
            register: reader.uleb128()?,
            expression: block(reader)?,
        },
        constants::DW_CFA_offset_extended_sf => CallFrameOperation::OffsetSf {
            register: reader.uleb128()?,
            factored_offset: reader.sleb128()?,
        },
        constants::DW_CFA_def_cfa_sf => CallFrameOperation::DefCfaSf {
            register: reader.uleb128()?,
            factored_offset: reader.sleb128()?,
        },
        constants::DW_CFA_def_cfa_offset_sf => CallFrameOperation::DefCfaOffsetSf {
            factored_offset: reader.sleb128()?,
        },
        constants::DW_CFA_val_offset => CallFrameOperation::ValOffset {
            register: reader.uleb128()?,
            factored_offset: reader.uleb128()?,
        },
        constants::DW_CFA_val_offset_sf => CallFrameOperation::ValOffsetSf {
            register: reader.uleb128()?,
            factored_offset: reader.sleb128()?,
        },
        constants::DW_CFA_val_expression => CallFrameOperation::ValExpression {
            register: reader.uleb128()?,
            expression: block(reader)?,
        },
        constants::DW_CFA_GNU_window_save => CallFrameOperation::NegateRaState,
        constants::DW_CFA_GNU_args_size => CallFrameOperation::ArgsSize {
            size: reader.uleb128()?,
        },
        constants::DW_CFA_GNU_negative_offset_extended => CallFrameOperation::NegativeOffset {
            register: reader.uleb128()?,
            factored_offset: reader.uleb128()?,
        },
        _ => {
            return Err(CfiError::new(
                CfiErrorKind::BadInstruction,
                offset,
                format!("unknown opcode {:#04x}", opcode.0),
            ))
        }
    })
}

fn block<'d>(reader: &mut Reader<'d>) -> Result<&'d [u8]> {
    let len = reader.uleb128()?;
    Ok(reader.bytes(len)?)
}
