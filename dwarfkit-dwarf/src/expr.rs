//! Decoding of DWARF expressions, the stack machine bytecode used by location descriptions and
//! call frame rules.

use std::borrow::Cow;
use std::fmt;

use gimli::constants::{self, DwOp};

use crate::context::SchemaContext;
use crate::error::{DwarfError, Result};
use crate::reader::Reader;

/// GNU extension marking an uninitialized value. `gimli` does not define it.
const DW_OP_GNU_UNINIT: DwOp = DwOp(0xf0);

/// The operands of an expression operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operands<'d> {
    /// The operation takes no operands.
    None,
    /// A single unsigned constant, register number, index, or offset.
    Unsigned(u64),
    /// A single signed constant or offset.
    Signed(i64),
    /// Two unsigned operands, such as `DW_OP_bit_piece` size and offset.
    UnsignedPair(u64, u64),
    /// An unsigned operand followed by a signed one, such as `DW_OP_bregx` register and offset.
    UnsignedSigned(u64, i64),
    /// A target address.
    Address(u64),
    /// A length-prefixed block, as used by `DW_OP_implicit_value`.
    Block(&'d [u8]),
    /// A typed constant: the unit-relative offset of a base type DIE and the constant's bytes.
    Typed {
        /// Offset of the base type DIE.
        type_offset: u64,
        /// The constant value.
        value: &'d [u8],
    },
    /// The nested expression of `DW_OP_entry_value`.
    Nested(Vec<ExprOp<'d>>),
    /// A WebAssembly location: local, global, or operand stack slot.
    Wasm {
        /// 0 for locals, 1 for globals, 2 for the operand stack, 3 for 32-bit globals.
        kind: u8,
        /// Index of the slot.
        index: u64,
    },
}

/// One decoded operation of an expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExprOp<'d> {
    /// Offset of the opcode from the start of the expression.
    pub offset: u64,
    /// The opcode.
    pub opcode: DwOp,
    /// The decoded operands.
    pub operands: Operands<'d>,
}

impl ExprOp<'_> {
    /// The symbolic name of the opcode, such as `DW_OP_fbreg`.
    pub fn name(&self) -> Cow<'static, str> {
        if self.opcode == DW_OP_GNU_UNINIT {
            return Cow::Borrowed("DW_OP_GNU_uninit");
        }

        match self.opcode.static_string() {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("OP:{:#x}", self.opcode.0)),
        }
    }
}

impl fmt::Display for ExprOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())?;
        match self.operands {
            Operands::None => Ok(()),
            Operands::Unsigned(value) => write!(f, " {value}"),
            Operands::Signed(value) => write!(f, " {value}"),
            Operands::UnsignedPair(a, b) => write!(f, " {a} {b}"),
            Operands::UnsignedSigned(a, b) => write!(f, " {a} {b}"),
            Operands::Address(address) => write!(f, " {address:#x}"),
            Operands::Block(bytes) => write!(f, " {bytes:02x?}"),
            Operands::Typed { type_offset, value } => write!(f, " <{type_offset:#x}> {value:02x?}"),
            Operands::Nested(ref ops) => {
                f.write_str(" (")?;
                for (index, op) in ops.iter().enumerate() {
                    if index > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{op}")?;
                }
                f.write_str(")")
            }
            Operands::Wasm { kind, index } => write!(f, " {kind} {index}"),
        }
    }
}

/// The operand layout of an opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    None,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Uleb,
    Sleb,
    UlebUleb,
    UlebSleb,
    U8Uleb,
    Offset,
    OffsetSleb,
    Address,
    Block,
    Typed,
    Nested,
    Wasm,
}

fn shape(opcode: DwOp) -> Option<Shape> {
    let shape = match opcode {
        constants::DW_OP_addr => Shape::Address,
        constants::DW_OP_const1u | constants::DW_OP_pick => Shape::U8,
        constants::DW_OP_const1s | constants::DW_OP_deref_size | constants::DW_OP_xderef_size => {
            Shape::I8
        }
        constants::DW_OP_const2u | constants::DW_OP_call2 => Shape::U16,
        constants::DW_OP_const2s | constants::DW_OP_bra | constants::DW_OP_skip => Shape::I16,
        constants::DW_OP_const4u | constants::DW_OP_call4 => Shape::U32,
        constants::DW_OP_const4s => Shape::I32,
        constants::DW_OP_const8u => Shape::U64,
        constants::DW_OP_const8s => Shape::I64,

        constants::DW_OP_constu
        | constants::DW_OP_plus_uconst
        | constants::DW_OP_regx
        | constants::DW_OP_piece
        | constants::DW_OP_addrx
        | constants::DW_OP_constx
        | constants::DW_OP_convert
        | constants::DW_OP_reinterpret
        | constants::DW_OP_GNU_addr_index
        | constants::DW_OP_GNU_const_index
        | constants::DW_OP_GNU_convert
        | constants::DW_OP_GNU_reinterpret => Shape::Uleb,

        constants::DW_OP_consts | constants::DW_OP_fbreg => Shape::Sleb,
        constants::DW_OP_bregx => Shape::UlebSleb,
        constants::DW_OP_bit_piece
        | constants::DW_OP_regval_type
        | constants::DW_OP_GNU_regval_type => Shape::UlebUleb,
        constants::DW_OP_deref_type
        | constants::DW_OP_xderef_type
        | constants::DW_OP_GNU_deref_type => Shape::U8Uleb,

        constants::DW_OP_call_ref | constants::DW_OP_GNU_parameter_ref => Shape::Offset,
        constants::DW_OP_implicit_pointer | constants::DW_OP_GNU_implicit_pointer => {
            Shape::OffsetSleb
        }

        constants::DW_OP_implicit_value => Shape::Block,
        constants::DW_OP_const_type | constants::DW_OP_GNU_const_type => Shape::Typed,
        constants::DW_OP_entry_value | constants::DW_OP_GNU_entry_value => Shape::Nested,
        constants::DW_OP_WASM_location => Shape::Wasm,

        constants::DW_OP_deref
        | constants::DW_OP_dup
        | constants::DW_OP_drop
        | constants::DW_OP_over
        | constants::DW_OP_swap
        | constants::DW_OP_rot
        | constants::DW_OP_xderef
        | constants::DW_OP_abs
        | constants::DW_OP_and
        | constants::DW_OP_div
        | constants::DW_OP_minus
        | constants::DW_OP_mod
        | constants::DW_OP_mul
        | constants::DW_OP_neg
        | constants::DW_OP_not
        | constants::DW_OP_or
        | constants::DW_OP_plus
        | constants::DW_OP_shl
        | constants::DW_OP_shr
        | constants::DW_OP_shra
        | constants::DW_OP_xor
        | constants::DW_OP_eq
        | constants::DW_OP_ge
        | constants::DW_OP_gt
        | constants::DW_OP_le
        | constants::DW_OP_lt
        | constants::DW_OP_ne
        | constants::DW_OP_nop
        | constants::DW_OP_push_object_address
        | constants::DW_OP_form_tls_address
        | constants::DW_OP_call_frame_cfa
        | constants::DW_OP_stack_value
        | constants::DW_OP_GNU_push_tls_address
        | DW_OP_GNU_UNINIT => Shape::None,

        // DW_OP_lit0..31 and DW_OP_reg0..31
        DwOp(0x30..=0x6f) => Shape::None,
        // DW_OP_breg0..31
        DwOp(0x70..=0x8f) => Shape::Sleb,

        _ => return None,
    };

    Some(shape)
}

/// Decodes expressions of one context.
///
/// The parser is stateless. The context determines the width of `DW_OP_addr` operands and of
/// section offsets in `DW_OP_call_ref` and `DW_OP_implicit_pointer`.
#[derive(Clone, Copy, Debug)]
pub struct ExprParser {
    ctx: SchemaContext,
}

impl ExprParser {
    /// Creates a parser for expressions of a unit or call frame entry.
    pub fn new(ctx: SchemaContext) -> Self {
        ExprParser { ctx }
    }

    /// Decodes all operations of an expression.
    ///
    /// Offsets in the result and in errors are relative to the start of `expr`.
    pub fn parse<'d>(&self, expr: &'d [u8]) -> Result<Vec<ExprOp<'d>>> {
        self.ops(expr).collect()
    }

    /// Iterates over the operations of an expression as they are decoded.
    pub fn ops<'d>(&self, expr: &'d [u8]) -> ExprOps<'d> {
        ExprOps {
            parser: *self,
            reader: Reader::new(expr, self.ctx.endian),
            failed: false,
        }
    }

    fn read_op<'d>(&self, reader: &mut Reader<'d>) -> Result<ExprOp<'d>> {
        let offset = reader.position();
        let opcode = DwOp(reader.u8()?);
        let shape = shape(opcode).ok_or_else(|| {
            DwarfError::malformed(offset, format!("unknown expression opcode {:#x}", opcode.0))
        })?;

        let ctx = self.ctx;
        let operands = match shape {
            Shape::None => Operands::None,
            Shape::U8 => Operands::Unsigned(reader.u8()?.into()),
            Shape::U16 => Operands::Unsigned(reader.u16()?.into()),
            Shape::U32 => Operands::Unsigned(reader.u32()?.into()),
            Shape::U64 => Operands::Unsigned(reader.u64()?),
            Shape::I8 => Operands::Signed(reader.i8()?.into()),
            Shape::I16 => Operands::Signed(reader.i16()?.into()),
            Shape::I32 => Operands::Signed(reader.i32()?.into()),
            Shape::I64 => Operands::Signed(reader.i64()?),
            Shape::Uleb => Operands::Unsigned(reader.uleb128()?),
            Shape::Sleb => Operands::Signed(reader.sleb128()?),
            Shape::UlebUleb => Operands::UnsignedPair(reader.uleb128()?, reader.uleb128()?),
            Shape::UlebSleb => Operands::UnsignedSigned(reader.uleb128()?, reader.sleb128()?),
            Shape::U8Uleb => Operands::UnsignedPair(reader.u8()?.into(), reader.uleb128()?),
            Shape::Offset => Operands::Unsigned(reader.offset(ctx.format)?),
            Shape::OffsetSleb => {
                Operands::UnsignedSigned(reader.offset(ctx.format)?, reader.sleb128()?)
            }
            Shape::Address => Operands::Address(reader.address(ctx.address_size)?),
            Shape::Block => {
                let len = reader.uleb128()?;
                Operands::Block(reader.bytes(len)?)
            }
            Shape::Typed => {
                let type_offset = reader.uleb128()?;
                let len = reader.u8()?;
                Operands::Typed {
                    type_offset,
                    value: reader.bytes(len.into())?,
                }
            }
            Shape::Nested => {
                let len = reader.uleb128()?;
                Operands::Nested(self.parse(reader.bytes(len)?)?)
            }
            Shape::Wasm => {
                let kind_offset = reader.position();
                let kind = reader.u8()?;
                let index = match kind {
                    0..=2 => reader.uleb128()?,
                    3 => reader.u32()?.into(),
                    _ => {
                        return Err(DwarfError::malformed(
                            kind_offset,
                            format!("unknown DW_OP_WASM_location kind {kind}"),
                        ))
                    }
                };
                Operands::Wasm { kind, index }
            }
        };

        Ok(ExprOp {
            offset,
            opcode,
            operands,
        })
    }
}

/// An iterator over the operations of an expression.
///
/// Stops at the end of the expression, or after yielding the first error.
#[derive(Clone, Debug)]
pub struct ExprOps<'d> {
    parser: ExprParser,
    reader: Reader<'d>,
    failed: bool,
}

impl<'d> Iterator for ExprOps<'d> {
    type Item = Result<ExprOp<'d>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }

        let op = self.parser.read_op(&mut self.reader);
        self.failed = op.is_err();
        Some(op)
    }
}

impl std::iter::FusedIterator for ExprOps<'_> {}
