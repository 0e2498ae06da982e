//! Reconstruction of unwind tables from call frame instructions.

use std::collections::BTreeMap;

use dwarfkit_common::Arch;

use crate::error::{CfiError, CfiErrorKind, Result};
use crate::instruction::{CallFrameInstruction, CallFrameOperation};

/// The rule computing the canonical frame address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaRule<'d> {
    /// The CFA is a register plus an offset.
    RegOffset {
        /// The register, or `None` while only an offset has been defined.
        reg: Option<u64>,
        /// The offset added to the register value.
        offset: i64,
    },
    /// The CFA is computed by a DWARF expression.
    Expression(&'d [u8]),
}

/// The rule recovering the value a register had in the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterRule<'d> {
    /// The value cannot be recovered.
    Undefined,
    /// The register was not modified.
    SameValue,
    /// The value is saved at the CFA plus this offset.
    Offset(i64),
    /// The value is the CFA plus this offset.
    ValOffset(i64),
    /// The value is stored in another register.
    Register(u64),
    /// The value is saved at the address computed by an expression.
    Expression(&'d [u8]),
    /// The value is computed by an expression.
    ValExpression(&'d [u8]),
}

/// One row of an unwind table: the rules in effect from `pc` up to the next row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfiRow<'d> {
    /// The first address covered by this row.
    pub pc: u64,
    /// The CFA rule, if one has been defined.
    pub cfa: Option<CfaRule<'d>>,
    /// Rules of the registers that have one, by register number.
    pub rules: BTreeMap<u64, RegisterRule<'d>>,
}

impl<'d> CfiRow<'d> {
    /// Returns the rule of a register.
    pub fn rule(&self, register: u64) -> Option<&RegisterRule<'d>> {
        self.rules.get(&register)
    }

    /// Whether neither the CFA nor any register has a rule.
    pub fn is_empty(&self) -> bool {
        self.cfa.is_none() && self.rules.is_empty()
    }

    /// Renders a register number with its name on `arch`, or as `r<N>` if the architecture does
    /// not name it.
    ///
    /// ```
    /// use dwarfkit_cfi::CfiRow;
    /// use dwarfkit_common::Arch;
    ///
    /// assert_eq!(CfiRow::register_name(Arch::Amd64, 7), "rsp");
    /// assert_eq!(CfiRow::register_name(Arch::Unknown, 7), "r7");
    /// ```
    pub fn register_name(arch: Arch, register: u64) -> String {
        arch.cpu_family().display_register(register)
    }
}

/// The unwind table of a CIE or FDE.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedCallFrameTable<'d> {
    /// Rows in the order they were produced.
    pub rows: Vec<CfiRow<'d>>,
    /// Every register that received a rule, in order of first appearance. For an FDE this starts
    /// with the registers of its CIE.
    pub reg_order: Vec<u64>,
}

/// The entry whose instructions are executed.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TableOwner<'a, 'd> {
    Cie,
    Fde {
        initial_location: u64,
        cie_table: &'a DecodedCallFrameTable<'d>,
    },
}

/// Alignment factors declared by a CIE.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Factors {
    pub code_alignment: u64,
    pub data_alignment: i64,
}

impl Factors {
    fn data(&self, factored: i64) -> i64 {
        factored.wrapping_mul(self.data_alignment)
    }
}

/// Executes the instructions of an entry and collects its rows.
pub(crate) fn decode_table<'d>(
    instructions: &[CallFrameInstruction<'d>],
    factors: Factors,
    owner: TableOwner<'_, 'd>,
) -> Result<DecodedCallFrameTable<'d>> {
    let (initial_row, mut reg_order) = match owner {
        TableOwner::Cie => (None, Vec::new()),
        TableOwner::Fde {
            cie_table,
            ..
        } => (cie_table.rows.last(), cie_table.reg_order.clone()),
    };

    let mut row = initial_row.cloned().unwrap_or_default();
    if let TableOwner::Fde {
        initial_location, ..
    } = owner
    {
        row.pc = initial_location;
    }

    let mut rows = Vec::new();
    let mut stack: Vec<CfiRow<'d>> = Vec::new();

    for instruction in instructions {
        match instruction.operation {
            CallFrameOperation::SetLoc { address } => {
                rows.push(row.clone());
                row.pc = address;
            }
            CallFrameOperation::AdvanceLoc { delta } => {
                rows.push(row.clone());
                row.pc = row
                    .pc
                    .wrapping_add(delta.wrapping_mul(factors.code_alignment));
            }
            CallFrameOperation::DefCfa { register, offset } => {
                row.cfa = Some(CfaRule::RegOffset {
                    reg: Some(register),
                    offset: offset as i64,
                });
            }
            CallFrameOperation::DefCfaSf {
                register,
                factored_offset,
            } => {
                row.cfa = Some(CfaRule::RegOffset {
                    reg: Some(register),
                    offset: factors.data(factored_offset),
                });
            }
            CallFrameOperation::DefCfaRegister { register } => {
                let offset = match row.cfa {
                    None => 0,
                    Some(CfaRule::RegOffset { offset, .. }) => offset,
                    Some(CfaRule::Expression(_)) => return Err(no_register_cfa(instruction)),
                };
                row.cfa = Some(CfaRule::RegOffset {
                    reg: Some(register),
                    offset,
                });
            }
            CallFrameOperation::DefCfaOffset { offset } => {
                set_cfa_offset(&mut row, instruction, offset as i64)?;
            }
            CallFrameOperation::DefCfaOffsetSf { factored_offset } => {
                set_cfa_offset(&mut row, instruction, factors.data(factored_offset))?;
            }
            CallFrameOperation::DefCfaExpression { expression } => {
                row.cfa = Some(CfaRule::Expression(expression));
            }
            CallFrameOperation::Undefined { register } => {
                set_rule(&mut reg_order, &mut row, register, RegisterRule::Undefined);
            }
            CallFrameOperation::SameValue { register } => {
                set_rule(&mut reg_order, &mut row, register, RegisterRule::SameValue);
            }
            CallFrameOperation::Offset {
                register,
                factored_offset,
            } => {
                let offset = factors.data(factored_offset as i64);
                set_rule(&mut reg_order, &mut row, register, RegisterRule::Offset(offset));
            }
            CallFrameOperation::OffsetSf {
                register,
                factored_offset,
            } => {
                let offset = factors.data(factored_offset);
                set_rule(&mut reg_order, &mut row, register, RegisterRule::Offset(offset));
            }
            CallFrameOperation::NegativeOffset {
                register,
                factored_offset,
            } => {
                let offset = factors.data((factored_offset as i64).wrapping_neg());
                set_rule(&mut reg_order, &mut row, register, RegisterRule::Offset(offset));
            }
            CallFrameOperation::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = factors.data(factored_offset as i64);
                set_rule(&mut reg_order, &mut row, register, RegisterRule::ValOffset(offset));
            }
            CallFrameOperation::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = factors.data(factored_offset);
                set_rule(&mut reg_order, &mut row, register, RegisterRule::ValOffset(offset));
            }
            CallFrameOperation::Register {
                register,
                new_register,
            } => {
                set_rule(&mut reg_order, &mut row, register, RegisterRule::Register(new_register));
            }
            CallFrameOperation::Expression {
                register,
                expression,
            } => {
                set_rule(&mut reg_order, &mut row, register, RegisterRule::Expression(expression));
            }
            CallFrameOperation::ValExpression {
                register,
                expression,
            } => {
                set_rule(&mut reg_order, &mut row, register, RegisterRule::ValExpression(expression));
            }
            CallFrameOperation::Restore { register } => {
                if matches!(owner, TableOwner::Cie) {
                    return Err(CfiError::at(CfiErrorKind::RestoreInCie, instruction.offset));
                }

                add_to_order(&mut reg_order, register);
                match initial_row.and_then(|initial| initial.rule(register)) {
                    Some(&rule) => row.rules.insert(register, rule),
                    None => row.rules.remove(&register),
                };
            }
            CallFrameOperation::RememberState => stack.push(row.clone()),
            CallFrameOperation::RestoreState => {
                let pc = row.pc;
                row = stack.pop().ok_or_else(|| {
                    CfiError::new(
                        CfiErrorKind::BadInstruction,
                        instruction.offset,
                        "restore_state without remembered state",
                    )
                })?;
                row.pc = pc;
            }
            CallFrameOperation::Nop
            | CallFrameOperation::ArgsSize { .. }
            | CallFrameOperation::NegateRaState => {}
        }
    }

    if !row.is_empty() {
        rows.push(row);
    }

    Ok(DecodedCallFrameTable { rows, reg_order })
}

fn add_to_order(reg_order: &mut Vec<u64>, register: u64) {
    if !reg_order.contains(&register) {
        reg_order.push(register);
    }
}

fn set_rule<'d>(
    reg_order: &mut Vec<u64>,
    row: &mut CfiRow<'d>,
    register: u64,
    rule: RegisterRule<'d>,
) {
    add_to_order(reg_order, register);
    row.rules.insert(register, rule);
}

fn set_cfa_offset(
    row: &mut CfiRow<'_>,
    instruction: &CallFrameInstruction<'_>,
    new_offset: i64,
) -> Result<()> {
    match row.cfa {
        Some(CfaRule::RegOffset { ref mut offset, .. }) => {
            *offset = new_offset;
            Ok(())
        }
        // The register follows in a later DW_CFA_def_cfa_register.
        None => {
            row.cfa = Some(CfaRule::RegOffset {
                reg: None,
                offset: new_offset,
            });
            Ok(())
        }
        Some(CfaRule::Expression(_)) => Err(no_register_cfa(instruction)),
    }
}

fn no_register_cfa(instruction: &CallFrameInstruction<'_>) -> CfiError {
    CfiError::new(
        CfiErrorKind::BadInstruction,
        instruction.offset,
        format!("{} without a register CFA rule", instruction.name()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use dwarfkit_dwarf::gimli::constants;
    use similar_asserts::assert_eq;

    const FACTORS: Factors = Factors {
        code_alignment: 1,
        data_alignment: -4,
    };

    fn ins(offset: u64, operation: CallFrameOperation<'static>) -> CallFrameInstruction<'static> {
        CallFrameInstruction {
            offset,
            opcode: constants::DW_CFA_nop,
            operation,
        }
    }

    #[test]
    fn test_advance_then_offset() -> Result<()> {
        let instructions = [
            ins(0, CallFrameOperation::AdvanceLoc { delta: 4 }),
            ins(
                1,
                CallFrameOperation::Offset {
                    register: 6,
                    factored_offset: 2,
                },
            ),
        ];

        let table = decode_table(&instructions, FACTORS, TableOwner::Cie)?;
        assert_eq!(
            table.rows,
            vec![
                CfiRow::default(),
                CfiRow {
                    pc: 4,
                    cfa: None,
                    rules: [(6, RegisterRule::Offset(-8))].into_iter().collect(),
                },
            ]
        );
        assert_eq!(table.reg_order, vec![6]);
        Ok(())
    }

    #[test]
    fn test_remember_restore_keeps_pc() -> Result<()> {
        let instructions = [
            ins(
                0,
                CallFrameOperation::DefCfa {
                    register: 7,
                    offset: 8,
                },
            ),
            ins(1, CallFrameOperation::RememberState),
            ins(
                2,
                CallFrameOperation::Offset {
                    register: 16,
                    factored_offset: 2,
                },
            ),
            ins(3, CallFrameOperation::DefCfaOffset { offset: 16 }),
            ins(4, CallFrameOperation::AdvanceLoc { delta: 8 }),
            ins(5, CallFrameOperation::RestoreState),
        ];

        let table = decode_table(&instructions, FACTORS, TableOwner::Cie)?;
        let remembered = CfiRow {
            pc: 8,
            cfa: Some(CfaRule::RegOffset { reg: Some(7), offset: 8 }),
            rules: BTreeMap::new(),
        };
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].cfa, Some(CfaRule::RegOffset { reg: Some(7), offset: 16 }));
        assert_eq!(table.rows[1], remembered);
        assert_eq!(table.reg_order, vec![16]);
        Ok(())
    }

    #[test]
    fn test_restore_in_cie() {
        let instructions = [ins(3, CallFrameOperation::Restore { register: 6 })];
        let error = decode_table(&instructions, FACTORS, TableOwner::Cie).unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::RestoreInCie);
        assert_eq!(error.offset(), Some(3));
    }

    #[test]
    fn test_restore_state_without_remember() {
        let instructions = [ins(0, CallFrameOperation::RestoreState)];
        let error = decode_table(&instructions, FACTORS, TableOwner::Cie).unwrap_err();
        assert_eq!(error.kind(), CfiErrorKind::BadInstruction);
    }

    #[test]
    fn test_fde_restores_cie_rules() -> Result<()> {
        let cie_table = DecodedCallFrameTable {
            rows: vec![CfiRow {
                pc: 0,
                cfa: Some(CfaRule::RegOffset { reg: Some(7), offset: 8 }),
                rules: [(16, RegisterRule::Offset(-8))].into_iter().collect(),
            }],
            reg_order: vec![16],
        };

        let instructions = [
            ins(
                0,
                CallFrameOperation::Offset {
                    register: 16,
                    factored_offset: 4,
                },
            ),
            ins(1, CallFrameOperation::SameValue { register: 6 }),
            ins(2, CallFrameOperation::AdvanceLoc { delta: 2 }),
            ins(3, CallFrameOperation::Restore { register: 16 }),
            ins(4, CallFrameOperation::Restore { register: 6 }),
        ];

        let owner = TableOwner::Fde {
            initial_location: 0x1000,
            cie_table: &cie_table,
        };
        let table = decode_table(&instructions, FACTORS, owner)?;

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].pc, 0x1000);
        assert_eq!(table.rows[0].rule(16), Some(&RegisterRule::Offset(-16)));
        assert_eq!(table.rows[0].rule(6), Some(&RegisterRule::SameValue));
        assert_eq!(table.rows[1].pc, 0x1002);
        assert_eq!(table.rows[1].rules, cie_table.rows[0].rules);
        assert_eq!(table.reg_order, vec![16, 6]);
        Ok(())
    }

    #[test]
    fn test_sf_offsets_use_data_alignment() -> Result<()> {
        let instructions = [
            ins(
                0,
                CallFrameOperation::DefCfaSf {
                    register: 7,
                    factored_offset: -2,
                },
            ),
            ins(
                1,
                CallFrameOperation::NegativeOffset {
                    register: 3,
                    factored_offset: 2,
                },
            ),
        ];

        let table = decode_table(&instructions, FACTORS, TableOwner::Cie)?;
        let row = &table.rows[0];
        assert_eq!(row.cfa, Some(CfaRule::RegOffset { reg: Some(7), offset: 8 }));
        assert_eq!(row.rule(3), Some(&RegisterRule::Offset(8)));
        Ok(())
    }

    #[test]
    fn test_register_completes_pending_offset() -> Result<()> {
        let instructions = [
            ins(0, CallFrameOperation::DefCfaOffsetSf { factored_offset: -4 }),
            ins(1, CallFrameOperation::DefCfaRegister { register: 6 }),
        ];

        let table = decode_table(&instructions, FACTORS, TableOwner::Cie)?;
        assert_eq!(
            table.rows[0].cfa,
            Some(CfaRule::RegOffset {
                reg: Some(6),
                offset: 16,
            })
        );
        Ok(())
    }
}
