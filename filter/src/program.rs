// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Validated filter programs.

use crate::FILTER;
use crate::insn::{INSTRUCTION_SIZE, Instruction, op};
use thiserror::Error;
use tracing::debug;

/// Largest number of instructions a program may have.
pub const MAX_INSTRUCTIONS: usize = 512;

/// Number of scratch memory words available to a program.
pub const MEM_WORDS: u32 = 16;

/// Reasons for rejecting a filter program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    /// The program has no instructions.
    #[error("Filter program is empty")]
    Empty,
    /// The program has more instructions than allowed.
    #[error("Filter program has {len} instructions, at most {max} are allowed")]
    TooLong {
        /// number of instructions in the program
        len: usize,
        /// limit that applied
        max: usize,
    },
    /// An instruction has an opcode that does not decode.
    #[error("Invalid opcode 0x{code:04x} at instruction {pc}")]
    InvalidOpcode {
        /// index of the offending instruction
        pc: usize,
        /// the opcode
        code: u16,
    },
    /// A jump lands past the end of the program.
    #[error("Jump at instruction {pc} lands outside of the program")]
    JumpOutOfRange {
        /// index of the offending instruction
        pc: usize,
    },
    /// A scratch memory access is out of bounds.
    #[error("Scratch memory index {index} at instruction {pc} is out of range")]
    ScratchOutOfRange {
        /// index of the offending instruction
        pc: usize,
        /// the scratch index
        index: u32,
    },
    /// Division or modulo by the constant zero.
    #[error("Division by constant zero at instruction {pc}")]
    DivisionByZero {
        /// index of the offending instruction
        pc: usize,
    },
    /// The last instruction is not a return.
    #[error("Filter program does not end with a return")]
    MissingReturn,
    /// The encoded form of a program is not a whole number of instructions.
    #[error("Encoded filter program length {0} is not a multiple of {INSTRUCTION_SIZE}")]
    BadEncoding(usize),
}

/// An immutable, structurally valid filter program.
///
/// Validation guarantees that an evaluator can run the program without bounds checks on jumps
/// or scratch memory, and that every path ends in a return. It says nothing about what the
/// program matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    insns: Box<[Instruction]>,
}

impl Program {
    /// Validate and build a program of at most [`MAX_INSTRUCTIONS`] instructions.
    ///
    /// # Errors
    ///
    /// Returns a [`ProgramError`] describing the first defect found.
    pub fn new(insns: Vec<Instruction>) -> Result<Self, ProgramError> {
        Self::with_limit(insns, MAX_INSTRUCTIONS)
    }

    /// Validate and build a program of at most `max` instructions.
    ///
    /// # Errors
    ///
    /// Returns a [`ProgramError`] describing the first defect found.
    pub fn with_limit(insns: Vec<Instruction>, max: usize) -> Result<Self, ProgramError> {
        if let Err(e) = validate(&insns, max) {
            debug!(target: FILTER, "Rejected filter program: {e}");
            return Err(e);
        }
        Ok(Self {
            insns: insns.into_boxed_slice(),
        })
    }

    /// Decode and validate a program from its little-endian wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProgramError::BadEncoding`] if `raw` is not a whole number of instructions,
    /// or any validation error.
    pub fn from_bytes(raw: &[u8], max: usize) -> Result<Self, ProgramError> {
        let chunks = raw.chunks_exact(INSTRUCTION_SIZE);
        if !chunks.remainder().is_empty() {
            return Err(ProgramError::BadEncoding(raw.len()));
        }
        let insns = chunks
            .map(|chunk| {
                let mut insn = [0u8; INSTRUCTION_SIZE];
                insn.copy_from_slice(chunk);
                Instruction::from_bytes(insn)
            })
            .collect();
        Self::with_limit(insns, max)
    }

    /// A program that accepts up to `snaplen` bytes of every frame.
    #[must_use]
    pub fn accept(snaplen: u32) -> Self {
        Self {
            insns: Box::new([Instruction::ret(snaplen)]),
        }
    }

    /// The instructions of this program.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.insns
    }

    /// Number of instructions. Never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    /// Always false: empty programs do not validate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Encode this program in its wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.insns.iter().flat_map(|i| i.to_bytes()).collect()
    }
}

fn check_scratch(pc: usize, index: u32) -> Result<(), ProgramError> {
    if index < MEM_WORDS {
        Ok(())
    } else {
        Err(ProgramError::ScratchOutOfRange { pc, index })
    }
}

fn check_target(pc: usize, offset: u64, len: usize) -> Result<(), ProgramError> {
    // offsets are relative to the next instruction
    let target = pc as u64 + 1 + offset;
    if target < len as u64 {
        Ok(())
    } else {
        Err(ProgramError::JumpOutOfRange { pc })
    }
}

fn validate(insns: &[Instruction], max: usize) -> Result<(), ProgramError> {
    let len = insns.len();
    if len == 0 {
        return Err(ProgramError::Empty);
    }
    if len > max {
        return Err(ProgramError::TooLong { len, max });
    }

    for (pc, insn) in insns.iter().enumerate() {
        let invalid = ProgramError::InvalidOpcode { pc, code: insn.code };
        if insn.code > 0xff {
            return Err(invalid);
        }
        match op::class(insn.code) {
            op::LD | op::LDX => {
                if op::size(insn.code) == 0x18 {
                    return Err(invalid);
                }
                match op::mode(insn.code) {
                    op::IMM | op::ABS | op::IND | op::LEN | op::MSH => {}
                    op::MEM => check_scratch(pc, insn.k)?,
                    _ => return Err(invalid),
                }
            }
            op::ST | op::STX => check_scratch(pc, insn.k)?,
            op::ALU => match op::operation(insn.code) {
                op::DIV | op::MOD => {
                    if op::source(insn.code) == op::K && insn.k == 0 {
                        return Err(ProgramError::DivisionByZero { pc });
                    }
                }
                op::ADD | op::SUB | op::MUL | op::OR | op::AND | op::LSH | op::RSH | op::NEG
                | op::XOR => {}
                _ => return Err(invalid),
            },
            op::JMP => match op::operation(insn.code) {
                op::JA => check_target(pc, u64::from(insn.k), len)?,
                op::JEQ | op::JGT | op::JGE | op::JSET => {
                    check_target(pc, u64::from(insn.jt), len)?;
                    check_target(pc, u64::from(insn.jf), len)?;
                }
                _ => return Err(invalid),
            },
            op::RET => match op::rval(insn.code) {
                op::K | op::A | op::X => {}
                _ => return Err(invalid),
            },
            op::MISC => match op::misc_operation(insn.code) {
                op::TAX | op::TXA => {}
                _ => return Err(invalid),
            },
            _ => return Err(invalid),
        }
    }

    match insns.last() {
        Some(last) if op::class(last.code) == op::RET => Ok(()),
        _ => Err(ProgramError::MissingReturn),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;
    use crate::insn::op::*;
    use pretty_assertions::assert_eq;

    // ldh [12]; jeq #0x800, L1, L2; L1: ret #-1; L2: ret #0
    fn ipv4_only() -> Vec<Instruction> {
        vec![
            Instruction::stmt(LD | H | ABS, 12),
            Instruction::jump(JMP | JEQ | K, 0x0800, 0, 1),
            Instruction::ret(u32::MAX),
            Instruction::ret(0),
        ]
    }

    #[test]
    fn accepts_valid_program() {
        let program = Program::new(ipv4_only()).unwrap();
        assert_eq!(program.len(), 4);
        assert!(!program.is_empty());
        assert_eq!(program.instructions(), ipv4_only().as_slice());
    }

    #[test]
    fn wire_form_round_trips() {
        let program = Program::new(ipv4_only()).unwrap();
        let raw = program.to_bytes();
        assert_eq!(raw.len(), 4 * INSTRUCTION_SIZE);
        assert_eq!(Program::from_bytes(&raw, MAX_INSTRUCTIONS).unwrap(), program);
        assert_eq!(
            Program::from_bytes(&raw[..raw.len() - 1], MAX_INSTRUCTIONS),
            Err(ProgramError::BadEncoding(31))
        );
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert_eq!(Program::new(vec![]), Err(ProgramError::Empty));
        let long = vec![Instruction::ret(0); 5];
        assert_eq!(
            Program::with_limit(long, 4),
            Err(ProgramError::TooLong { len: 5, max: 4 })
        );
        let long = vec![Instruction::ret(0); MAX_INSTRUCTIONS + 1];
        assert!(matches!(
            Program::new(long),
            Err(ProgramError::TooLong { .. })
        ));
    }

    #[test]
    fn rejects_jumps_out_of_range() {
        let mut insns = ipv4_only();
        insns[1].jf = 2;
        assert_eq!(
            Program::new(insns),
            Err(ProgramError::JumpOutOfRange { pc: 1 })
        );
        let insns = vec![Instruction::stmt(JMP | JA, u32::MAX), Instruction::ret(0)];
        assert_eq!(
            Program::new(insns),
            Err(ProgramError::JumpOutOfRange { pc: 0 })
        );
    }

    #[test]
    fn rejects_bad_scratch_and_division() {
        let insns = vec![Instruction::stmt(ST, MEM_WORDS), Instruction::ret(0)];
        assert_eq!(
            Program::new(insns),
            Err(ProgramError::ScratchOutOfRange {
                pc: 0,
                index: MEM_WORDS
            })
        );
        let insns = vec![Instruction::stmt(LD | MEM, 15), Instruction::ret(0)];
        assert!(Program::new(insns).is_ok());
        let insns = vec![Instruction::stmt(ALU | DIV | K, 0), Instruction::ret(0)];
        assert_eq!(
            Program::new(insns),
            Err(ProgramError::DivisionByZero { pc: 0 })
        );
        // division by the index register is checked at run time
        let insns = vec![Instruction::stmt(ALU | MOD | X, 0), Instruction::ret(0)];
        assert!(Program::new(insns).is_ok());
    }

    #[test]
    fn rejects_invalid_opcodes_and_missing_return() {
        let insns = vec![Instruction::stmt(ALU | 0xb0, 1), Instruction::ret(0)];
        assert_eq!(
            Program::new(insns),
            Err(ProgramError::InvalidOpcode {
                pc: 0,
                code: ALU | 0xb0
            })
        );
        let insns = vec![Instruction::stmt(LD | IMM, 1)];
        assert_eq!(Program::new(insns), Err(ProgramError::MissingReturn));
    }

    #[test]
    fn validation_never_panics() {
        bolero::check!()
            .with_type::<Vec<(u16, u8, u8, u32)>>()
            .for_each(|raw| {
                let insns: Vec<_> = raw
                    .iter()
                    .map(|&(code, jt, jf, k)| Instruction::jump(code, k, jt, jf))
                    .collect();
                if let Ok(program) = Program::new(insns) {
                    let last = program.instructions()[program.len() - 1];
                    assert_eq!(op::class(last.code), RET);
                }
            });
    }
}
