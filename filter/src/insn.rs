// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Classic filter instruction encoding.

use core::fmt::{Display, Formatter};

/// Size, in bytes, of one encoded [`Instruction`].
pub const INSTRUCTION_SIZE: usize = 8;

/// Opcode fields of a classic filter instruction.
///
/// An opcode is the bitwise or of a class, and (depending on the class) a size, a mode, an
/// operation and an operand source.
#[allow(missing_docs)]
pub mod op {
    // classes
    pub const LD: u16 = 0x00;
    pub const LDX: u16 = 0x01;
    pub const ST: u16 = 0x02;
    pub const STX: u16 = 0x03;
    pub const ALU: u16 = 0x04;
    pub const JMP: u16 = 0x05;
    pub const RET: u16 = 0x06;
    pub const MISC: u16 = 0x07;

    // load sizes
    pub const W: u16 = 0x00;
    pub const H: u16 = 0x08;
    pub const B: u16 = 0x10;

    // load modes
    pub const IMM: u16 = 0x00;
    pub const ABS: u16 = 0x20;
    pub const IND: u16 = 0x40;
    pub const MEM: u16 = 0x60;
    pub const LEN: u16 = 0x80;
    pub const MSH: u16 = 0xa0;

    // alu operations
    pub const ADD: u16 = 0x00;
    pub const SUB: u16 = 0x10;
    pub const MUL: u16 = 0x20;
    pub const DIV: u16 = 0x30;
    pub const OR: u16 = 0x40;
    pub const AND: u16 = 0x50;
    pub const LSH: u16 = 0x60;
    pub const RSH: u16 = 0x70;
    pub const NEG: u16 = 0x80;
    pub const MOD: u16 = 0x90;
    pub const XOR: u16 = 0xa0;

    // jump conditions
    pub const JA: u16 = 0x00;
    pub const JEQ: u16 = 0x10;
    pub const JGT: u16 = 0x20;
    pub const JGE: u16 = 0x30;
    pub const JSET: u16 = 0x40;

    // operand sources
    pub const K: u16 = 0x00;
    pub const X: u16 = 0x08;
    pub const A: u16 = 0x10;

    // misc operations
    pub const TAX: u16 = 0x00;
    pub const TXA: u16 = 0x80;

    /// Extract the class bits of an opcode.
    #[must_use]
    pub const fn class(code: u16) -> u16 {
        code & 0x07
    }
    /// Extract the size bits of a load opcode.
    #[must_use]
    pub const fn size(code: u16) -> u16 {
        code & 0x18
    }
    /// Extract the mode bits of a load / store opcode.
    #[must_use]
    pub const fn mode(code: u16) -> u16 {
        code & 0xe0
    }
    /// Extract the operation bits of an alu or jump opcode.
    #[must_use]
    pub const fn operation(code: u16) -> u16 {
        code & 0xf0
    }
    /// Extract the operand-source bits of an alu or jump opcode.
    #[must_use]
    pub const fn source(code: u16) -> u16 {
        code & 0x08
    }
    /// Extract the return-value source bits of a return opcode.
    #[must_use]
    pub const fn rval(code: u16) -> u16 {
        code & 0x18
    }
    /// Extract the operation bits of a misc opcode.
    #[must_use]
    pub const fn misc_operation(code: u16) -> u16 {
        code & 0xf8
    }
}

/// A single classic filter instruction.
///
/// The layout matches the one used by capture devices: a 16 bit opcode, two relative jump
/// offsets and a 32 bit generic operand.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Instruction {
    /// Opcode (see [`op`]).
    pub code: u16,
    /// Jump offset if the condition holds.
    pub jt: u8,
    /// Jump offset if the condition does not hold.
    pub jf: u8,
    /// Generic operand.
    pub k: u32,
}

const _: () = assert!(size_of::<Instruction>() == INSTRUCTION_SIZE);

impl Instruction {
    /// Build a non-jump instruction.
    #[must_use]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    /// Build a conditional jump instruction.
    #[must_use]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    /// Build a `ret #k` instruction: accept `k` bytes of the frame (0 rejects it).
    #[must_use]
    pub const fn ret(k: u32) -> Self {
        Self::stmt(op::RET | op::K, k)
    }

    /// Decode one instruction from its little-endian wire form.
    #[must_use]
    pub const fn from_bytes(raw: [u8; INSTRUCTION_SIZE]) -> Self {
        Self {
            code: u16::from_le_bytes([raw[0], raw[1]]),
            jt: raw[2],
            jf: raw[3],
            k: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    /// Encode this instruction in its little-endian wire form.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; INSTRUCTION_SIZE] {
        let code = self.code.to_le_bytes();
        let k = self.k.to_le_bytes();
        [code[0], code[1], self.jt, self.jf, k[0], k[1], k[2], k[3]]
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{{ 0x{:02x}, {}, {}, 0x{:08x} }}",
            self.code, self.jt, self.jf, self.k
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test {
    use super::*;

    #[test]
    fn wire_form_is_little_endian() {
        let insn = Instruction::jump(op::JMP | op::JEQ | op::K, 0x0800, 1, 2);
        let raw = insn.to_bytes();
        assert_eq!(raw, [0x15, 0x00, 1, 2, 0x00, 0x08, 0x00, 0x00]);
        assert_eq!(Instruction::from_bytes(raw), insn);
    }

    #[test]
    fn opcode_fields() {
        let code = op::LD | op::H | op::ABS;
        assert_eq!(op::class(code), op::LD);
        assert_eq!(op::size(code), op::H);
        assert_eq!(op::mode(code), op::ABS);
        assert_eq!(op::rval(Instruction::ret(1).code), op::K);
    }
}
