use std::sync::Arc;

use super::registers::Register;
use crate::error::DecodeError;

/// Maximum length of a single CPU instruction, over all supported
/// architectures.
pub const MAX_INSTRUCTION_LEN: usize = 16;

/// Trait implementing the disassembling logic used by the tracer.
pub trait Decoder: Send + Sync {
    /// Decodes the first instruction found in `code`, located at `addr`.
    ///
    /// `code` may be longer than the instruction.
    fn decode(&self, addr: u64, code: &[u8]) -> Result<Instruction, DecodeError>;
}

impl<D: Decoder + ?Sized> Decoder for Arc<D> {
    fn decode(&self, addr: u64, code: &[u8]) -> Result<Instruction, DecodeError> {
        (**self).decode(addr, code)
    }
}

/// Decoded CPU instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Address of the instruction.
    pub address: u64,

    /// Length (in bytes) of the instruction.
    pub size: usize,

    /// Mnemonic of the instruction.
    pub mnemonic: String,

    /// Operands of the instruction, as displayed by the disassembler.
    pub op_str: String,

    /// Structured operands of the instruction.
    pub operands: Vec<Operand>,

    /// Semantic groups the instruction belongs to.
    pub groups: Vec<InstructionGroup>,
}

impl Instruction {
    /// Returns whether the instruction may transfer control (jump, call,
    /// return).
    pub fn is_control_transfer(&self) -> bool {
        self.groups.iter().any(|group| {
            matches!(
                group,
                InstructionGroup::Jump
                    | InstructionGroup::Call
                    | InstructionGroup::Ret
                    | InstructionGroup::BranchRelative
            )
        })
    }

    /// Returns whether the instruction returns from a function.
    pub fn is_return(&self) -> bool {
        self.groups.contains(&InstructionGroup::Ret)
    }

    /// Returns the last immediate operand, if any.
    ///
    /// For direct branches, this is the branch target (test-bit branches
    /// also carry the bit number first).
    pub fn immediate_target(&self) -> Option<u64> {
        self.operands.iter().rev().find_map(|op| match op {
            Operand::Immediate(imm) => Some(*imm as u64),
            _ => None,
        })
    }

    /// Address of the instruction following this one.
    pub const fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.size as u64)
    }
}

/// Instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A register operand.
    Register(Register),

    /// A memory operand.
    Memory {
        /// Base register, if it is a known register.
        base: Option<Register>,

        /// Displacement from the base register.
        disp: i64,
    },

    /// An immediate operand.
    Immediate(i64),

    /// Any other operand (vector registers, system registers, ...).
    Other,
}

/// Semantic group of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstructionGroup {
    /// Jump (conditional or not).
    Jump,

    /// Function call.
    Call,

    /// Function return.
    Ret,

    /// Software interrupt.
    Interrupt,

    /// Relative branch.
    BranchRelative,

    /// Privileged instruction.
    Privilege,

    /// Any other group.
    Other,
}
