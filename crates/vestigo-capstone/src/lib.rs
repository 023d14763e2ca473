//! This crate provides an instruction [Decoder] backed by
//! [Capstone](https://www.capstone-engine.org/).
//!
//! ```
//! use vestigo_capstone::{Arch, CapstoneDecoder};
//! use vestigo_tracer::engine::Decoder;
//!
//! let decoder = CapstoneDecoder::new(Arch::X86_64);
//! let insn = decoder.decode(0x1000, &[0x48, 0x89, 0xe5]).unwrap();
//!
//! assert_eq!(insn.mnemonic, "mov");
//! assert_eq!(insn.op_str, "rbp, rsp");
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use capstone::arch::arm64::{Arm64Operand, Arm64OperandType};
use capstone::arch::x86::{X86Operand, X86OperandType};
use capstone::arch::{ArchOperand, BuildsCapstone, BuildsCapstoneSyntax};
use capstone::{Capstone, RegId};
use vestigo_tracer::DecodeError;
use vestigo_tracer::engine::{Decoder, Instruction, InstructionGroup, Operand, Register};

thread_local! {
    /// Capstone handles cannot be shared between threads, so each thread
    /// builds its own on first use.
    static DISASSEMBLERS: RefCell<HashMap<Arch, Capstone>> = RefCell::new(HashMap::new());
}

/// CPU architecture (and mode) of the decoded code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// IA-32.
    X86,

    /// x86-64.
    X86_64,

    /// AArch64.
    Aarch64,
}

impl Arch {
    fn build(self) -> capstone::CsResult<Capstone> {
        use capstone::arch::{arm64, x86};

        match self {
            Self::X86 => Capstone::new()
                .x86()
                .mode(x86::ArchMode::Mode32)
                .syntax(x86::ArchSyntax::Intel)
                .detail(true)
                .build(),
            Self::X86_64 => Capstone::new()
                .x86()
                .mode(x86::ArchMode::Mode64)
                .syntax(x86::ArchSyntax::Intel)
                .detail(true)
                .build(),
            Self::Aarch64 => Capstone::new()
                .arm64()
                .mode(arm64::ArchMode::Arm)
                .detail(true)
                .build(),
        }
    }
}

/// Instruction decoder backed by Capstone.
#[derive(Debug, Clone, Copy)]
pub struct CapstoneDecoder {
    arch: Arch,
}

impl CapstoneDecoder {
    /// Creates a new decoder for the given architecture.
    pub const fn new(arch: Arch) -> Self {
        Self { arch }
    }

    /// Architecture of the decoded code.
    pub const fn arch(&self) -> Arch {
        self.arch
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, addr: u64, code: &[u8]) -> Result<Instruction, DecodeError> {
        DISASSEMBLERS.with_borrow_mut(|disassemblers| {
            let cs = match disassemblers.entry(self.arch) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    tracing::debug!(arch = ?self.arch, "initializing disassembler");
                    entry.insert(self.arch.build().map_err(|e| backend_error(addr, e))?)
                }
            };

            decode_with(cs, addr, code)
        })
    }
}

fn decode_with(cs: &Capstone, addr: u64, code: &[u8]) -> Result<Instruction, DecodeError> {
    let insns = cs
        .disasm_count(code, addr, 1)
        .map_err(|e| backend_error(addr, e))?;

    let insn = insns.first().ok_or(DecodeError::Invalid { addr })?;
    let detail = cs.insn_detail(insn).map_err(|e| backend_error(addr, e))?;

    let groups = detail
        .groups()
        .iter()
        .filter_map(|&group| cs.group_name(group))
        .map(|name| match name.as_str() {
            "jump" => InstructionGroup::Jump,
            "call" => InstructionGroup::Call,
            "ret" | "return" => InstructionGroup::Ret,
            "int" | "iret" => InstructionGroup::Interrupt,
            "branch_relative" => InstructionGroup::BranchRelative,
            "privilege" => InstructionGroup::Privilege,
            _ => InstructionGroup::Other,
        })
        .collect();

    let operands = detail
        .arch_detail()
        .operands()
        .into_iter()
        .map(|op| match op {
            ArchOperand::X86Operand(op) => x86_operand(cs, op),
            ArchOperand::Arm64Operand(op) => arm64_operand(cs, op),
            _ => Operand::Other,
        })
        .collect();

    Ok(Instruction {
        address: insn.address(),
        size: insn.bytes().len(),
        mnemonic: insn.mnemonic().unwrap_or_default().to_owned(),
        op_str: insn.op_str().unwrap_or_default().to_owned(),
        operands,
        groups,
    })
}

fn x86_operand(cs: &Capstone, op: X86Operand) -> Operand {
    match op.op_type {
        X86OperandType::Reg(reg) => register(cs, reg).map_or(Operand::Other, Operand::Register),
        X86OperandType::Imm(imm) => Operand::Immediate(imm),
        X86OperandType::Mem(mem) => Operand::Memory {
            base: register(cs, mem.base()),
            disp: mem.disp(),
        },
        _ => Operand::Other,
    }
}

fn arm64_operand(cs: &Capstone, op: Arm64Operand) -> Operand {
    match op.op_type {
        Arm64OperandType::Reg(reg) => register(cs, reg).map_or(Operand::Other, Operand::Register),
        Arm64OperandType::Imm(imm) => Operand::Immediate(imm),
        Arm64OperandType::Mem(mem) => Operand::Memory {
            base: register(cs, mem.base()),
            disp: i64::from(mem.disp()),
        },
        _ => Operand::Other,
    }
}

fn register(cs: &Capstone, reg: RegId) -> Option<Register> {
    Register::from_name(&cs.reg_name(reg)?)
}

fn backend_error(addr: u64, e: capstone::Error) -> DecodeError {
    DecodeError::Backend {
        addr,
        message: e.to_string(),
    }
}
