mod line;
mod telescope;

use std::fmt;

pub use self::telescope::{MAX_STRING_LEN, Telescoped, Telescoper};
pub(crate) use self::telescope::decode_at;
use self::line::Line;
use crate::engine::{Decoder, Instruction, Operand, Process, Register, RegisterSnapshot};
use crate::filter::ModuleFilter;

/// Column at which the mnemonic starts.
const MNEMONIC_COLUMN: usize = 28;

/// Column at which the operands start.
const OPERANDS_COLUMN: usize = 35;

/// Column at which the annotation starts.
const ANNOTATION_COLUMN: usize = 65;

/// Options for printing a traced instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrintOptions {
    /// Whether to colorize the output with ANSI escape sequences.
    pub colored: bool,

    /// Whether to append the register block below the instruction line.
    pub details: bool,

    /// Text appended at the end of the line (prefixed with `@`), if
    /// non-empty.
    pub annotation: String,
}

impl PrintOptions {
    /// Enables or disables colors.
    pub const fn colored(mut self, colored: bool) -> Self {
        self.colored = colored;
        self
    }

    /// Enables or disables the register block.
    pub const fn details(mut self, details: bool) -> Self {
        self.details = details;
        self
    }

    /// Sets the annotation of the line.
    pub fn annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }
}

/// Renderer of traced instructions.
///
/// The formatter holds no state of its own: two calls with the same inputs
/// yield the same text.
#[derive(Clone, Copy)]
pub struct Formatter<'a> {
    process: &'a dyn Process,
    decoder: &'a dyn Decoder,
    modules: &'a ModuleFilter,
}

impl<'a> Formatter<'a> {
    /// Creates a new [Formatter].
    pub const fn new(
        process: &'a dyn Process,
        decoder: &'a dyn Decoder,
        modules: &'a ModuleFilter,
    ) -> Self {
        Self {
            process,
            decoder,
            modules,
        }
    }

    /// Renders `insn` as a single aligned line.
    ///
    /// The line holds the address, the raw bytes, the mnemonic and the
    /// operands. Direct control transfers get the module-relative location of
    /// their target, unless `details` is set (the register block already
    /// telescopes it).
    pub fn format_line(
        &self,
        insn: &Instruction,
        details: bool,
        annotation: &str,
        colored: bool,
    ) -> String {
        let mut line = Line::new(colored);

        line.push(&format!("{:#x}", insn.address), line::ADDRESS);
        line.push_plain(" ");
        line.push(&self.hex_bytes(insn), line::BYTES);

        line.pad_to(MNEMONIC_COLUMN);
        line.push(&insn.mnemonic, line::MNEMONIC);

        if !insn.op_str.is_empty() {
            line.pad_to(OPERANDS_COLUMN);
            line.push_operands(&insn.op_str);
        }

        if !details && insn.is_control_transfer() {
            let location = insn
                .immediate_target()
                .and_then(|target| Some(self.modules.find(target)?.relative(target)));

            if let Some(location) = location {
                line.push_plain(" ");
                line.push(&format!("({location})"), line::LOCATION);
            }
        }

        if !annotation.is_empty() {
            line.pad_to(ANNOTATION_COLUMN);
            line.push(&format!("@{annotation}"), line::ANNOTATION);
        }

        line.finish()
    }

    /// Renders the register block of `insn`.
    ///
    /// Each register referenced by an operand (directly or as a memory base)
    /// gets one line with its value and what this value points at. Registers
    /// missing from `regs` are skipped.
    pub fn format_details(
        &self,
        insn: &Instruction,
        regs: &RegisterSnapshot,
        colored: bool,
    ) -> String {
        let telescoper = Telescoper::new(self.process, self.decoder);
        let is_control_transfer = insn.is_control_transfer();

        let mut visited = Vec::<Register>::with_capacity(insn.operands.len());
        let mut lines = Vec::with_capacity(insn.operands.len());

        for operand in &insn.operands {
            let (reg, disp) = match *operand {
                Operand::Register(reg) => (reg, 0),
                Operand::Memory {
                    base: Some(reg),
                    disp,
                } => (reg, disp),
                _ => continue,
            };

            if visited.contains(&reg) {
                continue;
            }
            visited.push(reg);

            let Some(value) = regs.get(reg) else {
                tracing::trace!(%reg, "register unavailable");
                continue;
            };

            let value = value.wrapping_add_signed(disp);

            let mut line = Line::new(colored);
            line.push_plain("    ");
            line.push(reg.name(), line::REGISTER);
            line.push_plain(" = ");
            line.push(&format!("{value:#x}"), line::NUMBER);

            if let Some(telescoped) = telescoper.resolve(value, is_control_transfer) {
                line.push_plain(" >> ");
                push_telescoped(&mut line, &telescoped);
            }

            lines.push(line.finish());
        }

        lines.join("\n")
    }

    /// Renders `insn` according to `options`, register block included.
    pub fn render(
        &self,
        insn: &Instruction,
        regs: &RegisterSnapshot,
        options: &PrintOptions,
    ) -> String {
        let mut text = self.format_line(
            insn,
            options.details,
            &options.annotation,
            options.colored,
        );

        if options.details {
            let details = self.format_details(insn, regs, options.colored);

            if !details.is_empty() {
                text.push('\n');
                text.push_str(&details);
            }
        }

        text
    }

    fn hex_bytes(&self, insn: &Instruction) -> String {
        let mut bytes = vec![0u8; insn.size];

        if let Err(e) = self.process.read_bytes(insn.address, &mut bytes) {
            tracing::trace!(error = %e, "instruction bytes unreadable");
            bytes.fill(0);
        }

        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn push_telescoped(line: &mut Line, telescoped: &Telescoped) {
    match telescoped {
        Telescoped::Disassembled {
            mnemonic,
            operands,
            location,
        } => {
            line.push(mnemonic, line::MNEMONIC);

            if !operands.is_empty() {
                line.push_plain(" ");
                line.push_operands(operands);
            }

            if let Some(location) = location {
                line.push_plain(" ");
                line.push(&format!("({location})"), line::LOCATION);
            }
        }
        Telescoped::StringLiteral(s) => line.push(&format!("{s:?}"), line::STRING),
        Telescoped::RawPointer(ptr) => line.push(&format!("{ptr:#x}"), line::NUMBER),
    }
}

impl fmt::Display for Telescoped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = Line::new(false);
        push_telescoped(&mut line, self);
        f.write_str(&line.finish())
    }
}
