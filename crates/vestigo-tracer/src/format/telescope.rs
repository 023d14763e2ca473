use crate::engine::{Decoder, Instruction, MAX_INSTRUCTION_LEN, Process};
use crate::error::MemoryError;

/// Maximum number of bytes read when looking for a string.
pub const MAX_STRING_LEN: usize = 128;

/// What a pointer value was found to point at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Telescoped {
    /// The pointer targets an instruction.
    Disassembled {
        /// Mnemonic of the targeted instruction.
        mnemonic: String,

        /// Operands of the targeted instruction.
        operands: String,

        /// Location of the instruction within its backing file, as
        /// `file#offset`.
        location: Option<String>,
    },

    /// The pointer targets a printable string (newlines collapsed).
    StringLiteral(String),

    /// The pointer targets another pointer.
    RawPointer(u64),
}

/// Resolver of pointer values, for diagnostic display.
///
/// Every failure (unmapped memory, undecodable bytes) is recovered into an
/// unresolved pointer.
#[derive(Clone, Copy)]
pub struct Telescoper<'a> {
    process: &'a dyn Process,
    decoder: &'a dyn Decoder,
}

impl<'a> Telescoper<'a> {
    /// Creates a new [Telescoper].
    pub const fn new(process: &'a dyn Process, decoder: &'a dyn Decoder) -> Self {
        Self { process, decoder }
    }

    /// Resolves what `addr` points at.
    ///
    /// When `is_control_transfer` is set, `addr` is expected to be a code
    /// address. Otherwise it is first tried as a string, then as a pointer.
    pub fn resolve(&self, addr: u64, is_control_transfer: bool) -> Option<Telescoped> {
        let range = self.process.find_memory_range_by_address(addr)?;

        if is_control_transfer {
            let insn = decode_at(self.process, self.decoder, addr)
                .inspect_err(|e| tracing::trace!(error = %e, "not an instruction"))
                .ok()?;

            let location = range.file.map(|file| {
                let offset = addr.wrapping_sub(range.range.start);
                format!("{}#{offset:#x}", file.file_name())
            });

            return Some(Telescoped::Disassembled {
                mnemonic: insn.mnemonic,
                operands: insn.op_str,
                location,
            });
        }

        self.read_string(addr)
            .map(Telescoped::StringLiteral)
            .or_else(|| {
                self.process
                    .read_pointer(addr)
                    .inspect_err(|e| tracing::trace!(error = %e, "not a pointer"))
                    .ok()
                    .map(Telescoped::RawPointer)
            })
    }

    fn read_string(&self, addr: u64) -> Option<String> {
        let s = self
            .process
            .read_c_string(addr, MAX_STRING_LEN)
            .inspect_err(|e| tracing::trace!(error = %e, "not a string"))
            .ok()?
            .replace(['\n', '\r'], " ");

        let is_printable = s
            .chars()
            .all(|c| c == '\t' || !(c.is_control() || c == char::REPLACEMENT_CHARACTER));

        (!s.is_empty() && is_printable).then_some(s)
    }
}

/// Reads and decodes the instruction located at `addr`.
///
/// The read is clamped to the end of the memory range containing `addr`, so
/// instructions lying right before an unmapped page can still be decoded.
pub(crate) fn decode_at(
    process: &dyn Process,
    decoder: &dyn Decoder,
    addr: u64,
) -> Result<Instruction, DecodeOrMemoryError> {
    let code = read_code(process, addr)?;
    Ok(decoder.decode(addr, &code)?)
}

fn read_code(process: &dyn Process, addr: u64) -> Result<Vec<u8>, MemoryError> {
    let mut code = vec![0u8; MAX_INSTRUCTION_LEN];

    if process.read_bytes(addr, &mut code).is_ok() {
        return Ok(code);
    }

    let available = process
        .find_memory_range_by_address(addr)
        .map(|range| range.range.end.saturating_sub(addr))
        .unwrap_or_default()
        .min(MAX_INSTRUCTION_LEN as u64) as usize;

    if available == 0 {
        return Err(MemoryError::InvalidAccess {
            addr,
            len: MAX_INSTRUCTION_LEN,
        });
    }

    code.truncate(available);
    process.read_bytes(addr, &mut code)?;

    Ok(code)
}

/// Failure to read or decode an instruction.
#[derive(thiserror::Error, Debug)]
pub(crate) enum DecodeOrMemoryError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Decode(#[from] crate::error::DecodeError),
}
