/// Instrumentation engine error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct EngineError<E>(pub E);

/// Trace handler error.
///
/// This is what a [Callout](crate::engine::Callout) hands back to the
/// instrumentation engine when the user handler fails. The tracer never
/// swallows it.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct HandlerError(pub Box<dyn std::error::Error + Send + Sync>);

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error<E> {
    /// An instrumentation engine error occurred.
    #[error(transparent)]
    Engine(#[from] EngineError<E>),
}

/// Result type of this crate.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error returned when reading the traced process' memory.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The memory range is not mapped, or not readable.
    #[error("invalid memory access at {addr:#x} ({len} bytes)")]
    InvalidAccess {
        /// Start address of the access.
        addr: u64,

        /// Length of the access.
        len: usize,
    },

    /// No null terminator was found within the readable range.
    #[error("unterminated string at {0:#x}")]
    Unterminated(u64),
}

/// Error returned when decoding an instruction.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes do not encode a valid instruction.
    #[error("invalid instruction at {addr:#x}")]
    Invalid {
        /// Address of the instruction.
        addr: u64,
    },

    /// The disassembler backend failed.
    #[error("disassembler failure at {addr:#x}: {message}")]
    Backend {
        /// Address of the instruction.
        addr: u64,

        /// Message reported by the backend.
        message: String,
    },
}
