mod decoder;
mod process;
mod registers;

use std::sync::Arc;

pub use self::decoder::{Decoder, Instruction, InstructionGroup, MAX_INSTRUCTION_LEN, Operand};
pub use self::process::{FileMapping, MemoryRange, Module, ModuleLoadCallback, Process};
pub use self::process::SubscriptionId;
pub use self::registers::{Register, RegisterSnapshot};
use crate::error::HandlerError;

/// Hook invoked by the engine when execution reaches an intercepted address.
///
/// The snapshot describes the registers of the thread reaching the address.
pub type EntryHook = Box<dyn FnMut(&RegisterSnapshot) + Send>;

/// Trait implementing the instrumentation logic of a dynamic instrumentation
/// engine.
///
/// The engine rewrites the code executed by a followed thread, one block at
/// a time. Before a block gets executed, each of its instructions is proposed
/// to the [CodeTransform] of the thread, which decides whether a [Callout]
/// must run right before the instruction.
pub trait Engine: Send + Sync {
    /// Error returned by this trait.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Installs a hook at the given address.
    ///
    /// The hook stays installed until [revert_entry](Self::revert_entry) is
    /// called, and may be invoked concurrently by several threads.
    fn intercept_at_entry(&self, addr: u64, hook: EntryHook) -> Result<(), Self::Error>;

    /// Removes the hook installed at the given address.
    ///
    /// This may be called from within the hook itself.
    fn revert_entry(&self, addr: u64);

    /// Starts following the execution of the given thread.
    ///
    /// Every block compiled for the thread goes through `transform`.
    fn follow_thread(
        &self,
        thread_id: u64,
        transform: Box<dyn CodeTransform>,
    ) -> Result<(), Self::Error>;

    /// Stops following the execution of the given thread.
    ///
    /// This may be called from within a callout or a transform, in which case
    /// the current block still runs to completion.
    fn unfollow_thread(&self, thread_id: u64);
}

/// Trait implementing the per-instruction instrumentation decision.
pub trait CodeTransform: Send {
    /// Function called when the engine starts compiling a new block.
    fn begin_block(&mut self, _block_addr: u64) {}

    /// Function called for every instruction of the block being compiled, in
    /// order.
    fn transform(&mut self, addr: u64) -> InstrumentDecision;
}

/// Instrumentation decision for a single instruction.
///
/// The instruction is kept in the executable stream either way.
pub enum InstrumentDecision {
    /// Keep the instruction unmodified.
    Keep,

    /// Invoke the callout right before executing the instruction.
    Callout(Callout),
}

impl InstrumentDecision {
    /// Returns whether a callout is attached to the instruction.
    pub const fn is_callout(&self) -> bool {
        matches!(self, Self::Callout(_))
    }
}

impl std::fmt::Debug for InstrumentDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keep => f.write_str("Keep"),
            Self::Callout(_) => f.write_str("Callout"),
        }
    }
}

type CalloutFn = dyn Fn(&RegisterSnapshot) -> Result<(), HandlerError> + Send + Sync;

/// Function to invoke right before an instrumented instruction executes.
#[derive(Clone)]
pub struct Callout(Arc<CalloutFn>);

impl Callout {
    /// Wraps the given function into a callout.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RegisterSnapshot) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invokes the callout with the register state of the executing thread.
    ///
    /// Errors come from the trace handler and must be surfaced by the engine.
    pub fn invoke(&self, regs: &RegisterSnapshot) -> Result<(), HandlerError> {
        (self.0)(regs)
    }
}

/// Trait for implementing the line-oriented output of the tracer.
pub trait Console: Send + Sync {
    /// Writes a single line (possibly spanning several physical lines).
    fn write_line(&self, line: &str);
}

impl<C: Console + ?Sized> Console for Arc<C> {
    fn write_line(&self, line: &str) {
        (**self).write_line(line)
    }
}
