use crate::engine::{Console, Instruction, RegisterSnapshot};
use crate::error::HandlerError;
use crate::format::{Formatter, PrintOptions};

/// Trait for implementing a trace handler.
///
/// The handler runs synchronously on the traced thread, right before the
/// traced instruction executes. The traced thread is stalled until it
/// returns.
pub trait TraceHandler: Send {
    /// Error returned by this handler.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Function called when a traced instruction is about to execute.
    ///
    /// Returning an error does not stop the trace: the error is handed back
    /// to the instrumentation engine.
    fn instruction_traced(&mut self, hit: &Hit<'_>) -> Result<(), Self::Error>;
}

/// Type-erased [TraceHandler], as stored by a trace session.
pub(crate) trait DynHandler: Send {
    fn instruction_traced(&mut self, hit: &Hit<'_>) -> Result<(), HandlerError>;
}

impl<H: TraceHandler> DynHandler for H {
    fn instruction_traced(&mut self, hit: &Hit<'_>) -> Result<(), HandlerError> {
        TraceHandler::instruction_traced(self, hit).map_err(|e| HandlerError(Box::new(e)))
    }
}

/// Traced instruction, as handed to a [TraceHandler].
pub struct Hit<'a> {
    instruction: &'a Instruction,
    context: &'a RegisterSnapshot,
    formatter: Formatter<'a>,
    console: &'a dyn Console,
    detach: &'a dyn Fn(),
}

impl<'a> Hit<'a> {
    pub(crate) const fn new(
        instruction: &'a Instruction,
        context: &'a RegisterSnapshot,
        formatter: Formatter<'a>,
        console: &'a dyn Console,
        detach: &'a dyn Fn(),
    ) -> Self {
        Self {
            instruction,
            context,
            formatter,
            console,
            detach,
        }
    }

    /// Instruction about to execute.
    pub const fn instruction(&self) -> &Instruction {
        self.instruction
    }

    /// Registers of the traced thread.
    pub const fn context(&self) -> &RegisterSnapshot {
        self.context
    }

    /// Renders the instruction as text.
    pub fn render(&self, options: &PrintOptions) -> String {
        self.formatter
            .render(self.instruction, self.context, options)
    }

    /// Writes the rendered instruction to the console.
    pub fn print(&self, options: &PrintOptions) {
        self.console.write_line(&self.render(options));
    }

    /// Stops the trace this instruction belongs to.
    ///
    /// The current handler call runs to completion, but no further
    /// instruction is reported.
    pub fn detach(&self) {
        (self.detach)()
    }
}
