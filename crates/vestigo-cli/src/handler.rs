use std::convert::Infallible;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

use vestigo_tracer::engine::Console;
use vestigo_tracer::format::PrintOptions;
use vestigo_tracer::handler::{Hit, TraceHandler};

/// Trace handler printing every traced instruction.
pub struct PrintingHandler {
    options: PrintOptions,
    annotate: bool,
    hits: usize,
}

impl PrintingHandler {
    /// Initializes the handler with the given print options.
    ///
    /// If `annotate` is set, each line is annotated with its hit index
    /// (overriding the annotation of `options`).
    pub const fn new(options: PrintOptions, annotate: bool) -> Self {
        Self {
            options,
            annotate,
            hits: 0,
        }
    }
}

impl TraceHandler for PrintingHandler {
    type Error = Infallible;

    fn instruction_traced(&mut self, hit: &Hit<'_>) -> Result<(), Self::Error> {
        if self.annotate {
            self.options.annotation = self.hits.to_string();
        }

        hit.print(&self.options);
        self.hits += 1;

        Ok(())
    }
}

/// Console writing lines to an output stream.
pub struct WriterConsole<W> {
    output: Mutex<W>,
}

impl<W> WriterConsole<W> {
    /// Wraps the given output stream.
    pub const fn new(output: W) -> Self {
        Self {
            output: Mutex::new(output),
        }
    }

    /// Returns the inner output stream.
    pub fn into_inner(self) -> W {
        self.output
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> Console for WriterConsole<W> {
    fn write_line(&self, line: &str) {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = writeln!(output, "{line}") {
            tracing::warn!(error = %e, "failed to write trace line");
        }
    }
}
