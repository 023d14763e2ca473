//! This crate allows to trace the instructions executed by a thread, on top
//! of a dynamic instrumentation engine.
//!
//! Three main components are provided:
//! - A trace session, driving the instrumentation engine so that every
//!   instruction executed by the traced thread (outside of excluded modules)
//!   is reported.
//! - A trait to implement a custom trace handler, consuming the traced
//!   instructions.
//! - A formatter, rendering traced instructions as aligned text lines with
//!   optional colors and register details.
//!
//! # Tracing a function
//!
//! The [TraceHandler](self::handler::TraceHandler) trait allows to define
//! custom logic for handling traced instructions.
//!
//! ```no_run
//! use vestigo_tracer::engine::{Console, Decoder, Engine, Process};
//! use vestigo_tracer::format::PrintOptions;
//! use vestigo_tracer::handler::{Hit, TraceHandler};
//! use vestigo_tracer::tracer::{AttachOptions, TraceSession};
//!
//! fn trace_function<E: Engine + 'static>(
//!     engine: E,
//!     process: impl Process + 'static,
//!     decoder: impl Decoder + 'static,
//!     console: impl Console + 'static,
//!     function_addr: u64,
//! ) -> vestigo_tracer::Result<(), E::Error> {
//!     // initialize the trace session
//!     let session = TraceSession::builder()
//!         .with_engine(engine)
//!         .with_process(process)
//!         .with_decoder(decoder)
//!         .with_console(console)
//!         .build();
//!
//!     // trace the first 100 instructions executed from `function_addr`,
//!     // leaving libc out
//!     let options = AttachOptions {
//!         instruction_limit: Some(100),
//!         module_exclusions: vec!["libc".to_owned()],
//!     };
//!
//!     session.attach(function_addr, Printer, options)?;
//!
//!     Ok(())
//! }
//!
//! struct Printer;
//!
//! impl TraceHandler for Printer {
//!     type Error = std::convert::Infallible;
//!
//!     fn instruction_traced(&mut self, hit: &Hit<'_>) -> Result<(), Self::Error> {
//!         hit.print(&PrintOptions::default().details(true));
//!         Ok(())
//!     }
//! }
//! ```
//!
//! # Plugging an instrumentation engine
//!
//! The [Engine](self::engine::Engine), [Process](self::engine::Process) and
//! [Decoder](self::engine::Decoder) traits describe what the tracer expects
//! from its environment: intercepting a function entry and rewriting the
//! code of a followed thread, introspecting the traced process, and
//! disassembling its code.
//!
//! The `vestigo-capstone` crate provides a [Decoder](self::engine::Decoder)
//! backed by Capstone.

/// Module containing traits for plugging an instrumentation engine.
pub mod engine;

mod error;

/// Module implementing the module-based exclusion filter.
pub mod filter;

/// Module implementing the rendering of traced instructions.
pub mod format;

/// Module containing traits for handling traced instructions.
pub mod handler;

/// Module implementing the trace session.
pub mod tracer;

pub use self::error::{DecodeError, EngineError, Error, HandlerError, MemoryError, Result};
