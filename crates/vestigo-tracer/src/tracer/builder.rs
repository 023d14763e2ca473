use std::sync::{Arc, Mutex};

use super::state::SessionState;
use super::{Controller, TraceSession};
use crate::engine::{Console, Decoder, Engine, Process};

/// Builder for [TraceSession].
///
/// It is usually created by calling [TraceSession::builder], and allows to
/// specify the instrumentation engine and the introspection services used
/// for tracing.
pub struct Builder<S> {
    state: S,
}

impl Builder<NeedsEngine> {
    pub(super) const fn new() -> Self {
        Self { state: NeedsEngine }
    }
}

impl Builder<NeedsEngine> {
    /// Specifies the instrumentation engine running the traced code.
    pub const fn with_engine<E: Engine>(self, engine: E) -> Builder<NeedsProcess<E>> {
        Builder {
            state: NeedsProcess { engine },
        }
    }
}

impl<E: Engine> Builder<NeedsProcess<E>> {
    /// Specifies the introspection service of the traced process.
    pub fn with_process<P>(self, process: P) -> Builder<NeedsDecoder<E>>
    where
        P: Process + 'static,
    {
        Builder {
            state: NeedsDecoder {
                engine: self.state.engine,
                process: Box::new(process),
            },
        }
    }
}

impl<E: Engine> Builder<NeedsDecoder<E>> {
    /// Specifies the disassembler of the traced code.
    pub fn with_decoder<D>(self, decoder: D) -> Builder<NeedsConsole<E>>
    where
        D: Decoder + 'static,
    {
        Builder {
            state: NeedsConsole {
                engine: self.state.engine,
                process: self.state.process,
                decoder: Box::new(decoder),
            },
        }
    }
}

impl<E: Engine> Builder<NeedsConsole<E>> {
    /// Specifies the console that printed instructions are written to.
    pub fn with_console<C>(self, console: C) -> Builder<ReadyToBuild<E>>
    where
        C: Console + 'static,
    {
        Builder {
            state: ReadyToBuild {
                engine: self.state.engine,
                process: self.state.process,
                decoder: self.state.decoder,
                console: Box::new(console),
            },
        }
    }
}

impl<E: Engine> Builder<ReadyToBuild<E>> {
    /// Builds the trace session.
    pub fn build(self) -> TraceSession<E> {
        TraceSession {
            inner: Arc::new(Controller {
                engine: self.state.engine,
                process: self.state.process,
                decoder: self.state.decoder,
                console: self.state.console,
                state: Mutex::new(SessionState::Idle),
            }),
        }
    }
}

pub struct NeedsEngine;

pub struct NeedsProcess<E> {
    engine: E,
}

pub struct NeedsDecoder<E> {
    engine: E,
    process: Box<dyn Process>,
}

pub struct NeedsConsole<E> {
    engine: E,
    process: Box<dyn Process>,
    decoder: Box<dyn Decoder>,
}

pub struct ReadyToBuild<E> {
    engine: E,
    process: Box<dyn Process>,
    decoder: Box<dyn Decoder>,
    console: Box<dyn Console>,
}
