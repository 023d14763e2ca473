mod builder;
mod registry;
mod state;
mod trampoline;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub use self::builder::Builder;
use self::builder::NeedsEngine;
pub use self::registry::LiveInstructionRegistry;
use self::state::{DetachReason, Session, SessionState, Status};
pub use self::trampoline::{TRAMPOLINE_MAX_DISTANCE, TrampolineGate};
use crate::engine::{Callout, CodeTransform, Console, Decoder, Engine, EntryHook};
use crate::engine::{InstrumentDecision, Process, RegisterSnapshot};
use crate::error::{EngineError, HandlerError};
use crate::filter::ModuleFilter;
use crate::format::{Formatter, decode_at};
use crate::handler::{DynHandler, Hit, TraceHandler};

/// Instruction tracer driving an instrumentation engine.
///
/// At most one thread is traced at a time. A trace starts when a thread
/// reaches the address given to [attach](Self::attach), and stops on
/// [detach](Self::detach) or when the instruction limit is reached.
///
/// The session is a cheap handle: clones refer to the same tracer, which
/// allows a [TraceHandler] to stop the trace it is part of.
pub struct TraceSession<E> {
    inner: Arc<Controller<E>>,
}

impl<E> Clone for TraceSession<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TraceSession<()> {
    /// Creates a trace session builder.
    pub const fn builder() -> Builder<NeedsEngine> {
        Builder::new()
    }
}

impl<E: Engine + 'static> TraceSession<E> {
    /// Arms a trace starting at `target`.
    ///
    /// The first thread reaching `target` gets traced, and every instruction
    /// it then executes is reported to `handler` (except the ones belonging
    /// to excluded modules).
    ///
    /// [AttachStatus::AlreadyTracing] is returned (and nothing is armed) if a
    /// thread is currently being traced.
    #[tracing::instrument(name = "Attach", skip(self, handler))]
    pub fn attach<H>(
        &self,
        target: u64,
        handler: H,
        options: AttachOptions,
    ) -> crate::Result<AttachStatus, E::Error>
    where
        H: TraceHandler + 'static,
    {
        if let SessionStatus::Active { thread_id, .. } = self.status() {
            tracing::info!(thread_id, "already tracing");
            return Ok(AttachStatus::AlreadyTracing);
        }

        let controller = Arc::downgrade(&self.inner);
        let mut pending = Some(PendingAttach {
            handler: Box::new(handler),
            options,
        });

        let hook: EntryHook = Box::new(move |regs: &RegisterSnapshot| {
            let Some(controller) = controller.upgrade() else {
                return;
            };

            controller.engine.revert_entry(target);

            if let Some(pending) = pending.take() {
                controller.start(regs, pending);
            }
        });

        self.inner
            .engine
            .intercept_at_entry(target, hook)
            .map_err(EngineError)?;

        tracing::info!(entry = format_args!("{target:#x}"), "armed");

        Ok(AttachStatus::Started)
    }

    /// Stops the current trace, if any.
    ///
    /// This may be called from within a [TraceHandler]. Callouts still pending
    /// for the stopped trace are ignored.
    pub fn detach(&self) {
        let session = match &*self.inner.state() {
            SessionState::Active(session) => Arc::clone(session),
            SessionState::Idle => return,
        };

        self.inner.end(&session, DetachReason::User);
    }

    /// Returns the status of the tracer.
    pub fn status(&self) -> SessionStatus {
        match &*self.inner.state() {
            SessionState::Idle => SessionStatus::Idle,
            SessionState::Active(session) => SessionStatus::Active {
                thread_id: session.thread_id,
                start_address: session.start_address,
                instruction_count: session.progress().count,
                instruction_limit: session.instruction_limit,
            },
        }
    }
}

/// Options of a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachOptions {
    /// Maximum number of instructions to trace (unbounded if `None`).
    pub instruction_limit: Option<usize>,

    /// Name patterns of the modules which must not be traced.
    ///
    /// A module is excluded if its name contains any of them.
    pub module_exclusions: Vec<String>,
}

/// Outcome of [TraceSession::attach].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttachStatus {
    /// The trace is armed.
    Started = 0,

    /// Another thread is being traced.
    AlreadyTracing = 1,
}

impl AttachStatus {
    /// Numeric code of the status.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Status of a [TraceSession].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No thread is being traced.
    Idle,

    /// A thread is being traced.
    Active {
        /// ID of the traced thread.
        thread_id: u64,

        /// Address at which the trace started.
        start_address: u64,

        /// Number of instructions instrumented so far.
        instruction_count: usize,

        /// Maximum number of instructions to trace.
        instruction_limit: Option<usize>,
    },
}

struct PendingAttach {
    handler: Box<dyn DynHandler>,
    options: AttachOptions,
}

struct Controller<E> {
    engine: E,
    process: Box<dyn Process>,
    decoder: Box<dyn Decoder>,
    console: Box<dyn Console>,
    state: Mutex<SessionState>,
}

impl<E: Engine + 'static> Controller<E> {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        matches!(*self.state(), SessionState::Active(_))
    }

    /// Starts tracing the thread which reached an armed entry.
    fn start(self: &Arc<Self>, regs: &RegisterSnapshot, pending: PendingAttach) {
        let thread_id = self.process.current_thread_id();
        let start_address = regs.pc();

        if self.is_active() {
            tracing::warn!(thread_id, "another thread is being traced, entry ignored");
            return;
        }

        let PendingAttach { handler, options } = pending;

        let filter = ModuleFilter::new(options.module_exclusions, self.process.modules());

        let controller = Arc::downgrade(self);
        let subscription = self.process.subscribe_module_load(Box::new(move || {
            if let Some(controller) = controller.upgrade() {
                controller.rebuild_filter();
            }
        }));

        let session = Arc::new(Session::new(
            thread_id,
            start_address,
            options.instruction_limit,
            subscription,
            filter,
            handler,
        ));

        {
            let mut state = self.state();

            if let SessionState::Active(_) = *state {
                drop(state);
                tracing::warn!(thread_id, "another thread is being traced, entry ignored");
                self.process.unsubscribe_module_load(subscription);
                return;
            }

            *state = SessionState::Active(Arc::clone(&session));
        }

        tracing::info!(
            thread_id,
            start = format_args!("{start_address:#x}"),
            "thread acquired"
        );

        let transform = SessionTransform {
            controller: Arc::downgrade(self),
            session: Arc::clone(&session),
            skip_rest: false,
        };

        if let Err(e) = self.engine.follow_thread(thread_id, Box::new(transform)) {
            tracing::error!(thread_id, error = %e, "failed to follow thread");
            self.end(&session, DetachReason::FollowFailed);
        }
    }

    /// Ends the given session.
    ///
    /// This is a no-op (beside updating the session status) if the session
    /// was already detached.
    fn end(&self, session: &Arc<Session>, reason: DetachReason) {
        let mut state = self.state();

        {
            let mut progress = session.progress();

            if progress.status == Status::Tracing || reason.status() == Status::Cancelled {
                progress.status = reason.status();
            }

            if progress.status == Status::Cancelled {
                session.registry().clear();
            }
        }

        let is_current =
            matches!(&*state, SessionState::Active(active) if Arc::ptr_eq(active, session));

        if !is_current {
            return;
        }

        *state = SessionState::Idle;
        drop(state);

        self.engine.unfollow_thread(session.thread_id);
        self.process.unsubscribe_module_load(session.subscription);

        tracing::info!(thread_id = session.thread_id, %reason, "detached");
    }

    fn rebuild_filter(&self) {
        let session = match &*self.state() {
            SessionState::Active(session) => Arc::clone(session),
            SessionState::Idle => return,
        };

        session.filter.rebuild(self.process.modules());
    }

    /// Handles the callout of an instrumented instruction.
    fn dispatch(
        &self,
        session: &Arc<Session>,
        regs: &RegisterSnapshot,
    ) -> Result<(), HandlerError> {
        let pc = regs.pc();

        let (status, was_pending) = {
            let progress = session.progress();
            let was_pending = progress.status != Status::Cancelled && session.registry().take(pc);
            (progress.status, was_pending)
        };

        if !was_pending {
            match status {
                Status::Tracing => self.abort(session, pc),
                Status::Exhausted | Status::Cancelled => {
                    tracing::trace!(pc = format_args!("{pc:#x}"), ?status, "callout ignored");
                }
            }
            return Ok(());
        }

        let insn = match decode_at(&*self.process, &*self.decoder, pc) {
            Ok(insn) => insn,
            Err(e) => {
                tracing::warn!(
                    pc = format_args!("{pc:#x}"),
                    error = %e,
                    "failed to decode traced instruction"
                );
                return Ok(());
            }
        };

        tracing::trace!(pc = format_args!("{pc:#x}"), mnemonic = %insn.mnemonic, "dispatch");

        let formatter = Formatter::new(&*self.process, &*self.decoder, &session.filter);
        let detach = || self.end(session, DetachReason::User);
        let hit = Hit::new(&insn, regs, formatter, &*self.console, &detach);

        session.handler().instruction_traced(&hit)
    }

    /// Aborts a session which received a callout it never asked for.
    fn abort(&self, session: &Arc<Session>, pc: u64) {
        tracing::error!(
            thread_id = session.thread_id,
            pc = format_args!("{pc:#x}"),
            "callout for an address which was not instrumented"
        );

        self.console.write_line(&format!(
            "trace aborted: unexpected callout at {pc:#x} (thread {})",
            session.thread_id
        ));

        self.end(session, DetachReason::ProtocolViolation);
    }
}

/// Per-thread instrumentation decision of a session.
struct SessionTransform<E> {
    controller: Weak<Controller<E>>,
    session: Arc<Session>,

    /// Set once an excluded instruction was seen in the current block.
    skip_rest: bool,
}

impl<E: Engine + 'static> SessionTransform<E> {
    fn callout(&self) -> Callout {
        let controller = Weak::clone(&self.controller);
        let session = Arc::clone(&self.session);

        Callout::new(move |regs| match controller.upgrade() {
            Some(controller) => controller.dispatch(&session, regs),
            None => Ok(()),
        })
    }

    fn end(&self, reason: DetachReason) {
        if let Some(controller) = self.controller.upgrade() {
            controller.end(&self.session, reason);
        }
    }
}

impl<E: Engine + 'static> CodeTransform for SessionTransform<E> {
    fn begin_block(&mut self, _block_addr: u64) {
        self.skip_rest = false;
    }

    fn transform(&mut self, addr: u64) -> InstrumentDecision {
        if self.skip_rest {
            return InstrumentDecision::Keep;
        }

        let mut progress = self.session.progress();

        if progress.status != Status::Tracing {
            return InstrumentDecision::Keep;
        }

        if !progress.gate.observe(addr) {
            tracing::trace!(addr = format_args!("{addr:#x}"), "trampoline");
            return InstrumentDecision::Keep;
        }

        if self.session.filter.is_excluded(addr) {
            tracing::trace!(
                addr = format_args!("{addr:#x}"),
                "excluded, skipping rest of block"
            );
            self.skip_rest = true;
            return InstrumentDecision::Keep;
        }

        let limit = self.session.instruction_limit;

        if limit.is_some_and(|limit| progress.count >= limit) {
            drop(progress);
            self.end(DetachReason::LimitReached);
            return InstrumentDecision::Keep;
        }

        self.session.registry().insert(addr);
        progress.count += 1;

        let limit_reached = limit.is_some_and(|limit| progress.count >= limit);
        drop(progress);

        tracing::trace!(addr = format_args!("{addr:#x}"), "instrumented");

        if limit_reached {
            self.end(DetachReason::LimitReached);
        }

        InstrumentDecision::Callout(self.callout())
    }
}
