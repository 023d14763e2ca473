use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::registry::LiveInstructionRegistry;
use super::trampoline::TrampolineGate;
use crate::engine::SubscriptionId;
use crate::filter::ModuleFilter;
use crate::handler::DynHandler;

/// State of the trace controller.
pub(super) enum SessionState {
    Idle,
    Active(Arc<Session>),
}

/// Trace session owning a thread.
///
/// The session outlives its detach for as long as the engine holds callouts
/// referring to it.
pub(super) struct Session {
    pub thread_id: u64,
    pub start_address: u64,
    pub instruction_limit: Option<usize>,
    pub subscription: SubscriptionId,
    pub filter: ModuleFilter,
    progress: Mutex<Progress>,
    registry: Mutex<LiveInstructionRegistry>,
    handler: Mutex<Box<dyn DynHandler>>,
}

impl Session {
    pub fn new(
        thread_id: u64,
        start_address: u64,
        instruction_limit: Option<usize>,
        subscription: SubscriptionId,
        filter: ModuleFilter,
        handler: Box<dyn DynHandler>,
    ) -> Self {
        Self {
            thread_id,
            start_address,
            instruction_limit,
            subscription,
            filter,
            progress: Mutex::new(Progress {
                gate: TrampolineGate::new(start_address),
                count: 0,
                status: Status::Tracing,
            }),
            registry: Mutex::new(LiveInstructionRegistry::new()),
            handler: Mutex::new(handler),
        }
    }

    pub fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> MutexGuard<'_, LiveInstructionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handler(&self) -> MutexGuard<'_, Box<dyn DynHandler>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mutable progress of a session.
pub(super) struct Progress {
    pub gate: TrampolineGate,
    pub count: usize,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Status {
    /// Instructions are being instrumented.
    Tracing,

    /// The instruction limit was reached. Callouts already emitted are still
    /// delivered.
    Exhausted,

    /// The session was detached. Pending callouts are ignored.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DetachReason {
    User,
    LimitReached,
    ProtocolViolation,
    FollowFailed,
}

impl DetachReason {
    /// Status of a session detached for this reason.
    pub const fn status(self) -> Status {
        match self {
            Self::LimitReached => Status::Exhausted,
            Self::User | Self::ProtocolViolation | Self::FollowFailed => Status::Cancelled,
        }
    }
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user request",
            Self::LimitReached => "limit reached",
            Self::ProtocolViolation => "protocol violation",
            Self::FollowFailed => "thread follow failed",
        })
    }
}
