//! In-process replay of a raw code image.
//!
//! The replay does not emulate instructions: execution goes through the image
//! linearly, following only unconditional direct jumps, which is enough to
//! drive a trace session the way a dynamic instrumentation engine would.

mod image;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use byteorder::{ByteOrder, LittleEndian};
use vestigo_capstone::{Arch, CapstoneDecoder};
use vestigo_tracer::engine::{CodeTransform, Decoder, Engine, EntryHook, Instruction};
use vestigo_tracer::engine::{InstrumentDecision, MAX_INSTRUCTION_LEN, Process, Register};
use vestigo_tracer::engine::RegisterSnapshot;
use vestigo_tracer::{DecodeError, HandlerError, MemoryError};

pub use self::image::{ImageProcess, REPLAY_THREAD_ID};

/// Single-threaded instrumentation engine replaying an [ImageProcess].
#[derive(Clone)]
pub struct ReplayEngine {
    inner: Arc<Inner>,
}

struct Inner {
    process: Arc<ImageProcess>,
    decoder: CapstoneDecoder,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    hooks: HashMap<u64, EntryHook>,
    reverted: HashSet<u64>,
    transforms: HashMap<u64, Box<dyn CodeTransform>>,
    unfollowed: u64,
}

impl ReplayEngine {
    /// Creates a new engine replaying `process`.
    pub fn new(process: Arc<ImageProcess>, decoder: CapstoneDecoder) -> Self {
        Self {
            inner: Arc::new(Inner {
                process,
                decoder,
                state: Mutex::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_following(&self, thread_id: u64) -> bool {
        self.state().transforms.contains_key(&thread_id)
    }

    /// Replays the image from `start`, with `regs` as register state.
    ///
    /// The replay stops when the thread stops being followed, on the first
    /// `ret`, when leaving the mapped memory, or after `max_steps` executed
    /// instructions.
    #[tracing::instrument(name = "Replay", skip_all, fields(start = %format_args!("{start:#x}")))]
    pub fn replay(
        &self,
        start: u64,
        regs: &RegisterSnapshot,
        max_steps: usize,
    ) -> Result<ReplayOutcome, ReplayError> {
        let thread_id = self.inner.process.current_thread_id();

        let mut pc = start;
        let mut steps = 0;
        let mut was_followed = self.is_following(thread_id);

        let stop = loop {
            if steps >= max_steps {
                break StopReason::MaxSteps;
            }

            if self.fire_hook(pc, regs) {
                pc = self.relocate(pc)?;
                was_followed |= self.is_following(thread_id);
                continue;
            }

            let block = self.decode_block(pc);

            let Some(last) = block.last() else {
                break if self.inner.process.find_memory_range_by_address(pc).is_some() {
                    StopReason::Undecodable(pc)
                } else {
                    StopReason::EndOfCode(pc)
                };
            };

            let decisions = self.compile(thread_id, &block);

            for (insn, decision) in block.iter().zip(decisions) {
                if steps >= max_steps {
                    break;
                }
                steps += 1;

                if let InstrumentDecision::Callout(callout) = decision {
                    callout.invoke(&self.snapshot(insn.address, regs))?;
                }
            }

            if steps >= max_steps {
                break StopReason::MaxSteps;
            }

            if was_followed && !self.is_following(thread_id) {
                break StopReason::Unfollowed;
            }

            if last.is_return() {
                break StopReason::Returned(last.address);
            }

            pc = match last.immediate_target() {
                Some(target) if is_unconditional_jump(last) => target,
                _ => last.next_address(),
            };
        };

        tracing::debug!(steps, ?stop, "replay stopped");

        Ok(ReplayOutcome { steps, stop })
    }

    /// Invokes the hook installed at `addr`, if any.
    fn fire_hook(&self, addr: u64, regs: &RegisterSnapshot) -> bool {
        let Some(mut hook) = self.state().hooks.remove(&addr) else {
            return false;
        };
        self.state().reverted.remove(&addr);

        tracing::trace!(addr = format_args!("{addr:#x}"), "entry hook");

        hook(&self.snapshot(addr, regs));

        let mut state = self.state();
        if !state.reverted.contains(&addr) {
            state.hooks.insert(addr, hook);
        }

        true
    }

    /// Relocates the instruction at `addr` into the stub region, followed by
    /// a jump back to the next instruction.
    ///
    /// It returns the address of the relocated instruction.
    fn relocate(&self, addr: u64) -> Result<u64, ReplayError> {
        let process = &self.inner.process;
        let stub = process.stub_range().start;

        let insn = self
            .decode(addr)
            .map_err(|e| ReplayError::Relocation { addr, source: e })?;

        let mut code = vec![0u8; insn.size];
        process.read_bytes(addr, &mut code)?;

        let jump_addr = stub + code.len() as u64;
        let jump = encode_jump(self.inner.decoder.arch(), jump_addr, insn.next_address())
            .ok_or(ReplayError::OutOfRange { addr })?;

        code.extend_from_slice(&jump);
        process.write_stub(&code)?;

        tracing::trace!(
            addr = format_args!("{addr:#x}"),
            stub = format_args!("{stub:#x}"),
            "instruction relocated"
        );

        Ok(stub)
    }

    fn decode(&self, addr: u64) -> Result<Instruction, DecodeError> {
        let process = &self.inner.process;

        let available = process
            .find_memory_range_by_address(addr)
            .map(|range| range.range.end.saturating_sub(addr))
            .unwrap_or_default()
            .min(MAX_INSTRUCTION_LEN as u64) as usize;

        let mut code = vec![0u8; available];
        if process.read_bytes(addr, &mut code).is_err() {
            code.clear();
        }

        self.inner.decoder.decode(addr, &code)
    }

    /// Decodes the block starting at `addr`.
    ///
    /// The block ends with the first control transfer, right before a hooked
    /// instruction, or right before undecodable bytes.
    fn decode_block(&self, addr: u64) -> Vec<Instruction> {
        let mut block = Vec::new();
        let mut pc = addr;

        loop {
            if pc != addr && self.state().hooks.contains_key(&pc) {
                break;
            }

            let insn = match self.decode(pc) {
                Ok(insn) => insn,
                Err(e) => {
                    tracing::trace!(error = %e, "block truncated");
                    break;
                }
            };

            pc = insn.next_address();

            let is_last = insn.is_control_transfer();
            block.push(insn);

            if is_last {
                break;
            }
        }

        block
    }

    /// Asks the transform of the thread (if followed) for the instrumentation
    /// of `block`.
    fn compile(&self, thread_id: u64, block: &[Instruction]) -> Vec<InstrumentDecision> {
        let (transform, unfollowed) = {
            let mut state = self.state();
            (state.transforms.remove(&thread_id), state.unfollowed)
        };

        let Some(mut transform) = transform else {
            return block.iter().map(|_| InstrumentDecision::Keep).collect();
        };

        if let Some(first) = block.first() {
            transform.begin_block(first.address);
        }

        let decisions = block
            .iter()
            .map(|insn| transform.transform(insn.address))
            .collect();

        let mut state = self.state();
        if state.unfollowed == unfollowed {
            state.transforms.insert(thread_id, transform);
        }

        decisions
    }

    fn snapshot(&self, pc: u64, regs: &RegisterSnapshot) -> RegisterSnapshot {
        let pc_register = match self.inner.decoder.arch() {
            Arch::X86 => Register::Eip,
            Arch::X86_64 => Register::Rip,
            Arch::Aarch64 => Register::Pc,
        };

        let mut snapshot = RegisterSnapshot::new(pc);
        snapshot.extend(regs.iter());
        snapshot.set(pc_register, pc);
        snapshot
    }
}

impl Engine for ReplayEngine {
    type Error = ReplayError;

    fn intercept_at_entry(&self, addr: u64, hook: EntryHook) -> Result<(), Self::Error> {
        if self.inner.process.find_module_by_address(addr).is_none() {
            return Err(ReplayError::Unmapped(addr));
        }

        let mut state = self.state();

        if state.hooks.contains_key(&addr) {
            return Err(ReplayError::AlreadyIntercepted(addr));
        }

        state.hooks.insert(addr, hook);
        Ok(())
    }

    fn revert_entry(&self, addr: u64) {
        let mut state = self.state();
        state.hooks.remove(&addr);
        state.reverted.insert(addr);
    }

    fn follow_thread(
        &self,
        thread_id: u64,
        transform: Box<dyn CodeTransform>,
    ) -> Result<(), Self::Error> {
        let mut state = self.state();

        if state.transforms.contains_key(&thread_id) {
            return Err(ReplayError::AlreadyFollowed(thread_id));
        }

        state.transforms.insert(thread_id, transform);
        Ok(())
    }

    fn unfollow_thread(&self, thread_id: u64) {
        let mut state = self.state();
        state.transforms.remove(&thread_id);
        state.unfollowed += 1;
    }
}

fn is_unconditional_jump(insn: &Instruction) -> bool {
    matches!(insn.mnemonic.as_str(), "jmp" | "b")
}

/// Encodes a direct jump located at `from`, targeting `to`.
fn encode_jump(arch: Arch, from: u64, to: u64) -> Option<Vec<u8>> {
    match arch {
        Arch::X86 | Arch::X86_64 => {
            // jmp rel32
            let rel = i32::try_from(to.wrapping_sub(from + 5) as i64).ok()?;

            let mut code = vec![0xe9, 0, 0, 0, 0];
            LittleEndian::write_i32(&mut code[1..], rel);
            Some(code)
        }
        Arch::Aarch64 => {
            // b imm26
            let rel = to.wrapping_sub(from) as i64;

            if rel % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&rel) {
                return None;
            }

            let mut code = vec![0; 4];
            LittleEndian::write_u32(&mut code, 0x1400_0000 | ((rel >> 2) as u32 & 0x03ff_ffff));
            Some(code)
        }
    }
}

/// Outcome of a replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Number of executed instructions.
    pub steps: usize,

    /// Reason why the replay stopped.
    pub stop: StopReason,
}

/// Reason why a replay stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// A `ret` instruction (at the given address) was executed.
    Returned(u64),

    /// Execution reached unmapped memory (at the given address).
    EndOfCode(u64),

    /// Execution reached undecodable bytes (at the given address).
    Undecodable(u64),

    /// The maximum number of steps was reached.
    MaxSteps,

    /// The traced thread stopped being followed.
    Unfollowed,
}

/// Replay error.
#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    /// The address is not part of the code image.
    #[error("no code is mapped at {0:#x}")]
    Unmapped(u64),

    /// The address is already intercepted.
    #[error("{0:#x} is already intercepted")]
    AlreadyIntercepted(u64),

    /// The thread is already followed.
    #[error("thread {0} is already followed")]
    AlreadyFollowed(u64),

    /// The hooked instruction could not be decoded.
    #[error("failed to relocate the instruction at {addr:#x}")]
    Relocation {
        /// Address of the hooked instruction.
        addr: u64,

        /// Decoding error.
        source: DecodeError,
    },

    /// The stub region is too far from the hooked instruction.
    #[error("stub region out of range of {addr:#x}")]
    OutOfRange {
        /// Address of the hooked instruction.
        addr: u64,
    },

    /// A memory access failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The trace handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}
