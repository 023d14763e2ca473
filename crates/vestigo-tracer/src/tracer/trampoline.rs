/// Maximum distance (in bytes, exclusive) from the hooked address at which
/// the first genuine instruction is expected.
pub const TRAMPOLINE_MAX_DISTANCE: u64 = 48;

/// Detector of the end of the engine's entry trampoline.
///
/// Right after an entry hook returns, the traced thread first runs code
/// generated by the engine (the relocated prologue of the hooked function)
/// before jumping back into the hooked function, slightly past its start.
///
/// The gate considers the trampoline left as soon as an instruction lands
/// strictly between 0 and [TRAMPOLINE_MAX_DISTANCE] bytes after the hooked
/// address. This is an approximation: an unusually long relocated prologue
/// would be misclassified.
#[derive(Debug, Clone)]
pub struct TrampolineGate {
    start: u64,
    in_trampoline: bool,
}

impl TrampolineGate {
    /// Creates a new gate for a trace starting at `start`.
    pub const fn new(start: u64) -> Self {
        Self {
            start,
            in_trampoline: true,
        }
    }

    /// Feeds the gate with the next candidate instruction.
    ///
    /// It returns whether the instruction is genuine target code (i.e., the
    /// trampoline was left).
    pub fn observe(&mut self, addr: u64) -> bool {
        if self.in_trampoline {
            let distance = addr.wrapping_sub(self.start);

            if distance > 0 && distance < TRAMPOLINE_MAX_DISTANCE {
                tracing::debug!(addr = format_args!("{addr:#x}"), "trampoline left");
                self.in_trampoline = false;
            }
        }

        !self.in_trampoline
    }

    /// Returns whether the trampoline is still executing.
    pub const fn in_trampoline(&self) -> bool {
        self.in_trampoline
    }
}
