use std::collections::HashSet;

/// Set of instrumented instructions expecting a callout.
///
/// An address is inserted when its block gets compiled, and taken back when
/// its callout fires. A callout firing for an address which is not in the
/// registry means the engine and the tracer went out of sync.
#[derive(Debug, Default)]
pub struct LiveInstructionRegistry {
    addrs: HashSet<u64>,
}

impl LiveInstructionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instrumented instruction.
    ///
    /// It returns whether the address was not already pending.
    pub fn insert(&mut self, addr: u64) -> bool {
        self.addrs.insert(addr)
    }

    /// Consumes the pending callout of the given address.
    ///
    /// It returns whether the address was pending.
    pub fn take(&mut self, addr: u64) -> bool {
        self.addrs.remove(&addr)
    }

    /// Returns whether the given address is pending.
    pub fn contains(&self, addr: u64) -> bool {
        self.addrs.contains(&addr)
    }

    /// Drops every pending callout.
    pub fn clear(&mut self) {
        self.addrs.clear();
    }

    /// Number of pending callouts.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Returns whether no callout is pending.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}
