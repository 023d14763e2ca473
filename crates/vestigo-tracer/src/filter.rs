use std::sync::{Arc, PoisonError, RwLock};

use crate::engine::Module;

/// Module-based exclusion filter.
///
/// The filter keeps an index of every module loaded by the traced process,
/// flagging the ones whose name contains one of the configured patterns.
///
/// The index is never patched in place: [rebuild](Self::rebuild) computes a
/// complete new index, then swaps it in. Concurrent readers either see the
/// previous index or the new one.
pub struct ModuleFilter {
    patterns: Vec<String>,
    index: RwLock<Arc<ModuleIndex>>,
}

impl ModuleFilter {
    /// Creates a new [ModuleFilter], indexing the given modules.
    pub fn new<I, S>(patterns: I, modules: impl IntoIterator<Item = Module>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns.into_iter().map(Into::into).collect::<Vec<_>>();
        let index = ModuleIndex::build(&patterns, modules);

        Self {
            patterns,
            index: RwLock::new(Arc::new(index)),
        }
    }

    /// Rebuilds the index from the given modules.
    pub fn rebuild(&self, modules: impl IntoIterator<Item = Module>) {
        let index = Arc::new(ModuleIndex::build(&self.patterns, modules));

        tracing::debug!(
            modules = index.entries.len(),
            excluded = index.entries.iter().filter(|e| e.excluded).count(),
            "module index rebuilt"
        );

        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
    }

    /// Returns whether `addr` belongs to an excluded module.
    pub fn is_excluded(&self, addr: u64) -> bool {
        self.snapshot().is_excluded(addr)
    }

    /// Returns the module containing `addr`, excluded or not.
    pub fn find(&self, addr: u64) -> Option<ModuleLocation> {
        self.snapshot().find(addr)
    }

    /// Returns the current index.
    pub fn snapshot(&self) -> Arc<ModuleIndex> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Immutable address-range index over loaded modules.
#[derive(Debug, Default)]
pub struct ModuleIndex {
    /// Modules sorted by base address.
    entries: Vec<IndexEntry>,
}

#[derive(Debug)]
struct IndexEntry {
    module: Module,
    excluded: bool,
}

impl ModuleIndex {
    fn build(patterns: &[String], modules: impl IntoIterator<Item = Module>) -> Self {
        let mut entries = modules
            .into_iter()
            .filter(|module| !module.range.is_empty())
            .map(|module| IndexEntry {
                excluded: patterns.iter().any(|p| module.name.contains(p.as_str())),
                module,
            })
            .collect::<Vec<_>>();

        entries.sort_by_key(|e| e.module.range.start);

        Self { entries }
    }

    fn entry(&self, addr: u64) -> Option<&IndexEntry> {
        let pos = self
            .entries
            .partition_point(|e| e.module.range.start <= addr);

        let entry = self.entries.get(pos.checked_sub(1)?)?;
        entry.module.range.contains(&addr).then_some(entry)
    }

    /// Returns whether `addr` belongs to an excluded module.
    pub fn is_excluded(&self, addr: u64) -> bool {
        self.entry(addr).is_some_and(|e| e.excluded)
    }

    /// Returns the module containing `addr`, excluded or not.
    pub fn find(&self, addr: u64) -> Option<ModuleLocation> {
        self.entry(addr).map(|e| ModuleLocation {
            name: e.module.name.clone(),
            base: e.module.range.start,
        })
    }

    /// Number of indexed modules.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no module is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Location of an address within a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleLocation {
    /// Name of the module.
    pub name: String,

    /// Base address of the module.
    pub base: u64,
}

impl ModuleLocation {
    /// Formats `addr` relative to the module, as `name#offset`.
    pub fn relative(&self, addr: u64) -> String {
        format!("{}#{:#x}", self.name, addr.wrapping_sub(self.base))
    }
}
