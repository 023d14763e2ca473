use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::MemoryError;

/// Callback invoked when the traced process loads a new module.
///
/// It may be invoked from any thread.
pub type ModuleLoadCallback = Box<dyn Fn() + Send + Sync>;

/// Trait implementing the introspection logic over the traced process.
///
/// Every memory read reports invalid accesses as a [MemoryError], never by
/// crashing the process.
pub trait Process: Send + Sync {
    /// Returns the ID of the calling thread.
    fn current_thread_id(&self) -> u64;

    /// Enumerates the modules currently loaded.
    fn modules(&self) -> Vec<Module>;

    /// Returns the module containing `addr`, if any.
    fn find_module_by_address(&self, addr: u64) -> Option<Module> {
        self.modules()
            .into_iter()
            .find(|module| module.range.contains(&addr))
    }

    /// Returns the mapped memory range containing `addr`, if any.
    fn find_memory_range_by_address(&self, addr: u64) -> Option<MemoryRange>;

    /// Registers a callback invoked whenever a module gets loaded.
    fn subscribe_module_load(&self, callback: ModuleLoadCallback) -> SubscriptionId;

    /// Unregisters a callback previously registered with
    /// [subscribe_module_load](Self::subscribe_module_load).
    fn unsubscribe_module_load(&self, id: SubscriptionId);

    /// Reads `buf.len()` bytes at `addr`.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Reads a pointer-sized value at `addr`.
    fn read_pointer(&self, addr: u64) -> Result<u64, MemoryError>;

    /// Reads a null-terminated string at `addr`.
    ///
    /// At most `max_len` bytes are returned. Bytes which are not valid UTF-8
    /// are replaced.
    fn read_c_string(&self, addr: u64, max_len: usize) -> Result<String, MemoryError>;
}

impl<P: Process + ?Sized> Process for Arc<P> {
    fn current_thread_id(&self) -> u64 {
        (**self).current_thread_id()
    }

    fn modules(&self) -> Vec<Module> {
        (**self).modules()
    }

    fn find_module_by_address(&self, addr: u64) -> Option<Module> {
        (**self).find_module_by_address(addr)
    }

    fn find_memory_range_by_address(&self, addr: u64) -> Option<MemoryRange> {
        (**self).find_memory_range_by_address(addr)
    }

    fn subscribe_module_load(&self, callback: ModuleLoadCallback) -> SubscriptionId {
        (**self).subscribe_module_load(callback)
    }

    fn unsubscribe_module_load(&self, id: SubscriptionId) {
        (**self).unsubscribe_module_load(id)
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read_bytes(addr, buf)
    }

    fn read_pointer(&self, addr: u64) -> Result<u64, MemoryError> {
        (**self).read_pointer(addr)
    }

    fn read_c_string(&self, addr: u64, max_len: usize) -> Result<String, MemoryError> {
        (**self).read_c_string(addr, max_len)
    }
}

/// Handle over a module-load subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Module loaded by the traced process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// File name of the module.
    pub name: String,

    /// Path from which the module was loaded.
    pub path: PathBuf,

    /// Address range of the mapped module.
    pub range: Range<u64>,
}

impl Module {
    /// Creates a new [Module] mapped at `range`.
    ///
    /// The module name is the file name of `path`.
    pub fn new(path: impl Into<PathBuf>, range: Range<u64>) -> Self {
        let path = path.into();

        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        Self { name, path, range }
    }

    /// Base address of the module.
    pub const fn base(&self) -> u64 {
        self.range.start
    }
}

/// Mapped memory range of the traced process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    /// Address range.
    pub range: Range<u64>,

    /// File backing the range, if any.
    pub file: Option<FileMapping>,
}

/// File backing a [MemoryRange].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMapping {
    /// Path of the mapped file.
    pub path: PathBuf,
}

impl FileMapping {
    /// File name of the mapped file.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}
