use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use vestigo_tracer::MemoryError;
use vestigo_tracer::engine::{FileMapping, MemoryRange, Module, ModuleLoadCallback, Process};
use vestigo_tracer::engine::SubscriptionId;

struct Region {
    base: u64,
    data: Vec<u8>,
    path: Option<PathBuf>,
    is_module: bool,
}

impl Region {
    fn range(&self) -> Range<u64> {
        self.base..self.base + self.data.len() as u64
    }
}

/// In-memory traced process.
#[derive(Default)]
pub struct MockProcess {
    regions: Mutex<Vec<Region>>,
    subscribers: Mutex<Vec<(SubscriptionId, ModuleLoadCallback)>>,
    next_subscription: AtomicU64,
    thread_id: AtomicU64,
}

impl MockProcess {
    fn regions(&self) -> MutexGuard<'_, Vec<Region>> {
        self.regions.lock().unwrap()
    }

    /// Sets the ID of the thread calling into the process.
    pub fn set_thread(&self, thread_id: u64) {
        self.thread_id.store(thread_id, Ordering::SeqCst);
    }

    /// Maps a module, without notifying subscribers.
    pub fn map_module(&self, path: &str, base: u64, data: Vec<u8>) {
        self.regions().push(Region {
            base,
            data,
            path: Some(PathBuf::from(path)),
            is_module: true,
        });
    }

    /// Maps an anonymous memory region.
    pub fn map_anonymous(&self, base: u64, data: Vec<u8>) {
        self.regions().push(Region {
            base,
            data,
            path: None,
            is_module: false,
        });
    }

    /// Maps a module, then notifies subscribers.
    pub fn load_module(&self, path: &str, base: u64, data: Vec<u8>) {
        self.map_module(path, base, data);

        for (_, callback) in self.subscribers.lock().unwrap().iter() {
            callback();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Process for MockProcess {
    fn current_thread_id(&self) -> u64 {
        self.thread_id.load(Ordering::SeqCst)
    }

    fn modules(&self) -> Vec<Module> {
        self.regions()
            .iter()
            .filter(|region| region.is_module)
            .filter_map(|region| Some(Module::new(region.path.clone()?, region.range())))
            .collect()
    }

    fn find_memory_range_by_address(&self, addr: u64) -> Option<MemoryRange> {
        self.regions()
            .iter()
            .find(|region| region.range().contains(&addr))
            .map(|region| MemoryRange {
                range: region.range(),
                file: region.path.clone().map(|path| FileMapping { path }),
            })
    }

    fn subscribe_module_load(&self, callback: ModuleLoadCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers.lock().unwrap().push((id, callback));
        id
    }

    fn unsubscribe_module_load(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|(other, _)| *other != id);
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let err = MemoryError::InvalidAccess {
            addr,
            len: buf.len(),
        };

        let regions = self.regions();
        let region = regions
            .iter()
            .find(|region| region.range().contains(&addr))
            .ok_or(err.clone())?;

        let start = (addr - region.base) as usize;
        let src = region.data.get(start..start + buf.len()).ok_or(err)?;
        buf.copy_from_slice(src);

        Ok(())
    }

    fn read_pointer(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_c_string(&self, addr: u64, max_len: usize) -> Result<String, MemoryError> {
        let regions = self.regions();
        let region = regions
            .iter()
            .find(|region| region.range().contains(&addr))
            .ok_or(MemoryError::InvalidAccess { addr, len: 1 })?;

        let bytes = &region.data[(addr - region.base) as usize..];
        let len = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(MemoryError::Unterminated(addr))?;

        Ok(String::from_utf8_lossy(&bytes[..len.min(max_len)]).into_owned())
    }
}
