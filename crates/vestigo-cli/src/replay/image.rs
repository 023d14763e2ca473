use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use byteorder::{ByteOrder, LittleEndian};
use vestigo_tracer::MemoryError;
use vestigo_tracer::engine::{FileMapping, MemoryRange, Module, ModuleLoadCallback, Process};
use vestigo_tracer::engine::SubscriptionId;

/// ID of the single replayed thread.
pub const REPLAY_THREAD_ID: u64 = 1;

/// Size of the region holding relocated instructions.
const STUB_SIZE: u64 = 0x100;

/// Address space of a replayed code image.
///
/// It holds the image itself (mapped as a module) and an anonymous stub
/// region, in which hooked instructions get relocated.
pub struct ImageProcess {
    module: Module,
    image: Vec<u8>,
    pointer_width: usize,
    stub_base: u64,
    stub: Mutex<Vec<u8>>,
    subscriptions: Mutex<Vec<(SubscriptionId, ModuleLoadCallback)>>,
    next_subscription: AtomicU64,
}

impl ImageProcess {
    /// Maps `image` (read from `path`) at `base`.
    ///
    /// Pointers read from the address space are `pointer_width` bytes wide.
    pub fn new(path: impl Into<PathBuf>, base: u64, image: Vec<u8>, pointer_width: usize) -> Self {
        let end = base.saturating_add(image.len() as u64);

        // leave an unmapped page between the image and the stub
        let stub_base = end.div_ceil(0x1000).saturating_add(1).saturating_mul(0x1000);

        Self {
            module: Module::new(path, base..end),
            image,
            pointer_width,
            stub_base,
            stub: Mutex::new(vec![0; STUB_SIZE as usize]),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Module of the code image.
    pub const fn module(&self) -> &Module {
        &self.module
    }

    /// Address range of the stub region.
    pub const fn stub_range(&self) -> Range<u64> {
        self.stub_base..self.stub_base + STUB_SIZE
    }

    /// Overwrites the start of the stub region with `code`.
    pub(super) fn write_stub(&self, code: &[u8]) -> Result<(), MemoryError> {
        let mut stub = self.stub.lock().unwrap_or_else(PoisonError::into_inner);

        stub.get_mut(..code.len())
            .ok_or(MemoryError::InvalidAccess {
                addr: self.stub_base,
                len: code.len(),
            })?
            .copy_from_slice(code);

        Ok(())
    }

    /// Runs `f` over the bytes mapped from `addr` up to the end of the
    /// enclosing range.
    fn with_bytes<T>(&self, addr: u64, f: impl FnOnce(&[u8]) -> T) -> Option<T> {
        if self.module.range.contains(&addr) {
            let offset = (addr - self.module.base()) as usize;
            return Some(f(&self.image[offset..]));
        }

        if self.stub_range().contains(&addr) {
            let stub = self.stub.lock().unwrap_or_else(PoisonError::into_inner);
            let offset = (addr - self.stub_base) as usize;
            return Some(f(&stub[offset..]));
        }

        None
    }
}

impl Process for ImageProcess {
    fn current_thread_id(&self) -> u64 {
        REPLAY_THREAD_ID
    }

    fn modules(&self) -> Vec<Module> {
        vec![self.module.clone()]
    }

    fn find_memory_range_by_address(&self, addr: u64) -> Option<MemoryRange> {
        if self.module.range.contains(&addr) {
            Some(MemoryRange {
                range: self.module.range.clone(),
                file: Some(FileMapping {
                    path: self.module.path.clone(),
                }),
            })
        } else if self.stub_range().contains(&addr) {
            Some(MemoryRange {
                range: self.stub_range(),
                file: None,
            })
        } else {
            None
        }
    }

    fn subscribe_module_load(&self, callback: ModuleLoadCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));

        id
    }

    fn unsubscribe_module_load(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(other, _)| *other != id);
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let len = buf.len();

        self.with_bytes(addr, |bytes| {
            buf.copy_from_slice(bytes.get(..len)?);
            Some(())
        })
        .flatten()
        .ok_or(MemoryError::InvalidAccess { addr, len })
    }

    fn read_pointer(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..self.pointer_width];

        self.read_bytes(addr, buf)?;

        Ok(LittleEndian::read_uint(buf, self.pointer_width))
    }

    fn read_c_string(&self, addr: u64, max_len: usize) -> Result<String, MemoryError> {
        self.with_bytes(addr, |bytes| {
            let len = bytes
                .iter()
                .position(|&b| b == 0)
                .ok_or(MemoryError::Unterminated(addr))?;

            Ok(String::from_utf8_lossy(&bytes[..len.min(max_len)]).into_owned())
        })
        .unwrap_or(Err(MemoryError::InvalidAccess { addr, len: 1 }))
    }
}
