//! GPU-visible memory allocation.
//!
//! Everything the pipeline places in device memory (command buffer segments, the queue ring,
//! heaps, the SIP kernel, tag and event slots) goes through an [`AllocationProvider`]. The
//! provider is shared by the device and every object created from it, so implementations are
//! internally synchronized.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    CommandBuffer,
    Ring,
    Heap,
    Kernel,
    CsrSaveArea,
    Tag,
    Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub kind: AllocationKind,
    pub gpu_address: u64,
    pub size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of device memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },
    #[error("zero-sized allocation")]
    ZeroSized,
}

pub trait AllocationProvider: fmt::Debug + Send + Sync {
    fn allocate(&self, size: usize, kind: AllocationKind) -> Result<Allocation, AllocError>;

    /// Return `allocation` to the provider. Freeing an allocation twice is a no-op.
    fn free(&self, allocation: &Allocation);
}

/// An allocation that is returned to its provider when dropped.
pub struct DeviceAllocation {
    allocation: Allocation,
    provider: Arc<dyn AllocationProvider>,
}

impl DeviceAllocation {
    pub fn new(
        provider: &Arc<dyn AllocationProvider>,
        size: usize,
        kind: AllocationKind,
    ) -> Result<Self, AllocError> {
        let allocation = provider.allocate(size, kind)?;
        Ok(Self {
            allocation,
            provider: Arc::clone(provider),
        })
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn id(&self) -> AllocationId {
        self.allocation.id
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address
    }

    pub fn size(&self) -> usize {
        self.allocation.size
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceAllocation")
            .field(&self.allocation)
            .finish()
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.provider.free(&self.allocation);
    }
}

pub const ALLOCATION_ALIGNMENT: u64 = 0x1000;

#[derive(Debug)]
struct LinearState {
    next_address: u64,
    next_id: u64,
    in_use: usize,
    live: BTreeMap<AllocationId, Allocation>,
    /// Freed ranges, reused first-fit.
    free_ranges: Vec<(u64, usize)>,
}

/// Bump allocator over a fixed GPU virtual range with a byte budget.
///
/// Sizes are rounded up to [`ALLOCATION_ALIGNMENT`]. Freed ranges are recycled first-fit but
/// never coalesced.
#[derive(Debug)]
pub struct LinearAllocator {
    base: u64,
    capacity: usize,
    state: Mutex<LinearState>,
}

impl LinearAllocator {
    pub fn new(base: u64, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            state: Mutex::new(LinearState {
                next_address: base,
                next_id: 1,
                in_use: 0,
                live: BTreeMap::new(),
                free_ranges: Vec::new(),
            }),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn live_allocations(&self) -> Vec<Allocation> {
        self.lock().live.values().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, LinearState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn align_up(size: usize) -> Option<usize> {
    let align = ALLOCATION_ALIGNMENT as usize;
    size.checked_add(align - 1).map(|s| s & !(align - 1))
}

impl AllocationProvider for LinearAllocator {
    fn allocate(&self, size: usize, kind: AllocationKind) -> Result<Allocation, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSized);
        }
        let oom = AllocError::OutOfMemory { requested: size };
        let rounded = align_up(size).ok_or(oom)?;

        let mut state = self.lock();
        if state.in_use.checked_add(rounded).map_or(true, |total| total > self.capacity) {
            return Err(oom);
        }

        let reusable = state.free_ranges.iter().position(|&(_, len)| len >= rounded);
        let gpu_address = match reusable {
            Some(idx) => {
                let (address, len) = state.free_ranges.swap_remove(idx);
                if len > rounded {
                    state.free_ranges.push((address + rounded as u64, len - rounded));
                }
                address
            }
            None => {
                let address = state.next_address;
                let end = address.checked_add(rounded as u64).ok_or(oom)?;
                if end > self.base + self.capacity as u64 {
                    return Err(oom);
                }
                state.next_address = end;
                address
            }
        };

        let id = AllocationId(state.next_id);
        state.next_id += 1;
        state.in_use += rounded;

        let allocation = Allocation {
            id,
            kind,
            gpu_address,
            size: rounded,
        };
        state.live.insert(id, allocation);
        Ok(allocation)
    }

    fn free(&self, allocation: &Allocation) {
        let mut state = self.lock();
        if let Some(live) = state.live.remove(&allocation.id) {
            state.in_use -= live.size;
            state.free_ranges.push((live.gpu_address, live.size));
        }
    }
}
