use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ze_gpu_cmd::{DeviceCaps, HeapRange, PreemptionMode, StateBaseAddress};

use crate::allocation::{AllocationId, AllocationKind, AllocationProvider, DeviceAllocation};
use crate::config::DriverConfig;
use crate::error::Result;

pub const SIP_KERNEL_SIZE: usize = 0x1000;
pub const EVENT_SLOT_SIZE: usize = 64;

/// Value written to an event slot when the event is signaled.
pub const EVENT_SIGNALED: u64 = 1;

/// Ids for devices, lists, and queues. Queue ids double as backend context ids, so they
/// must stay unique across devices sharing one backend.
static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(1);

fn next_object_id() -> u32 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A device-memory synchronization slot that command lists signal and queues wait on.
#[derive(Debug)]
pub struct Event {
    device_id: u32,
    memory: DeviceAllocation,
}

impl Event {
    /// Id of the device whose memory holds the slot.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn gpu_address(&self) -> u64 {
        self.memory.gpu_address()
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.memory.id()
    }
}

#[derive(Debug)]
struct Heaps {
    general_state: DeviceAllocation,
    instruction: DeviceAllocation,
    surface_state: DeviceAllocation,
    dynamic_state: DeviceAllocation,
}

/// Per-device state shared by every list and queue created from it.
#[derive(Debug)]
pub struct Device {
    id: u32,
    caps: DeviceCaps,
    config: DriverConfig,
    provider: Arc<dyn AllocationProvider>,
    heaps: Heaps,
    sip_kernel: DeviceAllocation,
}

impl Device {
    pub fn new(
        caps: DeviceCaps,
        config: DriverConfig,
        provider: Arc<dyn AllocationProvider>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let sizes = caps.heap_sizes;
        let heap = |size: u32| DeviceAllocation::new(&provider, size as usize, AllocationKind::Heap);
        let heaps = Heaps {
            general_state: heap(sizes.general_state)?,
            instruction: heap(sizes.instruction)?,
            surface_state: heap(sizes.surface_state)?,
            dynamic_state: heap(sizes.dynamic_state)?,
        };
        let sip_kernel = DeviceAllocation::new(&provider, SIP_KERNEL_SIZE, AllocationKind::Kernel)?;

        tracing::info!(
            device = %caps.name,
            address_bits = caps.address_bits,
            default_preemption = ?caps.default_preemption_mode,
            "device initialized"
        );

        Ok(Arc::new(Self {
            id: next_object_id(),
            caps,
            config,
            provider,
            heaps,
            sip_kernel,
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<dyn AllocationProvider> {
        &self.provider
    }

    /// Heap bases as programmed by the queue's one-time STATE_BASE_ADDRESS.
    pub fn state_base_address(&self) -> StateBaseAddress {
        let sizes = self.caps.heap_sizes;
        let range = |memory: &DeviceAllocation, size: u32| {
            Some(HeapRange {
                base: memory.gpu_address(),
                size,
            })
        };
        StateBaseAddress {
            general_state: range(&self.heaps.general_state, sizes.general_state),
            instruction: range(&self.heaps.instruction, sizes.instruction),
            surface_state: range(&self.heaps.surface_state, sizes.surface_state),
            dynamic_state: range(&self.heaps.dynamic_state, sizes.dynamic_state),
            mocs: self.caps.state_mocs,
        }
    }

    pub fn sip_kernel_address(&self) -> u64 {
        self.sip_kernel.gpu_address()
    }

    /// Device-owned allocations every submission needs resident.
    pub fn resident_allocations(&self) -> [AllocationId; 5] {
        [
            self.heaps.general_state.id(),
            self.heaps.instruction.id(),
            self.heaps.surface_state.id(),
            self.heaps.dynamic_state.id(),
            self.sip_kernel.id(),
        ]
    }

    /// Forced mode, else the requested mode, else the device default; then limited to what
    /// the hardware supports.
    pub fn resolve_preemption_mode(&self, requested: Option<PreemptionMode>) -> PreemptionMode {
        let mode = self
            .config
            .force_preemption_mode
            .or(requested)
            .unwrap_or(self.caps.default_preemption_mode);
        let clamped = self.caps.clamp_preemption_mode(mode);
        if clamped != mode {
            tracing::warn!(
                device = %self.caps.name,
                requested = ?mode,
                using = ?clamped,
                "preemption mode not supported by device"
            );
        }
        clamped
    }

    pub fn create_event(&self) -> Result<Event> {
        Ok(Event {
            device_id: self.id,
            memory: DeviceAllocation::new(&self.provider, EVENT_SLOT_SIZE, AllocationKind::Event)?,
        })
    }

    pub(crate) fn next_object_id(&self) -> u32 {
        next_object_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::LinearAllocator;
    use pretty_assertions::assert_eq;

    fn device(caps: DeviceCaps, config: DriverConfig) -> (Arc<LinearAllocator>, Arc<Device>) {
        let linear = Arc::new(LinearAllocator::new(0x1_0000_0000, 16 << 20));
        let device = Device::new(caps, config, linear.clone()).unwrap();
        (linear, device)
    }

    #[test]
    fn heaps_and_sip_are_allocated_and_released() {
        let (linear, device) = device(DeviceCaps::gen12lp(), DriverConfig::default());
        assert_eq!(linear.live_allocations().len(), 5);

        let sba = device.state_base_address();
        assert_eq!(sba.mocs, 4);
        assert_eq!(sba.general_state.map(|h| h.size), Some(64 * 1024));
        assert!(sba.surface_state.is_some());

        drop(device);
        assert!(linear.live_allocations().is_empty());
    }

    #[test]
    fn preemption_resolution_order() {
        let (_, device) = device(DeviceCaps::gen12lp(), DriverConfig::default());
        assert_eq!(device.resolve_preemption_mode(None), PreemptionMode::ThreadGroup);
        assert_eq!(
            device.resolve_preemption_mode(Some(PreemptionMode::MidThread)),
            PreemptionMode::MidThread
        );

        let forced = DriverConfig {
            force_preemption_mode: Some(PreemptionMode::MidBatch),
            ..DriverConfig::default()
        };
        let (_, device) = self::device(DeviceCaps::gen12lp(), forced);
        assert_eq!(
            device.resolve_preemption_mode(Some(PreemptionMode::MidThread)),
            PreemptionMode::MidBatch
        );
    }

    #[test]
    fn mid_thread_is_clamped_without_hardware_support() {
        let (_, device) = device(DeviceCaps::xe_hpg(), DriverConfig::default());
        assert_eq!(
            device.resolve_preemption_mode(Some(PreemptionMode::MidThread)),
            PreemptionMode::ThreadGroup
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let linear = Arc::new(LinearAllocator::new(0, 16 << 20));
        let config = DriverConfig {
            queue_ring_size: 8,
            ..DriverConfig::default()
        };
        assert!(matches!(
            Device::new(DeviceCaps::gen9(), config, linear),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn object_ids_are_unique_across_devices() {
        let (_, a) = device(DeviceCaps::gen12lp(), DriverConfig::default());
        let (_, b) = device(DeviceCaps::gen12lp(), DriverConfig::default());
        assert_ne!(a.id(), b.id());
        assert_ne!(a.next_object_id(), b.next_object_id());
    }

    #[test]
    fn events_own_their_slot() {
        let (linear, device) = device(DeviceCaps::gen9(), DriverConfig::default());
        let event = device.create_event().unwrap();
        assert_eq!(event.device_id(), device.id());
        assert_eq!(event.gpu_address() % 0x1000, 0);
        assert_eq!(linear.live_allocations().len(), 6);
        drop(event);
        assert_eq!(linear.live_allocations().len(), 5);
    }
}
