//! Command lists: recorded, replayable sequences of GPU operations.
//!
//! A list encodes straight into its own [`CommandBuffer`]. It carries no hardware state
//! assumptions on entry; the queue that executes it supplies whatever transitions it needs.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ze_gpu_cmd::{
    ComputeWalker, GpuCommand, PipeControl, PipeControlFlags, PostSync, PreemptionMode,
    SemaphoreCompare,
};

use crate::allocation::{Allocation, AllocationId, AllocationKind};
use crate::buffer::CommandBuffer;
use crate::device::{Device, Event, EVENT_SIGNALED};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineGroup {
    Compute,
    Render,
    Copy,
}

impl EngineGroup {
    pub fn supports_dispatch(self) -> bool {
        !matches!(self, EngineGroup::Copy)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelDispatch {
    pub walker: ComputeWalker,
    /// The kernel cannot be preempted at instruction granularity.
    pub disallow_mid_thread: bool,
    /// The kernel cannot be preempted between thread groups either.
    pub disallow_thread_group: bool,
}

impl KernelDispatch {
    pub fn new(walker: ComputeWalker) -> Self {
        Self {
            walker,
            disallow_mid_thread: false,
            disallow_thread_group: false,
        }
    }

    /// Finest preemption granularity this kernel tolerates.
    pub fn preemption_limit(&self) -> PreemptionMode {
        if self.disallow_thread_group {
            PreemptionMode::MidBatch
        } else if self.disallow_mid_thread {
            PreemptionMode::ThreadGroup
        } else {
            PreemptionMode::MidThread
        }
    }
}

/// Device-memory location of an [`Event`], as referenced from a command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRef {
    pub device_id: u32,
    pub gpu_address: u64,
    pub allocation: AllocationId,
}

impl From<&Event> for EventRef {
    fn from(event: &Event) -> Self {
        Self {
            device_id: event.device_id(),
            gpu_address: event.gpu_address(),
            allocation: event.allocation_id(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Dispatch(KernelDispatch),
    Copy { src: u64, dst: u64, size: u64 },
    /// Stall until prior work drains, optionally writing a timestamp once it has.
    Barrier { timestamp: Option<u64> },
    SignalEvent(EventRef),
    WaitEvent(EventRef),
}

impl Operation {
    pub fn signal(event: &Event) -> Self {
        Operation::SignalEvent(event.into())
    }

    pub fn wait(event: &Event) -> Self {
        Operation::WaitEvent(event.into())
    }

    fn command(&self) -> GpuCommand {
        match *self {
            Operation::Dispatch(dispatch) => GpuCommand::ComputeWalker(dispatch.walker),
            Operation::Copy { src, dst, size } => GpuCommand::MemCopy { src, dst, size },
            Operation::Barrier { timestamp } => GpuCommand::PipeControl(PipeControl {
                flags: PipeControlFlags::STALL_AND_FLUSH,
                post_sync: match timestamp {
                    Some(address) => PostSync::WriteTimestamp { address },
                    None => PostSync::None,
                },
            }),
            Operation::SignalEvent(event) => signal_event_command(event.gpu_address),
            Operation::WaitEvent(event) => wait_event_command(event.gpu_address),
        }
    }

    fn event(&self) -> Option<&EventRef> {
        match self {
            Operation::SignalEvent(event) | Operation::WaitEvent(event) => Some(event),
            _ => None,
        }
    }
}

pub(crate) fn signal_event_command(address: u64) -> GpuCommand {
    GpuCommand::PipeControl(PipeControl {
        flags: PipeControlFlags::STALL_AND_FLUSH,
        post_sync: PostSync::WriteImmediate {
            address,
            value: EVENT_SIGNALED,
        },
    })
}

pub(crate) fn wait_event_command(address: u64) -> GpuCommand {
    GpuCommand::SemaphoreWait {
        address,
        value: EVENT_SIGNALED as u32,
        compare: SemaphoreCompare::GreaterOrEqual,
    }
}

#[derive(Debug)]
pub struct CommandList {
    id: u32,
    device: Arc<Device>,
    engine: EngineGroup,
    requested_preemption: Option<PreemptionMode>,
    preemption_mode: PreemptionMode,
    buffer: CommandBuffer,
    closed: bool,
    operation_count: usize,
    residency: BTreeSet<AllocationId>,
}

impl CommandList {
    /// Create an open, empty list. `preemption` overrides the device default mode.
    pub fn create(
        device: &Arc<Device>,
        engine: EngineGroup,
        preemption: Option<PreemptionMode>,
    ) -> Result<Self> {
        let buffer = CommandBuffer::new(
            device.allocator(),
            AllocationKind::CommandBuffer,
            device.config().command_list_segment_size,
        )?;
        let preemption_mode = device.resolve_preemption_mode(preemption);
        let id = device.next_object_id();
        tracing::debug!(list = id, ?engine, ?preemption_mode, "command list created");

        Ok(Self {
            id,
            device: Arc::clone(device),
            engine,
            requested_preemption: preemption,
            preemption_mode,
            buffer,
            closed: false,
            operation_count: 0,
            residency: BTreeSet::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn engine_group(&self) -> EngineGroup {
        self.engine
    }

    /// Mode the list must run in: the resolved request, lowered by any kernel restrictions.
    pub fn preemption_mode(&self) -> PreemptionMode {
        self.preemption_mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn operation_count(&self) -> usize {
        self.operation_count
    }

    /// Address the queue jumps to.
    pub fn gpu_address(&self) -> u64 {
        self.buffer.gpu_address()
    }

    pub fn buffer(&self) -> &CommandBuffer {
        &self.buffer
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn append(&mut self, operation: Operation) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidState("cannot append to a closed command list"));
        }
        if let Operation::Dispatch(_) = operation {
            if !self.engine.supports_dispatch() {
                return Err(Error::InvalidArgument(
                    "copy engine command lists cannot dispatch kernels",
                ));
            }
        }
        if let Some(event) = operation.event() {
            if event.device_id != self.device.id() {
                return Err(Error::InvalidArgument("event belongs to another device"));
            }
        }

        self.buffer.append(self.device.caps(), &operation.command())?;

        if let Operation::Dispatch(dispatch) = operation {
            self.lower_preemption(dispatch.preemption_limit());
        }
        if let Some(event) = operation.event() {
            self.residency.insert(event.allocation);
        }
        self.operation_count += 1;
        Ok(())
    }

    fn lower_preemption(&mut self, limit: PreemptionMode) {
        if self.device.config().force_preemption_mode.is_some() {
            return;
        }
        let lowered = self.preemption_mode.min(limit);
        if lowered != self.preemption_mode {
            tracing::trace!(
                list = self.id,
                from = ?self.preemption_mode,
                to = ?lowered,
                "kernel restricts preemption"
            );
            self.preemption_mode = lowered;
        }
    }

    /// Record that work in this list references `allocation`.
    pub fn make_resident(&mut self, allocation: &Allocation) {
        self.residency.insert(allocation.id);
    }

    /// Everything a submission of this list needs resident, its own segments included.
    pub fn residency(&self) -> impl Iterator<Item = AllocationId> + '_ {
        self.buffer
            .allocation_ids()
            .chain(self.residency.iter().copied())
    }

    /// Terminate the list with BATCH_BUFFER_END and make it submittable. Closing a closed list
    /// does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.buffer
            .append(self.device.caps(), &GpuCommand::BatchBufferEnd)?;
        self.closed = true;
        tracing::debug!(
            list = self.id,
            operations = self.operation_count,
            bytes = self.buffer.used(),
            segments = self.buffer.segments().len(),
            "command list closed"
        );
        Ok(())
    }

    /// Back to open and empty. Engine group and requested preemption mode are kept; the first
    /// segment is reused.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.closed = false;
        self.operation_count = 0;
        self.residency.clear();
        self.preemption_mode = self.device.resolve_preemption_mode(self.requested_preemption);
    }
}
