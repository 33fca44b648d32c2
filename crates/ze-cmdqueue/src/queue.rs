//! Command queues.
//!
//! A queue owns a ring of command buffer segments. Each `execute_command_lists` call writes
//! one primary batch into the ring: wait-event semaphores, then for every list the setup the
//! [`TransitionPolicy`] asks for followed by a second-level jump into the list, then a
//! completion tag and BATCH_BUFFER_END. The batch is handed to the backend as one submission.
//!
//! Every mutating method takes `&mut self`, so callers sharing a queue across threads wrap it
//! in their own lock.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ze_gpu_cmd::{CmdOpcode, DeviceCaps, GpuCommand, PipeControl, PipeControlFlags, PostSync};

use crate::allocation::{AllocationId, AllocationKind, DeviceAllocation};
use crate::backend::{self, SharedBackend, Submission};
use crate::buffer::{CommandBuffer, Segment};
use crate::device::{Device, Event};
use crate::error::{Error, Result};
use crate::list::{wait_event_command, CommandList, EngineGroup};
use crate::policy::{PolicyOptions, QueueState, TransitionDecision, TransitionPolicy};

pub const TAG_SIZE: usize = 64;

/// Scheduling hint forwarded to the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePriority {
    #[default]
    Normal,
    Low,
    High,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    #[default]
    Default,
    /// `execute_command_lists` returns only after the batch completes.
    Synchronous,
    Asynchronous,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDesc {
    pub priority: QueuePriority,
    pub mode: QueueMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueLifecycle {
    Created,
    FirstExecutionPending,
    SteadyState,
}

/// Completion handle for one submission on one queue.
#[derive(Debug)]
pub struct Fence {
    queue_id: u32,
    task_count: Option<u64>,
}

impl Fence {
    /// Task count of the submission this fence was attached to, if any.
    pub fn task_count(&self) -> Option<u64> {
        self.task_count
    }

    pub fn reset(&mut self) {
        self.task_count = None;
    }
}

fn completion_tag(address: u64, task_count: u64) -> GpuCommand {
    GpuCommand::PipeControl(PipeControl {
        flags: PipeControlFlags::STALL_AND_FLUSH,
        post_sync: PostSync::WriteImmediate {
            address,
            value: task_count,
        },
    })
}

const TAIL_SIZE: usize =
    CmdOpcode::PipeControl.packet_size_bytes() + CmdOpcode::BatchBufferEnd.packet_size_bytes();

pub struct CommandQueue {
    id: u32,
    device: Arc<Device>,
    engine: EngineGroup,
    desc: QueueDesc,
    backend: SharedBackend,
    ring: CommandBuffer,
    /// Full ring segments and the last task count written into each.
    retired: Vec<(Segment, u64)>,
    tag: DeviceAllocation,
    csr_save_area: Option<DeviceAllocation>,
    state: QueueState,
    lifecycle: QueueLifecycle,
    task_count: u64,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("desc", &self.desc)
            .field("state", &self.state)
            .field("lifecycle", &self.lifecycle)
            .field("task_count", &self.task_count)
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    /// Create a queue submitting through `csr`. A missing handle is an invalid argument.
    pub fn create(
        device: &Arc<Device>,
        engine: EngineGroup,
        csr: Option<SharedBackend>,
        desc: QueueDesc,
    ) -> Result<Self> {
        let backend = csr.ok_or(Error::InvalidArgument(
            "command stream receiver handle is null",
        ))?;
        let provider = device.allocator();
        let caps = device.caps();

        let ring = CommandBuffer::new(provider, AllocationKind::Ring, device.config().queue_ring_size)?;
        let tag = DeviceAllocation::new(provider, TAG_SIZE, AllocationKind::Tag)?;
        let csr_save_area = if engine.supports_dispatch()
            && caps.supports_mid_thread
            && caps.csr_save_area_size > 0
        {
            Some(DeviceAllocation::new(
                provider,
                caps.csr_save_area_size,
                AllocationKind::CsrSaveArea,
            )?)
        } else {
            None
        };

        let mut queue = Self {
            id: device.next_object_id(),
            device: Arc::clone(device),
            engine,
            desc,
            backend,
            ring,
            retired: Vec::new(),
            tag,
            csr_save_area,
            state: QueueState::new(caps.default_preemption_mode),
            lifecycle: QueueLifecycle::Created,
            task_count: 0,
        };
        queue.lifecycle = QueueLifecycle::FirstExecutionPending;
        tracing::debug!(queue = queue.id, ?engine, ?desc, "command queue created");
        Ok(queue)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn engine_group(&self) -> EngineGroup {
        self.engine
    }

    pub fn desc(&self) -> QueueDesc {
        self.desc
    }

    pub fn lifecycle(&self) -> QueueLifecycle {
        self.lifecycle
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    /// Task count of the most recent submission; 0 before the first.
    pub fn task_count(&self) -> u64 {
        self.task_count
    }

    pub fn tag_address(&self) -> u64 {
        self.tag.gpu_address()
    }

    /// Ring segments still waiting for the GPU to finish with them.
    pub fn retired_segment_count(&self) -> usize {
        self.retired.len()
    }

    pub fn create_fence(&self) -> Fence {
        Fence {
            queue_id: self.id,
            task_count: None,
        }
    }

    fn policy<'a>(&self, device: &'a Device) -> TransitionPolicy<'a> {
        TransitionPolicy {
            caps: device.caps(),
            engine: self.engine,
            options: PolicyOptions {
                force_mid_thread_setup_each_switch: device
                    .config()
                    .force_mid_thread_setup_each_switch,
            },
            state_base_address: device.state_base_address(),
            csr_base_address: self.csr_save_area.as_ref().map(DeviceAllocation::gpu_address),
            sip_address: device.sip_kernel_address(),
        }
    }

    /// Submit `lists` as one batch, in order.
    ///
    /// Either every list is submitted or none is: argument checks, the ring reservation, and
    /// encoding all happen before the backend sees anything, and queue state only advances
    /// once the backend accepts the batch.
    pub fn execute_command_lists(
        &mut self,
        lists: &[&CommandList],
        fence: Option<&mut Fence>,
        wait_events: &[&Event],
    ) -> Result<()> {
        if lists.is_empty() {
            return Err(Error::InvalidArgument("no command lists to execute"));
        }
        for list in lists {
            if !Arc::ptr_eq(list.device(), &self.device) {
                return Err(Error::InvalidArgument("command list belongs to another device"));
            }
            if list.engine_group() != self.engine {
                return Err(Error::InvalidArgument(
                    "command list engine group does not match the queue",
                ));
            }
            if !list.is_closed() {
                return Err(Error::InvalidState("command list is not closed"));
            }
        }
        if wait_events
            .iter()
            .any(|event| event.device_id() != self.device.id())
        {
            return Err(Error::InvalidArgument("wait event belongs to another device"));
        }
        if let Some(fence) = fence.as_deref() {
            if fence.queue_id != self.id {
                return Err(Error::InvalidArgument("fence belongs to another queue"));
            }
        }

        self.retire_completed();

        let device = Arc::clone(&self.device);
        let caps = device.caps();
        let policy = self.policy(&device);
        let (decisions, next_state) =
            policy.plan(&self.state, lists.iter().map(|list| list.preemption_mode()));

        let reserve = policy.worst_case_prologue_size()
            + lists.len()
                * (policy.worst_case_per_list_size()
                    + CmdOpcode::BatchBufferStart.packet_size_bytes())
            + wait_events.len() * CmdOpcode::SemaphoreWait.packet_size_bytes()
            + TAIL_SIZE;
        if let Some(full) = self.ring.reserve_contiguous(reserve)? {
            if full.used() > 0 {
                self.retired.push((full, self.task_count));
            }
        }

        let start = self.ring.current().used();
        let batch_address = self.ring.current().cursor_address();
        let task_count = self.task_count + 1;
        if let Err(err) = self.encode_batch(caps, lists, &decisions, wait_events, task_count) {
            self.ring.rewind(start);
            return Err(err);
        }

        let commands = self.ring.current().bytes()[start..].to_vec();
        let submission = Submission {
            context_id: self.id,
            engine: self.engine,
            priority: self.desc.priority,
            batch_address,
            commands,
            task_count,
            tag_address: self.tag.gpu_address(),
            residency: self.residency(lists, wait_events),
        };
        tracing::debug!(
            queue = self.id,
            lists = lists.len(),
            task_count,
            bytes = submission.commands.len(),
            "executing command lists"
        );

        if let Err(err) = backend::lock(&self.backend).submit(submission) {
            self.ring.rewind(start);
            return Err(err.into());
        }

        self.state = next_state;
        self.task_count = task_count;
        self.lifecycle = QueueLifecycle::SteadyState;
        if let Some(fence) = fence {
            fence.task_count = Some(task_count);
        }

        if self.desc.mode == QueueMode::Synchronous {
            self.wait_for(task_count, device.config().sync_timeout())?;
        }
        Ok(())
    }

    fn encode_batch(
        &mut self,
        caps: &DeviceCaps,
        lists: &[&CommandList],
        decisions: &[TransitionDecision],
        wait_events: &[&Event],
        task_count: u64,
    ) -> Result<()> {
        for event in wait_events {
            self.ring
                .write_contiguous(caps, &wait_event_command(event.gpu_address()))?;
        }
        for (list, decision) in lists.iter().zip(decisions) {
            for cmd in decision.commands(caps) {
                tracing::trace!(queue = self.id, list = list.id(), command = %cmd, "transition");
                self.ring.write_contiguous(caps, &cmd)?;
            }
            self.ring.write_contiguous(
                caps,
                &GpuCommand::BatchBufferStart {
                    address: list.gpu_address(),
                    second_level: true,
                },
            )?;
        }
        self.ring
            .write_contiguous(caps, &completion_tag(self.tag.gpu_address(), task_count))?;
        self.ring.write_contiguous(caps, &GpuCommand::BatchBufferEnd)?;
        Ok(())
    }

    fn residency(&self, lists: &[&CommandList], wait_events: &[&Event]) -> Vec<AllocationId> {
        let mut resident = BTreeSet::new();
        resident.extend(self.device.resident_allocations());
        resident.extend(self.ring.allocation_ids());
        resident.insert(self.tag.id());
        resident.extend(self.csr_save_area.as_ref().map(DeviceAllocation::id));
        for list in lists {
            resident.extend(list.residency());
        }
        resident.extend(wait_events.iter().map(|event| event.allocation_id()));
        resident.into_iter().collect()
    }

    fn completed_task_count(&self) -> u64 {
        backend::lock(&self.backend).completed_task_count(self.id)
    }

    fn retire_completed(&mut self) {
        if self.retired.is_empty() {
            return;
        }
        let completed = self.completed_task_count();
        let before = self.retired.len();
        self.retired.retain(|(_, last_task)| *last_task > completed);
        let released = before - self.retired.len();
        if released > 0 {
            tracing::trace!(queue = self.id, released, completed, "released ring segments");
        }
    }

    fn wait_for(&mut self, task_count: u64, timeout: Option<Duration>) -> Result<()> {
        backend::lock(&self.backend).wait(self.id, task_count, timeout)?;
        self.retire_completed();
        Ok(())
    }

    /// Block until everything submitted so far has completed.
    pub fn synchronize(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.task_count == 0 {
            return Ok(());
        }
        let timeout = timeout.or(self.device.config().sync_timeout());
        self.wait_for(self.task_count, timeout)
    }

    pub fn fence_status(&self, fence: &Fence) -> Result<bool> {
        if fence.queue_id != self.id {
            return Err(Error::InvalidArgument("fence belongs to another queue"));
        }
        Ok(match fence.task_count {
            Some(task_count) => self.completed_task_count() >= task_count,
            None => false,
        })
    }

    pub fn host_synchronize(&mut self, fence: &Fence, timeout: Option<Duration>) -> Result<()> {
        if fence.queue_id != self.id {
            return Err(Error::InvalidArgument("fence belongs to another queue"));
        }
        let task_count = fence
            .task_count
            .ok_or(Error::InvalidState("fence was never submitted"))?;
        let timeout = timeout.or(self.device.config().sync_timeout());
        self.wait_for(task_count, timeout)
    }

    /// Forget the one-time setup so the next execution re-sends it. The context keeps running
    /// in its last preemption mode, so that is carried over. The queue must be idle.
    pub fn reset(&mut self) -> Result<()> {
        if self.completed_task_count() < self.task_count {
            return Err(Error::InvalidState("cannot reset a queue with work in flight"));
        }
        self.retire_completed();
        self.state = QueueState::new(self.state.last_preemption_mode);
        self.lifecycle = QueueLifecycle::FirstExecutionPending;
        tracing::debug!(queue = self.id, "command queue reset");
        Ok(())
    }

    /// Release the ring and every queue allocation. The caller is expected to have waited for
    /// outstanding work first.
    pub fn destroy(self) {
        let completed = self.completed_task_count();
        if completed < self.task_count {
            tracing::warn!(
                queue = self.id,
                completed,
                submitted = self.task_count,
                "destroying command queue with outstanding submissions"
            );
        }
        tracing::debug!(queue = self.id, "command queue destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::LinearAllocator;
    use crate::backend::{BackendError, ImmediateBackend, NullBackend};
    use crate::config::DriverConfig;
    use crate::list::Operation;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use ze_gpu_cmd::{decode_all, PreemptionMode};

    struct Fixture {
        linear: Arc<LinearAllocator>,
        device: Arc<Device>,
        backend: Arc<Mutex<ImmediateBackend>>,
    }

    impl Fixture {
        fn new(config: DriverConfig) -> Self {
            let linear = Arc::new(LinearAllocator::new(0x1_0000_0000, 64 << 20));
            let device = Device::new(DeviceCaps::gen12lp(), config, linear.clone()).unwrap();
            Self {
                linear,
                device,
                backend: Arc::new(Mutex::new(ImmediateBackend::new())),
            }
        }

        fn queue(&self, desc: QueueDesc) -> CommandQueue {
            let shared: SharedBackend = self.backend.clone();
            CommandQueue::create(&self.device, EngineGroup::Compute, Some(shared), desc).unwrap()
        }

        fn closed_list(&self, mode: Option<PreemptionMode>) -> CommandList {
            let mut list = CommandList::create(&self.device, EngineGroup::Compute, mode).unwrap();
            list.append(Operation::Barrier { timestamp: None }).unwrap();
            list.close().unwrap();
            list
        }

        fn last_batch(&self) -> Vec<GpuCommand> {
            let backend = self.backend.lock().unwrap();
            decode_all(&backend.submissions().last().unwrap().commands).unwrap()
        }
    }

    #[test]
    fn null_csr_handle_is_rejected() {
        let fx = Fixture::new(DriverConfig::default());
        assert!(matches!(
            CommandQueue::create(&fx.device, EngineGroup::Compute, None, QueueDesc::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn lifecycle_advances_after_first_execution() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        assert_eq!(queue.lifecycle(), QueueLifecycle::FirstExecutionPending);

        let list = fx.closed_list(None);
        queue.execute_command_lists(&[&list], None, &[]).unwrap();
        assert_eq!(queue.lifecycle(), QueueLifecycle::SteadyState);
        assert_eq!(queue.task_count(), 1);
        assert!(queue.state().pipeline_selected);
        assert!(queue.state().state_base_address_programmed);
    }

    #[test]
    fn open_list_aborts_whole_batch() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let closed = fx.closed_list(None);
        let open = CommandList::create(&fx.device, EngineGroup::Compute, None).unwrap();

        assert!(matches!(
            queue.execute_command_lists(&[&closed, &open], None, &[]),
            Err(Error::InvalidState(_))
        ));
        assert!(fx.backend.lock().unwrap().submissions().is_empty());
        assert_eq!(queue.lifecycle(), QueueLifecycle::FirstExecutionPending);
        assert_eq!(queue.task_count(), 0);
    }

    #[test]
    fn mismatched_engine_is_rejected() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let mut copy = CommandList::create(&fx.device, EngineGroup::Copy, None).unwrap();
        copy.close().unwrap();
        assert!(matches!(
            queue.execute_command_lists(&[&copy], None, &[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.execute_command_lists(&[], None, &[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn backend_failure_leaves_state_untouched() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let list = fx.closed_list(Some(PreemptionMode::MidThread));
        let before = *queue.state();

        fx.backend
            .lock()
            .unwrap()
            .fail_next_submit(BackendError::DeviceLost);
        assert!(matches!(
            queue.execute_command_lists(&[&list], None, &[]),
            Err(Error::Backend(BackendError::DeviceLost))
        ));
        assert_eq!(*queue.state(), before);
        assert_eq!(queue.task_count(), 0);

        // The retry re-emits every one-time command, written where the failed batch was.
        queue.execute_command_lists(&[&list], None, &[]).unwrap();
        let backend = fx.backend.lock().unwrap();
        let submission = &backend.submissions()[0];
        assert_eq!(submission.task_count, 1);
        let cmds = decode_all(&submission.commands).unwrap();
        assert_eq!(cmds[0].opcode(), CmdOpcode::PipelineSelect);
        assert!(cmds.iter().any(|c| c.opcode() == CmdOpcode::StateSip));
    }

    #[test]
    fn batch_ends_with_completion_tag() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let list = fx.closed_list(None);
        queue.execute_command_lists(&[&list], None, &[]).unwrap();
        queue.execute_command_lists(&[&list], None, &[]).unwrap();

        let cmds = fx.last_batch();
        assert_eq!(
            cmds,
            vec![
                GpuCommand::BatchBufferStart {
                    address: list.gpu_address(),
                    second_level: true,
                },
                completion_tag(queue.tag_address(), 2),
                GpuCommand::BatchBufferEnd,
            ]
        );
    }

    #[test]
    fn wait_events_lead_the_batch() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let event = fx.device.create_event().unwrap();
        let list = fx.closed_list(None);
        queue.execute_command_lists(&[&list], None, &[&event]).unwrap();

        let cmds = fx.last_batch();
        assert_eq!(cmds[0], wait_event_command(event.gpu_address()));
        assert_eq!(cmds[1].opcode(), CmdOpcode::PipelineSelect);

        let backend = fx.backend.lock().unwrap();
        assert!(backend.submissions()[0]
            .residency
            .contains(&event.allocation_id()));
    }

    #[test]
    fn fences_track_their_submission() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let list = fx.closed_list(None);
        let mut fence = queue.create_fence();
        assert!(!queue.fence_status(&fence).unwrap());
        assert!(matches!(
            queue.host_synchronize(&fence, None),
            Err(Error::InvalidState(_))
        ));

        fx.backend.lock().unwrap().set_hold_completions(true);
        queue
            .execute_command_lists(&[&list], Some(&mut fence), &[])
            .unwrap();
        assert_eq!(fence.task_count(), Some(1));
        assert!(!queue.fence_status(&fence).unwrap());
        assert!(matches!(
            queue.host_synchronize(&fence, None),
            Err(Error::Backend(BackendError::Timeout))
        ));

        fx.backend.lock().unwrap().complete_pending();
        assert!(queue.fence_status(&fence).unwrap());
        queue.host_synchronize(&fence, None).unwrap();
    }

    #[test]
    fn synchronous_queue_waits_for_completion() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc {
            mode: QueueMode::Synchronous,
            ..QueueDesc::default()
        });
        let list = fx.closed_list(None);
        queue.execute_command_lists(&[&list], None, &[]).unwrap();

        fx.backend.lock().unwrap().set_hold_completions(true);
        // Submitted, but the wait times out.
        assert!(matches!(
            queue.execute_command_lists(&[&list], None, &[]),
            Err(Error::Backend(BackendError::Timeout))
        ));
        assert_eq!(queue.task_count(), 2);
    }

    #[test]
    fn full_ring_segments_are_released_once_complete() {
        let fx = Fixture::new(DriverConfig {
            queue_ring_size: 4096,
            ..DriverConfig::default()
        });
        let mut queue = fx.queue(QueueDesc::default());
        let list = fx.closed_list(None);
        fx.backend.lock().unwrap().set_hold_completions(true);

        // Each steady-state batch is 64 bytes, so a page fills after a few dozen.
        for _ in 0..100 {
            queue.execute_command_lists(&[&list], None, &[]).unwrap();
        }
        assert!(queue.retired_segment_count() > 0);

        fx.backend.lock().unwrap().complete_pending();
        queue.synchronize(None).unwrap();
        assert_eq!(queue.retired_segment_count(), 0);
    }

    #[test]
    fn reset_requires_idle_and_reprograms_state() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let list = fx.closed_list(None);

        fx.backend.lock().unwrap().set_hold_completions(true);
        queue.execute_command_lists(&[&list], None, &[]).unwrap();
        assert!(matches!(queue.reset(), Err(Error::InvalidState(_))));

        fx.backend.lock().unwrap().complete_pending();
        queue.reset().unwrap();
        assert_eq!(queue.lifecycle(), QueueLifecycle::FirstExecutionPending);

        fx.backend.lock().unwrap().set_hold_completions(false);
        queue.execute_command_lists(&[&list], None, &[]).unwrap();
        assert_eq!(fx.last_batch()[0].opcode(), CmdOpcode::PipelineSelect);
    }

    #[test]
    fn reset_keeps_the_running_preemption_mode() {
        let fx = Fixture::new(DriverConfig::default());
        let mut queue = fx.queue(QueueDesc::default());
        let mid_thread = fx.closed_list(Some(PreemptionMode::MidThread));
        let thread_group = fx.closed_list(Some(PreemptionMode::ThreadGroup));

        queue.execute_command_lists(&[&mid_thread], None, &[]).unwrap();
        queue.reset().unwrap();
        assert_eq!(queue.state().last_preemption_mode, PreemptionMode::MidThread);

        queue
            .execute_command_lists(&[&thread_group], None, &[])
            .unwrap();
        let caps = fx.device.caps();
        let opcodes: Vec<_> = fx.last_batch().iter().map(GpuCommand::opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                CmdOpcode::PipelineSelect,
                CmdOpcode::StateBaseAddress,
                CmdOpcode::PipeControl,
                CmdOpcode::LoadRegisterImm,
                CmdOpcode::BatchBufferStart,
                CmdOpcode::PipeControl,
                CmdOpcode::BatchBufferEnd,
            ]
        );
        assert_eq!(
            fx.last_batch()[3],
            caps.preemption_register
                .load_register_imm(PreemptionMode::ThreadGroup)
        );
        assert_eq!(queue.state().last_preemption_mode, PreemptionMode::ThreadGroup);
    }

    #[test]
    fn fences_from_another_device_are_rejected() {
        let fx = Fixture::new(DriverConfig::default());
        let other = Fixture {
            backend: fx.backend.clone(),
            ..Fixture::new(DriverConfig::default())
        };
        let mut queue = fx.queue(QueueDesc::default());
        let foreign_queue = other.queue(QueueDesc::default());
        assert_ne!(queue.id(), foreign_queue.id());

        let list = fx.closed_list(None);
        let mut foreign = foreign_queue.create_fence();
        assert!(matches!(
            queue.execute_command_lists(&[&list], Some(&mut foreign), &[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.fence_status(&foreign),
            Err(Error::InvalidArgument(_))
        ));
        assert!(fx.backend.lock().unwrap().submissions().is_empty());
    }

    #[test]
    fn wait_events_from_another_device_are_rejected() {
        let fx = Fixture::new(DriverConfig::default());
        let other = Fixture::new(DriverConfig::default());
        let foreign = other.device.create_event().unwrap();
        let mut queue = fx.queue(QueueDesc::default());
        let list = fx.closed_list(None);

        assert!(matches!(
            queue.execute_command_lists(&[&list], None, &[&foreign]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(fx.backend.lock().unwrap().submissions().is_empty());
        assert_eq!(queue.task_count(), 0);
    }

    #[test]
    fn destroy_releases_queue_allocations() {
        let fx = Fixture::new(DriverConfig::default());
        let baseline = fx.linear.live_allocations().len();
        let queue = {
            let shared = crate::backend::shared(NullBackend::new());
            CommandQueue::create(&fx.device, EngineGroup::Compute, Some(shared), QueueDesc::default())
                .unwrap()
        };
        // Ring, tag, and CSR save area.
        assert_eq!(fx.linear.live_allocations().len(), baseline + 3);
        queue.destroy();
        assert_eq!(fx.linear.live_allocations().len(), baseline);
    }

    #[test]
    fn copy_queue_skips_render_state() {
        let fx = Fixture::new(DriverConfig::default());
        let shared: SharedBackend = fx.backend.clone();
        let mut queue =
            CommandQueue::create(&fx.device, EngineGroup::Copy, Some(shared), QueueDesc::default())
                .unwrap();
        let mut list = CommandList::create(&fx.device, EngineGroup::Copy, None).unwrap();
        list.append(Operation::Copy {
            src: 0x1000,
            dst: 0x2000,
            size: 64,
        })
        .unwrap();
        list.close().unwrap();

        queue.execute_command_lists(&[&list], None, &[]).unwrap();
        let opcodes: Vec<_> = fx.last_batch().iter().map(GpuCommand::opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                CmdOpcode::BatchBufferStart,
                CmdOpcode::PipeControl,
                CmdOpcode::BatchBufferEnd,
            ]
        );
    }
}
