#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use anyhow::{anyhow, Context, Result};
use ze_cmdstream::cmdqueue::{ImmediateBackend, LinearAllocator, SharedBackend, Submission};
use ze_cmdstream::gpu_cmd::decode_all;
use ze_cmdstream::{
    CommandList, CommandQueue, Device, DeviceCaps, DriverConfig, EngineGroup, GpuCommand,
    Operation, PreemptionMode, QueueDesc,
};

pub const VA_BASE: u64 = 0x1_0000_0000;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();
    });
}

/// A device, an in-process backend that records submissions, and one queue.
pub struct Harness {
    pub allocator: Arc<LinearAllocator>,
    pub device: Arc<Device>,
    pub backend: Arc<Mutex<ImmediateBackend>>,
    pub queue: CommandQueue,
}

impl Harness {
    pub fn new(caps: DeviceCaps) -> Result<Self> {
        Self::with_config(caps, DriverConfig::default(), EngineGroup::Compute, VA_BASE)
    }

    pub fn with_config(
        caps: DeviceCaps,
        config: DriverConfig,
        engine: EngineGroup,
        va_base: u64,
    ) -> Result<Self> {
        init_tracing();
        let allocator = Arc::new(LinearAllocator::new(va_base, 256 << 20));
        let device = Device::new(caps, config, allocator.clone()).context("create device")?;
        let backend = Arc::new(Mutex::new(ImmediateBackend::new()));
        let shared: SharedBackend = backend.clone();
        let queue = CommandQueue::create(&device, engine, Some(shared), QueueDesc::default())
            .context("create queue")?;
        Ok(Self {
            allocator,
            device,
            backend,
            queue,
        })
    }

    /// A closed compute list holding one barrier.
    pub fn list(&self, mode: Option<PreemptionMode>) -> Result<CommandList> {
        let mut list = CommandList::create(&self.device, EngineGroup::Compute, mode)?;
        list.append(Operation::Barrier { timestamp: None })?;
        list.close()?;
        Ok(list)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.backend.lock().unwrap().submissions().to_vec()
    }

    pub fn batch(&self, index: usize) -> Result<Vec<GpuCommand>> {
        let submissions = self.submissions();
        let submission = submissions
            .get(index)
            .ok_or_else(|| anyhow!("no submission #{index} (have {})", submissions.len()))?;
        decode_all(&submission.commands).context("decode ring batch")
    }

    /// Every submitted command, in submission order.
    pub fn trace(&self) -> Result<Vec<GpuCommand>> {
        let mut all = Vec::new();
        for submission in self.submissions() {
            all.extend(decode_all(&submission.commands)?);
        }
        Ok(all)
    }
}

pub fn count(trace: &[GpuCommand], pred: impl Fn(&GpuCommand) -> bool) -> usize {
    trace.iter().filter(|cmd| pred(cmd)).count()
}
