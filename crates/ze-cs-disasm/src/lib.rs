//! Command stream inspection helpers behind the `ze-cs-disasm` binary.

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use ze_cmdqueue::{
    CommandList, CommandQueue, Device, DriverConfig, EngineGroup, ImmediateBackend,
    KernelDispatch, LinearAllocator, Operation, QueueDesc, SharedBackend,
};
use ze_gpu_cmd::{CmdStreamIter, ComputeWalker, DeviceCaps, GpuCommand, PreemptionMode};

/// GPU virtual range the demo allocator hands out.
const DEMO_VA_BASE: u64 = 0x1_0000_0000;
const DEMO_VA_SIZE: usize = 256 << 20;

/// Print one line per packet in `stream`, returning the packet count.
pub fn disassemble(stream: &[u8], out: &mut impl Write) -> anyhow::Result<usize> {
    let mut count = 0;
    for packet in CmdStreamIter::new(stream) {
        let packet = packet.context("malformed command stream")?;
        let offset = packet.offset;
        match packet.opcode {
            Some(_) => {
                let (cmd, _) = GpuCommand::decode(packet.bytes)
                    .with_context(|| format!("decode packet at offset {offset:#x}"))?;
                writeln!(out, "{offset:#08x}  {cmd}")?;
            }
            None => {
                let opcode = packet.hdr.opcode;
                writeln!(
                    out,
                    "{offset:#08x}  UNKNOWN opcode={opcode:#x} size={}",
                    packet.bytes.len()
                )?;
            }
        }
        count += 1;
    }
    Ok(count)
}

/// Submit a ThreadGroup list followed by a MidThread list on a fresh queue and return the
/// bytes of the resulting ring batch.
pub fn run_demo(caps: DeviceCaps, config: DriverConfig) -> anyhow::Result<Vec<u8>> {
    let allocator = Arc::new(LinearAllocator::new(DEMO_VA_BASE, DEMO_VA_SIZE));
    let device = Device::new(caps, config, allocator)?;
    let backend = Arc::new(Mutex::new(ImmediateBackend::new()));
    let shared: SharedBackend = backend.clone();
    let mut queue =
        CommandQueue::create(&device, EngineGroup::Compute, Some(shared), QueueDesc::default())?;

    let walker = ComputeWalker {
        kernel_start: DEMO_VA_BASE + 0x100_0000,
        indirect_data_start: DEMO_VA_BASE + 0x110_0000,
        indirect_data_length: 64,
        simd_size: 16,
        thread_group_count: [64, 1, 1],
        local_size: [16, 1, 1],
        slm_size_bytes: 0,
    };

    let mut lists = Vec::new();
    for mode in [PreemptionMode::ThreadGroup, PreemptionMode::MidThread] {
        let mut list = CommandList::create(&device, EngineGroup::Compute, Some(mode))?;
        list.append(Operation::Dispatch(KernelDispatch::new(walker)))?;
        list.append(Operation::Barrier { timestamp: None })?;
        list.close()?;
        lists.push(list);
    }
    let refs: Vec<&CommandList> = lists.iter().collect();
    queue.execute_command_lists(&refs, None, &[])?;
    queue.synchronize(None)?;

    let mut backend = backend
        .lock()
        .map_err(|_| anyhow!("submission backend lock poisoned"))?;
    let submission = backend
        .take_submissions()
        .pop()
        .ok_or_else(|| anyhow!("queue produced no submission"))?;
    tracing::info!(
        batch_address = %format!("{:#x}", submission.batch_address),
        bytes = submission.commands.len(),
        "demo batch submitted"
    );
    Ok(submission.commands)
}
