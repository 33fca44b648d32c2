//! GPU command-stream execution pipeline.
//!
//! Re-exports the packet encoder ([`gpu_cmd`]) and the list/queue layer built on it
//! ([`cmdqueue`]) under one crate.
#![forbid(unsafe_code)]

pub use ze_cmdqueue as cmdqueue;
pub use ze_gpu_cmd as gpu_cmd;

pub use ze_cmdqueue::{
    CommandList, CommandQueue, Device, DriverConfig, EngineGroup, Error, Fence, Operation,
    QueueDesc, Result,
};
pub use ze_gpu_cmd::{CapsRegistry, DeviceCaps, GpuCommand, PreemptionMode};
