//! Command lists, the state-transition policy, and command queues.
//!
//! ```text
//! CommandList::append ─┐
//!                      ├─ close ─> CommandQueue::execute_command_lists
//!                      │              ├─ TransitionPolicy::plan
//!                      │              ├─ encode into the ring
//!                      │              └─ SubmissionBackend::submit
//! ```
//!
//! Device memory comes from an [`AllocationProvider`]; batches go to a [`SubmissionBackend`].
//! Both are supplied by the embedder.
#![forbid(unsafe_code)]

pub mod allocation;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod list;
pub mod policy;
pub mod queue;

pub use allocation::{
    Allocation, AllocationId, AllocationKind, AllocationProvider, DeviceAllocation,
    LinearAllocator,
};
pub use backend::{
    shared, BackendError, ImmediateBackend, NullBackend, SharedBackend, Submission,
    SubmissionBackend,
};
pub use buffer::{CommandBuffer, Segment};
pub use config::{ConfigError, DriverConfig};
pub use device::{Device, Event};
pub use error::{Error, Result};
pub use list::{CommandList, EngineGroup, EventRef, KernelDispatch, Operation};
pub use policy::{QueueState, TransitionDecision, TransitionPolicy};
pub use queue::{CommandQueue, Fence, QueueDesc, QueueLifecycle, QueueMode, QueuePriority};
