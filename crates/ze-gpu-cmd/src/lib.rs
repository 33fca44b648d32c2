//! GPU command packet encoding.
//!
//! This crate is the leaf of the command-stream pipeline:
//! - [`cmd`]: opcodes, packed packet layouts, and a raw packet walker.
//! - [`command`]: [`GpuCommand`], the typed view of a packet, with a size query that mirrors
//!   encoding exactly, plus decoding for tools and tests.
//! - [`caps`]: per-generation [`DeviceCaps`] and the [`CapsRegistry`].
//! - [`writer`]: a growable [`CmdWriter`] for fixtures and tooling.
#![forbid(unsafe_code)]

pub mod caps;
pub mod cmd;
pub mod command;
pub mod writer;

pub use caps::{CapsRegistry, DeviceCaps, HeapSizes, PreemptionMode, PreemptionRegister};
pub use cmd::{CmdDecodeError, CmdOpcode, CmdPacket, CmdStreamIter};
pub use command::{
    decode_all, ComputeWalker, EncodeError, GpuCommand, HeapRange, PipeControl, PipeControlFlags,
    Pipeline, PostSync, SemaphoreCompare, StateBaseAddress,
};
pub use writer::CmdWriter;
