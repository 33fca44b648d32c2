//! Segmented GPU command buffers.
//!
//! A [`CommandBuffer`] is a chain of fixed-capacity segments. Every segment except the newest
//! keeps room for one BATCH_BUFFER_START, so appending can always jump to a fresh segment
//! when the current one runs out of space.

use std::sync::Arc;

use ze_gpu_cmd::{CmdOpcode, DeviceCaps, EncodeError, GpuCommand};

use crate::allocation::{AllocationId, AllocationKind, AllocationProvider, DeviceAllocation};
use crate::config::MIN_SEGMENT_SIZE;
use crate::error::{Error, Result};

/// Bytes held back at the end of a segment for the chaining jump.
pub const CHAIN_RESERVE: usize = CmdOpcode::BatchBufferStart.packet_size_bytes();

#[derive(Debug)]
pub struct Segment {
    memory: DeviceAllocation,
    bytes: Vec<u8>,
    used: usize,
}

impl Segment {
    fn new(memory: DeviceAllocation) -> Self {
        let bytes = vec![0u8; memory.size()];
        Self {
            memory,
            bytes,
            used: 0,
        }
    }

    pub fn gpu_address(&self) -> u64 {
        self.memory.gpu_address()
    }

    pub fn allocation_id(&self) -> AllocationId {
        self.memory.id()
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used
    }

    /// Encoded bytes, up to the write cursor.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.used]
    }

    /// GPU address of the next byte to be written.
    pub fn cursor_address(&self) -> u64 {
        self.gpu_address() + self.used as u64
    }

    /// Encode `cmd` at the cursor without chaining.
    pub fn write(&mut self, caps: &DeviceCaps, cmd: &GpuCommand) -> std::result::Result<usize, EncodeError> {
        let written = cmd.encode(caps, &mut self.bytes[self.used..])?;
        self.used += written;
        Ok(written)
    }

    fn rewind(&mut self, used: usize) {
        if used < self.used {
            self.bytes[used..self.used].fill(0);
            self.used = used;
        }
    }

    fn clear(&mut self) {
        self.rewind(0);
    }
}

#[derive(Debug)]
pub struct CommandBuffer {
    provider: Arc<dyn AllocationProvider>,
    kind: AllocationKind,
    segment_size: usize,
    segments: Vec<Segment>,
}

impl CommandBuffer {
    pub fn new(
        provider: &Arc<dyn AllocationProvider>,
        kind: AllocationKind,
        segment_size: usize,
    ) -> Result<Self> {
        if segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::InvalidArgument("command buffer segment size too small"));
        }
        let first = DeviceAllocation::new(provider, segment_size, kind)?;
        Ok(Self {
            provider: Arc::clone(provider),
            kind,
            segment_size,
            segments: vec![Segment::new(first)],
        })
    }

    /// Address of the first segment, where execution of the buffer starts.
    pub fn gpu_address(&self) -> u64 {
        self.segments[0].gpu_address()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn current(&self) -> &Segment {
        let last = self.segments.len() - 1;
        &self.segments[last]
    }

    fn current_mut(&mut self) -> &mut Segment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// Total encoded bytes across all segments, chaining jumps included.
    pub fn used(&self) -> usize {
        self.segments.iter().map(Segment::used).sum()
    }

    pub fn allocation_ids(&self) -> impl Iterator<Item = AllocationId> + '_ {
        self.segments.iter().map(Segment::allocation_id)
    }

    /// Append `cmd`, chaining into a new segment first if it would not fit alongside the
    /// reserved jump. On error the buffer is unchanged.
    pub fn append(&mut self, caps: &DeviceCaps, cmd: &GpuCommand) -> Result<usize> {
        cmd.validate(caps)?;

        let needed = cmd.size_bytes();
        if self.current().remaining() < needed + CHAIN_RESERVE {
            self.chain(caps, needed + CHAIN_RESERVE)?;
        }
        Ok(self.current_mut().write(caps, cmd)?)
    }

    fn chain(&mut self, caps: &DeviceCaps, min_size: usize) -> Result<()> {
        let size = self.segment_size.max(min_size);
        let next = Segment::new(DeviceAllocation::new(&self.provider, size, self.kind)?);
        let jump = GpuCommand::BatchBufferStart {
            address: next.gpu_address(),
            second_level: false,
        };
        // `next` frees itself if the jump cannot be encoded.
        self.current_mut().write(caps, &jump)?;
        tracing::trace!(
            from = %format!("{:#x}", self.current().gpu_address()),
            to = %format!("{:#x}", next.gpu_address()),
            "chained command buffer segment"
        );
        self.segments.push(next);
        Ok(())
    }

    /// Make sure the current segment has `size` contiguous bytes, moving to a fresh segment
    /// if it does not. The exhausted segment is handed back to the caller, who decides when
    /// the GPU is done with it.
    pub fn reserve_contiguous(&mut self, size: usize) -> Result<Option<Segment>> {
        if self.current().remaining() >= size {
            return Ok(None);
        }
        let next = Segment::new(DeviceAllocation::new(
            &self.provider,
            self.segment_size.max(size),
            self.kind,
        )?);
        let last = self.segments.len() - 1;
        Ok(Some(std::mem::replace(&mut self.segments[last], next)))
    }

    /// Encode at the cursor of the current segment without chaining.
    pub fn write_contiguous(&mut self, caps: &DeviceCaps, cmd: &GpuCommand) -> Result<usize> {
        Ok(self.current_mut().write(caps, cmd)?)
    }

    /// Roll the current segment's cursor back to `used`.
    pub fn rewind(&mut self, used: usize) {
        self.current_mut().rewind(used);
    }

    /// Drop every segment but the first and clear it.
    pub fn reset(&mut self) {
        self.segments.truncate(1);
        self.segments[0].clear();
    }
}
