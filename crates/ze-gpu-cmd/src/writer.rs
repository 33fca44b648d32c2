//! Growable command stream builder.
//!
//! Intended for tests, fixtures, and host-side tooling that needs to emit canonical packet
//! streams without managing fixed-capacity segments.

use crate::caps::DeviceCaps;
use crate::command::{
    ComputeWalker, EncodeError, GpuCommand, HeapRange, PipeControl, Pipeline, PostSync,
    SemaphoreCompare, StateBaseAddress,
};

#[derive(Debug, Clone)]
pub struct CmdWriter {
    caps: DeviceCaps,
    buf: Vec<u8>,
}

impl CmdWriter {
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            buf: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Append `cmd`, returning the byte offset it was written at.
    pub fn push(&mut self, cmd: &GpuCommand) -> Result<usize, EncodeError> {
        cmd.validate(&self.caps)?;

        let offset = self.buf.len();
        self.buf.resize(offset + cmd.size_bytes(), 0);
        match cmd.encode(&self.caps, &mut self.buf[offset..]) {
            Ok(_) => Ok(offset),
            Err(err) => {
                self.buf.truncate(offset);
                Err(err)
            }
        }
    }

    pub fn pipeline_select(&mut self, pipeline: Pipeline) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::PipelineSelect { pipeline })
    }

    pub fn state_base_address(&mut self, sba: StateBaseAddress) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::StateBaseAddress(sba))
    }

    /// STATE_BASE_ADDRESS programming all four heaps.
    pub fn state_base_address_all(
        &mut self,
        general_state: HeapRange,
        instruction: HeapRange,
        surface_state: HeapRange,
        dynamic_state: HeapRange,
    ) -> Result<usize, EncodeError> {
        let mocs = self.caps.state_mocs;
        self.state_base_address(StateBaseAddress {
            general_state: Some(general_state),
            instruction: Some(instruction),
            surface_state: Some(surface_state),
            dynamic_state: Some(dynamic_state),
            mocs,
        })
    }

    pub fn load_register_imm(&mut self, register_offset: u32, data: u32) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::LoadRegisterImm {
            register_offset,
            data,
        })
    }

    pub fn pipe_control(&mut self, pc: PipeControl) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::PipeControl(pc))
    }

    pub fn write_timestamp(&mut self, address: u64) -> Result<usize, EncodeError> {
        self.pipe_control(PipeControl {
            post_sync: PostSync::WriteTimestamp { address },
            ..PipeControl::stall()
        })
    }

    pub fn compute_walker(&mut self, walker: ComputeWalker) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::ComputeWalker(walker))
    }

    pub fn mem_copy(&mut self, src: u64, dst: u64, size: u64) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::MemCopy { src, dst, size })
    }

    pub fn batch_buffer_start(&mut self, address: u64, second_level: bool) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::BatchBufferStart {
            address,
            second_level,
        })
    }

    pub fn batch_buffer_end(&mut self) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::BatchBufferEnd)
    }

    pub fn state_sip(&mut self, sip_address: u64) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::StateSip { sip_address })
    }

    pub fn gpgpu_csr_base_address(&mut self, address: u64) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::GpgpuCsrBaseAddress { address })
    }

    pub fn semaphore_wait(
        &mut self,
        address: u64,
        value: u32,
        compare: SemaphoreCompare,
    ) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::SemaphoreWait {
            address,
            value,
            compare,
        })
    }

    pub fn noop(&mut self) -> Result<usize, EncodeError> {
        self.push(&GpuCommand::Noop)
    }
}
