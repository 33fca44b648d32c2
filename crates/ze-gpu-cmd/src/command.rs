//! Typed GPU commands: size query, encoding, and decoding.
//!
//! [`GpuCommand::size_bytes`] is the size-query mirror of [`GpuCommand::encode`]: callers reserve
//! buffer space by summing size queries, and `encode` consumes exactly that much.

use core::fmt;
use core::mem::offset_of;

use bitflags::bitflags;

use crate::caps::DeviceCaps;
use crate::cmd::{
    decode_cmd_hdr_le, read_u32_le, read_u64_le, CmdBatchBufferStart, CmdComputeWalker,
    CmdDecodeError, CmdGpgpuCsrBaseAddress, CmdHdr, CmdLoadRegisterImm, CmdMemCopy, CmdOpcode,
    CmdPipeControl, CmdPipelineSelect, CmdSemaphoreWait, CmdStateBaseAddress, CmdStateSip,
    BATCH_BUFFER_START_FLAG_SECOND_LEVEL, PIPELINE_3D, PIPELINE_GPGPU, PIPELINE_MEDIA,
    POST_SYNC_OP_NONE, POST_SYNC_OP_WRITE_IMMEDIATE, POST_SYNC_OP_WRITE_TIMESTAMP,
    SBA_MODIFY_DYNAMIC_STATE, SBA_MODIFY_GENERAL_STATE, SBA_MODIFY_INSTRUCTION,
    SBA_MODIFY_SURFACE_STATE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("address 0x{address:x} does not fit in {address_bits} bits")]
    UnsupportedAddressRange { address: u64, address_bits: u8 },
    #[error("command needs {needed} bytes but only {remaining} remain")]
    BufferTooSmall { needed: usize, remaining: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pipeline {
    ThreeD,
    Media,
    Gpgpu,
}

impl Pipeline {
    fn to_u32(self) -> u32 {
        match self {
            Self::ThreeD => PIPELINE_3D,
            Self::Media => PIPELINE_MEDIA,
            Self::Gpgpu => PIPELINE_GPGPU,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            PIPELINE_3D => Some(Self::ThreeD),
            PIPELINE_MEDIA => Some(Self::Media),
            PIPELINE_GPGPU => Some(Self::Gpgpu),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PipeControlFlags: u32 {
        const STATE_CACHE_INVALIDATE = 1 << 2;
        const CONSTANT_CACHE_INVALIDATE = 1 << 3;
        const DC_FLUSH = 1 << 5;
        const HDC_PIPELINE_FLUSH = 1 << 9;
        const TEXTURE_CACHE_INVALIDATE = 1 << 10;
        const INSTRUCTION_CACHE_INVALIDATE = 1 << 11;
        const RENDER_TARGET_CACHE_FLUSH = 1 << 12;
        const CS_STALL = 1 << 20;
    }
}

impl PipeControlFlags {
    /// Full stall + data cache flush used around state transitions.
    pub const STALL_AND_FLUSH: Self = Self::CS_STALL.union(Self::DC_FLUSH);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostSync {
    None,
    WriteImmediate { address: u64, value: u64 },
    WriteTimestamp { address: u64 },
}

impl PostSync {
    pub fn address(&self) -> Option<u64> {
        match *self {
            Self::None => None,
            Self::WriteImmediate { address, .. } | Self::WriteTimestamp { address } => {
                Some(address)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeControl {
    pub flags: PipeControlFlags,
    pub post_sync: PostSync,
}

impl PipeControl {
    pub fn stall() -> Self {
        Self {
            flags: PipeControlFlags::STALL_AND_FLUSH,
            post_sync: PostSync::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapRange {
    pub base: u64,
    pub size: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StateBaseAddress {
    pub general_state: Option<HeapRange>,
    pub instruction: Option<HeapRange>,
    pub surface_state: Option<HeapRange>,
    pub dynamic_state: Option<HeapRange>,
    pub mocs: u32,
}

impl StateBaseAddress {
    fn heaps(&self) -> [Option<HeapRange>; 4] {
        [
            self.general_state,
            self.instruction,
            self.surface_state,
            self.dynamic_state,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComputeWalker {
    pub kernel_start: u64,
    pub indirect_data_start: u64,
    pub indirect_data_length: u32,
    pub simd_size: u32,
    pub thread_group_count: [u32; 3],
    pub local_size: [u32; 3],
    pub slm_size_bytes: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SemaphoreCompare {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl SemaphoreCompare {
    fn to_u32(self) -> u32 {
        match self {
            Self::GreaterThan => 0,
            Self::GreaterOrEqual => 1,
            Self::LessThan => 2,
            Self::LessOrEqual => 3,
            Self::Equal => 4,
            Self::NotEqual => 5,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::GreaterThan),
            1 => Some(Self::GreaterOrEqual),
            2 => Some(Self::LessThan),
            3 => Some(Self::LessOrEqual),
            4 => Some(Self::Equal),
            5 => Some(Self::NotEqual),
            _ => None,
        }
    }
}

/// One GPU operation, as recorded into a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuCommand {
    Noop,
    PipelineSelect {
        pipeline: Pipeline,
    },
    StateBaseAddress(StateBaseAddress),
    LoadRegisterImm {
        register_offset: u32,
        data: u32,
    },
    PipeControl(PipeControl),
    ComputeWalker(ComputeWalker),
    MemCopy {
        src: u64,
        dst: u64,
        size: u64,
    },
    BatchBufferStart {
        address: u64,
        second_level: bool,
    },
    BatchBufferEnd,
    StateSip {
        sip_address: u64,
    },
    GpgpuCsrBaseAddress {
        address: u64,
    },
    SemaphoreWait {
        address: u64,
        value: u32,
        compare: SemaphoreCompare,
    },
}

fn put_u32(out: &mut [u8], offset: usize, v: u32) {
    out[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut [u8], offset: usize, v: u64) {
    out[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

fn invalid(field: &'static str, value: u32) -> CmdDecodeError {
    CmdDecodeError::InvalidFieldValue { field, value }
}

impl GpuCommand {
    pub fn opcode(&self) -> CmdOpcode {
        match self {
            Self::Noop => CmdOpcode::Noop,
            Self::PipelineSelect { .. } => CmdOpcode::PipelineSelect,
            Self::StateBaseAddress(_) => CmdOpcode::StateBaseAddress,
            Self::LoadRegisterImm { .. } => CmdOpcode::LoadRegisterImm,
            Self::PipeControl(_) => CmdOpcode::PipeControl,
            Self::ComputeWalker(_) => CmdOpcode::ComputeWalker,
            Self::MemCopy { .. } => CmdOpcode::MemCopy,
            Self::BatchBufferStart { .. } => CmdOpcode::BatchBufferStart,
            Self::BatchBufferEnd => CmdOpcode::BatchBufferEnd,
            Self::StateSip { .. } => CmdOpcode::StateSip,
            Self::GpgpuCsrBaseAddress { .. } => CmdOpcode::GpgpuCsrBaseAddress,
            Self::SemaphoreWait { .. } => CmdOpcode::SemaphoreWait,
        }
    }

    /// Bytes [`GpuCommand::encode`] will write.
    pub fn size_bytes(&self) -> usize {
        self.opcode().packet_size_bytes()
    }

    /// Reject any address field `caps` cannot reach.
    pub fn validate(&self, caps: &DeviceCaps) -> Result<(), EncodeError> {
        match self {
            Self::StateBaseAddress(sba) => {
                for heap in sba.heaps().into_iter().flatten() {
                    caps.check_address(heap.base)?;
                }
                Ok(())
            }
            Self::PipeControl(pc) => match pc.post_sync.address() {
                Some(address) => caps.check_address(address),
                None => Ok(()),
            },
            Self::ComputeWalker(walker) => {
                caps.check_address(walker.kernel_start)?;
                caps.check_address(walker.indirect_data_start)
            }
            Self::MemCopy { src, dst, .. } => {
                caps.check_address(*src)?;
                caps.check_address(*dst)
            }
            Self::BatchBufferStart { address, .. }
            | Self::StateSip {
                sip_address: address,
            }
            | Self::GpgpuCsrBaseAddress { address }
            | Self::SemaphoreWait { address, .. } => caps.check_address(*address),
            Self::Noop
            | Self::PipelineSelect { .. }
            | Self::LoadRegisterImm { .. }
            | Self::BatchBufferEnd => Ok(()),
        }
    }

    /// Encode at the start of `out` and return the number of bytes written.
    ///
    /// Nothing is written when validation fails.
    pub fn encode(&self, caps: &DeviceCaps, out: &mut [u8]) -> Result<usize, EncodeError> {
        self.validate(caps)?;

        let size = self.size_bytes();
        if out.len() < size {
            return Err(EncodeError::BufferTooSmall {
                needed: size,
                remaining: out.len(),
            });
        }

        let out = &mut out[..size];
        out.fill(0);
        put_u32(out, offset_of!(CmdHdr, opcode), self.opcode() as u32);
        put_u32(out, offset_of!(CmdHdr, size_bytes), size as u32);

        match *self {
            Self::Noop | Self::BatchBufferEnd => {}
            Self::PipelineSelect { pipeline } => {
                put_u32(out, offset_of!(CmdPipelineSelect, pipeline), pipeline.to_u32());
            }
            Self::StateBaseAddress(sba) => {
                let mut modify_enable = 0u32;
                let heaps = [
                    (
                        sba.general_state,
                        SBA_MODIFY_GENERAL_STATE,
                        offset_of!(CmdStateBaseAddress, general_state_base),
                        offset_of!(CmdStateBaseAddress, general_state_size),
                    ),
                    (
                        sba.instruction,
                        SBA_MODIFY_INSTRUCTION,
                        offset_of!(CmdStateBaseAddress, instruction_base),
                        offset_of!(CmdStateBaseAddress, instruction_size),
                    ),
                    (
                        sba.surface_state,
                        SBA_MODIFY_SURFACE_STATE,
                        offset_of!(CmdStateBaseAddress, surface_state_base),
                        offset_of!(CmdStateBaseAddress, surface_state_size),
                    ),
                    (
                        sba.dynamic_state,
                        SBA_MODIFY_DYNAMIC_STATE,
                        offset_of!(CmdStateBaseAddress, dynamic_state_base),
                        offset_of!(CmdStateBaseAddress, dynamic_state_size),
                    ),
                ];
                for (heap, bit, base_off, size_off) in heaps {
                    if let Some(heap) = heap {
                        modify_enable |= bit;
                        put_u64(out, base_off, heap.base);
                        put_u32(out, size_off, heap.size);
                    }
                }
                put_u32(
                    out,
                    offset_of!(CmdStateBaseAddress, modify_enable),
                    modify_enable,
                );
                put_u32(out, offset_of!(CmdStateBaseAddress, mocs), sba.mocs);
            }
            Self::LoadRegisterImm {
                register_offset,
                data,
            } => {
                put_u32(
                    out,
                    offset_of!(CmdLoadRegisterImm, register_offset),
                    register_offset,
                );
                put_u32(out, offset_of!(CmdLoadRegisterImm, data), data);
            }
            Self::PipeControl(pc) => {
                let (op, address, immediate) = match pc.post_sync {
                    PostSync::None => (POST_SYNC_OP_NONE, 0, 0),
                    PostSync::WriteImmediate { address, value } => {
                        (POST_SYNC_OP_WRITE_IMMEDIATE, address, value)
                    }
                    PostSync::WriteTimestamp { address } => {
                        (POST_SYNC_OP_WRITE_TIMESTAMP, address, 0)
                    }
                };
                put_u32(out, offset_of!(CmdPipeControl, flags), pc.flags.bits());
                put_u32(out, offset_of!(CmdPipeControl, post_sync_op), op);
                put_u64(out, offset_of!(CmdPipeControl, address), address);
                put_u64(out, offset_of!(CmdPipeControl, immediate), immediate);
            }
            Self::ComputeWalker(w) => {
                put_u64(out, offset_of!(CmdComputeWalker, kernel_start), w.kernel_start);
                put_u64(
                    out,
                    offset_of!(CmdComputeWalker, indirect_data_start),
                    w.indirect_data_start,
                );
                put_u32(
                    out,
                    offset_of!(CmdComputeWalker, indirect_data_length),
                    w.indirect_data_length,
                );
                put_u32(out, offset_of!(CmdComputeWalker, simd_size), w.simd_size);
                put_u32(
                    out,
                    offset_of!(CmdComputeWalker, thread_group_count_x),
                    w.thread_group_count[0],
                );
                put_u32(
                    out,
                    offset_of!(CmdComputeWalker, thread_group_count_y),
                    w.thread_group_count[1],
                );
                put_u32(
                    out,
                    offset_of!(CmdComputeWalker, thread_group_count_z),
                    w.thread_group_count[2],
                );
                put_u32(out, offset_of!(CmdComputeWalker, local_size_x), w.local_size[0]);
                put_u32(out, offset_of!(CmdComputeWalker, local_size_y), w.local_size[1]);
                put_u32(out, offset_of!(CmdComputeWalker, local_size_z), w.local_size[2]);
                put_u32(
                    out,
                    offset_of!(CmdComputeWalker, slm_size_bytes),
                    w.slm_size_bytes,
                );
            }
            Self::MemCopy { src, dst, size } => {
                put_u64(out, offset_of!(CmdMemCopy, src_address), src);
                put_u64(out, offset_of!(CmdMemCopy, dst_address), dst);
                put_u64(out, offset_of!(CmdMemCopy, size_bytes), size);
            }
            Self::BatchBufferStart {
                address,
                second_level,
            } => {
                let flags = if second_level {
                    BATCH_BUFFER_START_FLAG_SECOND_LEVEL
                } else {
                    0
                };
                put_u64(out, offset_of!(CmdBatchBufferStart, address), address);
                put_u32(out, offset_of!(CmdBatchBufferStart, flags), flags);
            }
            Self::StateSip { sip_address } => {
                put_u64(out, offset_of!(CmdStateSip, sip_address), sip_address);
            }
            Self::GpgpuCsrBaseAddress { address } => {
                put_u64(out, offset_of!(CmdGpgpuCsrBaseAddress, address), address);
            }
            Self::SemaphoreWait {
                address,
                value,
                compare,
            } => {
                put_u64(out, offset_of!(CmdSemaphoreWait, address), address);
                put_u32(out, offset_of!(CmdSemaphoreWait, value), value);
                put_u32(
                    out,
                    offset_of!(CmdSemaphoreWait, compare_op),
                    compare.to_u32(),
                );
            }
        }

        Ok(size)
    }

    /// Decode the packet at the start of `buf`, returning it with its size in bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CmdDecodeError> {
        let hdr = decode_cmd_hdr_le(buf)?;
        let raw_opcode = hdr.opcode;
        let size = hdr.size_bytes as usize;

        let opcode =
            CmdOpcode::from_u32(raw_opcode).ok_or(CmdDecodeError::UnknownOpcode { found: raw_opcode })?;
        let expected = opcode.packet_size_bytes();
        if size != expected {
            return Err(CmdDecodeError::PayloadSizeMismatch {
                expected,
                found: size,
            });
        }
        if buf.len() < size {
            return Err(CmdDecodeError::BufferTooSmall);
        }
        let p = &buf[..size];

        let cmd = match opcode {
            CmdOpcode::Noop => Self::Noop,
            CmdOpcode::BatchBufferEnd => Self::BatchBufferEnd,
            CmdOpcode::PipelineSelect => {
                let raw = read_u32_le(p, offset_of!(CmdPipelineSelect, pipeline));
                Self::PipelineSelect {
                    pipeline: Pipeline::from_u32(raw).ok_or(invalid("pipeline", raw))?,
                }
            }
            CmdOpcode::StateBaseAddress => {
                let modify_enable = read_u32_le(p, offset_of!(CmdStateBaseAddress, modify_enable));
                let heap = |bit: u32, base_off: usize, size_off: usize| {
                    (modify_enable & bit != 0).then(|| HeapRange {
                        base: read_u64_le(p, base_off),
                        size: read_u32_le(p, size_off),
                    })
                };
                Self::StateBaseAddress(StateBaseAddress {
                    general_state: heap(
                        SBA_MODIFY_GENERAL_STATE,
                        offset_of!(CmdStateBaseAddress, general_state_base),
                        offset_of!(CmdStateBaseAddress, general_state_size),
                    ),
                    instruction: heap(
                        SBA_MODIFY_INSTRUCTION,
                        offset_of!(CmdStateBaseAddress, instruction_base),
                        offset_of!(CmdStateBaseAddress, instruction_size),
                    ),
                    surface_state: heap(
                        SBA_MODIFY_SURFACE_STATE,
                        offset_of!(CmdStateBaseAddress, surface_state_base),
                        offset_of!(CmdStateBaseAddress, surface_state_size),
                    ),
                    dynamic_state: heap(
                        SBA_MODIFY_DYNAMIC_STATE,
                        offset_of!(CmdStateBaseAddress, dynamic_state_base),
                        offset_of!(CmdStateBaseAddress, dynamic_state_size),
                    ),
                    mocs: read_u32_le(p, offset_of!(CmdStateBaseAddress, mocs)),
                })
            }
            CmdOpcode::LoadRegisterImm => Self::LoadRegisterImm {
                register_offset: read_u32_le(p, offset_of!(CmdLoadRegisterImm, register_offset)),
                data: read_u32_le(p, offset_of!(CmdLoadRegisterImm, data)),
            },
            CmdOpcode::PipeControl => {
                let flags = read_u32_le(p, offset_of!(CmdPipeControl, flags));
                let op = read_u32_le(p, offset_of!(CmdPipeControl, post_sync_op));
                let address = read_u64_le(p, offset_of!(CmdPipeControl, address));
                let immediate = read_u64_le(p, offset_of!(CmdPipeControl, immediate));
                let post_sync = match op {
                    POST_SYNC_OP_NONE => PostSync::None,
                    POST_SYNC_OP_WRITE_IMMEDIATE => PostSync::WriteImmediate {
                        address,
                        value: immediate,
                    },
                    POST_SYNC_OP_WRITE_TIMESTAMP => PostSync::WriteTimestamp { address },
                    other => return Err(invalid("post_sync_op", other)),
                };
                Self::PipeControl(PipeControl {
                    flags: PipeControlFlags::from_bits_retain(flags),
                    post_sync,
                })
            }
            CmdOpcode::ComputeWalker => Self::ComputeWalker(ComputeWalker {
                kernel_start: read_u64_le(p, offset_of!(CmdComputeWalker, kernel_start)),
                indirect_data_start: read_u64_le(p, offset_of!(CmdComputeWalker, indirect_data_start)),
                indirect_data_length: read_u32_le(
                    p,
                    offset_of!(CmdComputeWalker, indirect_data_length),
                ),
                simd_size: read_u32_le(p, offset_of!(CmdComputeWalker, simd_size)),
                thread_group_count: [
                    read_u32_le(p, offset_of!(CmdComputeWalker, thread_group_count_x)),
                    read_u32_le(p, offset_of!(CmdComputeWalker, thread_group_count_y)),
                    read_u32_le(p, offset_of!(CmdComputeWalker, thread_group_count_z)),
                ],
                local_size: [
                    read_u32_le(p, offset_of!(CmdComputeWalker, local_size_x)),
                    read_u32_le(p, offset_of!(CmdComputeWalker, local_size_y)),
                    read_u32_le(p, offset_of!(CmdComputeWalker, local_size_z)),
                ],
                slm_size_bytes: read_u32_le(p, offset_of!(CmdComputeWalker, slm_size_bytes)),
            }),
            CmdOpcode::MemCopy => Self::MemCopy {
                src: read_u64_le(p, offset_of!(CmdMemCopy, src_address)),
                dst: read_u64_le(p, offset_of!(CmdMemCopy, dst_address)),
                size: read_u64_le(p, offset_of!(CmdMemCopy, size_bytes)),
            },
            CmdOpcode::BatchBufferStart => {
                let flags = read_u32_le(p, offset_of!(CmdBatchBufferStart, flags));
                if flags & !BATCH_BUFFER_START_FLAG_SECOND_LEVEL != 0 {
                    return Err(invalid("batch_buffer_start.flags", flags));
                }
                Self::BatchBufferStart {
                    address: read_u64_le(p, offset_of!(CmdBatchBufferStart, address)),
                    second_level: flags & BATCH_BUFFER_START_FLAG_SECOND_LEVEL != 0,
                }
            }
            CmdOpcode::StateSip => Self::StateSip {
                sip_address: read_u64_le(p, offset_of!(CmdStateSip, sip_address)),
            },
            CmdOpcode::GpgpuCsrBaseAddress => Self::GpgpuCsrBaseAddress {
                address: read_u64_le(p, offset_of!(CmdGpgpuCsrBaseAddress, address)),
            },
            CmdOpcode::SemaphoreWait => {
                let raw = read_u32_le(p, offset_of!(CmdSemaphoreWait, compare_op));
                Self::SemaphoreWait {
                    address: read_u64_le(p, offset_of!(CmdSemaphoreWait, address)),
                    value: read_u32_le(p, offset_of!(CmdSemaphoreWait, value)),
                    compare: SemaphoreCompare::from_u32(raw).ok_or(invalid("compare_op", raw))?,
                }
            }
        };

        Ok((cmd, size))
    }
}

/// Decode every packet in `buf`.
pub fn decode_all(buf: &[u8]) -> Result<Vec<GpuCommand>, CmdDecodeError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < buf.len() {
        let (cmd, size) = GpuCommand::decode(&buf[offset..])?;
        out.push(cmd);
        offset = offset.checked_add(size).ok_or(CmdDecodeError::CountOverflow)?;
    }
    Ok(out)
}

impl fmt::Display for GpuCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode().mnemonic())?;
        match self {
            Self::Noop | Self::BatchBufferEnd => Ok(()),
            Self::PipelineSelect { pipeline } => write!(f, " pipeline={pipeline:?}"),
            Self::StateBaseAddress(sba) => {
                let names = ["general", "instruction", "surface", "dynamic"];
                for (name, heap) in names.iter().zip(sba.heaps()) {
                    if let Some(heap) = heap {
                        write!(f, " {name}=0x{:x}+0x{:x}", heap.base, heap.size)?;
                    }
                }
                write!(f, " mocs={}", sba.mocs)
            }
            Self::LoadRegisterImm {
                register_offset,
                data,
            } => write!(f, " reg=0x{register_offset:04x} data=0x{data:08x}"),
            Self::PipeControl(pc) => {
                write!(f, " flags=0x{:08x}", pc.flags.bits())?;
                match pc.post_sync {
                    PostSync::None => Ok(()),
                    PostSync::WriteImmediate { address, value } => {
                        write!(f, " post_sync=imm addr=0x{address:x} value={value}")
                    }
                    PostSync::WriteTimestamp { address } => {
                        write!(f, " post_sync=timestamp addr=0x{address:x}")
                    }
                }
            }
            Self::ComputeWalker(w) => write!(
                f,
                " kernel=0x{:x} groups={}x{}x{} local={}x{}x{} simd={}",
                w.kernel_start,
                w.thread_group_count[0],
                w.thread_group_count[1],
                w.thread_group_count[2],
                w.local_size[0],
                w.local_size[1],
                w.local_size[2],
                w.simd_size
            ),
            Self::MemCopy { src, dst, size } => {
                write!(f, " src=0x{src:x} dst=0x{dst:x} size={size}")
            }
            Self::BatchBufferStart {
                address,
                second_level,
            } => {
                write!(f, " addr=0x{address:x}")?;
                if *second_level {
                    write!(f, " second_level")?;
                }
                Ok(())
            }
            Self::StateSip { sip_address } => write!(f, " sip=0x{sip_address:x}"),
            Self::GpgpuCsrBaseAddress { address } => write!(f, " addr=0x{address:x}"),
            Self::SemaphoreWait {
                address,
                value,
                compare,
            } => write!(f, " addr=0x{address:x} value={value} compare={compare:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_rejects_unreachable_address_without_writing() {
        let caps = DeviceCaps::gen12lp();
        let mut out = [0xAAu8; 64];
        let cmd = GpuCommand::BatchBufferStart {
            address: 1 << 50,
            second_level: true,
        };
        assert_eq!(
            cmd.encode(&caps, &mut out),
            Err(EncodeError::UnsupportedAddressRange {
                address: 1 << 50,
                address_bits: 48,
            })
        );
        assert!(out.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn encode_reports_short_buffer() {
        let caps = DeviceCaps::gen12lp();
        let mut out = [0u8; 16];
        let cmd = GpuCommand::MemCopy {
            src: 0x1000,
            dst: 0x2000,
            size: 64,
        };
        assert_eq!(
            cmd.encode(&caps, &mut out),
            Err(EncodeError::BufferTooSmall {
                needed: 32,
                remaining: 16,
            })
        );
    }

    #[test]
    fn load_register_imm_layout() {
        let caps = DeviceCaps::gen12lp();
        let mut out = [0u8; 16];
        let written = GpuCommand::LoadRegisterImm {
            register_offset: 0x2580,
            data: 0x0006_0000,
        }
        .encode(&caps, &mut out)
        .unwrap();
        assert_eq!(written, 16);
        assert_eq!(
            out,
            [
                0x22, 0, 0, 0, 16, 0, 0, 0, 0x80, 0x25, 0, 0, 0, 0, 0x06, 0
            ]
        );
    }

    #[test]
    fn sba_heaps_without_modify_bit_decode_as_none() {
        let caps = DeviceCaps::gen12lp();
        let cmd = GpuCommand::StateBaseAddress(StateBaseAddress {
            surface_state: Some(HeapRange {
                base: 0x10_0000,
                size: 0x1000,
            }),
            mocs: 4,
            ..StateBaseAddress::default()
        });
        let mut out = [0u8; 64];
        cmd.encode(&caps, &mut out).unwrap();
        assert_eq!(read_u32_le(&out, 8), SBA_MODIFY_SURFACE_STATE);

        let (decoded, size) = GpuCommand::decode(&out).unwrap();
        assert_eq!(size, 64);
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn decode_rejects_unknown_post_sync_op() {
        let caps = DeviceCaps::gen12lp();
        let mut out = [0u8; 32];
        GpuCommand::PipeControl(PipeControl::stall())
            .encode(&caps, &mut out)
            .unwrap();
        out[offset_of!(CmdPipeControl, post_sync_op)] = 7;
        assert_eq!(
            GpuCommand::decode(&out),
            Err(CmdDecodeError::InvalidFieldValue {
                field: "post_sync_op",
                value: 7,
            })
        );
    }

    #[test]
    fn display_is_stable() {
        let cmd = GpuCommand::BatchBufferStart {
            address: 0x1_0000,
            second_level: true,
        };
        assert_eq!(cmd.to_string(), "BATCH_BUFFER_START addr=0x10000 second_level");
        assert_eq!(
            GpuCommand::LoadRegisterImm {
                register_offset: 0x2580,
                data: 0x0006_0002,
            }
            .to_string(),
            "LOAD_REGISTER_IMM reg=0x2580 data=0x00060002"
        );
    }
}
