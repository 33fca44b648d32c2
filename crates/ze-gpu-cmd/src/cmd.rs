//! Command packet layouts.
//!
//! Every packet starts with a [`CmdHdr`]. `size_bytes` covers the header plus payload and is
//! always a multiple of [`CMD_ALIGNMENT`]. All fields are little-endian.

use core::mem::size_of;

pub const CMD_ALIGNMENT: usize = 4;

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdHdr {
    pub opcode: u32,
    pub size_bytes: u32,
}

impl CmdHdr {
    pub const SIZE_BYTES: usize = 8;
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmdOpcode {
    Noop = 0x0000,
    BatchBufferEnd = 0x000A,
    SemaphoreWait = 0x001C,
    LoadRegisterImm = 0x0022,
    BatchBufferStart = 0x0031,

    MemCopy = 0x5043,

    StateBaseAddress = 0x6101,
    StateSip = 0x6102,
    GpgpuCsrBaseAddress = 0x6104,
    PipelineSelect = 0x6904,

    ComputeWalker = 0x7205,
    PipeControl = 0x7A00,
}

impl CmdOpcode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0000 => Some(Self::Noop),
            0x000A => Some(Self::BatchBufferEnd),
            0x001C => Some(Self::SemaphoreWait),
            0x0022 => Some(Self::LoadRegisterImm),
            0x0031 => Some(Self::BatchBufferStart),
            0x5043 => Some(Self::MemCopy),
            0x6101 => Some(Self::StateBaseAddress),
            0x6102 => Some(Self::StateSip),
            0x6104 => Some(Self::GpgpuCsrBaseAddress),
            0x6904 => Some(Self::PipelineSelect),
            0x7205 => Some(Self::ComputeWalker),
            0x7A00 => Some(Self::PipeControl),
            _ => None,
        }
    }

    /// Mnemonic used by the disassembler.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Noop => "NOOP",
            Self::BatchBufferEnd => "BATCH_BUFFER_END",
            Self::SemaphoreWait => "SEMAPHORE_WAIT",
            Self::LoadRegisterImm => "LOAD_REGISTER_IMM",
            Self::BatchBufferStart => "BATCH_BUFFER_START",
            Self::MemCopy => "MEM_COPY",
            Self::StateBaseAddress => "STATE_BASE_ADDRESS",
            Self::StateSip => "STATE_SIP",
            Self::GpgpuCsrBaseAddress => "GPGPU_CSR_BASE_ADDRESS",
            Self::PipelineSelect => "PIPELINE_SELECT",
            Self::ComputeWalker => "COMPUTE_WALKER",
            Self::PipeControl => "PIPE_CONTROL",
        }
    }

    /// Fixed packet size for this opcode. Every packet in this format is fixed-size.
    pub const fn packet_size_bytes(self) -> usize {
        match self {
            Self::Noop => size_of::<CmdNoop>(),
            Self::BatchBufferEnd => size_of::<CmdBatchBufferEnd>(),
            Self::SemaphoreWait => size_of::<CmdSemaphoreWait>(),
            Self::LoadRegisterImm => size_of::<CmdLoadRegisterImm>(),
            Self::BatchBufferStart => size_of::<CmdBatchBufferStart>(),
            Self::MemCopy => size_of::<CmdMemCopy>(),
            Self::StateBaseAddress => size_of::<CmdStateBaseAddress>(),
            Self::StateSip => size_of::<CmdStateSip>(),
            Self::GpgpuCsrBaseAddress => size_of::<CmdGpgpuCsrBaseAddress>(),
            Self::PipelineSelect => size_of::<CmdPipelineSelect>(),
            Self::ComputeWalker => size_of::<CmdComputeWalker>(),
            Self::PipeControl => size_of::<CmdPipeControl>(),
        }
    }
}

pub const PIPELINE_3D: u32 = 0;
pub const PIPELINE_MEDIA: u32 = 1;
pub const PIPELINE_GPGPU: u32 = 2;

pub const SBA_MODIFY_GENERAL_STATE: u32 = 1u32 << 0;
pub const SBA_MODIFY_INSTRUCTION: u32 = 1u32 << 1;
pub const SBA_MODIFY_SURFACE_STATE: u32 = 1u32 << 2;
pub const SBA_MODIFY_DYNAMIC_STATE: u32 = 1u32 << 3;

pub const POST_SYNC_OP_NONE: u32 = 0;
pub const POST_SYNC_OP_WRITE_IMMEDIATE: u32 = 1;
pub const POST_SYNC_OP_WRITE_TIMESTAMP: u32 = 3;

/// Jump returns to the issuing buffer at the next BATCH_BUFFER_END.
pub const BATCH_BUFFER_START_FLAG_SECOND_LEVEL: u32 = 1u32 << 0;

/* ------------------------------ MI commands ------------------------------ */

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdNoop {
    pub hdr: CmdHdr,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdBatchBufferEnd {
    pub hdr: CmdHdr,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdBatchBufferStart {
    pub hdr: CmdHdr,
    pub address: u64,
    pub flags: u32,
    pub reserved0: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdLoadRegisterImm {
    pub hdr: CmdHdr,
    pub register_offset: u32,
    pub data: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdSemaphoreWait {
    pub hdr: CmdHdr,
    pub address: u64,
    pub value: u32,
    pub compare_op: u32,
}

/* ------------------------------- Blitter -------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdMemCopy {
    pub hdr: CmdHdr,
    pub src_address: u64,
    pub dst_address: u64,
    pub size_bytes: u64,
}

/* ---------------------------- State commands ---------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdPipelineSelect {
    pub hdr: CmdHdr,
    pub pipeline: u32,
    pub reserved0: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdStateBaseAddress {
    pub hdr: CmdHdr,
    /// `SBA_MODIFY_*` bits; heaps without their bit set are left unchanged by the GPU.
    pub modify_enable: u32,
    pub mocs: u32,
    pub general_state_base: u64,
    pub general_state_size: u32,
    pub instruction_base: u64,
    pub instruction_size: u32,
    pub surface_state_base: u64,
    pub surface_state_size: u32,
    pub dynamic_state_base: u64,
    pub dynamic_state_size: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdStateSip {
    pub hdr: CmdHdr,
    pub sip_address: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdGpgpuCsrBaseAddress {
    pub hdr: CmdHdr,
    pub address: u64,
}

/* ------------------------------ Execution ------------------------------- */

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdComputeWalker {
    pub hdr: CmdHdr,
    pub kernel_start: u64,
    pub indirect_data_start: u64,
    pub indirect_data_length: u32,
    pub simd_size: u32,
    pub thread_group_count_x: u32,
    pub thread_group_count_y: u32,
    pub thread_group_count_z: u32,
    pub local_size_x: u32,
    pub local_size_y: u32,
    pub local_size_z: u32,
    pub slm_size_bytes: u32,
    pub reserved0: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct CmdPipeControl {
    pub hdr: CmdHdr,
    pub flags: u32,
    pub post_sync_op: u32,
    pub address: u64,
    pub immediate: u64,
}

// Packet sizes are part of the format; keep them pinned.
const _: () = {
    assert!(size_of::<CmdHdr>() == CmdHdr::SIZE_BYTES);
    assert!(size_of::<CmdNoop>() == 8);
    assert!(size_of::<CmdBatchBufferEnd>() == 8);
    assert!(size_of::<CmdBatchBufferStart>() == 24);
    assert!(size_of::<CmdLoadRegisterImm>() == 16);
    assert!(size_of::<CmdSemaphoreWait>() == 24);
    assert!(size_of::<CmdMemCopy>() == 32);
    assert!(size_of::<CmdPipelineSelect>() == 16);
    assert!(size_of::<CmdStateBaseAddress>() == 64);
    assert!(size_of::<CmdStateSip>() == 16);
    assert!(size_of::<CmdGpgpuCsrBaseAddress>() == 16);
    assert!(size_of::<CmdComputeWalker>() == 64);
    assert!(size_of::<CmdPipeControl>() == 32);
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CmdDecodeError {
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("bad packet size_bytes {found}")]
    BadSizeBytes { found: u32 },
    #[error("packet size_bytes {found} is not 4-byte aligned")]
    SizeNotAligned { found: u32 },
    #[error("unknown opcode 0x{found:04x}")]
    UnknownOpcode { found: u32 },
    #[error("payload size mismatch (expected {expected} bytes, found {found})")]
    PayloadSizeMismatch { expected: usize, found: usize },
    #[error("invalid {field} value {value}")]
    InvalidFieldValue { field: &'static str, value: u32 },
    #[error("packet at offset {offset} ({packet_size_bytes} bytes) overruns the {stream_size_bytes}-byte stream")]
    PacketOverrunsStream {
        offset: usize,
        packet_size_bytes: u32,
        stream_size_bytes: usize,
    },
    #[error("offset overflow")]
    CountOverflow,
}

pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(b)
}

pub fn decode_cmd_hdr_le(buf: &[u8]) -> Result<CmdHdr, CmdDecodeError> {
    if buf.len() < CmdHdr::SIZE_BYTES {
        return Err(CmdDecodeError::BufferTooSmall);
    }

    let opcode = read_u32_le(buf, 0);
    let size_bytes = read_u32_le(buf, 4);

    if size_bytes < CmdHdr::SIZE_BYTES as u32 {
        return Err(CmdDecodeError::BadSizeBytes { found: size_bytes });
    }
    if size_bytes % CMD_ALIGNMENT as u32 != 0 {
        return Err(CmdDecodeError::SizeNotAligned { found: size_bytes });
    }

    Ok(CmdHdr { opcode, size_bytes })
}

/// One raw packet yielded by [`CmdStreamIter`].
#[derive(Clone, Copy)]
pub struct CmdPacket<'a> {
    /// Byte offset of the packet header from the start of the walked buffer.
    pub offset: usize,
    pub hdr: CmdHdr,
    pub opcode: Option<CmdOpcode>,
    /// Full packet bytes, header included.
    pub bytes: &'a [u8],
}

/// Walks a raw packet stream without interpreting payloads.
///
/// Unknown opcodes are yielded with `opcode == None` so tools can skip them; malformed headers end
/// the iteration with an error.
pub struct CmdStreamIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> CmdStreamIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for CmdStreamIter<'a> {
    type Item = Result<CmdPacket<'a>, CmdDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }

        let hdr = match decode_cmd_hdr_le(&self.buf[self.offset..]) {
            Ok(hdr) => hdr,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        let packet_size = hdr.size_bytes as usize;
        let packet_end = match self.offset.checked_add(packet_size) {
            Some(end) => end,
            None => {
                self.done = true;
                return Some(Err(CmdDecodeError::CountOverflow));
            }
        };
        if packet_end > self.buf.len() {
            self.done = true;
            return Some(Err(CmdDecodeError::PacketOverrunsStream {
                offset: self.offset,
                packet_size_bytes: hdr.size_bytes,
                stream_size_bytes: self.buf.len(),
            }));
        }

        let packet = CmdPacket {
            offset: self.offset,
            hdr,
            opcode: CmdOpcode::from_u32(hdr.opcode),
            bytes: &self.buf[self.offset..packet_end],
        };
        self.offset = packet_end;
        Some(Ok(packet))
    }
}
