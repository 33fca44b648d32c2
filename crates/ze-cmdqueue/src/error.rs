use thiserror::Error;
use ze_gpu_cmd::EncodeError;

use crate::allocation::AllocError;
use crate::backend::BackendError;
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("out of device memory (requested {requested} bytes)")]
    OutOfDeviceMemory { requested: usize },

    #[error("address 0x{address:x} does not fit in {address_bits} bits")]
    UnsupportedAddressRange { address: u64, address_bits: u8 },

    #[error("invalid driver configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("submission backend failed: {0}")]
    Backend(#[from] BackendError),
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::UnsupportedAddressRange {
                address,
                address_bits,
            } => Error::UnsupportedAddressRange {
                address,
                address_bits,
            },
            EncodeError::BufferTooSmall { .. } => {
                Error::InvalidState("command buffer segment overflowed its reservation")
            }
        }
    }
}

impl From<AllocError> for Error {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory { requested } => Error::OutOfDeviceMemory { requested },
            AllocError::ZeroSized => Error::InvalidArgument("allocation size must be non-zero"),
        }
    }
}
