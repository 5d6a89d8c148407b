use crate::channel::DeviceId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device channel error: {0}")]
    Channel(String),

    #[error("Out of device memory: {size} bytes requested on device {device}")]
    OutOfMemory { device: DeviceId, size: usize },

    #[error("Invalid device ID: {0}")]
    InvalidDevice(DeviceId),

    #[error("Device {0} is not open")]
    DeviceNotOpen(DeviceId),

    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),

    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("Buffer handle is stale or was never allocated")]
    StaleHandle,

    #[error("Buffer lives on device {actual}, not device {expected}")]
    DeviceMismatch { expected: DeviceId, actual: DeviceId },

    #[error("Range out of bounds: offset {offset} + size {size} exceeds capacity {capacity}")]
    OutOfRange {
        offset: usize,
        size: usize,
        capacity: usize,
    },

    #[error("Source and destination ranges overlap")]
    Overlap,

    #[error("Free of {requested} bytes does not match allocation of {recorded} bytes")]
    SizeMismatch { requested: usize, recorded: usize },

    #[error("No device allocation is tracked for key 0x{0:x}")]
    UnknownAllocation(u64),
}

pub type BufferResult<T> = Result<T, BufferError>;
