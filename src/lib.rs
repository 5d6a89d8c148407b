//! Accelerator-resident buffers behind opaque host handles.
//!
//! A [`BufferManager`] keeps one descriptor per buffer and drives a [`DeviceChannel`]
//! to allocate, free and move bytes on the device. [`EmulatedChannel`] is an in-process
//! backend whose devices live in anonymous host mappings.

pub mod buffer;
pub mod channel;
pub mod error;
pub mod utils;

pub use buffer::{BufferDescriptor, BufferHandle, BufferManager, DescriptorRecord};
pub use channel::{ChannelConfig, DeviceChannel, DeviceId, DeviceKernel, EmulatedChannel};
pub use error::{BufferError, BufferResult};
