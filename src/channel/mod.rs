pub mod aperture;
pub mod emulated;

use crate::error::BufferResult;

/// Identifies one accelerator reachable through a channel.
pub type DeviceId = u32;

/// Host-side tracking key under which a channel records a device allocation.
pub type HostKey = u64;

// Defaults for the emulated backend
const DEFAULT_ARENA_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_BASE_ADDRESS: u64 = 0x1000_0000; // Start at 256MB
const DEFAULT_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

/// Small operations a channel can execute on the device itself, without a host round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKernel {
    /// Byte copy between two device addresses. Ranges must not overlap.
    MemCopy { src: u64, dst: u64, size: usize },
    /// Set `size` bytes starting at `dst` to `value`.
    Fill { dst: u64, size: usize, value: u8 },
}

/// Transport that allocates, frees and moves bytes on an accelerator.
///
/// Allocations are tracked by the channel under the caller's `HostKey`; all transfer
/// primitives locate the device allocation through that key. Implementations must be
/// safe to call from several threads if the caller shares them.
pub trait DeviceChannel {
    /// Bring up a device so it can accept allocations.
    fn open(&self, device: DeviceId) -> BufferResult<()>;

    /// Tear down a device. Any allocation still live on it is discarded.
    fn close(&self, device: DeviceId) -> BufferResult<()>;

    fn is_open(&self, device: DeviceId) -> bool;

    /// Alignment used when a caller passes 0.
    fn default_alignment(&self) -> usize;

    /// Reserve `size` bytes on `device` and record them under `key`.
    /// Returns the device address of the new allocation.
    fn allocate(&self, device: DeviceId, key: HostKey, size: usize, align: usize)
    -> BufferResult<u64>;

    /// Free the allocation recorded under `key`. `size` must equal the allocated size.
    fn free(&self, device: DeviceId, key: HostKey, size: usize) -> BufferResult<()>;

    /// Copy `src` into the allocation under `key`, starting `into_offset` bytes in.
    fn transfer_in(
        &self,
        device: DeviceId,
        key: HostKey,
        src: &[u8],
        into_offset: usize,
    ) -> BufferResult<()>;

    /// Fill `dst` from the allocation under `key`, starting `from_offset` bytes in.
    fn transfer_out(
        &self,
        device: DeviceId,
        key: HostKey,
        dst: &mut [u8],
        from_offset: usize,
    ) -> BufferResult<()>;

    /// Execute `kernel` on the device and wait for it to finish.
    fn run(&self, device: DeviceId, kernel: DeviceKernel) -> BufferResult<()>;

    /// Device-local memory copy.
    fn copy_remote(&self, device: DeviceId, src: u64, dst: u64, size: usize) -> BufferResult<()> {
        self.run(device, DeviceKernel::MemCopy { src, dst, size })
    }
}

/// Trait for device address-space allocation strategies.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: usize, align: usize) -> Option<u64>;

    /// Free a previously reserved virtual address range. Returns `false` if it was not tracked.
    fn free_va(&mut self, addr: u64, size: usize) -> bool;

    /// Get the aperture's base and (exclusive) limit.
    fn bounds(&self) -> (u64, u64);
}

/// Settings for a channel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub device_count: u32,
    pub arena_size: usize,
    pub base_address: u64,
    pub default_alignment: usize,
    pub guard_pages: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            arena_size: DEFAULT_ARENA_SIZE,
            base_address: DEFAULT_BASE_ADDRESS,
            default_alignment: DEFAULT_ALIGNMENT,
            guard_pages: 0,
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn device_count(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    #[must_use]
    pub const fn arena_size(mut self, bytes: usize) -> Self {
        self.arena_size = bytes;
        self
    }

    #[must_use]
    pub const fn base_address(mut self, addr: u64) -> Self {
        self.base_address = addr;
        self
    }

    #[must_use]
    pub const fn default_alignment(mut self, align: usize) -> Self {
        self.default_alignment = align;
        self
    }

    #[must_use]
    pub const fn guard_pages(mut self, pages: u64) -> Self {
        self.guard_pages = pages;
        self
    }
}

pub use emulated::EmulatedChannel;
