#![allow(clippy::cast_possible_truncation)]

//! In-process accelerator backend.
//!
//! Every opened device owns a private, anonymous memory arena that stands in for device
//! memory. The host never hands out pointers into it: bytes only move through the channel
//! primitives, exactly like a detached accelerator.

use super::aperture::Aperture;
use super::{
    ApertureAllocator, ChannelConfig, DeviceChannel, DeviceId, DeviceKernel, HostKey,
    TransferDirection,
};
use crate::error::{BufferError, BufferResult};
use crate::utils::{check_range, ranges_overlap};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Anonymous mapping backing one device's memory.
#[derive(Debug)]
struct DeviceArena {
    base: NonNull<u8>,
    len: usize,
}

// The arena is only reached through the owning device's mutex.
unsafe impl Send for DeviceArena {}

impl DeviceArena {
    fn reserve(len: usize) -> BufferResult<Self> {
        let ret = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        let base = NonNull::new(ret.cast::<u8>())
            .ok_or_else(|| BufferError::Channel("mmap returned a null arena".into()))?;

        Ok(Self { base, len })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for DeviceArena {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        if ret != 0 {
            warn!(
                error = %std::io::Error::last_os_error(),
                "failed to unmap device arena"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceAllocation {
    device_address: u64,
    size: usize,
}

/// State of one opened device.
#[derive(Debug)]
struct DeviceState {
    arena: DeviceArena,
    aperture: Aperture,
    base_address: u64,
    // Host key -> allocation, the channel-side identity map
    by_key: HashMap<HostKey, DeviceAllocation>,
    // Device address -> size, for resolving raw addresses passed to kernels
    by_address: BTreeMap<u64, usize>,
}

impl DeviceState {
    fn lookup(&self, key: HostKey) -> BufferResult<DeviceAllocation> {
        self.by_key
            .get(&key)
            .copied()
            .ok_or(BufferError::UnknownAllocation(key))
    }

    /// Arena offset of `[addr, addr + size)`, which must lie inside one live allocation.
    fn resolve(&self, addr: u64, size: usize) -> BufferResult<usize> {
        let (&start, &len) = self
            .by_address
            .range(..=addr)
            .next_back()
            .ok_or(BufferError::UnknownAllocation(addr))?;

        let offset_in_alloc = (addr - start) as usize;
        if offset_in_alloc >= len && size > 0 {
            return Err(BufferError::UnknownAllocation(addr));
        }
        check_range(offset_in_alloc, size, len)?;

        Ok((addr - self.base_address) as usize)
    }

    fn transfer(
        &self,
        key: HostKey,
        offset: usize,
        len: usize,
        direction: TransferDirection,
    ) -> BufferResult<std::ops::Range<usize>> {
        let alloc = self.lookup(key)?;
        check_range(offset, len, alloc.size)?;

        debug!(
            key = format_args!("0x{key:x}"),
            device_address = format_args!("0x{:x}", alloc.device_address),
            offset,
            len,
            ?direction,
            "device transfer"
        );

        let start = (alloc.device_address - self.base_address) as usize + offset;
        Ok(start..start + len)
    }
}

/// A `DeviceChannel` whose devices live in host memory.
///
/// Devices are numbered `0..config.device_count` and must be opened before use.
#[derive(Debug)]
pub struct EmulatedChannel {
    config: ChannelConfig,
    devices: Vec<Mutex<Option<DeviceState>>>,
}

impl Default for EmulatedChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl EmulatedChannel {
    #[must_use]
    pub fn new(mut config: ChannelConfig) -> Self {
        if !config.default_alignment.is_power_of_two() {
            warn!(
                alignment = config.default_alignment,
                "invalid default alignment, falling back to 1"
            );
            config.default_alignment = 1;
        }

        let devices = (0..config.device_count).map(|_| Mutex::new(None)).collect();
        Self { config, devices }
    }

    #[must_use]
    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn slot(&self, device: DeviceId) -> BufferResult<MutexGuard<'_, Option<DeviceState>>> {
        self.devices
            .get(device as usize)
            .ok_or(BufferError::InvalidDevice(device))?
            .lock()
            .map_err(|_| BufferError::Channel(format!("device {device} state poisoned")))
    }

    fn with_device<T>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&mut DeviceState) -> BufferResult<T>,
    ) -> BufferResult<T> {
        let mut guard = self.slot(device)?;
        let state = guard.as_mut().ok_or(BufferError::DeviceNotOpen(device))?;
        f(state)
    }

    /// Bytes of device address space still free on `device`.
    pub fn available_memory(&self, device: DeviceId) -> BufferResult<u64> {
        self.with_device(device, |state| Ok(state.aperture.available()))
    }

    /// Number of allocations currently tracked on `device`.
    pub fn allocation_count(&self, device: DeviceId) -> BufferResult<usize> {
        self.with_device(device, |state| Ok(state.by_key.len()))
    }
}

impl DeviceChannel for EmulatedChannel {
    fn open(&self, device: DeviceId) -> BufferResult<()> {
        let mut guard = self.slot(device)?;
        if guard.is_some() {
            return Ok(());
        }

        let arena = DeviceArena::reserve(self.config.arena_size)?;
        let base = self.config.base_address;
        let aperture = Aperture::new(
            base,
            base + self.config.arena_size as u64,
            self.config.default_alignment as u64,
            self.config.guard_pages,
        );

        debug!(
            device,
            arena_size = self.config.arena_size,
            "opened emulated device"
        );

        *guard = Some(DeviceState {
            arena,
            aperture,
            base_address: base,
            by_key: HashMap::new(),
            by_address: BTreeMap::new(),
        });
        Ok(())
    }

    fn close(&self, device: DeviceId) -> BufferResult<()> {
        let state = self.slot(device)?.take();
        if let Some(state) = state {
            if !state.by_key.is_empty() {
                warn!(
                    device,
                    live = state.by_key.len(),
                    "closing device with live allocations"
                );
            }
            debug!(device, "closed emulated device");
        }
        Ok(())
    }

    fn is_open(&self, device: DeviceId) -> bool {
        self.slot(device).is_ok_and(|guard| guard.is_some())
    }

    fn default_alignment(&self) -> usize {
        self.config.default_alignment
    }

    fn allocate(
        &self,
        device: DeviceId,
        key: HostKey,
        size: usize,
        align: usize,
    ) -> BufferResult<u64> {
        self.with_device(device, |state| {
            if state.by_key.contains_key(&key) {
                return Err(BufferError::Channel(format!(
                    "key 0x{key:x} already tracks an allocation"
                )));
            }

            let device_address = state
                .aperture
                .allocate_va(size, align)
                .ok_or(BufferError::OutOfMemory { device, size })?;

            state.by_key.insert(
                key,
                DeviceAllocation {
                    device_address,
                    size,
                },
            );
            state.by_address.insert(device_address, size);
            Ok(device_address)
        })
    }

    fn free(&self, device: DeviceId, key: HostKey, size: usize) -> BufferResult<()> {
        self.with_device(device, |state| {
            let alloc = state.lookup(key)?;
            if alloc.size != size {
                return Err(BufferError::SizeMismatch {
                    requested: size,
                    recorded: alloc.size,
                });
            }

            state.by_key.remove(&key);
            state.by_address.remove(&alloc.device_address);
            if !state.aperture.free_va(alloc.device_address, alloc.size) {
                return Err(BufferError::Channel(format!(
                    "device VA 0x{:x} was not reserved",
                    alloc.device_address
                )));
            }
            Ok(())
        })
    }

    fn transfer_in(
        &self,
        device: DeviceId,
        key: HostKey,
        src: &[u8],
        into_offset: usize,
    ) -> BufferResult<()> {
        self.with_device(device, |state| {
            let range =
                state.transfer(key, into_offset, src.len(), TransferDirection::HostToDevice)?;
            state.arena.bytes_mut()[range].copy_from_slice(src);
            Ok(())
        })
    }

    fn transfer_out(
        &self,
        device: DeviceId,
        key: HostKey,
        dst: &mut [u8],
        from_offset: usize,
    ) -> BufferResult<()> {
        self.with_device(device, |state| {
            let range =
                state.transfer(key, from_offset, dst.len(), TransferDirection::DeviceToHost)?;
            dst.copy_from_slice(&state.arena.bytes()[range]);
            Ok(())
        })
    }

    fn run(&self, device: DeviceId, kernel: DeviceKernel) -> BufferResult<()> {
        self.with_device(device, |state| {
            debug!(device, ?kernel, "run on device");
            match kernel {
                DeviceKernel::MemCopy { src, dst, size } => {
                    let from = state.resolve(src, size)?;
                    let to = state.resolve(dst, size)?;
                    if ranges_overlap(src, dst, size as u64) {
                        return Err(BufferError::Overlap);
                    }
                    state.arena.bytes_mut().copy_within(from..from + size, to);
                }
                DeviceKernel::Fill { dst, size, value } => {
                    let to = state.resolve(dst, size)?;
                    state.arena.bytes_mut()[to..to + size].fill(value);
                }
            }
            Ok(())
        })
    }
}
