use super::descriptor::{BufferDescriptor, DescriptorRecord};
use super::table::{BufferHandle, DescriptorTable};
use crate::channel::{DeviceChannel, DeviceId, DeviceKernel};
use crate::error::{BufferError, BufferResult};
use crate::utils::{check_range, ranges_overlap};
use tracing::{debug, warn};

/// Owns accelerator-resident buffers and moves bytes in and out of them.
///
/// Every buffer is a descriptor in a host-side table plus a live allocation inside the
/// channel, tracked there under the handle's key. Mutating operations take `&mut self`,
/// transfers take `&self`, so sharing a manager across threads goes through the usual
/// borrow rules (e.g. an `RwLock`) and a channel that is `Sync`.
pub struct BufferManager<C: DeviceChannel> {
    channel: C,
    table: DescriptorTable,
}

impl<C: DeviceChannel> BufferManager<C> {
    #[must_use]
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            table: DescriptorTable::new(),
        }
    }

    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    /// Opens `device` on the underlying channel.
    pub fn open_device(&self, device: DeviceId) -> BufferResult<()> {
        self.channel.open(device)
    }

    /// Releases every buffer still living on `device`, then closes it.
    pub fn close_device(&mut self, device: DeviceId) -> BufferResult<()> {
        let handles: Vec<_> = self
            .table
            .handles()
            .filter(|&h| self.table.get(h).is_ok_and(|d| d.device == device))
            .collect();

        for handle in handles {
            self.release(device, handle)?;
        }
        self.channel.close(device)
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Allocates `size` bytes on `device`.
    ///
    /// `alignment` must be a power of two; 0 selects the channel's default.
    ///
    /// # Errors
    /// `InvalidSize` for a zero size, `InvalidAlignment`, and any channel failure
    /// (`OutOfMemory`, `DeviceNotOpen`, ...). On failure no handle or allocation is left behind.
    pub fn allocate(
        &mut self,
        device: DeviceId,
        size: usize,
        alignment: usize,
    ) -> BufferResult<BufferHandle> {
        if size == 0 {
            return Err(BufferError::InvalidSize(size));
        }
        let alignment = if alignment == 0 {
            self.channel.default_alignment()
        } else {
            alignment
        };
        if !alignment.is_power_of_two() {
            return Err(BufferError::InvalidAlignment(alignment));
        }

        let handle = self.table.reserve()?;
        let device_address = match self.channel.allocate(device, handle.key(), size, alignment) {
            Ok(addr) => addr,
            Err(e) => {
                self.table.unreserve(handle);
                return Err(e);
            }
        };

        debug!(
            device,
            size,
            alignment,
            key = format_args!("0x{:x}", handle.key()),
            device_address = format_args!("0x{device_address:x}"),
            "allocated buffer"
        );

        self.table.fill(
            handle,
            BufferDescriptor {
                device,
                device_address,
                size,
            },
        );
        Ok(handle)
    }

    /// Frees the device allocation behind `handle` and retires the handle.
    ///
    /// # Errors
    /// `StaleHandle` if the handle was already released or never allocated here,
    /// `DeviceMismatch` if `device` is not where the buffer lives. If the channel fails
    /// to free, the handle stays valid.
    pub fn release(&mut self, device: DeviceId, handle: BufferHandle) -> BufferResult<()> {
        let desc = *self.resolve(device, handle)?;

        self.channel.free(device, handle.key(), desc.size)?;
        self.table.remove(handle)?;

        debug!(
            device,
            size = desc.size,
            key = format_args!("0x{:x}", handle.key()),
            "released buffer"
        );
        Ok(())
    }

    /// Releases every live buffer.
    ///
    /// Keeps going past buffers the channel fails to free; those handles stay valid and
    /// each failure is logged.
    ///
    /// # Errors
    /// Returns the first failure once every buffer has been attempted.
    pub fn release_all(&mut self) -> BufferResult<()> {
        let live: Vec<_> = self
            .table
            .handles()
            .filter_map(|h| self.table.get(h).ok().map(|d| (d.device, h)))
            .collect();

        let mut first_err = None;
        for (device, handle) in live {
            if let Err(e) = self.release(device, handle) {
                warn!(
                    device,
                    key = format_args!("0x{:x}", handle.key()),
                    error = %e,
                    "failed to release buffer"
                );
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ===========================================================================================
    // Transfers
    // ===========================================================================================

    /// Copies `src[offset_host..offset_host + size]` into the buffer at `offset_device`.
    pub fn copy_to_device(
        &self,
        device: DeviceId,
        src: &[u8],
        dst: BufferHandle,
        size: usize,
        offset_host: usize,
        offset_device: usize,
    ) -> BufferResult<()> {
        let desc = self.resolve(device, dst)?;
        check_range(offset_host, size, src.len())?;
        check_range(offset_device, size, desc.size)?;

        debug!(
            device,
            size,
            offset_host,
            offset_device,
            device_address = format_args!("0x{:x}", desc.device_address),
            "copy to device"
        );

        if size == 0 {
            return Ok(());
        }
        self.channel.transfer_in(
            device,
            dst.key(),
            &src[offset_host..offset_host + size],
            offset_device,
        )
    }

    /// Copies `size` bytes at `offset_device` of the buffer into `dst` at `offset_host`.
    pub fn copy_to_host(
        &self,
        device: DeviceId,
        src: BufferHandle,
        dst: &mut [u8],
        size: usize,
        offset_device: usize,
        offset_host: usize,
    ) -> BufferResult<()> {
        let desc = self.resolve(device, src)?;
        check_range(offset_device, size, desc.size)?;
        check_range(offset_host, size, dst.len())?;

        debug!(
            device,
            size,
            offset_device,
            offset_host,
            device_address = format_args!("0x{:x}", desc.device_address),
            "copy to host"
        );

        if size == 0 {
            return Ok(());
        }
        self.channel.transfer_out(
            device,
            src.key(),
            &mut dst[offset_host..offset_host + size],
            offset_device,
        )
    }

    /// Copies `size` bytes from `src` at `offset_src` to `dst` at `offset_dst` without
    /// leaving the device.
    ///
    /// # Errors
    /// `Overlap` if both ranges share bytes (only possible when `src == dst`).
    pub fn copy_on_device(
        &self,
        device: DeviceId,
        src: BufferHandle,
        dst: BufferHandle,
        size: usize,
        offset_src: usize,
        offset_dst: usize,
    ) -> BufferResult<()> {
        let src_desc = self.resolve(device, src)?;
        let dst_desc = self.resolve(device, dst)?;
        check_range(offset_src, size, src_desc.size)?;
        check_range(offset_dst, size, dst_desc.size)?;

        let src_addr = src_desc.device_address + offset_src as u64;
        let dst_addr = dst_desc.device_address + offset_dst as u64;
        if ranges_overlap(src_addr, dst_addr, size as u64) {
            return Err(BufferError::Overlap);
        }

        debug!(
            device,
            size,
            src = format_args!("0x{src_addr:x}"),
            dst = format_args!("0x{dst_addr:x}"),
            "copy on device"
        );

        if size == 0 {
            return Ok(());
        }
        self.channel.copy_remote(device, src_addr, dst_addr, size)
    }

    /// Sets `size` bytes of the buffer, starting at `offset`, to `value` on the device.
    pub fn fill(
        &self,
        device: DeviceId,
        handle: BufferHandle,
        value: u8,
        size: usize,
        offset: usize,
    ) -> BufferResult<()> {
        let desc = self.resolve(device, handle)?;
        check_range(offset, size, desc.size)?;

        if size == 0 {
            return Ok(());
        }
        let dst = desc.device_address + offset as u64;
        self.channel
            .run(device, DeviceKernel::Fill { dst, size, value })
    }

    // ===========================================================================================
    // Lookup
    // ===========================================================================================

    /// Raw device address of the buffer, for passing into device-side code.
    pub fn translate(&self, handle: BufferHandle) -> BufferResult<u64> {
        self.table.get(handle).map(|d| d.device_address)
    }

    pub fn descriptor(&self, handle: BufferHandle) -> BufferResult<BufferDescriptor> {
        self.table.get(handle).copied()
    }

    /// Fixed-layout descriptor for device code that receives the buffer by value.
    pub fn record(&self, handle: BufferHandle) -> BufferResult<DescriptorRecord> {
        self.table.get(handle).map(DescriptorRecord::from)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn resolve(&self, device: DeviceId, handle: BufferHandle) -> BufferResult<&BufferDescriptor> {
        let desc = self.table.get(handle)?;
        if desc.device != device {
            return Err(BufferError::DeviceMismatch {
                expected: device,
                actual: desc.device,
            });
        }
        Ok(desc)
    }
}

impl<C: DeviceChannel> Drop for BufferManager<C> {
    fn drop(&mut self) {
        if self.table.is_empty() {
            return;
        }
        if self.release_all().is_err() {
            warn!(live = self.table.len(), "buffers left on device after drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, EmulatedChannel};

    fn manager() -> BufferManager<EmulatedChannel> {
        let channel = EmulatedChannel::new(ChannelConfig::new().arena_size(1 << 20).device_count(2));
        let mgr = BufferManager::new(channel);
        mgr.open_device(0).unwrap();
        mgr
    }

    #[test]
    fn allocate_populates_descriptor() {
        let mut mgr = manager();
        let h = mgr.allocate(0, 4096, 64).unwrap();
        let desc = mgr.descriptor(h).unwrap();
        assert_eq!(desc.size, 4096);
        assert_eq!(desc.device, 0);
        assert_eq!(desc.device_address % 64, 0);
        assert_eq!(mgr.translate(h).unwrap(), desc.device_address);
    }

    #[test]
    fn allocate_rejects_bad_arguments() {
        let mut mgr = manager();
        assert!(matches!(mgr.allocate(0, 0, 64), Err(BufferError::InvalidSize(0))));
        assert!(matches!(
            mgr.allocate(0, 64, 48),
            Err(BufferError::InvalidAlignment(48))
        ));
        assert!(mgr.is_empty());
    }

    #[test]
    fn zero_alignment_uses_channel_default() {
        let mut mgr = manager();
        mgr.allocate(0, 3, 0).unwrap();
        let h = mgr.allocate(0, 3, 0).unwrap();
        assert_eq!(mgr.translate(h).unwrap() % 64, 0);
    }

    #[test]
    fn failed_channel_allocation_leaves_no_handle() {
        let mut mgr = manager();
        assert!(matches!(
            mgr.allocate(1, 64, 0),
            Err(BufferError::DeviceNotOpen(1))
        ));
        assert!(matches!(
            mgr.allocate(0, 4 << 20, 0),
            Err(BufferError::OutOfMemory { .. })
        ));
        assert!(mgr.is_empty());
    }

    #[test]
    fn release_frees_device_allocation() {
        let mut mgr = manager();
        let h = mgr.allocate(0, 256, 0).unwrap();
        assert_eq!(mgr.channel().allocation_count(0).unwrap(), 1);
        mgr.release(0, h).unwrap();
        assert_eq!(mgr.channel().allocation_count(0).unwrap(), 0);
        assert_eq!(mgr.channel().available_memory(0).unwrap(), 1 << 20);
        assert!(matches!(mgr.release(0, h), Err(BufferError::StaleHandle)));
        assert!(matches!(mgr.translate(h), Err(BufferError::StaleHandle)));
    }

    #[test]
    fn wrong_device_is_rejected() {
        let mut mgr = manager();
        mgr.open_device(1).unwrap();
        let h = mgr.allocate(0, 64, 0).unwrap();
        assert!(matches!(
            mgr.release(1, h),
            Err(BufferError::DeviceMismatch { expected: 1, actual: 0 })
        ));
        assert!(matches!(
            mgr.copy_to_device(1, &[0; 8], h, 8, 0, 0),
            Err(BufferError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn transfers_are_bounds_checked() {
        let mut mgr = manager();
        let h = mgr.allocate(0, 64, 0).unwrap();
        let host = [7u8; 32];
        assert!(matches!(
            mgr.copy_to_device(0, &host, h, 16, 0, 56),
            Err(BufferError::OutOfRange { offset: 56, size: 16, capacity: 64 })
        ));
        assert!(matches!(
            mgr.copy_to_device(0, &host, h, 16, 20, 0),
            Err(BufferError::OutOfRange { offset: 20, size: 16, capacity: 32 })
        ));
        let mut out = [0u8; 8];
        assert!(matches!(
            mgr.copy_to_host(0, h, &mut out, 16, 0, 0),
            Err(BufferError::OutOfRange { .. })
        ));
    }

    #[test]
    fn offsets_apply_to_each_side() {
        let mut mgr = manager();
        let h = mgr.allocate(0, 32, 0).unwrap();
        let host: Vec<u8> = (0..32).collect();
        mgr.copy_to_device(0, &host, h, 8, 4, 16).unwrap();

        let mut out = [0u8; 12];
        mgr.copy_to_host(0, h, &mut out, 8, 16, 2).unwrap();
        assert_eq!(&out[2..10], &host[4..12]);
        assert_eq!(&out[..2], &[0, 0]);
    }

    #[test]
    fn copy_within_one_buffer() {
        let mut mgr = manager();
        let h = mgr.allocate(0, 64, 0).unwrap();
        let host: Vec<u8> = (0..64).collect();
        mgr.copy_to_device(0, &host, h, 64, 0, 0).unwrap();

        assert!(matches!(
            mgr.copy_on_device(0, h, h, 16, 0, 8),
            Err(BufferError::Overlap)
        ));
        mgr.copy_on_device(0, h, h, 16, 0, 32).unwrap();

        let mut out = [0u8; 64];
        mgr.copy_to_host(0, h, &mut out, 64, 0, 0).unwrap();
        assert_eq!(&out[32..48], &host[0..16]);
        assert_eq!(&out[..32], &host[..32]);
    }

    #[test]
    fn close_device_releases_its_buffers() {
        let mut mgr = manager();
        mgr.open_device(1).unwrap();
        mgr.allocate(0, 64, 0).unwrap();
        let keep = mgr.allocate(1, 64, 0).unwrap();
        mgr.close_device(0).unwrap();
        assert_eq!(mgr.len(), 1);
        assert!(!mgr.channel().is_open(0));
        assert!(mgr.translate(keep).is_ok());
    }

    #[test]
    fn released_handle_is_stale_everywhere() {
        let mut mgr = manager();
        let live = mgr.allocate(0, 64, 0).unwrap();
        let gone = mgr.allocate(0, 64, 0).unwrap();
        mgr.release(0, gone).unwrap();

        let mut out = [0u8; 8];
        assert!(matches!(
            mgr.copy_to_device(0, &[0; 8], gone, 8, 0, 0),
            Err(BufferError::StaleHandle)
        ));
        assert!(matches!(
            mgr.copy_to_host(0, gone, &mut out, 8, 0, 0),
            Err(BufferError::StaleHandle)
        ));
        assert!(matches!(
            mgr.copy_on_device(0, gone, live, 8, 0, 0),
            Err(BufferError::StaleHandle)
        ));
        assert!(matches!(
            mgr.copy_on_device(0, live, gone, 8, 0, 0),
            Err(BufferError::StaleHandle)
        ));
        assert!(matches!(mgr.fill(0, gone, 0, 8, 0), Err(BufferError::StaleHandle)));
        assert!(matches!(mgr.descriptor(gone), Err(BufferError::StaleHandle)));
        assert!(matches!(mgr.record(gone), Err(BufferError::StaleHandle)));
    }

    #[test]
    fn device_copy_checks_both_ranges() {
        let mut mgr = manager();
        let a = mgr.allocate(0, 64, 0).unwrap();
        let b = mgr.allocate(0, 32, 0).unwrap();

        assert!(matches!(
            mgr.copy_on_device(0, a, b, 16, 56, 0),
            Err(BufferError::OutOfRange { offset: 56, size: 16, capacity: 64 })
        ));
        assert!(matches!(
            mgr.copy_on_device(0, a, b, 16, 0, 24),
            Err(BufferError::OutOfRange { offset: 24, size: 16, capacity: 32 })
        ));
        assert!(matches!(
            mgr.copy_on_device(0, a, b, 16, usize::MAX, 0),
            Err(BufferError::OutOfRange { .. })
        ));
    }

    #[test]
    fn device_copy_across_devices_is_rejected() {
        let mut mgr = manager();
        mgr.open_device(1).unwrap();
        let on0 = mgr.allocate(0, 64, 0).unwrap();
        let on1 = mgr.allocate(1, 64, 0).unwrap();

        assert!(matches!(
            mgr.copy_on_device(0, on0, on1, 8, 0, 0),
            Err(BufferError::DeviceMismatch { expected: 0, actual: 1 })
        ));
        assert!(matches!(
            mgr.copy_on_device(1, on0, on1, 8, 0, 0),
            Err(BufferError::DeviceMismatch { expected: 1, actual: 0 })
        ));
        assert!(matches!(
            mgr.copy_to_host(1, on0, &mut [0u8; 8], 8, 0, 0),
            Err(BufferError::DeviceMismatch { .. })
        ));
        assert!(matches!(
            mgr.fill(1, on0, 0, 8, 0),
            Err(BufferError::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn release_all_continues_past_failures() {
        let mut mgr = manager();
        mgr.open_device(1).unwrap();
        let orphan = mgr.allocate(0, 64, 0).unwrap();
        mgr.allocate(1, 64, 0).unwrap();
        mgr.allocate(1, 128, 0).unwrap();

        // Device 0 goes away underneath the manager
        mgr.channel().close(0).unwrap();

        assert!(matches!(
            mgr.release_all(),
            Err(BufferError::DeviceNotOpen(0))
        ));
        assert_eq!(mgr.channel().allocation_count(1).unwrap(), 0);
        assert_eq!(mgr.len(), 1);
        assert!(mgr.translate(orphan).is_ok());
    }

    #[test]
    fn fill_sets_only_requested_range() {
        let mut mgr = manager();
        let h = mgr.allocate(0, 32, 0).unwrap();
        mgr.copy_to_device(0, &[0u8; 32], h, 32, 0, 0).unwrap();
        mgr.fill(0, h, 0xEE, 8, 8).unwrap();

        let mut out = [0u8; 32];
        mgr.copy_to_host(0, h, &mut out, 32, 0, 0).unwrap();
        assert!(out[..8].iter().all(|&b| b == 0));
        assert!(out[8..16].iter().all(|&b| b == 0xEE));
        assert!(out[16..].iter().all(|&b| b == 0));
        assert!(matches!(
            mgr.fill(0, h, 0, 8, 30),
            Err(BufferError::OutOfRange { .. })
        ));
    }

    #[test]
    fn record_matches_descriptor() {
        let mut mgr = manager();
        let h = mgr.allocate(0, 512, 0).unwrap();
        let rec = mgr.record(h).unwrap();
        assert_eq!(rec.device_address, mgr.translate(h).unwrap());
        assert_eq!(rec.size, 512);
    }
}
