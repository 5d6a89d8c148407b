use crate::channel::DeviceId;

/// Where a buffer lives on the accelerator. Written once at allocation, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub device: DeviceId,
    pub device_address: u64,
    pub size: usize,
}

/// Fixed-layout record handed to device code that needs to locate a buffer.
///
/// Layout: `device_address` then `size`, both 64-bit little endian.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorRecord {
    pub device_address: u64,
    pub size: u64,
}

impl DescriptorRecord {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    #[must_use]
    pub fn to_le_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.device_address.to_le_bytes());
        out[8..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let (addr, size) = bytes.split_at(8);
        let mut a = [0u8; 8];
        let mut s = [0u8; 8];
        a.copy_from_slice(addr);
        s.copy_from_slice(size);
        Self {
            device_address: u64::from_le_bytes(a),
            size: u64::from_le_bytes(s),
        }
    }
}

impl From<&BufferDescriptor> for DescriptorRecord {
    fn from(desc: &BufferDescriptor) -> Self {
        Self {
            device_address: desc.device_address,
            size: desc.size as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_sixteen_bytes() {
        assert_eq!(DescriptorRecord::SIZE, 16);
    }

    #[test]
    fn record_layout_is_address_then_size() {
        let desc = BufferDescriptor {
            device: 0,
            device_address: 0x1000_0040,
            size: 4096,
        };
        let bytes = DescriptorRecord::from(&desc).to_le_bytes();
        assert_eq!(&bytes[..8], &0x1000_0040u64.to_le_bytes());
        assert_eq!(&bytes[8..], &4096u64.to_le_bytes());
        assert_eq!(
            DescriptorRecord::from_le_bytes(bytes).device_address,
            0x1000_0040
        );
    }
}
