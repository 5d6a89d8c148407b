use crate::error::{BufferError, BufferResult};

/// Rounds `val` up to the next multiple of `align`. `align` must be a power of two.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// Checks that `[offset, offset + size)` fits inside a region of `capacity` bytes.
///
/// # Errors
/// Returns `OutOfRange` if the range overflows or ends past `capacity`.
pub fn check_range(offset: usize, size: usize, capacity: usize) -> BufferResult<()> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(BufferError::OutOfRange {
            offset,
            size,
            capacity,
        }),
    }
}

/// Whether the half-open ranges `[a, a + len)` and `[b, b + len)` intersect.
///
/// Ends past `u64::MAX` are clamped, so the test never overflows.
#[must_use]
pub const fn ranges_overlap(a: u64, b: u64, len: u64) -> bool {
    len != 0 && a < b.saturating_add(len) && b < a.saturating_add(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn range_check_catches_overflow() {
        assert!(check_range(0, 16, 16).is_ok());
        assert!(check_range(16, 0, 16).is_ok());
        assert!(matches!(
            check_range(8, 9, 16),
            Err(BufferError::OutOfRange { offset: 8, size: 9, capacity: 16 })
        ));
        assert!(check_range(usize::MAX, 2, usize::MAX).is_err());
    }

    #[test]
    fn overlap_is_half_open() {
        assert!(ranges_overlap(0, 8, 16));
        assert!(!ranges_overlap(0, 16, 16));
        assert!(!ranges_overlap(0, 0, 0));
    }

    #[test]
    fn overlap_near_address_space_end() {
        assert!(!ranges_overlap(0x1000_0000, u64::MAX - 4, 16));
        assert!(ranges_overlap(u64::MAX - 8, u64::MAX - 4, 16));
    }
}
