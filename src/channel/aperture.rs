use super::ApertureAllocator;
use crate::utils::align_up;
use std::collections::BTreeMap;
use tracing::warn;

pub const PAGE_SIZE: u64 = 4096;

/// Represents a managed range of device virtual address space.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Tracks occupied ranges: Start Address -> Size, guard pages included.
    // Used to find holes for new allocations.
    allocations: BTreeMap<u64, u64>,
}

impl Aperture {
    /// `limit` is exclusive. `align` must be a power of two.
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align,
            guard_pages,
            allocations: BTreeMap::new(),
        }
    }

    const fn guard_size(&self) -> u64 {
        self.guard_pages * PAGE_SIZE
    }

    /// First tracked start at or after `cursor` whose user address is aligned.
    fn candidate_from(&self, cursor: u64, align: u64) -> u64 {
        align_up(cursor + self.guard_size(), align) - self.guard_size()
    }

    /// Bytes not covered by any reservation.
    #[must_use]
    pub fn available(&self) -> u64 {
        let (base, limit) = self.bounds();
        let used: u64 = self.allocations.values().sum();
        (limit - base).saturating_sub(used)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// First-fit search for a hole large enough for `size` plus guard pages.
    fn allocate_va(&mut self, size: usize, align: usize) -> Option<u64> {
        let align = std::cmp::max(align as u64, self.align);
        let request_size = (size as u64).checked_add(self.guard_size() * 2)?;

        let mut cursor = self.base;
        let mut found = None;

        for (&alloc_start, &alloc_size) in &self.allocations {
            let candidate = self.candidate_from(cursor, align);
            if candidate.checked_add(request_size)? <= alloc_start {
                found = Some(candidate);
                break;
            }
            cursor = std::cmp::max(cursor, alloc_start + alloc_size);
        }

        let start = match found {
            Some(start) => start,
            None => {
                let candidate = self.candidate_from(cursor, align);
                if candidate.checked_add(request_size)? > self.limit {
                    return None;
                }
                candidate
            }
        };

        self.allocations.insert(start, request_size);
        Some(start + self.guard_size())
    }

    fn free_va(&mut self, addr: u64, _size: usize) -> bool {
        // The tracked start is the address minus the leading guard
        let tracked_start = addr.wrapping_sub(self.guard_size());

        if self.allocations.remove(&tracked_start).is_none() {
            warn!(addr = format_args!("0x{addr:x}"), "free of untracked device VA");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1000_0000;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut ap = Aperture::new(BASE, BASE + 0x10_0000, 64, 0);
        let a = ap.allocate_va(100, 0).unwrap();
        let b = ap.allocate_va(100, 4096).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(b % 4096, 0);
        assert!(b >= a + 100);
    }

    #[test]
    fn freed_hole_is_reused() {
        let mut ap = Aperture::new(BASE, BASE + 0x10_0000, 64, 0);
        let a = ap.allocate_va(256, 0).unwrap();
        let b = ap.allocate_va(256, 0).unwrap();
        assert!(ap.free_va(a, 256));
        let c = ap.allocate_va(128, 0).unwrap();
        assert_eq!(c, a);
        assert!(c + 128 <= b);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut ap = Aperture::new(BASE, BASE + 1024, 64, 0);
        assert_eq!(ap.bounds(), (BASE, BASE + 1024));
        assert_eq!(ap.available(), 1024);
        assert!(ap.allocate_va(1024, 0).is_some());
        assert!(ap.allocate_va(1, 0).is_none());
        assert_eq!(ap.available(), 0);
    }

    #[test]
    fn guard_pages_separate_allocations() {
        let mut ap = Aperture::new(BASE, BASE + 0x10_0000, 64, 1);
        let a = ap.allocate_va(64, 0).unwrap();
        let b = ap.allocate_va(64, 0).unwrap();
        assert_eq!(a, BASE + PAGE_SIZE);
        assert!(b >= a + 64 + 2 * PAGE_SIZE);
        assert!(ap.free_va(b, 64));
        assert!(ap.free_va(a, 64));
        assert!(ap.is_empty());
    }

    #[test]
    fn double_free_is_reported() {
        let mut ap = Aperture::new(BASE, BASE + 4096, 64, 0);
        let a = ap.allocate_va(64, 0).unwrap();
        assert!(ap.free_va(a, 64));
        assert!(!ap.free_va(a, 64));
    }
}
