#![allow(clippy::cast_possible_truncation)]

use super::descriptor::BufferDescriptor;
use crate::channel::HostKey;
use crate::error::{BufferError, BufferResult};

/// Opaque reference to a buffer owned by a `BufferManager`.
///
/// Handles are generational: once the buffer is released, the handle (and every copy of it)
/// stops resolving, even after its slot is reused by a later allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    /// Key under which the device channel tracks this buffer's allocation.
    #[must_use]
    pub const fn key(self) -> HostKey {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<BufferDescriptor>,
}

/// Arena of descriptors addressed by `BufferHandle`.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl DescriptorTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an empty slot. The handle resolves only after `fill`.
    pub fn reserve(&mut self) -> BufferResult<BufferHandle> {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            return Ok(BufferHandle { index, generation });
        }

        let index = u32::try_from(self.slots.len())
            .map_err(|_| BufferError::Channel("descriptor table is full".into()))?;
        self.slots.push(Slot {
            generation: 0,
            entry: None,
        });
        Ok(BufferHandle {
            index,
            generation: 0,
        })
    }

    /// Return a reserved but unfilled slot.
    pub fn unreserve(&mut self, handle: BufferHandle) {
        if let Some(slot) = self.slots.get(handle.index as usize) {
            if slot.generation == handle.generation && slot.entry.is_none() {
                self.free.push(handle.index);
            }
        }
    }

    pub fn fill(&mut self, handle: BufferHandle, desc: BufferDescriptor) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation && slot.entry.is_none() {
                slot.entry = Some(desc);
                self.live += 1;
            }
        }
    }

    pub fn get(&self, handle: BufferHandle) -> BufferResult<&BufferDescriptor> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(BufferError::StaleHandle)
    }

    /// Drop the descriptor and retire the handle's generation.
    pub fn remove(&mut self, handle: BufferHandle) -> BufferResult<BufferDescriptor> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(BufferError::StaleHandle)?;
        let desc = slot.entry.take().ok_or(BufferError::StaleHandle)?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Ok(desc)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles of all live descriptors.
    pub fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|_| BufferHandle {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(addr: u64) -> BufferDescriptor {
        BufferDescriptor {
            device: 0,
            device_address: addr,
            size: 64,
        }
    }

    #[test]
    fn reserved_slot_resolves_after_fill() {
        let mut table = DescriptorTable::new();
        let h = table.reserve().unwrap();
        assert!(matches!(table.get(h), Err(BufferError::StaleHandle)));
        table.fill(h, desc(0x100));
        assert_eq!(table.get(h).unwrap().device_address, 0x100);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reused_slot_does_not_revive_old_handle() {
        let mut table = DescriptorTable::new();
        let old = table.reserve().unwrap();
        table.fill(old, desc(0x100));
        table.remove(old).unwrap();

        let new = table.reserve().unwrap();
        table.fill(new, desc(0x200));
        assert_ne!(old, new);
        assert_ne!(old.key(), new.key());
        assert!(matches!(table.get(old), Err(BufferError::StaleHandle)));
        assert!(matches!(table.remove(old), Err(BufferError::StaleHandle)));
        assert_eq!(table.get(new).unwrap().device_address, 0x200);
    }

    #[test]
    fn unreserve_returns_slot() {
        let mut table = DescriptorTable::new();
        let h = table.reserve().unwrap();
        table.unreserve(h);
        let again = table.reserve().unwrap();
        assert_eq!(h, again);
        assert!(table.is_empty());
    }

    #[test]
    fn handles_lists_live_entries_only() {
        let mut table = DescriptorTable::new();
        let a = table.reserve().unwrap();
        table.fill(a, desc(1));
        let b = table.reserve().unwrap();
        table.fill(b, desc(2));
        table.remove(a).unwrap();
        assert_eq!(table.handles().collect::<Vec<_>>(), vec![b]);
    }
}
