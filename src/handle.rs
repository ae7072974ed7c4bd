//! A generic, generation-stamped handle table (§3, §4.8), used for both NT objects (files,
//! stdio, events, sections) and USER objects (HWND, HMENU, HCURSOR). Both instances are the
//! same structure; only the element type and, for USER, the guest-visible mirror differ.

use crate::error::{HandleError, HandleResult};
use log::warn;

/// A 32-bit handle: `(generation << 16) | index`. Handle `0` is always invalid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    fn new(index: u32, generation: u16) -> Self {
        Handle(((generation as u32) << 16) | index)
    }

    fn index(self) -> u32 {
        self.0 & 0xFFFF
    }

    fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

enum Slot<T> {
    Free { next: Option<u32>, generation: u16 },
    Occupied { value: T, generation: u16 },
}

/// A generation-stamped, free-list-threaded handle table. `T` carries whatever payload and
/// type-tag information the owning subsystem needs; this table itself only manages identity
/// and lifetime.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    first_free: Option<u32>,
    live_count: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        // Index 0 is reserved (handle 0 is always invalid); seed it as a dead, never-reused
        // free slot so real allocations start at index 1.
        Self {
            slots: vec![Slot::Free { next: None, generation: 1 }],
            first_free: None,
            live_count: 0,
        }
    }

    /// Allocates a new slot holding `value`, returning its handle.
    pub fn alloc(&mut self, value: T) -> Handle {
        if let Some(index) = self.first_free {
            let (next, generation) = match &self.slots[index as usize] {
                Slot::Free { next, generation } => (*next, *generation),
                Slot::Occupied { .. } => unreachable!("free list pointed at an occupied slot"),
            };
            self.first_free = next;
            self.slots[index as usize] = Slot::Occupied { value, generation };
            self.live_count += 1;
            return Handle::new(index, generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied { value, generation: 1 });
        self.live_count += 1;
        Handle::new(index, 1)
    }

    fn slot(&self, handle: Handle) -> HandleResult<&T> {
        if handle.is_null() {
            return Err(HandleError::Invalid(handle.0));
        }
        let index = handle.index() as usize;
        match self.slots.get(index) {
            Some(Slot::Occupied { value, generation }) if *generation == handle.generation() => Ok(value),
            _ => Err(HandleError::Invalid(handle.0)),
        }
    }

    fn slot_mut(&mut self, handle: Handle) -> HandleResult<&mut T> {
        if handle.is_null() {
            return Err(HandleError::Invalid(handle.0));
        }
        let index = handle.index() as usize;
        match self.slots.get_mut(index) {
            Some(Slot::Occupied { value, generation }) if *generation == handle.generation() => Ok(value),
            _ => Err(HandleError::Invalid(handle.0)),
        }
    }

    /// Looks up `handle`, requiring only generation match.
    pub fn get(&self, handle: Handle) -> HandleResult<&T> {
        self.slot(handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> HandleResult<&mut T> {
        self.slot_mut(handle)
    }

    /// Looks up `handle`, additionally requiring `predicate` to accept the stored value's type
    /// tag (e.g. `|v| matches!(v, Object::Window(_))`).
    pub fn get_typed(&self, handle: Handle, predicate: impl FnOnce(&T) -> bool) -> HandleResult<&T> {
        let value = self.slot(handle)?;
        if predicate(value) {
            Ok(value)
        } else {
            Err(HandleError::WrongType(handle.0))
        }
    }

    /// Frees `handle`, incrementing its slot's generation so stale copies of the handle can
    /// never resolve again, then threading the slot onto the free list.
    pub fn free(&mut self, handle: Handle) -> HandleResult<T> {
        if handle.is_null() {
            return Err(HandleError::Invalid(handle.0));
        }
        let index = handle.index();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(HandleError::Invalid(handle.0))?;

        let (value, generation) = match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation() => {
                let generation = *generation;
                let old = std::mem::replace(
                    slot,
                    Slot::Free { next: self.first_free, generation: generation.wrapping_add(1) },
                );
                match old {
                    Slot::Occupied { value, .. } => (value, generation),
                    Slot::Free { .. } => unreachable!(),
                }
            }
            _ => {
                warn!("handle table: free of stale or unknown handle {:#010x}", handle.0);
                return Err(HandleError::Invalid(handle.0));
            }
        };

        self.first_free = Some(index);
        self.live_count -= 1;
        Ok(value)
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        self.slot(handle).is_ok()
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Iterates over every occupied slot together with the handle that resolves to it.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { value, generation } => Some((Handle::new(i as u32, *generation), value)),
            Slot::Free { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_get_round_trips() {
        let mut table: HandleTable<u32> = HandleTable::new();
        let h = table.alloc(42);
        assert_eq!(*table.get(h).unwrap(), 42);
    }

    #[test]
    fn handle_zero_is_always_invalid() {
        let table: HandleTable<u32> = HandleTable::new();
        assert!(table.get(Handle::NULL).is_err());
    }

    #[test]
    fn freed_handle_generation_is_bumped_and_old_handle_rejected() {
        let mut table: HandleTable<u32> = HandleTable::new();
        let h1 = table.alloc(1);
        table.free(h1).unwrap();
        let h2 = table.alloc(2);

        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1.generation(), h2.generation());
        assert!(table.get(h1).is_err());
        assert_eq!(*table.get(h2).unwrap(), 2);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut table: HandleTable<u32> = HandleTable::new();
        let h = table.alloc(1);
        table.free(h).unwrap();
        assert!(table.free(h).is_err());
    }

    #[test]
    fn typed_lookup_rejects_wrong_type() {
        let mut table: HandleTable<Result<u32, &'static str>> = HandleTable::new();
        let h = table.alloc(Ok(1));
        assert!(table.get_typed(h, |v| v.is_err()).is_err());
        assert!(table.get_typed(h, |v| v.is_ok()).is_ok());
    }
}
