//! Dense, reusable slot allocation.
//!
//! A [`SlotTable`] hands out small integer slots for values and takes them
//! back when the value leaves. Freed indices are reused before the table
//! grows, which keeps correlation numbers small and the backing vector
//! dense. Every reuse bumps the slot generation; lookups and removals take
//! the full [`SlotId`] and refuse to touch a slot whose generation moved on.
//!
//! The table itself is not synchronised. The registry keeps it behind the
//! same lock that guards the rest of its bookkeeping so that check-then-mutate
//! sequences (allocate, match, free) are atomic as a whole.

use crate::SlotId;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Reusable, densely indexed collection keyed by [`SlotId`].
pub struct SlotTable<T> {
    // ---
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    occupied: usize,
}

impl<T> SlotTable<T> {
    // ---

    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            occupied: 0,
        }
    }

    /// Store `value` in a free slot and return its id.
    ///
    /// The most recently freed index is reused first.
    pub fn insert(&mut self, value: T) -> SlotId {
        // ---
        self.occupied += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return SlotId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SlotId::new(index, 0)
    }

    /// Borrow the value in `id`, if that exact generation is still live.
    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Remove and return the value in `id`.
    ///
    /// Returns `None` for out-of-range indices, already-freed slots, and
    /// slots that were reused since `id` was issued.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        // ---
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(id.index);
        self.occupied -= 1;
        Some(value)
    }

    /// Remove every value matching `pred`, returning them with their ids.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<(SlotId, T)>
    where
        F: FnMut(&T) -> bool,
    {
        // ---
        let mut removed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let hit = slot.value.as_ref().is_some_and(&mut pred);
            if hit {
                if let Some(value) = slot.value.take() {
                    removed.push((SlotId::new(index as u32, slot.generation), value));
                    self.free.push(index as u32);
                }
            }
        }
        self.occupied -= removed.len();
        removed
    }

    /// Remove every value, leaving all slots free for reuse.
    pub fn drain(&mut self) -> Vec<(SlotId, T)> {
        self.remove_where(|_| true)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Number of slots ever allocated (occupied or free).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
