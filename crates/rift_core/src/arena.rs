//! # Generational Arena
//!
//! Slot storage for objects that are created and destroyed at runtime
//! (dimensions). Keys carry a generation so a key of a released slot never
//! resolves to the object that later reuses the slot.

/// Key of an arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaKey {
    /// Slot index.
    pub index: u32,
    /// Generation of the slot when the key was issued.
    pub generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A generational arena with a free list.
///
/// Iteration order is slot order, which keeps every walk over the arena
/// deterministic.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    /// Free list - indices of released slots.
    free_list: Vec<u32>,
    /// Number of live objects.
    len: usize,
}

impl<T> Arena<T> {
    /// Creates an empty arena with room for `capacity` objects before growing.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Number of live objects.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true when no object is live.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value built from its future key.
    ///
    /// Released slots are reused lowest-index first so that ids stay compact.
    pub fn insert_with(&mut self, build: impl FnOnce(ArenaKey) -> T) -> ArenaKey {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            let key = ArenaKey { index, generation: slot.generation };
            slot.value = Some(build(key));
            self.len += 1;
            return key;
        }

        let index = self.slots.len() as u32;
        let key = ArenaKey { index, generation: 0 };
        self.slots.push(Slot { generation: 0, value: Some(build(key)) });
        self.len += 1;
        key
    }

    /// Removes and returns the value behind `key`.
    ///
    /// Returns None if the key is stale or the slot is empty.
    pub fn remove(&mut self, key: ArenaKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free_list.push(key.index);
        // Keep the lowest index on top of the stack.
        self.free_list.sort_unstable_by(|a, b| b.cmp(a));
        self.len -= 1;
        Some(value)
    }

    /// Gets a reference to a live value.
    #[inline]
    #[must_use]
    pub fn get(&self, key: ArenaKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Gets a mutable reference to a live value.
    #[inline]
    pub fn get_mut(&mut self, key: ArenaKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Iterates over all live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|v| {
                (ArenaKey { index: index as u32, generation: slot.generation }, v)
            })
        })
    }

    /// Iterates mutably over all live values in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ArenaKey, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (ArenaKey { index: index as u32, generation }, v))
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}
