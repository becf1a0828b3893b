use std::{marker::PhantomData, num::NonZeroU64};

/// Nonzero handle to an item in a generational pool. A handle stays unique for
/// the lifetime of the pool that created it: once its slot is reused, the old
/// handle no longer resolves.
///
/// It is typed for a modicum of safety, but nothing stops a handle from being
/// used with a different pool of the same type.
pub struct Handle<T>(NonZeroU64, PhantomData<fn() -> T>);

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        debug_assert_ne!(generation, 0);
        let value = u64::from(generation) << 32 | u64::from(index);
        // Generations start at 1, so the value is never zero.
        Self(NonZeroU64::new(value).unwrap_or(NonZeroU64::MIN), PhantomData)
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.0.get() as u32
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    /// Packs the handle into an integer, for use as an opaque id outside of
    /// the pool's crate.
    #[must_use]
    pub fn to_bits(self) -> u64 {
        self.0.get()
    }

    /// Recovers a handle from [`Handle::to_bits`]. Returns `None` for zero.
    #[must_use]
    pub fn from_bits(bits: u64) -> Option<Self> {
        NonZeroU64::new(bits).map(|v| Self(v, PhantomData))
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// An object pool that makes use of generational indices to avoid the ABA
/// problem.
///
/// Freed slots are recycled in LIFO order. A slot whose generation saturates
/// is retired instead of being recycled.
pub struct GenerationalPool<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Default for GenerationalPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GenerationalPool<T> {
    /// Initializes a new empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// The number of live items in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a reference to the item identified by the given handle.
    ///
    /// ## Returns
    ///
    /// `Some(&T)` if the handle is valid and `None` otherwise.
    #[must_use]
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation == handle.generation() {
            slot.value.as_ref()
        } else {
            None
        }
    }

    /// Returns a mutable reference to the item identified by the given handle.
    ///
    /// ## Returns
    ///
    /// `Some(&mut T)` if the handle is valid and `None` otherwise.
    #[must_use]
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation == handle.generation() {
            slot.value.as_mut()
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Inserts a new value into the pool and returns a handle to it.
    ///
    /// ## Panics
    ///
    /// Panics if the pool would hold more than `u32::MAX` slots.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            Handle::new(index, slot.generation)
        } else {
            let index = u32::try_from(self.slots.len()).expect("max u32::MAX items!");
            self.slots.push(Slot {
                generation: 1,
                value: Some(value),
            });
            Handle::new(index, 1)
        }
    }

    /// Removes the value identified by the given handle from the pool.
    ///
    /// ## Returns
    ///
    /// Returns the value if the handle is valid and `None` otherwise.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }

        let value = slot.value.take()?;
        self.len -= 1;

        if slot.generation < u32::MAX {
            slot.generation += 1;
            self.free_list.push(handle.index());
        }

        Some(value)
    }

    /// Iterates over every live item along with its handle.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Removes every item, invalidating all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if let Some(value) = slot.value.take() {
                values.push(value);
                if slot.generation < u32::MAX {
                    slot.generation += 1;
                    self.free_list.push(index as u32);
                }
            }
        }
        self.len = 0;
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_one() {
        let mut pool = GenerationalPool::<u32>::new();

        let handle = pool.insert(42);
        assert_eq!(handle.index(), 0);
        assert_eq!(handle.generation(), 1);

        assert_eq!(pool.get(handle), Some(&42));
        assert_eq!(pool.get_mut(handle), Some(&mut 42));
        assert_eq!(pool.len(), 1);

        assert_eq!(pool.remove(handle), Some(42));
        assert_eq!(pool.get(handle), None);
        assert!(pool.is_empty());
        assert_eq!(pool.slots[0].generation, 2);
    }

    #[test]
    fn handles() {
        let mut pool = GenerationalPool::<u32>::new();

        let handle = pool.insert(42);
        let copy = handle;

        assert_eq!(handle, copy);
        assert_eq!(
            format!("{:?}", handle),
            "Handle { index: 0, generation: 1 }"
        );

        let bits = handle.to_bits();
        assert_eq!(Handle::<u32>::from_bits(bits), Some(handle));
        assert_eq!(Handle::<u32>::from_bits(0), None);
    }

    #[test]
    fn remove_twice() {
        let mut pool = GenerationalPool::<u32>::new();
        let handle = pool.insert(42);

        assert_eq!(pool.remove(handle), Some(42));
        assert_eq!(pool.remove(handle), None);

        let _ = pool.insert(43);
        assert_eq!(pool.remove(handle), None, "stale handle must not alias");
    }

    #[test]
    fn insert_remove_insert_get() {
        let mut pool = GenerationalPool::<u32>::new();

        let a = pool.insert(42);
        assert_eq!(pool.remove(a), Some(42));

        let b = pool.insert(43);
        assert_eq!(a.index(), b.index(), "slot should be recycled");
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get(b), Some(&43));
    }

    #[test]
    fn iter_and_drain() {
        let mut pool = GenerationalPool::<u32>::new();
        let a = pool.insert(1);
        let b = pool.insert(2);
        let c = pool.insert(3);
        pool.remove(b);

        let live: Vec<_> = pool.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(live, vec![(a, 1), (c, 3)]);

        let mut drained = pool.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 3]);
        assert!(pool.is_empty());
        assert_eq!(pool.get(a), None);
    }
}
