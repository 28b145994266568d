//! Fixed-capacity object pool addressed by generation-checked handles.
//!
//! It also provides a type akin to pointers so that singly linked lists can be
//! realized on it within safe Rust. A slot is tagged as either used or free;
//! releasing a slot bumps its generation so that a [`Handle`] to the old
//! occupant never reaches a new one.
use core::{fmt, num::NonZeroUsize};

use crate::utils::Init;

/// A pointer to a slot in a [`Pool`], without information about which
/// specific `Pool` this is associated with.
///
/// `Pool` uses zero-based indices, but when stored in `PoolPtr`, they are
/// one-based to meet the requirement of `NonZeroUsize`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct PoolPtr(NonZeroUsize);

impl PoolPtr {
    /// Construct a `PoolPtr` from a zero-based slot index.
    fn new(index: usize) -> Self {
        match NonZeroUsize::new(index.wrapping_add(1)) {
            Some(x) => Self(x),
            None => unreachable!("slot index overflow"),
        }
    }

    fn index(self) -> usize {
        self.0.get() - 1
    }
}

/// A handle to an object stored in a [`Pool`]. Becomes stale when the
/// object is released.
///
/// A stale handle could only alias a new occupant after its slot has been
/// released `2^32` times.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct Handle {
    ptr: PoolPtr,
    generation: u32,
}

impl Handle {
    pub(crate) fn ptr(self) -> PoolPtr {
        self.ptr
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.ptr.index(), self.generation)
    }
}

/// Implemented by the objects that form a singly linked list inside a
/// [`Pool`].
pub(crate) trait Link {
    fn next(&self) -> Option<PoolPtr>;
    fn set_next(&mut self, next: Option<PoolPtr>);
}

#[derive(Debug, Clone, Copy)]
enum Entry<T> {
    Used(T),
    Free,
}

#[derive(Debug, Clone, Copy)]
struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

impl<T: Copy> Init for Slot<T> {
    const INIT: Self = Self {
        generation: 0,
        entry: Entry::Free,
    };
}

/// Fixed-capacity object pool.
pub(crate) struct Pool<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T: Copy, const N: usize> Init for Pool<T, N> {
    const INIT: Self = Self {
        slots: [Slot::INIT; N],
    };
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for Pool<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(
                self.slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, slot)| match &slot.entry {
                        Entry::Used(x) => Some((i, x)),
                        Entry::Free => None,
                    }),
            )
            .finish()
    }
}

impl<T, const N: usize> Pool<T, N> {
    /// Store `value` in the first free slot. Return `None` if there's no
    /// free slot.
    pub(crate) fn allocate(&mut self, value: T) -> Option<Handle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| matches!(slot.entry, Entry::Free))?;
        slot.entry = Entry::Used(value);
        Some(Handle {
            ptr: PoolPtr::new(index),
            generation: slot.generation,
        })
    }

    /// Release the object referenced by `handle`. Return `None` if the handle
    /// is stale.
    pub(crate) fn release(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.ptr.index())?;
        if slot.generation != handle.generation || matches!(slot.entry, Entry::Free) {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        match core::mem::replace(&mut slot.entry, Entry::Free) {
            Entry::Used(x) => Some(x),
            Entry::Free => None,
        }
    }

    /// Release every object. All outstanding handles become stale.
    pub(crate) fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Entry::Used(_) = slot.entry {
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = Entry::Free;
            }
        }
    }

    /// Get the object referenced by `handle`. Return `None` if the handle is
    /// stale.
    pub(crate) fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.ptr.index())?;
        match &slot.entry {
            Entry::Used(x) if slot.generation == handle.generation => Some(x),
            _ => None,
        }
    }

    /// Get the object at `ptr`.
    ///
    /// Panics if the slot is free. Only pointers taken from a live list are
    /// passed here.
    pub(crate) fn at(&self, ptr: PoolPtr) -> &T {
        match &self.slots[ptr.index()].entry {
            Entry::Used(x) => x,
            Entry::Free => unreachable!("dangling list link"),
        }
    }

    /// Mutable version of [`Self::at`].
    pub(crate) fn at_mut(&mut self, ptr: PoolPtr) -> &mut T {
        match &mut self.slots[ptr.index()].entry {
            Entry::Used(x) => x,
            Entry::Free => unreachable!("dangling list link"),
        }
    }

    /// Return the number of objects currently stored.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.entry, Entry::Used(_)))
            .count()
    }
}

impl<T: Link, const N: usize> Pool<T, N> {
    /// Iterate through the list starting at `head`.
    pub(crate) fn iter(&self, head: Option<PoolPtr>) -> Iter<'_, T, N> {
        Iter { pool: self, next: head }
    }

    /// Insert `ptr` at the front of the list.
    pub(crate) fn push_front(&mut self, head: &mut Option<PoolPtr>, ptr: PoolPtr) {
        self.at_mut(ptr).set_next(*head);
        *head = Some(ptr);
    }

    /// Insert `ptr` after `prev`, or at the front if `prev` is `None`.
    pub(crate) fn insert_after(
        &mut self,
        head: &mut Option<PoolPtr>,
        prev: Option<PoolPtr>,
        ptr: PoolPtr,
    ) {
        if let Some(prev) = prev {
            let next = self.at(prev).next();
            self.at_mut(ptr).set_next(next);
            self.at_mut(prev).set_next(Some(ptr));
        } else {
            self.push_front(head, ptr);
        }
    }

    /// Find `ptr` in the list and unlink it. Return the element that preceded
    /// it (`Some(None)` for the head), or `None` if `ptr` is not in the list.
    pub(crate) fn unlink(
        &mut self,
        head: &mut Option<PoolPtr>,
        ptr: PoolPtr,
    ) -> Option<Option<PoolPtr>> {
        let mut prev = None;
        let mut cursor = *head;
        while let Some(current) = cursor {
            if current == ptr {
                let next = self.at(current).next();
                match prev {
                    Some(prev) => self.at_mut(prev).set_next(next),
                    None => *head = next,
                }
                self.at_mut(current).set_next(None);
                return Some(prev);
            }
            prev = cursor;
            cursor = self.at(current).next();
        }
        None
    }
}

/// Iterator created by [`Pool::iter`].
pub(crate) struct Iter<'a, T, const N: usize> {
    pool: &'a Pool<T, N>,
    next: Option<PoolPtr>,
}

impl<'a, T: Link, const N: usize> Iterator for Iter<'a, T, N> {
    type Item = (PoolPtr, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let ptr = self.next?;
        let item = self.pool.at(ptr);
        self.next = item.next();
        Some((ptr, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct Node {
        value: u32,
        next: Option<PoolPtr>,
    }

    impl Link for Node {
        fn next(&self) -> Option<PoolPtr> {
            self.next
        }
        fn set_next(&mut self, next: Option<PoolPtr>) {
            self.next = next;
        }
    }

    fn node(value: u32) -> Node {
        Node { value, next: None }
    }

    fn values<const N: usize>(pool: &Pool<Node, N>, head: Option<PoolPtr>) -> Vec<u32> {
        pool.iter(head).map(|(_, n)| n.value).collect()
    }

    #[test]
    fn allocate_until_full() {
        let mut pool: Pool<Node, 3> = Init::INIT;
        assert!(pool.allocate(node(1)).is_some());
        assert!(pool.allocate(node(2)).is_some());
        assert!(pool.allocate(node(3)).is_some());
        assert!(pool.allocate(node(4)).is_none());
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn stale_handle() {
        let mut pool: Pool<Node, 2> = Init::INIT;
        let h1 = pool.allocate(node(1)).unwrap();
        assert_eq!(pool.release(h1).map(|n| n.value), Some(1));

        // The slot is reused by a new object
        let h2 = pool.allocate(node(2)).unwrap();
        assert_eq!(h1.ptr(), h2.ptr());
        assert_ne!(h1, h2);

        assert!(pool.get(h1).is_none());
        assert!(pool.release(h1).is_none());
        assert_eq!(pool.get(h2).map(|n| n.value), Some(2));
    }

    #[test]
    fn stale_handle_outlives_many_reuses() {
        let mut pool: Pool<Node, 1> = Init::INIT;
        let first = pool.allocate(node(0)).unwrap();
        pool.release(first).unwrap();

        // Brings a 16-bit generation back to where `first` was taken
        for i in 1..=u32::from(u16::MAX) {
            let h = pool.allocate(node(i)).unwrap();
            assert!(pool.get(first).is_none());
            pool.release(h).unwrap();
        }

        let last = pool.allocate(node(1)).unwrap();
        assert!(pool.release(first).is_none());
        assert_eq!(pool.get(last).map(|n| n.value), Some(1));
    }

    #[test]
    fn clear_invalidates_handles() {
        let mut pool: Pool<Node, 2> = Init::INIT;
        let h = pool.allocate(node(1)).unwrap();
        pool.clear();
        assert!(pool.get(h).is_none());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn list_ops() {
        let mut pool: Pool<Node, 4> = Init::INIT;
        let mut head = None;
        let a = pool.allocate(node(1)).unwrap().ptr();
        let b = pool.allocate(node(2)).unwrap().ptr();
        let c = pool.allocate(node(3)).unwrap().ptr();
        let d = pool.allocate(node(4)).unwrap().ptr();

        pool.push_front(&mut head, a);
        pool.push_front(&mut head, b);
        assert_eq!(values(&pool, head), [2, 1]);

        pool.insert_after(&mut head, Some(a), c);
        pool.insert_after(&mut head, None, d);
        assert_eq!(values(&pool, head), [4, 2, 1, 3]);

        // Interior
        assert_eq!(pool.unlink(&mut head, a), Some(Some(b)));
        assert_eq!(values(&pool, head), [4, 2, 3]);

        // Head
        assert_eq!(pool.unlink(&mut head, d), Some(None));
        assert_eq!(values(&pool, head), [2, 3]);

        // Not in the list
        assert_eq!(pool.unlink(&mut head, a), None);
        assert_eq!(values(&pool, head), [2, 3]);
    }
}
