//! Fixed-size entity pool with lifecycle hooks.
//!
//! O(1) acquire/release over a generation-indexed slab. A `Handle<T>` pairs
//! a slot index with the generation it was acquired at; using a handle whose
//! generation no longer matches the slot returns `None` instead of touching
//! freed or reused memory. This is the Rust-idiomatic stand-in for the
//! reference implementation's raw back-pointers (Channel -> Session,
//! Session -> Socket): a stale handle fails cleanly instead of dangling.

use parking_lot::Mutex;
use std::marker::PhantomData;

/// A handle into a `Pool<T>`. Copy/Eq so it can be stored as a plain
/// back-reference field without borrowing the pool.
pub struct Handle<T> {
    index: usize,
    generation: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}
impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}
impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u64,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    allocated_total: usize,
}

/// Lifecycle hooks, all optional. `on_acquire` may fail (returning `false`);
/// on failure the element is immediately returned to the free list and
/// `acquire` yields `None`.
pub trait PoolHooks<T>: Send + Sync {
    fn on_alloc(&self, _value: &mut T) {}
    fn on_free(&self, _value: &mut T) {}
    fn on_acquire(&self, _value: &mut T) -> bool {
        true
    }
    fn on_release(&self, _value: &mut T) {}
}

/// No-op hook set, used where a pool has no lifecycle concerns.
pub struct NoHooks;
impl<T> PoolHooks<T> for NoHooks {}

pub struct Pool<T, H: PoolHooks<T> = NoHooks> {
    inner: Mutex<Inner<T>>,
    hooks: H,
}

impl<T, H: PoolHooks<T>> Pool<T, H> {
    pub fn new(hooks: H) -> Self {
        Pool {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                allocated_total: 0,
            }),
            hooks,
        }
    }

    /// `in_use = allocated_total - available` (invariant 1 of the object
    /// pool contract).
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock();
        inner.allocated_total - inner.free.len()
    }

    pub fn allocated_total(&self) -> usize {
        self.inner.lock().allocated_total
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Acquire an element, physically allocating one via `make` if the free
    /// list is empty. Returns `None` only if `on_acquire` rejects the
    /// element (it is rolled back onto the free list before returning).
    pub fn acquire(&self, make: impl FnOnce() -> T) -> Option<Handle<T>> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                let mut value = make();
                self.hooks.on_alloc(&mut value);
                inner.slots.push(Slot {
                    value: Some(value),
                    generation: 0,
                });
                inner.allocated_total += 1;
                inner.slots.len() - 1
            }
        };

        let slot = &mut inner.slots[index];
        let generation = slot.generation;
        let accepted = {
            let value = slot.value.as_mut().expect("acquired slot missing value");
            self.hooks.on_acquire(value)
        };

        if !accepted {
            inner.free.push(index);
            return None;
        }

        Some(Handle {
            index,
            generation,
            _marker: PhantomData,
        })
    }

    /// Release an already-released handle is a no-op (invariant 3); a
    /// mismatched generation (stale handle) is likewise a no-op rather than
    /// a panic, since callers may race a close against a pending task.
    pub fn release(&self, handle: Handle<T>) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(handle.index) else {
            return;
        };
        if slot.generation != handle.generation || slot.value.is_none() {
            return; // stale or already released
        }
        {
            let value = slot.value.as_mut().expect("checked is_some above");
            self.hooks.on_release(value);
        }
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        if value.is_some() {
            inner.free.push(handle.index);
        }
        drop(value); // dropped after on_release observed it; on_free happens at physical free only
    }

    pub fn with<R>(&self, handle: Handle<T>, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref().map(f)
    }

    pub fn with_mut<R>(&self, handle: Handle<T>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut().map(f)
    }
}

impl<T, H: PoolHooks<T>> Drop for Pool<T, H> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if let Some(mut value) = slot.value.take() {
                self.hooks.on_free(&mut value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn acquire_release_round_trip() {
        let pool: Pool<u32> = Pool::new(NoHooks);
        let h1 = pool.acquire(|| 10).unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.with(h1, |v| *v), Some(10));

        pool.release(h1);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.with(h1, |v| *v), None); // generation bumped, stale handle
    }

    #[test]
    fn reacquire_reuses_slot_with_new_generation() {
        let pool: Pool<u32> = Pool::new(NoHooks);
        let h1 = pool.acquire(|| 1).unwrap();
        pool.release(h1);
        let h2 = pool.acquire(|| 2).unwrap();
        assert_eq!(pool.allocated_total(), 1); // reused the slot, no new allocation
        assert_ne!(h1.generation, h2.generation);
        assert_eq!(pool.with(h1, |v| *v), None);
        assert_eq!(pool.with(h2, |v| *v), Some(2));
    }

    #[test]
    fn double_release_is_noop() {
        let pool: Pool<u32> = Pool::new(NoHooks);
        let h1 = pool.acquire(|| 1).unwrap();
        pool.release(h1);
        pool.release(h1); // must not panic or double-count free list
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 1);
    }

    struct CountingHooks {
        allocs: AtomicUsize,
        acquires: AtomicUsize,
        releases: AtomicUsize,
        frees: AtomicUsize,
    }

    impl PoolHooks<u32> for CountingHooks {
        fn on_alloc(&self, _value: &mut u32) {
            self.allocs.fetch_add(1, Ordering::SeqCst);
        }
        fn on_acquire(&self, _value: &mut u32) -> bool {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn on_release(&self, _value: &mut u32) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        fn on_free(&self, _value: &mut u32) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hooks_fire_in_expected_counts() {
        use std::sync::Arc;

        let hooks = Arc::new(CountingHooks {
            allocs: AtomicUsize::new(0),
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        });

        impl PoolHooks<u32> for Arc<CountingHooks> {
            fn on_alloc(&self, v: &mut u32) {
                CountingHooks::on_alloc(self, v)
            }
            fn on_acquire(&self, v: &mut u32) -> bool {
                CountingHooks::on_acquire(self, v)
            }
            fn on_release(&self, v: &mut u32) {
                CountingHooks::on_release(self, v)
            }
            fn on_free(&self, v: &mut u32) {
                CountingHooks::on_free(self, v)
            }
        }

        let pool: Pool<u32, Arc<CountingHooks>> = Pool::new(hooks.clone());
        let h1 = pool.acquire(|| 0).unwrap();
        pool.release(h1);
        let _h2 = pool.acquire(|| 0).unwrap();

        assert_eq!(hooks.allocs.load(Ordering::SeqCst), 1); // only first acquire allocates
        assert_eq!(hooks.acquires.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.releases.load(Ordering::SeqCst), 1);
        drop(pool);
        assert_eq!(hooks.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejecting_acquire_rolls_back() {
        struct RejectOnce {
            rejected: std::sync::atomic::AtomicBool,
        }
        impl PoolHooks<u32> for RejectOnce {
            fn on_acquire(&self, _value: &mut u32) -> bool {
                !self.rejected.swap(true, Ordering::SeqCst)
            }
        }
        let pool: Pool<u32, RejectOnce> = Pool::new(RejectOnce {
            rejected: std::sync::atomic::AtomicBool::new(false),
        });
        assert!(pool.acquire(|| 1).is_none()); // first call flips `rejected` to true and fails
        assert_eq!(pool.available(), 1); // rolled back onto the free list
        assert!(pool.acquire(|| 1).is_some());
    }
}
