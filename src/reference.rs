//! Manual reference counting with an enqueue-not-inline finalizer.
//!
//! Grounded directly in `base/ref.c`: every owned entity starts at 1,
//! `ref()` refuses to raise a count that has already reached 0, and the
//! finalizer set at construction runs exactly once, the instant the count
//! hits 0. The finalizer must not perform the entity's release inline (it
//! would re-enter the pool/dispatcher while a caller may still be holding a
//! lock on the same structure); it enqueues a task onto the dispatcher
//! instead.

use std::sync::atomic::{AtomicI64, Ordering};

pub trait Finalize: Send + Sync {
    /// Called exactly once when the reference count reaches zero. Must not
    /// block and must not perform the entity's pool release inline.
    fn finalize(&self);
}

pub struct Reference<F: Finalize> {
    count: AtomicI64,
    finalizer: F,
}

impl<F: Finalize> Reference<F> {
    pub fn new(finalizer: F) -> Self {
        Reference {
            count: AtomicI64::new(1),
            finalizer,
        }
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Increments the count. Returns `false` (and leaves the count
    /// unchanged) if the count has already reached 0 — ref'ing a finalized
    /// reference is a logic error in the caller, asserted in debug builds.
    pub fn add_ref(&self) -> bool {
        loop {
            let current = self.count.load(Ordering::SeqCst);
            debug_assert!(current > 0, "ref on a finalized reference");
            if current <= 0 {
                return false;
            }
            let next = current + 1;
            if self
                .count
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Decrements the count; runs the finalizer exactly once when it
    /// reaches 0.
    pub fn unref(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous >= 1, "refcount underflow");
        if previous == 1 {
            self.finalizer.finalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingFinalize(Arc<AtomicUsize>);
    impl Finalize for CountingFinalize {
        fn finalize(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn finalizes_exactly_once_at_zero() {
        let hits = Arc::new(AtomicUsize::new(0));
        let reference = Reference::new(CountingFinalize(hits.clone()));

        assert!(reference.add_ref());
        assert_eq!(reference.count(), 2);

        reference.unref();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        reference.unref();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_ref_after_finalize_is_rejected() {
        let hits = Arc::new(AtomicUsize::new(0));
        let reference = Reference::new(CountingFinalize(hits.clone()));
        reference.unref();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!reference.add_ref());
    }
}
