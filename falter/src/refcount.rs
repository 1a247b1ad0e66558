use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Intrusive atomic reference count around a `T`.
///
/// The shared-ownership primitive for objects that running VM processes
/// and the fold/relocate pipeline hold simultaneously (a cached intrinsics
/// table, for instance). Increment/decrement are lock-free; destruction
/// runs exactly once, on whichever thread drops the count to zero.
///
/// Unlike `Arc`, the count starts at 1 for the creating owner and the
/// *caller* chooses when to release — which is what lets a subclass-style
/// consumer use [`Refcounted::decrement_without_drop`] to detach from a
/// registry before tearing the object down itself.
pub struct Refcounted<T> {
    count: AtomicUsize,
    value: T,
}

impl<T> Refcounted<T> {
    /// Allocate with an initial count of 1, owned by the caller.
    pub fn new(value: T) -> NonNull<Refcounted<T>> {
        let boxed = Box::new(Refcounted {
            count: AtomicUsize::new(1),
            value,
        });
        // SAFETY: Box::into_raw never returns null
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    /// Take another reference.
    ///
    /// Panics if the count was already zero: someone is acquiring through
    /// a dangling reference, which is a use-after-free bug that must not
    /// be ignored.
    pub fn acquire(&self) {
        let previous = self.count.fetch_add(1, Ordering::Relaxed);
        assert!(previous > 0, "acquire on a dead refcounted object");
    }

    /// Drop one reference, destroying the object when the count reaches
    /// zero.
    ///
    /// # Safety
    ///
    /// `this` must have been created by [`Refcounted::new`] and the caller
    /// must own one reference. After the call the pointer may dangle.
    pub unsafe fn release(this: NonNull<Refcounted<T>>) {
        // SAFETY: caller owns a reference, so the allocation is live
        let zero = unsafe { this.as_ref().decrement_without_drop() };
        if zero {
            // The release decrement synchronizes with every prior
            // decrement, so the destructing thread sees all writes.
            // SAFETY: count hit zero exactly once; we own the allocation
            drop(unsafe { Box::from_raw(this.as_ptr()) });
        }
    }

    /// Drop one reference without destroying the object, reporting
    /// whether the count reached zero. For consumers with custom teardown
    /// ordering; everyone else wants [`Refcounted::release`].
    pub fn decrement_without_drop(&self) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::Release);
        assert!(previous > 0, "release on a dead refcounted object");
        if previous == 1 {
            // pair with the Release above before the caller destroys
            self.count.load(Ordering::Acquire);
            return true;
        }
        false
    }

    /// Current count; for assertions and diagnostics only.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl<T> Deref for Refcounted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize as Counter;

    struct DropTracker {
        drops: Arc<Counter>,
    }

    impl Drop for DropTracker {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_of_last_reference_drops_exactly_once() {
        let drops = Arc::new(Counter::new(0));
        let obj = Refcounted::new(DropTracker {
            drops: Arc::clone(&drops),
        });

        // SAFETY: obj is live with count 1
        unsafe {
            obj.as_ref().acquire();
            assert_eq!(obj.as_ref().count(), 2);
            Refcounted::release(obj);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            Refcounted::release(obj);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decrement_without_drop_reports_zero_and_leaves_the_value() {
        let obj = Refcounted::new(17u64);
        // SAFETY: obj is live
        let shared = unsafe { obj.as_ref() };
        shared.acquire();
        assert!(!shared.decrement_without_drop());
        assert!(shared.decrement_without_drop());
        // the value is still intact; the caller owns teardown now
        assert_eq!(**shared, 17);
        // SAFETY: allocated by Refcounted::new; count already zero
        drop(unsafe { Box::from_raw(obj.as_ptr()) });
    }

    #[test]
    #[should_panic(expected = "acquire on a dead refcounted object")]
    fn acquire_after_zero_panics() {
        let obj = Refcounted::new(0u8);
        // SAFETY: obj is live
        let shared = unsafe { obj.as_ref() };
        assert!(shared.decrement_without_drop());
        shared.acquire();
    }

    #[test]
    fn concurrent_acquire_release_loses_no_updates() {
        // T,N in {1,8} x {1,1000}
        for (threads, iterations) in [(1, 1), (1, 1000), (8, 1), (8, 1000)] {
            let obj = Refcounted::new(());
            // SAFETY: obj stays live: the creating reference is only
            // released after every thread joined
            let shared: &'static Refcounted<()> =
                unsafe { &*obj.as_ptr() };

            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    std::thread::spawn(move || {
                        for _ in 0..iterations {
                            shared.acquire();
                            // SAFETY: the acquire above keeps it live
                            unsafe {
                                Refcounted::release(NonNull::from(shared))
                            };
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("refcount thread panicked");
            }

            assert_eq!(
                shared.count(),
                1,
                "count must return to 1 after {threads}x{iterations}"
            );
            // SAFETY: last reference
            unsafe { Refcounted::release(obj) };
        }
    }

    #[test]
    fn refcounted_table_shared_across_threads() {
        use crate::intrinsics::{Intrinsic, IntrinsicsTable};

        let table = Refcounted::new(IntrinsicsTable::with_defaults());
        // SAFETY: released only after the threads joined
        let shared: &'static Refcounted<IntrinsicsTable> =
            unsafe { &*table.as_ptr() };

        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(move || {
                    shared.acquire();
                    let addr =
                        shared.address_of(Intrinsic::Identity as u16);
                    // SAFETY: our acquire keeps it live
                    unsafe { Refcounted::release(NonNull::from(shared)) };
                    addr
                })
            })
            .collect();
        let addrs: Vec<_> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.iter().all(|a| a.is_some() && *a == addrs[0]));

        // SAFETY: last reference
        unsafe { Refcounted::release(table) };
    }
}
