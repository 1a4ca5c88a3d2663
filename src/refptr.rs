//! Atomically marked, reference-counted shared pointers.
//!
//! [`AtomicRefPtr`] is a `shared_ptr`-like cell with two extra guarantees
//! the standard library cannot give:
//!
//! - the stored value is a single opaque word packing `(pointer, mark)`,
//!   where the mark is a one-way flag set via CAS in the pointer's low bit
//!   (referents are heap allocations, so the bit is free);
//! - copy-assignment is atomic even when the *source* cell is being
//!   mutated concurrently.
//!
//! The second point is why each cell carries a lock: it is not possible to
//! load a pointer from the source and increment its reference count as one
//! atomic step without one. Assignments lock both cells in address order;
//! marking needs no lock (it never changes the pointer), which is also why
//! assignment CASes retry when they lose to a racing marker.
//!
//! Under the RCU reclamation policy the count and the lock are both no-ops
//! ([`NopRefCount`], [`crate::sync::NopLock`]): the grace period supplies
//! the load/increment atomicity instead.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::sync::{lock_pair, pause, RawLock, RawSpinLock};

/// An intrusive reference count.
///
/// Construction contributes no reference; the first owning cell or handle
/// calls [`RefCount::inc`].
pub trait RefCount: Default + Send + Sync {
    /// Add one reference.
    fn inc(&self);
    /// Drop one reference; returns true if this was the last one.
    fn dec(&self) -> bool;
}

/// Atomic 32-bit reference count.
#[derive(Default)]
pub struct AtomicRefCount(AtomicU32);

impl RefCount for AtomicRefCount {
    #[inline]
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn dec(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reference count underflow");
        prev == 1
    }
}

/// A count that never reaches zero; the referent is owned by a
/// reclamation policy instead.
#[derive(Default)]
pub struct NopRefCount;

impl RefCount for NopRefCount {
    #[inline]
    fn inc(&self) {}

    #[inline]
    fn dec(&self) -> bool {
        false
    }
}

/// Implemented by types held in an [`AtomicRefPtr`]: they embed their own
/// count.
pub trait Counted {
    /// Add one reference.
    fn retain(&self);
    /// Drop one reference; returns true if this was the last one.
    fn release(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Opaque word: pointer | mark, with the mark in the low bit.
// ---------------------------------------------------------------------------

const MARK_BIT: usize = 0x1;

#[inline]
const fn word_is_marked(word: usize) -> bool {
    word & MARK_BIT != 0
}

#[inline]
const fn word_with_mark(word: usize) -> usize {
    word | MARK_BIT
}

#[inline]
fn word_ptr<N>(word: usize) -> *mut N {
    (word & !MARK_BIT) as *mut N
}

/// Build a word from `ptr` carrying the mark bit of `mark_from`.
#[inline]
fn word_compose<N>(ptr: *mut N, mark_from: usize) -> usize {
    ptr as usize | (mark_from & MARK_BIT)
}

/// An atomic, markable, reference-counted pointer cell.
///
/// The mark is advisory metadata for the owner (the lock-free list uses it
/// for Harris-style logical deletion): it is set exactly once, is never
/// cleared, never transfers across assignments, and does not prevent the
/// pointer from being swapped afterwards via [`AtomicRefPtr::compare_exchange`].
pub struct AtomicRefPtr<N: Counted, L: RawLock = RawSpinLock> {
    word: AtomicUsize,
    lock: L,
    _owns: PhantomData<*mut N>,
}

// Safety: all access to the shared word is atomic, guarded by `lock` where
// a load/increment pairing is required; the referent itself is shared.
unsafe impl<N: Counted + Send + Sync, L: RawLock> Send for AtomicRefPtr<N, L> {}
unsafe impl<N: Counted + Send + Sync, L: RawLock> Sync for AtomicRefPtr<N, L> {}

impl<N: Counted, L: RawLock> AtomicRefPtr<N, L> {
    /// A null, unmarked cell.
    pub fn null() -> Self {
        Self {
            word: AtomicUsize::new(0),
            lock: L::default(),
            _owns: PhantomData,
        }
    }

    /// Take ownership of a fresh allocation; the cell contributes one
    /// reference. The result is unmarked.
    pub fn new(node: Box<N>) -> Self {
        let raw = Box::into_raw(node);
        debug_assert_eq!(
            raw as usize & MARK_BIT,
            0,
            "allocation must leave the low bit free"
        );
        // Safety: `raw` came from `Box::into_raw` just above.
        unsafe { (*raw).retain() };
        Self {
            word: AtomicUsize::new(raw as usize),
            lock: L::default(),
            _owns: PhantomData,
        }
    }

    #[inline]
    fn raw_word(&self) -> usize {
        self.word.load(Ordering::Acquire)
    }

    /// The current pointer, ignoring the mark.
    #[inline]
    pub fn get(&self) -> *mut N {
        word_ptr(self.raw_word())
    }

    /// Whether the current pointer is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }

    /// Read the mark bit.
    #[inline]
    pub fn get_mark(&self) -> bool {
        word_is_marked(self.raw_word())
    }

    /// Whether two cells currently hold the same pointer (marks ignored).
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }

    /// Borrow the referent.
    ///
    /// # Safety
    ///
    /// The referent must be pinned for the borrow: either this cell is a
    /// local handle owned by the calling thread (its contribution keeps the
    /// count up), or the caller is inside a reclamation grace period.
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&N> {
        unsafe { self.get().as_ref() }
    }

    /// Set the mark, keeping the pointer. Returns true iff this call
    /// performed the transition. Never frees anything.
    pub fn mark(&self) -> bool {
        loop {
            let word = self.raw_word();
            if word_is_marked(word) {
                return false;
            }
            if self
                .word
                .compare_exchange(
                    word,
                    word_with_mark(word),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                debug_assert!(self.get_mark());
                return true;
            }
            pause();
        }
    }

    /// Atomically publish `other`'s current pointer into this cell,
    /// preserving this cell's existing mark.
    ///
    /// `other` may be mutated concurrently: both cells are locked (in
    /// address order) so that the pointer load and the count increment
    /// happen as one step. A racing marker on this cell forces a retry.
    /// Marks never transfer; pointer self-assignment is a no-op.
    pub fn clone_from_shared(&self, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }
        loop {
            let guard = lock_pair(&self.lock, &other.lock);
            let this_word = self.word.load(Ordering::Acquire);
            let this_ptr = word_ptr::<N>(this_word);
            let that_ptr = other.get();
            if this_ptr == that_ptr {
                return;
            }
            let new_word = word_compose(that_ptr, this_word);
            if self
                .word
                .compare_exchange(this_word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Lost to a concurrent marker; re-read under fresh locks.
                drop(guard);
                pause();
                continue;
            }
            // Safety: `other`'s lock is held, so `that_ptr` cannot lose its
            // last reference between the load above and this increment.
            if let Some(node) = unsafe { that_ptr.as_ref() } {
                node.retain();
            }
            drop(guard);
            // Safety: the contribution released here belonged to this cell.
            unsafe { Self::drop_contribution(this_ptr) };
            return;
        }
    }

    /// Atomically replace this cell's word with `desired`'s if it currently
    /// equals `expected`'s. On success the mark bits are overwritten from
    /// `desired` and reference counts are adjusted (the self-exchange case
    /// included). Returns whether the exchange happened.
    ///
    /// `desired` is taken by value: ownership makes it stable, so only this
    /// cell and `expected` need locking.
    pub fn compare_exchange(&self, expected: &Self, desired: Self) -> bool {
        let released;
        {
            let _guard = lock_pair(&self.lock, &expected.lock);
            let expected_word = expected.word.load(Ordering::Acquire);
            let desired_word = desired.word.load(Ordering::Acquire);
            if self
                .word
                .compare_exchange(
                    expected_word,
                    desired_word,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return false;
            }
            let expected_ptr = word_ptr::<N>(expected_word);
            let desired_ptr = word_ptr::<N>(desired_word);
            if expected_ptr == desired_ptr {
                // Self-exchange: the cell's contribution carries over.
                return true;
            }
            // Safety: `desired` is owned by us and keeps its referent alive.
            if let Some(node) = unsafe { desired_ptr.as_ref() } {
                node.retain();
            }
            released = expected_ptr;
        }
        // Safety: the contribution released here belonged to this cell.
        unsafe { Self::drop_contribution(released) };
        true
    }

    /// Release one contribution on `ptr`, deleting the referent when it was
    /// the last.
    ///
    /// # Safety
    ///
    /// The caller must own the contribution being released, and `ptr` must
    /// have come from `Box::into_raw` (or be null).
    unsafe fn drop_contribution(ptr: *mut N) {
        if let Some(node) = unsafe { ptr.as_ref() } {
            if node.release() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl<N: Counted, L: RawLock> Clone for AtomicRefPtr<N, L> {
    /// Copies the pointer, not the mark: the new cell starts unmarked.
    fn clone(&self) -> Self {
        let fresh = Self::null();
        fresh.clone_from_shared(self);
        fresh
    }
}

impl<N: Counted, L: RawLock> Drop for AtomicRefPtr<N, L> {
    fn drop(&mut self) {
        // Safety: the cell's own contribution.
        unsafe { Self::drop_contribution(self.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    struct TestNode {
        count: AtomicRefCount,
        value: u64,
        drops: Arc<AtomicUsize>,
    }

    impl TestNode {
        fn boxed(value: u64, drops: &Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                count: AtomicRefCount::default(),
                value,
                drops: drops.clone(),
            })
        }
    }

    impl Counted for TestNode {
        fn retain(&self) {
            self.count.inc();
        }

        fn release(&self) -> bool {
            self.count.dec()
        }
    }

    impl Drop for TestNode {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestPtr = AtomicRefPtr<TestNode, RawSpinLock>;

    #[test]
    fn test_null_cell() {
        let cell = TestPtr::null();
        assert!(cell.is_null());
        assert!(!cell.get_mark());
        assert!(cell.get().is_null());
    }

    #[test]
    fn test_new_and_drop_deletes_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let cell = TestPtr::new(TestNode::boxed(7, &drops));
            assert!(!cell.is_null());
            assert_eq!(unsafe { cell.as_ref() }.unwrap().value, 7);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_shares_ownership() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let cell = TestPtr::new(TestNode::boxed(1, &drops));
            {
                let copy = cell.clone();
                assert!(copy.ptr_eq(&cell));
                assert_eq!(drops.load(Ordering::SeqCst), 0);
            }
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_is_one_shot() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = TestPtr::new(TestNode::boxed(1, &drops));
        assert!(!cell.get_mark());
        assert!(cell.mark());
        assert!(cell.get_mark());
        assert!(!cell.mark());
        // Marking never changes the pointer and never frees.
        assert!(!cell.is_null());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mark_on_null() {
        let cell = TestPtr::null();
        assert!(cell.mark());
        assert!(cell.get_mark());
        assert!(cell.is_null());
        assert!(!cell.mark());
    }

    #[test]
    fn test_assignment_preserves_target_mark() {
        let drops = Arc::new(AtomicUsize::new(0));
        let target = TestPtr::new(TestNode::boxed(1, &drops));
        let source = TestPtr::new(TestNode::boxed(2, &drops));
        source.mark();
        target.clone_from_shared(&source);

        // Pointer moved over; the source's mark did not come with it.
        assert!(target.ptr_eq(&source));
        assert!(!target.get_mark());
        // The old referent lost its only contribution.
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let marked_target = TestPtr::new(TestNode::boxed(3, &drops));
        marked_target.mark();
        marked_target.clone_from_shared(&source);
        // An existing mark on the target survives reassignment.
        assert!(marked_target.get_mark());
        assert!(marked_target.ptr_eq(&source));
    }

    #[test]
    fn test_compare_exchange() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = TestPtr::new(TestNode::boxed(1, &drops));
        let original = cell.clone();
        let replacement = TestPtr::new(TestNode::boxed(2, &drops));

        // Wrong expectation fails and changes nothing.
        assert!(!cell.compare_exchange(&TestPtr::null(), replacement.clone()));
        assert!(cell.ptr_eq(&original));

        // Matching expectation swaps and rebalances the counts.
        assert!(cell.compare_exchange(&original, replacement.clone()));
        assert!(cell.ptr_eq(&replacement));

        drop(original);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(cell);
        drop(replacement);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_compare_exchange_self() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = TestPtr::new(TestNode::boxed(1, &drops));
        let same = cell.clone();
        assert!(cell.compare_exchange(&same, same.clone()));
        assert!(cell.ptr_eq(&same));
        drop(same);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_mark_single_winner() {
        for _ in 0..64 {
            let drops = Arc::new(AtomicUsize::new(0));
            let cell = Arc::new(TestPtr::new(TestNode::boxed(1, &drops)));
            let winners = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();
            for _ in 0..4 {
                let cell = cell.clone();
                let winners = winners.clone();
                handles.push(thread::spawn(move || {
                    if cell.mark() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert!(cell.get_mark());
        }
    }

    #[test]
    fn test_concurrent_assign_balances_counts() {
        let drops = Arc::new(AtomicUsize::new(0));
        let created = 32;
        {
            let source = Arc::new(TestPtr::new(TestNode::boxed(0, &drops)));
            let mut handles = Vec::new();
            for i in 0..4 {
                let source = source.clone();
                let drops = drops.clone();
                handles.push(thread::spawn(move || {
                    for j in 0..8 {
                        if i % 2 == 0 {
                            // Writers keep swapping fresh nodes in.
                            let fresh = TestPtr::new(TestNode::boxed(j, &drops));
                            source.clone_from_shared(&fresh);
                        } else {
                            // Readers pull shared snapshots out.
                            let local = TestPtr::null();
                            local.clone_from_shared(&source);
                        }
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }
        }
        // Every node constructed (1 initial + 16 fresh) died exactly once.
        assert_eq!(drops.load(Ordering::SeqCst), created / 2 + 1);
    }
}
