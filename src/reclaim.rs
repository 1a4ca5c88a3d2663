//! Reclamation policies for the lock-free list.
//!
//! A policy bundles the three knobs the list threads through its nodes:
//! the per-node count, the lock each pointer cell carries, and the scope
//! guard wrapped around every list operation. [`RefCountPolicy`] frees a
//! node when its last reference drops; [`RcuPolicy`] strips the counts and
//! cell locks entirely and defers destruction to the epoch reclaimer.

use crate::rcu;
use crate::refptr::{AtomicRefCount, NopRefCount, RefCount};
use crate::sync::{NopLock, RawLock, RawSpinLock};

/// Per-operation reclamation scope.
pub trait ReclaimGuard {
    /// Enter a scope for one list operation (or one iterator lifetime).
    fn enter() -> Self;

    /// Hand a logically deleted node to the policy.
    ///
    /// # Safety
    ///
    /// `node` must point to a live heap allocation from `Box::into_raw`
    /// whose logical deletion this caller performed (each node is released
    /// at most once), `self` must still be in scope, and `N` must be sound
    /// to drop on another thread at an arbitrary later time (`Send` and no
    /// borrowed data) since the policy may defer destruction.
    unsafe fn release<N>(&self, node: *mut N);
}

/// Scope used by [`RefCountPolicy`]: releasing is a no-op because the node
/// dies with its last reference.
pub struct NopGuard;

impl ReclaimGuard for NopGuard {
    #[inline]
    fn enter() -> Self {
        NopGuard
    }

    #[inline]
    unsafe fn release<N>(&self, _node: *mut N) {}
}

/// Scope used by [`RcuPolicy`]: an RCU critical section for the duration,
/// with releases deferred past the grace period.
pub struct RcuScope {
    _guard: rcu::RcuGuard,
}

impl ReclaimGuard for RcuScope {
    #[inline]
    fn enter() -> Self {
        Self {
            _guard: rcu::RcuGuard::new(),
        }
    }

    #[inline]
    unsafe fn release<N>(&self, node: *mut N) {
        // Safety: forwarded contract; the scope keeps us inside a critical
        // section.
        unsafe { rcu::defer_drop(node) };
    }
}

/// A reclamation strategy for the lock-free list.
pub trait ReclaimPolicy {
    /// Per-node reference count.
    type Count: RefCount;
    /// Lock guarding each pointer cell's load/increment pairing.
    type Lock: RawLock;
    /// Scope guard entered around every list operation.
    type Guard: ReclaimGuard;
}

/// Free nodes by per-node atomic reference counting.
pub struct RefCountPolicy;

impl ReclaimPolicy for RefCountPolicy {
    type Count = AtomicRefCount;
    type Lock = RawSpinLock;
    type Guard = NopGuard;
}

/// Free nodes via the epoch-based reclaimer; counts and cell locks
/// compile away.
pub struct RcuPolicy;

impl ReclaimPolicy for RcuPolicy {
    type Count = NopRefCount;
    type Lock = NopLock;
    type Guard = RcuScope;
}
