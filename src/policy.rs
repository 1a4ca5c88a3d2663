//! Canonical policy aliases for the list implementations.
//!
//! The four concrete list flavors behind the shared
//! [`crate::list::ConcurrentList`] contract:
//!
//! - [`crate::list::GlobalLockList`]
//! - [`crate::list::PerNodeLockList`]
//! - [`LockFreeRcList`]: lock-free with per-node reference counting
//! - [`LockFreeRcuList`]: lock-free with epoch-deferred reclamation

use crate::list::LockFreeList;
use crate::reclaim::{RcuPolicy, RefCountPolicy};

/// Lock-free list that frees nodes by per-node reference counting.
pub type LockFreeRcList<T> = LockFreeList<T, RefCountPolicy>;

/// Lock-free list that defers node destruction to the epoch reclaimer;
/// per-node counts and cell locks compile away.
pub type LockFreeRcuList<T> = LockFreeList<T, RcuPolicy>;
