//! Epoch-based safe memory reclamation.
//!
//! A single global epoch advances monotonically. Readers declare critical
//! sections: the outermost [`region_begin`] acquires the calling thread's
//! bucket spinlock (a presence signal) and samples the current epoch;
//! deferred destructions enqueue into the bucket queue indexed by the
//! sampled epoch's parity. A detached reclaimer thread periodically bumps
//! the epoch and then acquires-and-releases every bucket lock; the acquire
//! is a barrier, so once a bucket lock has been cycled, every reader that
//! sampled the previous epoch has left its critical section and the queue
//! at the previous parity can be drained safely.
//!
//! The reclaimer is started lazily on first use and never joined; its
//! static state (and anything still queued at process exit) is deliberately
//! leaked.

use std::cell::{Cell, UnsafeCell};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::OxilistConfig;
use crate::constants::{DEFAULT_EPOCH_INTERVAL_MS, RCU_BUCKETS};
use crate::sync::{RawLock, RawSpinLock};
use crate::utility::{mix64, CachePadded};

/// Deleter applied to a deferred pointer once its grace period has passed.
pub type DeleterFn = unsafe fn(*mut ());

struct DeleteEntry {
    ptr: *mut (),
    deleter: DeleterFn,
}

// Safety: a deferred entry owns its pointee outright; ownership transfers
// to the reclaimer thread.
unsafe impl Send for DeleteEntry {}

/// Per-thread-bucket synchronization state.
struct SyncBucket {
    /// Deferred-destruction queues, indexed by epoch parity.
    /// Guarded by `critical`.
    queues: [UnsafeCell<Vec<DeleteEntry>>; 2],
    /// Held by a reader for the duration of its outermost critical section.
    critical: RawSpinLock,
}

// Safety: the queues are only touched while `critical` is held, either by
// the owning reader inside its critical section or by the reclaimer while
// sweeping.
unsafe impl Sync for SyncBucket {}

impl SyncBucket {
    fn new() -> Self {
        Self {
            queues: [UnsafeCell::new(Vec::new()), UnsafeCell::new(Vec::new())],
            critical: RawSpinLock::new(),
        }
    }
}

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(0);
static GC_STARTED: AtomicBool = AtomicBool::new(false);
static INIT_LOCK: RawSpinLock = RawSpinLock::new();
static SYNCS: OnceLock<Box<[CachePadded<SyncBucket>]>> = OnceLock::new();

fn syncs() -> &'static [CachePadded<SyncBucket>] {
    SYNCS.get_or_init(|| {
        (0..RCU_BUCKETS)
            .map(|_| CachePadded::new(SyncBucket::new()))
            .collect()
    })
}

thread_local! {
    /// Critical-section nesting depth; only the outermost pair touches the
    /// bucket lock.
    static CRIT_DEPTH: Cell<u32> = const { Cell::new(0) };
    /// Epoch sampled at the outermost `region_begin`.
    static SAMPLED_EPOCH: Cell<u64> = const { Cell::new(0) };
    /// Cached bucket index for this thread.
    static BUCKET: Cell<usize> = const { Cell::new(usize::MAX) };
}

fn bucket_index() -> usize {
    BUCKET.with(|cached| {
        let index = cached.get();
        if index != usize::MAX {
            return index;
        }
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        let index = (mix64(hasher.finish()) % RCU_BUCKETS as u64) as usize;
        cached.set(index);
        index
    })
}

#[inline]
fn sync_for_thread() -> &'static SyncBucket {
    &syncs()[bucket_index()]
}

/// Enter a critical section. Nests; the epoch is sampled and the bucket
/// lock acquired only at the outermost call.
pub fn region_begin() {
    CRIT_DEPTH.with(|depth| {
        let d = depth.get();
        if d == 0 {
            sync_for_thread().critical.lock();
            SAMPLED_EPOCH.with(|epoch| epoch.set(GLOBAL_EPOCH.load(Ordering::Acquire)));
        }
        depth.set(d + 1);
    });
}

/// Leave a critical section; the bucket lock is released only when the
/// outermost region ends.
///
/// # Panics
///
/// Debug-asserts when called outside a critical section.
pub fn region_end() {
    CRIT_DEPTH.with(|depth| {
        let d = depth.get();
        debug_assert!(d > 0, "region_end outside a critical section");
        depth.set(d - 1);
        if d == 1 {
            sync_for_thread().critical.unlock();
        }
    });
}

/// Defer `deleter(p)` until every reader active at the sampled epoch has
/// finished.
///
/// # Safety
///
/// `p` must be exclusively owned by the caller (it is destroyed exactly
/// once, by `deleter`), and the call must be made inside a critical
/// section.
pub unsafe fn free_with_fn(p: *mut (), deleter: DeleterFn) {
    init();
    debug_assert!(
        CRIT_DEPTH.with(|depth| depth.get()) > 0,
        "free_with_fn outside a critical section"
    );
    let bucket = sync_for_thread();
    let parity = SAMPLED_EPOCH.with(|epoch| epoch.get()) as usize % 2;
    // Safety: this thread holds the bucket's critical lock for the whole
    // region, so the queue is exclusively ours right now.
    unsafe {
        (*bucket.queues[parity].get()).push(DeleteEntry { ptr: p, deleter });
    }
}

/// Defer dropping a heap allocation obtained from `Box::into_raw`.
///
/// # Safety
///
/// Same contract as [`free_with_fn`]; `p` must have come from
/// `Box::into_raw`, must not be reachable by any thread past the current
/// grace period, and `T` must be sound to drop on the reclaimer thread
/// (`Send`, no borrowed data).
pub unsafe fn defer_drop<T>(p: *mut T) {
    unsafe { free_with_fn(p as *mut (), deleter::<T>) }
}

unsafe fn deleter<T>(p: *mut ()) {
    drop(unsafe { Box::from_raw(p as *mut T) });
}

/// RAII critical-section scope.
///
/// The region is thread-local state, so the guard is `!Send`.
pub struct RcuGuard {
    _not_send: PhantomData<*mut ()>,
}

impl RcuGuard {
    /// Enter a critical section for the lifetime of the guard.
    pub fn new() -> Self {
        region_begin();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for RcuGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RcuGuard {
    fn drop(&mut self) {
        region_end();
    }
}

/// Start the reclaimer exactly once (double-checked locking on a sticky
/// flag).
fn init() {
    if GC_STARTED.load(Ordering::Acquire) {
        return;
    }
    INIT_LOCK.lock();
    if !GC_STARTED.load(Ordering::Acquire) {
        let interval = match OxilistConfig::load_from_env() {
            Ok(config) => config.epoch_interval(),
            Err(err) => {
                tracing::warn!(error = %err, "invalid rcu config, using defaults");
                Duration::from_millis(DEFAULT_EPOCH_INTERVAL_MS)
            }
        };
        thread::Builder::new()
            .name("oxilist-rcu-gc".into())
            .spawn(move || gc_loop(interval))
            .expect("failed to spawn rcu reclaimer thread");
        GC_STARTED.store(true, Ordering::Release);
    }
    INIT_LOCK.unlock();
}

fn gc_loop(interval: Duration) {
    tracing::debug!(
        interval_ms = interval.as_millis() as u64,
        buckets = RCU_BUCKETS,
        "rcu reclaimer started"
    );
    let mut last_cycle = Instant::now();
    loop {
        let elapsed = last_cycle.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
        last_cycle = Instant::now();

        // Advance the epoch: readers entering from here on sample the new
        // value and enqueue at the other parity.
        let cleaning_epoch = GLOBAL_EPOCH.load(Ordering::Acquire);
        GLOBAL_EPOCH.store(cleaning_epoch + 1, Ordering::SeqCst);

        let parity = cleaning_epoch as usize % 2;
        let mut elems: Vec<DeleteEntry> = Vec::new();
        for bucket in syncs() {
            // The acquire is the barrier: any reader that sampled
            // `cleaning_epoch` in this bucket has left its outermost
            // region once we hold the lock.
            bucket.critical.lock();
            // Safety: queue access under the bucket lock.
            let drained = unsafe { std::mem::take(&mut *bucket.queues[parity].get()) };
            bucket.critical.unlock();
            elems.extend(drained);
        }

        if !elems.is_empty() {
            tracing::trace!(
                count = elems.len(),
                epoch = cleaning_epoch,
                "reclaiming deferred objects"
            );
        }
        for entry in elems {
            // Safety: the grace period for `entry` has passed; ownership
            // was transferred to us at enqueue time.
            unsafe { (entry.deleter)(entry.ptr) };
        }
    }
}
