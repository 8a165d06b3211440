//! Fixed-capacity slot pool with an intrusive free list and canary checks.
//!
//! The pool owns `N` payloads of type `T` for its entire lifetime. Acquiring
//! and releasing only flips the `in_use` bit and re-threads the free list; no
//! payload is allocated or dropped in steady state. Every slot carries a
//! sentinel next to its payload, and a changed sentinel is reported as a
//! `Critical` [`ErrorCode::BufferOverflow`] through the pool's
//! [`ErrorHandler`].
//!
//! Two mutex domains exist: one for the free list and counters, one per slot
//! for its payload. The free-list mutex is never held while the recovery plan
//! runs.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, warn};

use crate::error::{BusError, Classify, ErrorCode, Severity};
use crate::recovery::{Disposition, ErrorHandler, FatalPolicy, RecoveryPlan};

/// Sentinel stored beside every payload.
pub const CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned by [`SlotPool::release`] and [`SlotPool::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The handle was not issued by this pool, or its index is out of range.
    #[error("slot handle {index} does not belong to this pool")]
    InvalidHandle { index: usize },

    /// The slot is not currently in use.
    #[error("slot {index} is not in use (double release)")]
    DoubleRelease { index: usize },

    /// The slot's payload is still locked by a live [`Slot`] guard.
    #[error("slot {index} is still held by its guard")]
    StillHeld { index: usize },

    /// The slot's canary no longer matches the sentinel.
    #[error("buffer overflow detected in slot {index}")]
    Corrupted { index: usize },
}

impl Classify for PoolError {
    fn code(&self) -> ErrorCode {
        match self {
            PoolError::InvalidHandle { .. } | PoolError::StillHeld { .. } => {
                ErrorCode::InvalidHandle
            }
            PoolError::DoubleRelease { .. } => ErrorCode::DoubleRelease,
            PoolError::Corrupted { .. } => ErrorCode::BufferOverflow,
        }
    }

    fn severity(&self) -> Severity {
        match self {
            PoolError::Corrupted { .. } => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

/// Detached reference to an acquired slot. Obtained from [`Slot::detach`] and
/// given back with [`SlotPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    pool: u64,
    index: usize,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy)]
struct Metadata {
    in_use: bool,
    id: usize,
    next: Option<usize>,
}

struct FreeList<const N: usize> {
    head: Option<usize>,
    used: usize,
    meta: [Metadata; N],
}

struct SlotCell<T> {
    payload: T,
    canary: u64,
}

type Deinit<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Point-in-time view of which slots are lent out and which are free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Indices marked in use, ascending.
    pub in_use: Vec<usize>,
    /// Indices in free-list order, starting at the head.
    pub free: Vec<usize>,
}

/// Thread-safe pool of `N` reusable `T` payloads.
pub struct SlotPool<T, const N: usize> {
    id: u64,
    free: Mutex<FreeList<N>>,
    slots: Box<[Mutex<SlotCell<T>>; N]>,
    deinit: Option<Deinit<T>>,
    handler: ErrorHandler,
}

impl<T: Default + Send, const N: usize> SlotPool<T, N> {
    /// Pool of default-constructed payloads without lifecycle hooks.
    pub fn new() -> Self {
        Self::with_hooks(|_| {}, |_| {})
    }

    /// Pool whose payloads are passed to `init` once at construction and to
    /// `deinit` once when the pool is dropped.
    pub fn with_hooks<I, D>(init: I, deinit: D) -> Self
    where
        I: Fn(&mut T),
        D: Fn(&mut T) + Send + Sync + 'static,
    {
        let slots = Box::new(std::array::from_fn(|_| {
            let mut payload = T::default();
            init(&mut payload);
            Mutex::new(SlotCell {
                payload,
                canary: CANARY,
            })
        }));

        let meta = std::array::from_fn(|i| Metadata {
            in_use: false,
            id: i,
            next: if i + 1 < N { Some(i + 1) } else { None },
        });

        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            free: Mutex::new(FreeList {
                head: if N > 0 { Some(0) } else { None },
                used: 0,
                meta,
            }),
            slots,
            deinit: Some(Box::new(deinit)),
            handler: ErrorHandler::new(Self::recovery_plan()),
        }
    }
}

impl<T: Send, const N: usize> SlotPool<T, N> {
    /// Override what happens to an unrecovered canary mismatch.
    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.handler = ErrorHandler::with_policy(Self::recovery_plan(), policy);
        self
    }

    fn recovery_plan() -> RecoveryPlan {
        RecoveryPlan::builder()
            .on(ErrorCode::BufferOverflow, || {
                warn!("buffer overflow detected in slot pool");
                false
            })
            .build()
    }

    /// Take a free slot, or `None` when every slot is lent out.
    ///
    /// The returned guard releases the slot when dropped.
    pub fn acquire(&self) -> Option<Slot<'_, T, N>> {
        let index = {
            let mut free = self.lock_free();
            let index = free.head?;
            let next = free.meta[index].next.take();
            free.meta[index].in_use = true;
            free.head = next;
            free.used += 1;
            index
        };

        Some(Slot {
            pool: self,
            index,
            cell: lock_cell(&self.slots[index]),
            armed: true,
        })
    }

    /// Give a detached slot back to the pool.
    ///
    /// Counters are left untouched when the handle is foreign, the slot is
    /// not in use, its guard is still alive, or the canary check fails
    /// without recovery.
    pub fn release(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let index = handle.index;
        if handle.pool != self.id || index >= N {
            return Err(PoolError::InvalidHandle { index });
        }
        if !self.lock_free().meta[index].in_use {
            return Err(PoolError::DoubleRelease { index });
        }

        {
            let mut cell = match self.slots[index].try_lock() {
                Ok(cell) => cell,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Err(PoolError::StillHeld { index }),
            };
            if cell.canary != CANARY {
                drop(cell);
                self.escalate(index)?;
                cell = lock_cell(&self.slots[index]);
                cell.canary = CANARY;
            }
        }

        self.push_free(index)
    }

    /// Number of slots currently in use.
    pub fn len(&self) -> usize {
        self.lock_free().used
    }

    /// True when no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.lock_free().used == 0
    }

    /// True when every slot is in use and [`acquire`](Self::acquire) would
    /// return `None`.
    pub fn is_full(&self) -> bool {
        self.lock_free().used == N
    }

    /// Number of slots that can still be acquired.
    pub fn available(&self) -> usize {
        N - self.lock_free().used
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Validate the canary of every slot, used or free.
    ///
    /// Slots whose payload is locked by a holder at this moment are skipped,
    /// their canary is checked on release instead.
    pub fn check_integrity(&self) -> Result<(), PoolError> {
        let mut first_failure = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let intact = match slot.try_lock() {
                Ok(cell) => cell.canary == CANARY,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().canary == CANARY,
                Err(TryLockError::WouldBlock) => continue,
            };
            if intact {
                continue;
            }
            match self.escalate(index) {
                Ok(()) => lock_cell(slot).canary = CANARY,
                Err(err) => {
                    first_failure.get_or_insert(err);
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Which slots are in use and which are reachable from the free list.
    pub fn snapshot(&self) -> PoolSnapshot {
        let free = self.lock_free();
        let in_use = free
            .meta
            .iter()
            .filter(|meta| meta.in_use)
            .map(|meta| meta.id)
            .collect();

        let mut chain = Vec::with_capacity(N - free.used);
        let mut cursor = free.head;
        while let Some(index) = cursor {
            // A cycle would be a bookkeeping bug; never walk more than N links.
            if chain.len() == N {
                break;
            }
            chain.push(index);
            cursor = free.meta[index].next;
        }

        PoolSnapshot {
            in_use,
            free: chain,
        }
    }

    /// Overwrite the canary of slot `index`. Blocks while the slot's payload
    /// is held by a [`Slot`] guard.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn corrupt_canary(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            lock_cell(slot).canary = !CANARY;
        }
    }

    fn escalate(&self, index: usize) -> Result<(), PoolError> {
        let err = PoolError::Corrupted { index };
        match self.handler.handle(&BusError::from_classified(&err)) {
            Disposition::Recovered => Ok(()),
            _ => Err(err),
        }
    }

    fn push_free(&self, index: usize) -> Result<(), PoolError> {
        let mut free = self.lock_free();
        if !free.meta[index].in_use {
            return Err(PoolError::DoubleRelease { index });
        }
        let head = free.head;
        let meta = &mut free.meta[index];
        meta.in_use = false;
        meta.next = head;
        free.head = Some(index);
        free.used -= 1;
        Ok(())
    }

    fn lock_free(&self) -> MutexGuard<'_, FreeList<N>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default + Send, const N: usize> Default for SlotPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for SlotPool<T, N> {
    fn drop(&mut self) {
        if let Some(deinit) = self.deinit.take() {
            for slot in self.slots.iter_mut() {
                let cell = slot.get_mut().unwrap_or_else(PoisonError::into_inner);
                deinit(&mut cell.payload);
            }
        }
    }
}

impl<T, const N: usize> fmt::Debug for SlotPool<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self
            .free
            .lock()
            .map(|free| free.used)
            .unwrap_or_else(|poisoned| poisoned.into_inner().used);
        f.debug_struct("SlotPool")
            .field("id", &self.id)
            .field("capacity", &N)
            .field("used", &used)
            .finish()
    }
}

fn lock_cell<T>(slot: &Mutex<SlotCell<T>>) -> MutexGuard<'_, SlotCell<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive access to one acquired payload. Dropping the guard releases the
/// slot back to its pool.
pub struct Slot<'a, T: Send, const N: usize> {
    pool: &'a SlotPool<T, N>,
    index: usize,
    cell: MutexGuard<'a, SlotCell<T>>,
    armed: bool,
}

impl<T: Send, const N: usize> Slot<'_, T, N> {
    pub fn index(&self) -> usize {
        self.index
    }

    fn handle(&self) -> SlotHandle {
        SlotHandle {
            pool: self.pool.id,
            index: self.index,
        }
    }

    /// Stop tracking the slot without releasing it. The caller becomes
    /// responsible for passing the handle to [`SlotPool::release`].
    pub fn detach(mut self) -> SlotHandle {
        self.armed = false;
        self.handle()
    }
}

impl<T: Send, const N: usize> Deref for Slot<'_, T, N> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.cell.payload
    }
}

impl<T: Send, const N: usize> DerefMut for Slot<'_, T, N> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.cell.payload
    }
}

impl<T: Send, const N: usize> Drop for Slot<'_, T, N> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The payload lock is still held here, so the canary is checked
        // in place instead of through `SlotPool::release`.
        if self.cell.canary != CANARY {
            if let Err(err) = self.pool.escalate(self.index) {
                warn!(index = self.index, error = %err, "quarantining corrupted slot");
                return;
            }
            self.cell.canary = CANARY;
        }
        if let Err(err) = self.pool.push_free(self.index) {
            debug!(index = self.index, error = %err, "slot already released");
        }
    }
}

impl<T: Send + fmt::Debug, const N: usize> fmt::Debug for Slot<'_, T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("payload", &self.cell.payload)
            .finish()
    }
}
