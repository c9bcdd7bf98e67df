//! Kernel concurrency primitives (`conc`).
//!
//! This crate provides the blocking primitives the network stack (and other
//! subsystems) suspend on: a [`WaitQueue`] (condition-variable equivalent)
//! and a counting [`Semaphore`] built on top of it.
//!
//! # Scheduler Integration
//!
//! The crate does not depend on the scheduler directly.  The kernel registers
//! a [`SchedHooks`] implementation once during initialisation; the hooks own
//! waiter tracking, task blocking and the monotonic clock.  Without hooks
//! (early boot, host unit tests that don't need blocking) every wait degrades
//! to a non-blocking poll.
//!
//! # Interrupt Safety
//!
//! The notify path takes **no lock**: it is a single atomic increment plus a
//! hook call.  Producers running in interrupt context use the `_irq` notify
//! variants, which map to the hooks' deferred-wake entry point; the hooks
//! implementation must not reschedule inline from an interrupt handler.
//! The semaphore's permit counter is likewise manipulated with lock-free
//! compare-and-swap, so no release path can deadlock against a lock held by
//! the interrupted task.

#![no_std]

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// ============================================================================
// Wait Outcome
// ============================================================================

/// Result of a blocking wait operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A notification arrived (the waiter was explicitly woken).
    Woken,
    /// The timeout expired before a notification arrived.
    TimedOut,
    /// The queue was closed while waiting.
    Closed,
    /// No task context is available (called before hooks are registered).
    NoTask,
}

// ============================================================================
// Scheduler Hooks
// ============================================================================

/// Scheduler integration for blocking waits.
///
/// The kernel registers an implementation at initialisation time.  The
/// implementation owns waiter bookkeeping: it blocks the current task until
/// [`WaitQueue::notify_one`] signals the queue, a timeout expires, or the
/// queue is closed.
///
/// # Contract
///
/// - `wait` must consume a pending wake signal (via
///   [`WaitQueue::take_wake_signal`]) before reporting `Woken`.
/// - `wake_one` wakes at most one blocked task; it is a no-op when none is
///   blocked (the signal is already recorded in the queue).
/// - `wake_one_irq` is called from interrupt context.  It must only *mark*
///   the task runnable (a deferred-wake hint) and must not reschedule or
///   take a lock that task context holds while calling into this crate.
/// - `now_ms` is a monotonic millisecond clock.
pub trait SchedHooks: Send + Sync {
    /// Block the current task until woken, timed out, or the queue closes.
    ///
    /// `timeout_ms`: `None` blocks indefinitely, `Some(0)` is a non-blocking
    /// poll, `Some(n)` blocks for at most `n` milliseconds.
    fn wait(&self, queue: &WaitQueue, timeout_ms: Option<u64>) -> WaitOutcome;

    /// Wake one task blocked on `queue` (FIFO), if any.
    fn wake_one(&self, queue: &WaitQueue);

    /// Deferred-wake variant safe to call from interrupt context.
    fn wake_one_irq(&self, queue: &WaitQueue);

    /// Monotonic milliseconds since boot.
    fn now_ms(&self) -> u64;
}

/// Static storage for the registered hooks.
static SCHED_HOOKS: spin::Once<&'static dyn SchedHooks> = spin::Once::new();

/// Register the kernel scheduler hooks.
///
/// Should be called once during kernel initialisation.  Multiple calls are
/// safe; only the first registration takes effect.
pub fn register_sched_hooks(hooks: &'static dyn SchedHooks) {
    SCHED_HOOKS.call_once(|| hooks);
}

#[inline]
fn sched_hooks() -> Option<&'static dyn SchedHooks> {
    SCHED_HOOKS.get().copied()
}

/// Monotonic milliseconds since boot, `0` before hooks are registered.
#[inline]
pub fn now_ms() -> u64 {
    sched_hooks().map_or(0, |h| h.now_ms())
}

// ============================================================================
// WaitQueue
// ============================================================================

/// A wait queue: the condition-variable equivalent the socket layer blocks on.
///
/// The queue itself holds only two atomics, a closed flag and a pending
/// wake-signal counter.  Waiter tracking lives in the [`SchedHooks`]
/// implementation, which has access to the task table.
///
/// # Protocol
///
/// Producers push work onto their own queue *before* notifying; consumers
/// re-check that queue on every wakeup.  A notification that races a
/// waiter's registration is recorded in the signal counter and consumed by
/// the next wait, which closes the classic lost-wakeup window without
/// requiring the producer to hold any lock.
pub struct WaitQueue {
    /// Flag indicating the queue is permanently closed.
    closed: AtomicBool,
    /// Pending wake signals (incremented on notify, consumed on wait).
    wake_signals: AtomicU64,
}

impl WaitQueue {
    /// Create a new wait queue.
    pub const fn new() -> Self {
        WaitQueue {
            closed: AtomicBool::new(false),
            wake_signals: AtomicU64::new(0),
        }
    }

    /// Consume one pending wake signal, if any.
    ///
    /// Exposed for [`SchedHooks`] implementations, which poll or block on
    /// this while a task is parked.
    pub fn take_wake_signal(&self) -> bool {
        self.wake_signals
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            })
            .is_ok()
    }

    /// Wait with an optional timeout.
    ///
    /// `None` blocks indefinitely, `Some(0)` polls, `Some(n)` blocks for at
    /// most `n` milliseconds.
    pub fn wait_with_timeout(&self, timeout_ms: Option<u64>) -> WaitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return WaitOutcome::Closed;
        }

        // Consume a wake signal that arrived before we registered, so a
        // producer that pushed and notified just ahead of us is not lost.
        if self.take_wake_signal() {
            return WaitOutcome::Woken;
        }

        if timeout_ms == Some(0) {
            return WaitOutcome::TimedOut;
        }

        match sched_hooks() {
            Some(hooks) => hooks.wait(self, timeout_ms),
            // No scheduler yet: degrade to a non-blocking poll.
            None => WaitOutcome::NoTask,
        }
    }

    /// Block until a notification arrives.
    pub fn wait(&self) {
        loop {
            match self.wait_with_timeout(None) {
                WaitOutcome::Woken | WaitOutcome::Closed => return,
                // Degraded mode: spin-poll until a signal shows up.
                WaitOutcome::TimedOut | WaitOutcome::NoTask => core::hint::spin_loop(),
            }
        }
    }

    /// Block for at most `ms` milliseconds.
    ///
    /// Returns `true` if a notification arrived, `false` on timeout or close.
    pub fn wait_for(&self, ms: u64) -> bool {
        self.wait_with_timeout(Some(ms)) == WaitOutcome::Woken
    }

    /// Signal one waiter from task context.
    ///
    /// Wakes the first blocked waiter (FIFO).  If none is blocked the signal
    /// is recorded and consumed by the next wait.
    pub fn notify_one(&self) {
        self.wake_signals.fetch_add(1, Ordering::Release);
        if let Some(hooks) = sched_hooks() {
            hooks.wake_one(self);
        }
    }

    /// Signal one waiter from interrupt context.
    ///
    /// Identical to [`notify_one`](Self::notify_one) except the hooks receive
    /// the deferred-wake hint and must not reschedule inline.
    pub fn notify_one_irq(&self) {
        self.wake_signals.fetch_add(1, Ordering::Release);
        if let Some(hooks) = sched_hooks() {
            hooks.wake_one_irq(self);
        }
    }

    /// Close the queue; all current and future waits return
    /// [`WaitOutcome::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Check whether the queue is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Semaphore
// ============================================================================

/// A counting semaphore.
///
/// The permit counter is lock-free (CAS on an atomic), and blocking is
/// delegated to an internal [`WaitQueue`], so every release path, including
/// [`irq_release`](Self::irq_release), is safe from interrupt context.
///
/// # Conservation
///
/// `release(n)` always adds `n` permits; each woken waiter consumes one on
/// its way out of [`acquire`](Self::acquire).  The combined "waiters woken +
/// counter increase" observed by the system therefore equals `n`.
pub struct Semaphore {
    /// Available permits.
    permits: AtomicUsize,
    /// Tasks blocked waiting for a permit.
    queue: WaitQueue,
}

impl Semaphore {
    /// Create a semaphore with `permits` initial permits.
    pub const fn new(permits: usize) -> Self {
        Semaphore {
            permits: AtomicUsize::new(permits),
            queue: WaitQueue::new(),
        }
    }

    /// Current number of available permits.
    pub fn permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    /// Take one permit without blocking.
    ///
    /// Returns `true` if a permit was acquired.
    pub fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            })
            .is_ok()
    }

    /// Take one permit, blocking until one is available.
    pub fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            match self.queue.wait_with_timeout(None) {
                WaitOutcome::Closed => return,
                _ => continue,
            }
        }
    }

    /// Take one permit, blocking for at most `ms` milliseconds.
    ///
    /// Returns `true` if a permit was acquired.
    pub fn acquire_for(&self, ms: u64) -> bool {
        let start = now_ms();
        loop {
            if self.try_acquire() {
                return true;
            }
            let waited = now_ms().saturating_sub(start);
            if waited >= ms {
                return false;
            }
            match self.queue.wait_with_timeout(Some(ms - waited)) {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut | WaitOutcome::Closed => {
                    // One last chance: a release may have raced the timeout.
                    return self.try_acquire();
                }
                WaitOutcome::NoTask => return self.try_acquire(),
            }
        }
    }

    /// Return `n` permits and wake up to `n` waiters (task context).
    pub fn release(&self, n: usize) {
        self.permits.fetch_add(n, Ordering::Release);
        for _ in 0..n {
            self.queue.notify_one();
        }
    }

    /// Return `n` permits from interrupt context.
    ///
    /// Wakes waiters through the deferred-wake hint so the interrupt handler
    /// never reschedules inline.
    pub fn irq_release(&self, n: usize) {
        self.permits.fetch_add(n, Ordering::Release);
        for _ in 0..n {
            self.queue.notify_one_irq();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
extern crate std;
