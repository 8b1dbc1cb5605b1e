//! Mutex and event runtime backing the AML synchronization opcodes
//!
//! AML mutexes are recursive and carry a sync level; acquiring a lower level
//! than one already held is a firmware bug surfaced to the running method.
//! The global lock adds a firmware handshake over a dword in the FACS on top
//! of an ordinary recursive mutex.

use crate::consts::WAIT_FOREVER;
use crate::error::MethodAbort;
use crate::host::Host;

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

fn lock_untainted<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Convert an AML millisecond timeout operand to a wait bound.
///
/// `0xffff` waits forever; anything else is a bound in milliseconds.
pub fn timeout_from_ms(ms: u16) -> Option<Duration> {
    (ms != WAIT_FOREVER).then(|| Duration::from_millis(ms as u64))
}

#[derive(Debug, Default)]
struct Ownership {
    owner: Option<u64>,
    depth: u32,
}

/// Recursive mutex keyed by host thread id.
///
/// Backs AML `Mutex` objects and `Serialized` method entry. Re-acquisition
/// by the owning thread nests; release only drops ownership at depth zero.
#[derive(Debug, Default)]
pub struct RecursiveMutex {
    state: Mutex<Ownership>,
    released: Condvar,
}

impl RecursiveMutex {
    /// Fresh, unowned mutex.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire for `thread`, waiting up to `timeout` (`None` waits forever).
    ///
    /// Returns `false` on timeout.
    pub fn acquire(&self, thread: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock_untainted(&self.state);
        loop {
            match state.owner {
                None => {
                    state.owner = Some(thread);
                    state.depth = 1;
                    return true;
                }
                Some(owner) if owner == thread => {
                    state.depth += 1;
                    return true;
                }
                Some(_) => match deadline {
                    None => {
                        state = match self.released.wait(state) {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return false;
                        }
                        let (guard, _) = match self.released.wait_timeout(state, deadline - now)
                        {
                            Ok(out) => out,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        state = guard;
                    }
                },
            }
        }
    }

    /// Release one nesting level held by `thread`.
    pub fn release(&self, thread: u64) -> Result<(), MethodAbort> {
        let mut state = lock_untainted(&self.state);
        if state.owner != Some(thread) || state.depth == 0 {
            return Err(MethodAbort::MutexNotOwned);
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
        }
        Ok(())
    }

    /// Whether `thread` currently owns the mutex.
    pub fn held_by(&self, thread: u64) -> bool {
        lock_untainted(&self.state).owner == Some(thread)
    }
}

/// Runtime state of an AML `Mutex` object.
#[derive(Debug)]
pub struct AmlMutex {
    guard: RecursiveMutex,
    sync_level: u8,
}

impl AmlMutex {
    /// New mutex at the given sync level.
    pub fn new(sync_level: u8) -> Self {
        Self {
            guard: RecursiveMutex::new(),
            sync_level,
        }
    }

    /// Declared sync level.
    pub const fn sync_level(&self) -> u8 {
        self.sync_level
    }

    /// Underlying recursive lock.
    pub fn guard(&self) -> &RecursiveMutex {
        &self.guard
    }
}

/// Runtime state of an AML `Event` object: a counting semaphore.
#[derive(Debug, Default)]
pub struct AmlEvent {
    pending: Mutex<u64>,
    signaled: Condvar,
}

impl AmlEvent {
    /// Fresh event with no pending signals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one pending signal, waking one waiter.
    pub fn signal(&self) {
        let mut pending = lock_untainted(&self.pending);
        *pending = pending.saturating_add(1);
        self.signaled.notify_one();
    }

    /// Consume one pending signal, waiting up to `timeout`.
    ///
    /// Returns `false` on timeout, leaving the pending count untouched.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = lock_untainted(&self.pending);
        loop {
            if *pending > 0 {
                *pending -= 1;
                return true;
            }
            match deadline {
                None => {
                    pending = match self.signaled.wait(pending) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = match self.signaled.wait_timeout(pending, deadline - now) {
                        Ok(out) => out,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    pending = guard;
                }
            }
        }
    }

    /// Drop all pending signals.
    pub fn reset(&self) {
        *lock_untainted(&self.pending) = 0;
    }
}

/* GLOBAL LOCK */

const GLOBAL_LOCK_PENDING: u32 = 1 << 0;
const GLOBAL_LOCK_OWNED: u32 = 1 << 1;

/// How long to spin on the FACS dword before blocking on the release event.
const GLOBAL_LOCK_SPIN: Duration = Duration::from_millis(1);

/// The firmware-shared global lock.
///
/// Process-side ownership is a recursive mutex with exactly one owner; the
/// firmware side is negotiated through the pending/owned bit pair in the
/// FACS. Without a FACS the lock degrades to the process-side mutex alone.
#[derive(Debug)]
pub struct GlobalLock {
    owner: RecursiveMutex,
    facs_lock_addr: Option<u64>,
    released: AmlEvent,
}

impl GlobalLock {
    /// Global lock negotiating through the dword at `facs_lock_addr`.
    pub fn new(facs_lock_addr: Option<u64>) -> Self {
        Self {
            owner: RecursiveMutex::new(),
            facs_lock_addr,
            released: AmlEvent::new(),
        }
    }

    /// Called by host interrupt glue when firmware signals a release.
    pub fn firmware_released(&self) {
        self.released.signal();
    }

    /// Acquire for `thread`, handshaking with firmware.
    ///
    /// Returns `false` on timeout. The FACS bits are only touched by the
    /// first nesting level.
    pub fn acquire(&self, host: &dyn Host, thread: u64, timeout: Option<Duration>) -> bool {
        if !self.owner.acquire(thread, timeout) {
            return false;
        }
        if self.depth_is_nested(thread) {
            return true;
        }
        let Some(addr) = self.facs_lock_addr else {
            return true;
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_take_firmware_bit(host, addr) {
                trace!(target: "aml_vm::sync", "global lock acquired");
                return true;
            }
            // Firmware holds it. Spin briefly, then block until the release
            // interrupt signals the event.
            host.stall_us(GLOBAL_LOCK_SPIN.as_micros() as u64);
            if self.try_take_firmware_bit(host, addr) {
                return true;
            }
            let wait = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let _ = self.owner.release(thread);
                        warn!(target: "aml_vm::sync", "global lock handshake timed out");
                        return false;
                    }
                    Some(deadline - now)
                }
            };
            if !self.released.wait(wait) {
                let _ = self.owner.release(thread);
                warn!(target: "aml_vm::sync", "global lock handshake timed out");
                return false;
            }
        }
    }

    /// Release one nesting level; the last level hands the lock back to
    /// firmware and signals any firmware waiter.
    pub fn release(&self, host: &dyn Host, thread: u64) -> Result<(), MethodAbort> {
        if !self.owner.held_by(thread) {
            return Err(MethodAbort::MutexNotOwned);
        }
        let last = !self.depth_is_nested(thread);
        if last {
            if let Some(addr) = self.facs_lock_addr {
                let pending = self.clear_firmware_bits(host, addr);
                if pending {
                    host.global_lock_pending_released();
                }
            }
        }
        self.owner.release(thread)
    }

    fn depth_is_nested(&self, thread: u64) -> bool {
        let state = lock_untainted(&self.owner.state);
        state.owner == Some(thread) && state.depth > 1
    }

    fn try_take_firmware_bit(&self, host: &dyn Host, addr: u64) -> bool {
        let old = host.mem_read(addr, 4).unwrap_or(0) as u32;
        let mut new = (old & !GLOBAL_LOCK_PENDING) | GLOBAL_LOCK_OWNED;
        let contended = old & GLOBAL_LOCK_OWNED != 0;
        if contended {
            new |= GLOBAL_LOCK_PENDING;
        }
        if host.mem_write(addr, 4, new as u64).is_err() {
            return true;
        }
        !contended
    }

    fn clear_firmware_bits(&self, host: &dyn Host, addr: u64) -> bool {
        let old = host.mem_read(addr, 4).unwrap_or(0) as u32;
        let new = old & !(GLOBAL_LOCK_PENDING | GLOBAL_LOCK_OWNED);
        let _ = host.mem_write(addr, 4, new as u64);
        old & GLOBAL_LOCK_PENDING != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn recursive_acquire_nests() {
        let mutex = RecursiveMutex::new();
        assert!(mutex.acquire(1, None));
        assert!(mutex.acquire(1, Some(Duration::ZERO)));
        mutex.release(1).unwrap();
        assert!(mutex.held_by(1));
        mutex.release(1).unwrap();
        assert!(!mutex.held_by(1));
    }

    #[test]
    fn foreign_release_is_rejected() {
        let mutex = RecursiveMutex::new();
        assert!(mutex.acquire(1, None));
        assert!(mutex.release(2).is_err());
        mutex.release(1).unwrap();
        assert!(mutex.release(1).is_err());
    }

    #[test]
    fn contended_acquire_times_out() {
        let mutex = Arc::new(RecursiveMutex::new());
        assert!(mutex.acquire(1, None));
        let contender = Arc::clone(&mutex);
        let waited = std::thread::spawn(move || {
            contender.acquire(2, Some(Duration::from_millis(10)))
        })
        .join()
        .unwrap();
        assert!(!waited);
    }

    #[test]
    fn contended_acquire_succeeds_after_release() {
        let mutex = Arc::new(RecursiveMutex::new());
        assert!(mutex.acquire(1, None));
        let contender = Arc::clone(&mutex);
        let waiter = std::thread::spawn(move || contender.acquire(2, None));
        std::thread::sleep(Duration::from_millis(5));
        mutex.release(1).unwrap();
        assert!(waiter.join().unwrap());
        assert!(mutex.held_by(2));
    }

    #[test]
    fn event_counts_signals() {
        let event = AmlEvent::new();
        event.signal();
        event.signal();
        assert!(event.wait(Some(Duration::ZERO)));
        assert!(event.wait(Some(Duration::ZERO)));
        assert!(!event.wait(Some(Duration::from_millis(1))));
    }

    #[test]
    fn event_reset_discards_pending() {
        let event = AmlEvent::new();
        event.signal();
        event.reset();
        assert!(!event.wait(Some(Duration::ZERO)));
    }
}
