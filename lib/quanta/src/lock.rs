//! Lock discipline for the engine.
//!
//! One global lock serializes all engine state; short-duration leaf locks
//! protect queues handed across threads. The rules, checked in debug builds
//! by a per-thread tagged stack:
//!
//! 1. The global lock is acquired before any object lock.
//! 2. At most one object lock is held at a time unless the global lock is
//!    held.
//! 3. Leaf locks may not be held while acquiring any other lock.
//!
//! A watchdog flags acquisitions held past a threshold (default 5 ms).

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, TryLockError};

use photon::time::{now_usec, Usec};
use slog::{warn, Logger};

pub const DEFAULT_HOLD_WARN_THRESHOLD: Usec = 5_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LockRank {
    Global = 0,
    Object = 1,
    Leaf = 2,
}

thread_local! {
    static LOCK_STACK: RefCell<Vec<(&'static str, LockRank)>> = const { RefCell::new(Vec::new()) };
}

#[cfg(debug_assertions)]
fn check_order(name: &'static str, rank: LockRank) {
    LOCK_STACK.with(|stack| {
        let stack = stack.borrow();
        if let Some(&(top_name, top_rank)) = stack.last() {
            assert!(
                top_rank != LockRank::Leaf,
                "acquiring lock '{}' while holding leaf lock '{}'",
                name,
                top_name
            );
        }
        match rank {
            LockRank::Global => {
                assert!(
                    !stack.iter().any(|&(_, r)| r == LockRank::Global),
                    "global lock is not recursive; already held when acquiring '{}'",
                    name
                );
            }
            LockRank::Object => {
                let global_held = stack.iter().any(|&(_, r)| r == LockRank::Global);
                let object_held = stack.iter().any(|&(_, r)| r == LockRank::Object);
                assert!(
                    global_held || !object_held,
                    "second object lock '{}' without the global lock",
                    name
                );
            }
            LockRank::Leaf => {}
        }
    });
}

#[cfg(not(debug_assertions))]
fn check_order(_name: &'static str, _rank: LockRank) {}

fn push_held(name: &'static str, rank: LockRank) {
    if cfg!(debug_assertions) {
        LOCK_STACK.with(|stack| stack.borrow_mut().push((name, rank)));
    }
}

fn pop_held(name: &'static str) {
    if cfg!(debug_assertions) {
        LOCK_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|&(n, _)| n == name) {
                stack.remove(pos);
            }
        });
    }
}

pub struct TrackedMutex<T> {
    name: &'static str,
    rank: LockRank,
    warn_threshold: Usec,
    log: Option<Logger>,
    mutex: Mutex<T>,
}

impl<T> TrackedMutex<T> {
    pub fn new(name: &'static str, rank: LockRank, value: T) -> TrackedMutex<T> {
        TrackedMutex {
            name,
            rank,
            warn_threshold: DEFAULT_HOLD_WARN_THRESHOLD,
            log: None,
            mutex: Mutex::new(value),
        }
    }

    pub fn with_watchdog(mut self, log: Logger, threshold: Usec) -> TrackedMutex<T> {
        self.log = Some(log);
        self.warn_threshold = threshold;
        self
    }

    /// Acquires the lock. The tag names the operation for the watchdog.
    pub fn lock(&self, tag: &'static str) -> TrackedGuard<'_, T> {
        check_order(self.name, self.rank);
        let guard = self.mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        push_held(self.name, self.rank);
        TrackedGuard {
            owner: self,
            tag,
            acquired: now_usec(),
            guard: Some(guard),
        }
    }

    /// Out-of-order acquisition is only permitted through try_lock.
    pub fn try_lock(&self, tag: &'static str) -> Option<TrackedGuard<'_, T>> {
        match self.mutex.try_lock() {
            Ok(guard) => {
                push_held(self.name, self.rank);
                Some(TrackedGuard {
                    owner: self,
                    tag,
                    acquired: now_usec(),
                    guard: Some(guard),
                })
            }
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => {
                push_held(self.name, self.rank);
                Some(TrackedGuard {
                    owner: self,
                    tag,
                    acquired: now_usec(),
                    guard: Some(poisoned.into_inner()),
                })
            }
        }
    }
}

pub struct TrackedGuard<'a, T> {
    owner: &'a TrackedMutex<T>,
    tag: &'static str,
    acquired: Usec,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for TrackedGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for TrackedGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for TrackedGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        pop_held(self.owner.name);
        let held = now_usec() - self.acquired;
        if held > self.owner.warn_threshold {
            if let Some(log) = &self.owner.log {
                warn!(log, "lock held too long";
                      "lock" => self.owner.name,
                      "tag" => self.tag,
                      "held_usec" => held);
            }
        }
    }
}
