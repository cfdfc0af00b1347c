//! Cross-process lock word.
//!
//! The lock is a single `u32` inside a shared mapping, so any process that maps
//! the slot table can take it. Acquisition spins briefly, then yields, then
//! sleeps in short intervals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use super::Segment;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

const PARK_INTERVAL: Duration = Duration::from_micros(200);

/// Handle to one lock word in a shared mapping. Cheap to clone.
#[derive(Clone)]
pub struct SlotLock {
    segment: Arc<Segment>,
    offset: usize,
}

impl SlotLock {
    /// `offset` must be 4-byte aligned and inside `segment`.
    pub(crate) fn new(segment: Arc<Segment>, offset: usize) -> Self {
        debug_assert!(offset % 4 == 0 && offset + 4 <= segment.len());
        Self { segment, offset }
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: the offset is aligned and in bounds (checked at construction),
        // the mapping lives as long as `self.segment`, and this word is only
        // ever accessed atomically.
        unsafe { &*(self.segment.as_ptr().add(self.offset) as *const AtomicU32) }
    }

    pub fn try_acquire(&self) -> bool {
        self.word()
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Block until the lock is held.
    pub fn acquire(&self) {
        let backoff = Backoff::new();
        while !self.try_acquire() {
            if backoff.is_completed() {
                thread::sleep(PARK_INTERVAL);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Block until the lock is held or `timeout` elapses. Returns whether the
    /// lock was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();

        loop {
            if self.try_acquire() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if backoff.is_completed() {
                thread::sleep(PARK_INTERVAL);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Release the lock. Returns `false` if it was not held, which is expected
    /// after a forced teardown and is not an error.
    pub fn release(&self) -> bool {
        self.word().swap(UNLOCKED, Ordering::Release) == LOCKED
    }

    /// Release regardless of who holds the lock. Used on teardown when an
    /// in-flight decoder callback may never come back to unlock.
    pub fn force_release(&self) -> bool {
        self.release()
    }

    pub fn is_locked(&self) -> bool {
        self.word().load(Ordering::Acquire) == LOCKED
    }
}

impl std::fmt::Debug for SlotLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLock")
            .field("segment", &self.segment.path())
            .field("offset", &self.offset)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::scratch_dir;
    use std::sync::atomic::AtomicUsize;

    fn lock_in(dir: &std::path::Path) -> SlotLock {
        let segment = Arc::new(Segment::create(&dir.join("locks"), 64).unwrap());
        SlotLock::new(segment, 0)
    }

    #[test]
    fn acquire_release_cycle() {
        let lock = lock_in(&scratch_dir());

        assert!(!lock.is_locked());
        lock.acquire();
        assert!(lock.is_locked());
        assert!(!lock.try_acquire());
        assert!(lock.release());
        assert!(!lock.is_locked());
    }

    #[test]
    fn double_release_is_harmless() {
        let lock = lock_in(&scratch_dir());

        lock.acquire();
        assert!(lock.release());
        assert!(!lock.release());
        assert!(!lock.force_release());
        assert!(lock.try_acquire());
    }

    #[test]
    fn acquire_timeout_gives_up() {
        let lock = lock_in(&scratch_dir());
        lock.acquire();

        let start = Instant::now();
        assert!(!lock.acquire_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        lock.release();
        assert!(lock.acquire_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn lock_is_shared_through_the_mapping() {
        let dir = scratch_dir();
        let path = dir.join("locks");
        let a = SlotLock::new(Arc::new(Segment::create(&path, 64).unwrap()), 4);
        let b = SlotLock::new(Arc::new(Segment::open(&path).unwrap()), 4);

        a.acquire();
        assert!(b.is_locked());
        assert!(!b.try_acquire());
        a.release();
        assert!(b.try_acquire());
    }

    #[test]
    fn mutual_exclusion_across_threads() {
        let lock = lock_in(&scratch_dir());
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        lock.acquire();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.release();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock.is_locked());
    }
}
