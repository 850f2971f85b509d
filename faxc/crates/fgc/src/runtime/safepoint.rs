//! Safepoint Management
//!
//! Mutator operations run inside a [`MutatorGuard`]; the collector's global
//! pauses (initial mark, remark) take a [`PauseGuard`]. Both are views of one
//! reader/writer lock, so a pause starts exactly when every mutator has
//! left its current operation (reached a safepoint) and mutators block
//! until the pause ends.
//!
//! ```text
//! mutator:  ──[op]──[op]──   wait   ──[op]──
//! collector:          ──request──[ PAUSE ]──
//! ```
//!
//! Between two guarded operations a mutator holds no raw heap address:
//! every operation resolves its pointer arguments again.
//!
//! A thread that already holds a guard re-enters recursively, which never
//! blocks on a waiting pause. Such a thread must not wait for a pause
//! itself; [`Safepoint::is_mutator`] lets callers refuse instead of
//! deadlocking.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_SAFEPOINT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Guard nesting depth of this thread per safepoint
    static DEPTH: RefCell<Vec<(u64, usize)>> = RefCell::new(Vec::new());
}

/// Safepoint - coordination between mutators and collector pauses
pub struct Safepoint {
    id: u64,
    lock: RwLock<()>,
    pauses: AtomicU64,
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            id: NEXT_SAFEPOINT_ID.fetch_add(1, Ordering::Relaxed),
            lock: RwLock::new(()),
            pauses: AtomicU64::new(0),
        }
    }

    fn depth(&self) -> usize {
        DEPTH.with(|depth| {
            depth
                .borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .map_or(0, |(_, count)| *count)
        })
    }

    fn adjust_depth(&self, delta: isize) {
        DEPTH.with(|depth| {
            let mut depth = depth.borrow_mut();
            match depth.iter().position(|(id, _)| *id == self.id) {
                Some(i) => {
                    let count = (depth[i].1 as isize + delta).max(0) as usize;
                    if count == 0 {
                        depth.swap_remove(i);
                    } else {
                        depth[i].1 = count;
                    }
                }
                None if delta > 0 => depth.push((self.id, delta as usize)),
                None => {}
            }
        });
    }

    /// Enter a mutator operation; blocks while a pause is running or
    /// requested
    pub fn enter(&self) -> MutatorGuard<'_> {
        let guard = if self.depth() == 0 {
            self.lock.read()
        } else {
            self.lock.read_recursive()
        };
        self.adjust_depth(1);
        MutatorGuard {
            _guard: guard,
            safepoint: self,
        }
    }

    /// Whether the calling thread is inside a mutator operation
    pub fn is_mutator(&self) -> bool {
        self.depth() > 0
    }

    /// Stop the world: waits until no mutator operation is running
    pub fn pause(&self) -> PauseGuard<'_> {
        let requested = Instant::now();
        let guard = self.lock.write();
        self.pauses.fetch_add(1, Ordering::Relaxed);
        PauseGuard {
            _guard: guard,
            requested,
            started: Instant::now(),
        }
    }

    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one mutator operation
pub struct MutatorGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    safepoint: &'a Safepoint,
}

impl Drop for MutatorGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.adjust_depth(-1);
    }
}

/// Held by the collector for the duration of a global pause
pub struct PauseGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    requested: Instant,
    started: Instant,
}

impl PauseGuard<'_> {
    /// Time spent waiting for mutators to reach the safepoint
    pub fn time_to_safepoint(&self) -> Duration {
        self.started - self.requested
    }

    /// Time since the world stopped
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_nested_guards() {
        let safepoint = Safepoint::new();
        assert!(!safepoint.is_mutator());
        {
            let _outer = safepoint.enter();
            let _inner = safepoint.enter();
            assert!(safepoint.is_mutator());
        }
        assert!(!safepoint.is_mutator());
        let pause = safepoint.pause();
        assert!(pause.elapsed() < Duration::from_secs(5));
        assert_eq!(safepoint.pause_count(), 1);
    }

    #[test]
    fn test_independent_safepoints() {
        let a = Safepoint::new();
        let b = Safepoint::new();
        let _guard = a.enter();
        assert!(a.is_mutator());
        assert!(!b.is_mutator());
        drop(b.pause());
    }

    #[test]
    fn test_pause_waits_for_mutators() {
        let safepoint = Arc::new(Safepoint::new());
        let in_pause = Arc::new(AtomicBool::new(false));
        let guard = safepoint.enter();

        let handle = {
            let safepoint = Arc::clone(&safepoint);
            let in_pause = Arc::clone(&in_pause);
            std::thread::spawn(move || {
                let _pause = safepoint.pause();
                in_pause.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!in_pause.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(in_pause.load(Ordering::SeqCst));
    }
}
