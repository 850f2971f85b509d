//! Mark Queue - Concurrent Work Queue for Marking
//!
//! Gray objects waiting to be scanned. Built on crossbeam-deque:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 GLOBAL INJECTOR (roots)                 │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ GC Thread 1  │◀─▶│ GC Thread 2  │◀─▶│ GC Thread N  │
//! │ LIFO deque   │   │ LIFO deque   │   │ LIFO deque   │
//! └──────────────┘   └──────────────┘   └──────────────┘
//!                 (stealing between workers)
//! ```
//!
//! Termination: `pending` counts objects pushed but not yet fully scanned.
//! A push happens before the parent's completion, so `pending == 0` means
//! no worker holds or can produce work.

use std::iter;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Stealer, Worker};

/// MarkQueue - shared injector plus the termination counter
pub struct MarkQueue {
    injector: Injector<usize>,
    pending: AtomicUsize,
    enqueued: AtomicU64,
}

impl MarkQueue {
    pub fn new() -> Self {
        Self {
            injector: Injector::new(),
            pending: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Push to the global injector (root seeding, remark)
    pub fn push(&self, object: usize) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.injector.push(object);
    }

    /// Push to a worker's own deque
    pub fn push_local(&self, local: &Worker<usize>, object: usize) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        local.push(object);
    }

    /// Next object for `local`: own deque, then the injector, then siblings
    pub fn find_task(&self, local: &Worker<usize>, stealers: &[Stealer<usize>]) -> Option<usize> {
        local.pop().or_else(|| {
            iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(local)
                    .or_else(|| stealers.iter().map(|stealer| stealer.steal()).collect())
            })
            .find(|steal| !steal.is_retry())
            .and_then(|steal| steal.success())
        })
    }

    /// An object taken from the queue has been scanned
    pub fn complete(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Objects queued or being scanned
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    pub fn total_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
}

impl Default for MarkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_tracks_completion() {
        let queue = MarkQueue::new();
        let local = Worker::new_lifo();
        queue.push(0x10);
        queue.push(0x20);
        assert_eq!(queue.pending(), 2);

        let first = queue.find_task(&local, &[]).unwrap();
        queue.push_local(&local, 0x30);
        queue.complete();
        assert_eq!(queue.pending(), 2);

        let mut seen = vec![first];
        while let Some(object) = queue.find_task(&local, &[]) {
            seen.push(object);
            queue.complete();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0x10, 0x20, 0x30]);
        assert!(queue.is_idle());
        assert_eq!(queue.total_enqueued(), 3);
    }

    #[test]
    fn test_stealing_from_sibling() {
        let queue = MarkQueue::new();
        let owner = Worker::new_lifo();
        let thief = Worker::new_lifo();
        queue.push_local(&owner, 0x40);
        let stealers = vec![owner.stealer()];
        assert_eq!(queue.find_task(&thief, &stealers), Some(0x40));
    }
}
