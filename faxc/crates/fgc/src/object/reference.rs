//! Reference Objects - Weak, Soft, Phantom and Finalizer References
//!
//! A reference object holds its referent without (weak, phantom) or with
//! conditional (soft) strength. Processing runs at the end of marking,
//! inside the remark pause:
//!
//! - **Weak / Soft**: referent unreachable -> cleared and enqueued for
//!   notification. Soft referents are treated as roots unless memory
//!   pressure is high, in which case they behave like weak ones.
//! - **Phantom / Finalizer**: referent unreachable -> kept alive (marked
//!   `finalizable`) and enqueued; never cleared by the collector. Releasing
//!   the referent is up to the code polling the queue, by calling `clear`.
//!
//! A reference is enqueued at most once per unreachability event: the
//! enqueued flag resets only when the referent is found reachable again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::barrier::{Color, ColoredPointer};

/// Reference strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReferenceKind {
    Weak,
    Soft,
    Phantom,
    Finalizer,
}

impl ReferenceKind {
    /// Kinds whose referent is kept alive and enqueued instead of cleared
    pub fn keeps_referent(self) -> bool {
        matches!(self, ReferenceKind::Phantom | ReferenceKind::Finalizer)
    }
}

/// Reference - a reference object registered with the collector
#[derive(Debug)]
pub struct Reference {
    id: u64,
    kind: ReferenceKind,
    /// Raw colored-pointer word of the referent; healed in place like a slot
    referent: AtomicUsize,
    enqueued: AtomicBool,
    cleared: AtomicBool,
}

impl Reference {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub(crate) fn referent_slot(&self) -> &AtomicUsize {
        &self.referent
    }

    /// Referent word as stored (not healed)
    pub fn raw_referent(&self) -> ColoredPointer {
        ColoredPointer::from_raw(self.referent.load(Ordering::Acquire))
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    pub fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }

    /// Drop the referent; the collector stops keeping it alive
    pub fn clear(&self) {
        self.referent.store(0, Ordering::Release);
        self.cleared.store(true, Ordering::Release);
    }
}

/// ReferenceQueue - FIFO of references awaiting notification
#[derive(Default)]
pub struct ReferenceQueue {
    references: Mutex<VecDeque<Arc<Reference>>>,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reference: Arc<Reference>) {
        self.references.lock().push_back(reference);
    }

    pub fn poll(&self) -> Option<Arc<Reference>> {
        self.references.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.references.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.lock().is_empty()
    }
}

/// Outcome of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceStats {
    pub registered: usize,
    pub cleared: usize,
    pub enqueued: usize,
    pub kept_alive: usize,
}

/// ReferenceProcessor - registry and per-cycle processing
pub struct ReferenceProcessor {
    references: Mutex<Vec<Weak<Reference>>>,
    next_id: AtomicU64,

    notifications: ReferenceQueue,
    finalizable: ReferenceQueue,

    total_cleared: AtomicU64,
    total_enqueued: AtomicU64,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self {
            references: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            notifications: ReferenceQueue::new(),
            finalizable: ReferenceQueue::new(),
            total_cleared: AtomicU64::new(0),
            total_enqueued: AtomicU64::new(0),
        }
    }

    /// Register a new reference to `referent`
    ///
    /// The registry holds it weakly; dropping every `Arc` unregisters it.
    pub fn register(&self, kind: ReferenceKind, referent: ColoredPointer) -> Arc<Reference> {
        let reference = Arc::new(Reference {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            referent: AtomicUsize::new(referent.raw()),
            enqueued: AtomicBool::new(false),
            cleared: AtomicBool::new(referent.is_null()),
        });
        self.references.lock().push(Arc::downgrade(&reference));
        reference
    }

    /// Live registered references, pruning dropped ones
    pub fn snapshot(&self) -> Vec<Arc<Reference>> {
        let mut references = self.references.lock();
        references.retain(|reference| reference.strong_count() > 0);
        references.iter().filter_map(Weak::upgrade).collect()
    }

    /// Uncleared soft references, whose referents are roots while memory
    /// pressure is low
    pub fn soft_references(&self) -> Vec<Arc<Reference>> {
        self.snapshot()
            .into_iter()
            .filter(|reference| reference.kind == ReferenceKind::Soft && !reference.is_cleared())
            .collect()
    }

    /// Process every reference after marking
    ///
    /// * `heal` - heals a referent slot in place and returns the pointer
    /// * `is_live` - whether an object was marked this cycle
    /// * `keep_alive` - marks an unreachable phantom/finalizer referent
    ///
    /// Weak and soft references are handled before phantom and finalizer
    /// ones, so an object kept alive for finalization is already
    /// disconnected from its weak references.
    pub fn process(
        &self,
        heal: impl Fn(&AtomicUsize) -> ColoredPointer,
        is_live: impl Fn(usize) -> bool,
        mut keep_alive: impl FnMut(usize),
    ) -> ReferenceStats {
        let references = self.snapshot();
        let mut stats = ReferenceStats {
            registered: references.len(),
            ..ReferenceStats::default()
        };

        let (keeping, clearing): (Vec<_>, Vec<_>) = references
            .into_iter()
            .filter(|reference| !reference.is_cleared())
            .partition(|reference| reference.kind.keeps_referent());

        for reference in clearing {
            let referent = heal(&reference.referent);
            if referent.is_null() || is_live(referent.address()) {
                continue;
            }
            reference.clear();
            stats.cleared += 1;
            if !reference.enqueued.swap(true, Ordering::AcqRel) {
                self.notifications.push(reference);
                stats.enqueued += 1;
            }
        }

        for reference in keeping {
            let referent = heal(&reference.referent);
            if referent.is_null() {
                continue;
            }
            if is_live(referent.address()) {
                reference.enqueued.store(false, Ordering::Release);
                continue;
            }
            // The owner cleared or replaced the slot since it was healed
            if reference
                .referent
                .compare_exchange(
                    referent.raw(),
                    referent.with_color(Color::Finalizable).raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            keep_alive(referent.address());
            stats.kept_alive += 1;
            if !reference.enqueued.swap(true, Ordering::AcqRel) {
                match reference.kind {
                    ReferenceKind::Finalizer => self.finalizable.push(reference),
                    _ => self.notifications.push(reference),
                }
                stats.enqueued += 1;
            }
        }

        self.total_cleared
            .fetch_add(stats.cleared as u64, Ordering::Relaxed);
        self.total_enqueued
            .fetch_add(stats.enqueued as u64, Ordering::Relaxed);
        stats
    }

    /// Next weak/soft/phantom reference awaiting notification
    pub fn poll(&self) -> Option<Arc<Reference>> {
        self.notifications.poll()
    }

    /// Next finalizer reference whose referent became unreachable
    pub fn poll_finalizable(&self) -> Option<Arc<Reference>> {
        self.finalizable.poll()
    }

    pub fn registered(&self) -> usize {
        self.snapshot().len()
    }

    pub fn total_cleared(&self) -> u64 {
        self.total_cleared.load(Ordering::Relaxed)
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued.load(Ordering::Relaxed)
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}
