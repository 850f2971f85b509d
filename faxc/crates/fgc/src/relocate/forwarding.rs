//! Forwarding Table - Address Mapping During Relocation
//!
//! One table per relocating region, built exactly once when the region is
//! first touched in the relocation phase and immutable afterwards. Entries
//! are laid out deterministically: walking the marked objects in address
//! order, each object's destination is its slice base plus the sum of the
//! sizes before it. Lookups therefore never race with insertion.
//!
//! Copying is claimed per entry:
//!
//! ```text
//! Pending ──CAS──▶ Copying ──store──▶ Copied
//!    │                                  ▲
//!    └── losers spin until ─────────────┘
//! ```
//!
//! Both GC workers and mutators (relocate-on-access) go through the same
//! claim, so every object is copied by exactly one thread.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

const PENDING: u8 = 0;
const COPYING: u8 = 1;
const COPIED: u8 = 2;

/// Forwarding state of a region
#[derive(Default)]
pub enum ForwardingSlot {
    /// No table (region not relocating, or table not built yet)
    #[default]
    Empty,
    /// Table built; objects may be copied
    Ready(Arc<ForwardingTable>),
    /// Destination reservation failed; region went back to `Used`
    Aborted,
}

/// One live object scheduled for relocation
pub struct ForwardingEntry {
    from: usize,
    to: usize,
    size: usize,
    promote: bool,
    state: AtomicU8,
}

impl ForwardingEntry {
    /// Object address before relocation
    pub fn from(&self) -> usize {
        self.from
    }

    /// Object address after relocation
    pub fn to(&self) -> usize {
        self.to
    }

    /// Object size including header
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the copy goes to the old generation
    pub fn promote(&self) -> bool {
        self.promote
    }

    pub fn is_copied(&self) -> bool {
        self.state.load(Ordering::Acquire) == COPIED
    }
}

/// Live object description fed to [`ForwardingTable::build`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveObject {
    pub address: usize,
    pub size: usize,
    pub promote: bool,
}

/// ForwardingTable - mapping old addresses to new addresses for one region
pub struct ForwardingTable {
    region: usize,
    cycle: u64,
    entries: IndexMap<usize, ForwardingEntry>,
    copied: AtomicUsize,
    bytes: usize,
}

impl ForwardingTable {
    /// Lay out `objects` (ascending address order) into the survivor slice
    /// starting at `survivor_base` and the promotion slice at `promotion_base`
    ///
    /// Addresses are object (payload) addresses; slices are measured from
    /// the first header, hence `header_size`.
    pub fn build(
        region: usize,
        cycle: u64,
        objects: impl IntoIterator<Item = LiveObject>,
        survivor_base: usize,
        promotion_base: usize,
        header_size: usize,
    ) -> Self {
        let mut survivor_top = survivor_base;
        let mut promotion_top = promotion_base;
        let mut bytes = 0;
        let mut entries = IndexMap::new();

        for object in objects {
            let slice_top = if object.promote {
                &mut promotion_top
            } else {
                &mut survivor_top
            };
            let to = *slice_top + header_size;
            *slice_top += object.size;
            bytes += object.size;

            entries.insert(
                object.address,
                ForwardingEntry {
                    from: object.address,
                    to,
                    size: object.size,
                    promote: object.promote,
                    state: AtomicU8::new(PENDING),
                },
            );
        }

        Self {
            region,
            cycle,
            entries,
            copied: AtomicUsize::new(0),
            bytes,
        }
    }

    pub fn region(&self) -> usize {
        self.region
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn lookup(&self, from: usize) -> Option<&ForwardingEntry> {
        self.entries.get(&from)
    }

    /// New address of `from`, if it was live when the table was built
    pub fn forwarded(&self, from: usize) -> Option<usize> {
        self.entries.get(&from).map(|entry| entry.to)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ForwardingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes scheduled for copying
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn copied_count(&self) -> usize {
        self.copied.load(Ordering::Acquire)
    }

    /// Every entry has been copied
    pub fn is_complete(&self) -> bool {
        self.copied_count() == self.entries.len()
    }

    /// Make sure `entry` has been copied, running `copy` if this thread wins
    /// the claim. Returns true if this call performed the copy.
    pub fn ensure_copied(&self, entry: &ForwardingEntry, copy: impl FnOnce(&ForwardingEntry)) -> bool {
        match entry
            .state
            .compare_exchange(PENDING, COPYING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                copy(entry);
                entry.state.store(COPIED, Ordering::Release);
                self.copied.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(COPIED) => false,
            Err(_) => {
                let mut spins = 0u32;
                while entry.state.load(Ordering::Acquire) != COPIED {
                    if spins < 64 {
                        std::hint::spin_loop();
                        spins += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
                false
            }
        }
    }
}

impl std::fmt::Debug for ForwardingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingTable")
            .field("region", &self.region)
            .field("cycle", &self.cycle)
            .field("entries", &self.entries.len())
            .field("copied", &self.copied_count())
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn objects() -> Vec<LiveObject> {
        vec![
            LiveObject { address: 0x1010, size: 32, promote: false },
            LiveObject { address: 0x1100, size: 64, promote: true },
            LiveObject { address: 0x1200, size: 48, promote: false },
        ]
    }

    #[test]
    fn test_deterministic_layout() {
        let table = ForwardingTable::build(4, 9, objects(), 0x8000, 0x9000, 16);
        assert_eq!(table.forwarded(0x1010), Some(0x8010));
        assert_eq!(table.forwarded(0x1100), Some(0x9010));
        assert_eq!(table.forwarded(0x1200), Some(0x8000 + 32 + 16));
        assert_eq!(table.forwarded(0x1300), None);
        assert_eq!(table.bytes(), 144);
        assert_eq!(table.len(), 3);
        assert!(table.lookup(0x1100).unwrap().promote());
    }

    #[test]
    fn test_copy_claimed_once() {
        let table = Arc::new(ForwardingTable::build(0, 1, objects(), 0x8000, 0x9000, 16));
        let copies = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let copies = Arc::clone(&copies);
                std::thread::spawn(move || {
                    for from in [0x1010, 0x1100, 0x1200] {
                        let entry = table.lookup(from).unwrap();
                        table.ensure_copied(entry, |_| {
                            copies.fetch_add(1, Ordering::SeqCst);
                        });
                        assert!(entry.is_copied());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(copies.load(Ordering::SeqCst), 3);
        assert!(table.is_complete());
    }
}
