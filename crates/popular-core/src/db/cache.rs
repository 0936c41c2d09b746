//! Per-kind read-through cache owned by [`TallyStore`](super::store::TallyStore).
//!
//! Each kind maps to an immutable, shared mapping. Entries are filled on a
//! miss by reading the whole kind in one pass and replaced wholesale after a
//! run commits; they are never patched in place. A reader holding an `Arc`
//! from before a replacement keeps seeing the old mapping.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{TallyVector, TargetKind, VisitMap};

/// Tallies of one kind keyed by instance id.
pub type KindTallies = Arc<BTreeMap<i64, TallyVector>>;

/// Last visits of one kind keyed by instance id.
pub type KindVisits = Arc<BTreeMap<i64, VisitMap>>;

#[derive(Debug, Default)]
struct Entries {
    tallies: HashMap<TargetKind, KindTallies>,
    visits: HashMap<TargetKind, KindVisits>,
}

#[derive(Debug, Default)]
pub struct TallyCache {
    entries: Mutex<Entries>,
}

impl TallyCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a panic happened while swapping an `Arc`;
    // the map itself is always whole.
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn tallies(&self, kind: TargetKind) -> Option<KindTallies> {
        self.lock().tallies.get(&kind).cloned()
    }

    #[must_use]
    pub fn visits(&self, kind: TargetKind) -> Option<KindVisits> {
        self.lock().visits.get(&kind).cloned()
    }

    pub fn put_tallies(&self, kind: TargetKind, tallies: BTreeMap<i64, TallyVector>) -> KindTallies {
        let entry = Arc::new(tallies);
        self.lock().tallies.insert(kind, Arc::clone(&entry));
        entry
    }

    pub fn put_visits(&self, kind: TargetKind, visits: BTreeMap<i64, VisitMap>) -> KindVisits {
        let entry = Arc::new(visits);
        self.lock().visits.insert(kind, Arc::clone(&entry));
        entry
    }

    /// Drop the tally and visit entries of one kind.
    pub fn invalidate_kind(&self, kind: TargetKind) {
        let mut entries = self.lock();
        entries.tallies.remove(&kind);
        entries.visits.remove(&kind);
    }

    /// Drop only the visit entry of one kind.
    pub fn invalidate_visits(&self, kind: TargetKind) {
        self.lock().visits.remove(&kind);
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.lock();
        entries.tallies.clear();
        entries.visits.clear();
    }

    /// Number of kinds with a cached tally mapping.
    #[must_use]
    pub fn cached_kinds(&self) -> usize {
        self.lock().tallies.len()
    }
}
