//! Tally state: time windows, per-identity tally vectors, and the in-memory
//! snapshot a run folds events into.
//!
//! The snapshot tracks which rows changed since it was loaded so the
//! gateway only upserts dirty rows at commit time. Equality of two
//! snapshots is about state, never about dirtiness; compare
//! [`TallySnapshot::tallies`] and [`TallySnapshot::last_visits`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::{fmt, str::FromStr};

use super::target::{TargetIdentity, TargetKind};

// ---------------------------------------------------------------------------
// TimeWindow
// ---------------------------------------------------------------------------

/// Retention span of a tally in seconds. Zero means all-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeWindow(u64);

impl TimeWindow {
    pub const ALL_TIME: Self = Self(0);
    pub const DAY: Self = Self(86_400);
    pub const WEEK: Self = Self(604_800);
    pub const MONTH: Self = Self(2_592_000);
    pub const YEAR: Self = Self(31_536_000);

    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    #[must_use]
    pub const fn secs(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_all_time(self) -> bool {
        self.0 == 0
    }

    /// Whether an event at `timestamp` falls inside this window as seen
    /// from `now`. The lower edge is exclusive.
    #[must_use]
    pub fn covers(self, timestamp: i64, now: i64) -> bool {
        if self.is_all_time() {
            return true;
        }
        let span = i64::try_from(self.0).unwrap_or(i64::MAX);
        timestamp > now.saturating_sub(span)
    }

    /// Display name for the well-known windows.
    #[must_use]
    pub const fn label(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("All Time"),
            86_400 => Some("Past Day"),
            604_800 => Some("Past Week"),
            2_592_000 => Some("Past Month"),
            31_536_000 => Some("Past Year"),
            _ => None,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TimeWindow {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

// ---------------------------------------------------------------------------
// TallyVector
// ---------------------------------------------------------------------------

/// Per-identity counts, one per configured window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TallyVector {
    counts: BTreeMap<TimeWindow, u64>,
}

impl TallyVector {
    /// A vector with a zero count for every window.
    #[must_use]
    pub fn zeroed(windows: &[TimeWindow]) -> Self {
        Self {
            counts: windows.iter().map(|w| (*w, 0)).collect(),
        }
    }

    /// Build from raw `(window, count)` pairs, e.g. a decoded blob.
    pub fn from_counts(counts: impl IntoIterator<Item = (TimeWindow, u64)>) -> Self {
        Self {
            counts: counts.into_iter().collect(),
        }
    }

    /// Count for `window`; windows absent from the vector read as zero.
    #[must_use]
    pub fn count(&self, window: TimeWindow) -> u64 {
        self.counts.get(&window).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, window: TimeWindow) {
        let slot = self.counts.entry(window).or_insert(0);
        *slot = slot.saturating_add(1);
    }

    /// Drop windows that are no longer configured and add missing ones at
    /// zero. Used when stored vectors predate a configuration change.
    pub fn conform(&mut self, windows: &[TimeWindow]) {
        self.counts.retain(|w, _| windows.contains(w));
        for window in windows {
            self.counts.entry(*window).or_insert(0);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TimeWindow, u64)> + '_ {
        self.counts.iter().map(|(w, c)| (*w, *c))
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.counts.values().all(|c| *c == 0)
    }
}

// ---------------------------------------------------------------------------
// TallySnapshot
// ---------------------------------------------------------------------------

/// Last-visit timestamps of one identity, keyed by user id.
pub type VisitMap = BTreeMap<i64, i64>;

/// In-memory tally and last-visit state for every kind.
#[derive(Debug, Clone, Default)]
pub struct TallySnapshot {
    tallies: BTreeMap<TargetIdentity, TallyVector>,
    last_visits: BTreeMap<TargetIdentity, VisitMap>,
    dirty_tallies: BTreeSet<TargetIdentity>,
    dirty_visits: BTreeSet<(TargetIdentity, i64)>,
}

impl TallySnapshot {
    /// Insert a persisted tally without marking it dirty.
    pub fn load_tally(&mut self, identity: TargetIdentity, vector: TallyVector) {
        self.tallies.insert(identity, vector);
    }

    /// Insert a persisted last visit without marking it dirty.
    pub fn load_visit(&mut self, identity: TargetIdentity, user_id: i64, at: i64) {
        self.last_visits
            .entry(identity)
            .or_default()
            .insert(user_id, at);
    }

    #[must_use]
    pub const fn tallies(&self) -> &BTreeMap<TargetIdentity, TallyVector> {
        &self.tallies
    }

    #[must_use]
    pub const fn last_visits(&self) -> &BTreeMap<TargetIdentity, VisitMap> {
        &self.last_visits
    }

    #[must_use]
    pub fn tally(&self, identity: TargetIdentity) -> Option<&TallyVector> {
        self.tallies.get(&identity)
    }

    /// Mutable tally for `identity`, created zeroed over `windows` when
    /// absent. The row is marked dirty either way.
    pub fn tally_mut(&mut self, identity: TargetIdentity, windows: &[TimeWindow]) -> &mut TallyVector {
        self.dirty_tallies.insert(identity);
        self.tallies
            .entry(identity)
            .or_insert_with(|| TallyVector::zeroed(windows))
    }

    #[must_use]
    pub fn last_visit(&self, identity: TargetIdentity, user_id: i64) -> Option<i64> {
        self.last_visits
            .get(&identity)
            .and_then(|visits| visits.get(&user_id))
            .copied()
    }

    /// Record a visit. The stored timestamp never moves backwards.
    pub fn set_last_visit(&mut self, identity: TargetIdentity, user_id: i64, at: i64) {
        let slot = self
            .last_visits
            .entry(identity)
            .or_default()
            .entry(user_id)
            .or_insert(at);
        if at > *slot {
            *slot = at;
        }
        self.dirty_visits.insert((identity, user_id));
    }

    /// Drop all state for `identity`. Returns `true` if anything was held.
    pub fn remove_identity(&mut self, identity: TargetIdentity) -> bool {
        let had_tally = self.tallies.remove(&identity).is_some();
        let had_visits = self.last_visits.remove(&identity).is_some();
        self.dirty_tallies.remove(&identity);
        self.dirty_visits.retain(|(id, _)| *id != identity);
        had_tally || had_visits
    }

    /// Drop one last-visit entry. Returns `true` if it existed.
    pub fn remove_visit(&mut self, identity: TargetIdentity, user_id: i64) -> bool {
        self.dirty_visits.remove(&(identity, user_id));
        let Some(visits) = self.last_visits.get_mut(&identity) else {
            return false;
        };
        let removed = visits.remove(&user_id).is_some();
        if visits.is_empty() {
            self.last_visits.remove(&identity);
        }
        removed
    }

    /// Every `(identity, user_id, timestamp)` visit entry.
    pub fn visits(&self) -> impl Iterator<Item = (TargetIdentity, i64, i64)> + '_ {
        self.last_visits.iter().flat_map(|(identity, visits)| {
            visits.iter().map(move |(user, at)| (*identity, *user, *at))
        })
    }

    /// Tallies changed since load.
    pub fn dirty_tallies(&self) -> impl Iterator<Item = (TargetIdentity, &TallyVector)> + '_ {
        self.dirty_tallies
            .iter()
            .filter_map(|id| self.tallies.get(id).map(|v| (*id, v)))
    }

    /// Last visits changed since load.
    pub fn dirty_visits(&self) -> impl Iterator<Item = (TargetIdentity, i64, i64)> + '_ {
        self.dirty_visits
            .iter()
            .filter_map(|(id, user)| self.last_visit(*id, *user).map(|at| (*id, *user, at)))
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_tallies.clear();
        self.dirty_visits.clear();
    }

    /// Tallies of one kind keyed by instance id (the cache layout).
    #[must_use]
    pub fn kind_tallies(&self, kind: TargetKind) -> BTreeMap<i64, TallyVector> {
        self.tallies
            .iter()
            .filter(|(id, _)| id.kind == kind)
            .map(|(id, v)| (id.instance_id, v.clone()))
            .collect()
    }

    /// Last visits of one kind keyed by instance id (the cache layout).
    #[must_use]
    pub fn kind_visits(&self, kind: TargetKind) -> BTreeMap<i64, VisitMap> {
        self.last_visits
            .iter()
            .filter(|(id, _)| id.kind == kind)
            .map(|(id, v)| (id.instance_id, v.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// DeltaReport
// ---------------------------------------------------------------------------

/// Number of events that tallied per identity during one run.
///
/// Every non-sentinel identity seen in the run gets an entry, so a zero
/// count means "viewed, but nothing qualified".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaReport {
    entries: BTreeMap<TargetIdentity, u64>,
}

impl DeltaReport {
    pub fn touch(&mut self, identity: TargetIdentity) {
        self.entries.entry(identity).or_insert(0);
    }

    pub fn record(&mut self, identity: TargetIdentity) {
        *self.entries.entry(identity).or_insert(0) += 1;
    }

    #[must_use]
    pub fn get(&self, identity: TargetIdentity) -> u64 {
        self.entries.get(&identity).copied().unwrap_or(0)
    }

    /// Identities that gained at least one tally, in identity order.
    pub fn nonzero(&self) -> impl Iterator<Item = (TargetIdentity, u64)> + '_ {
        self.entries
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(id, n)| (*id, *n))
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COURSE_5: TargetIdentity = TargetIdentity::new(TargetKind::Course, 5);

    #[test]
    fn window_coverage_is_exclusive_at_the_edge() {
        let now = 1_000_000;
        assert!(TimeWindow::DAY.covers(now - 100, now));
        assert!(!TimeWindow::DAY.covers(now - 86_400, now));
        assert!(!TimeWindow::DAY.covers(now - 90_000, now));
        assert!(TimeWindow::ALL_TIME.covers(0, now));
    }

    #[test]
    fn window_labels_cover_defaults() {
        assert_eq!(TimeWindow::ALL_TIME.label(), Some("All Time"));
        assert_eq!(TimeWindow::MONTH.label(), Some("Past Month"));
        assert_eq!(TimeWindow::from_secs(3600).label(), None);
        assert_eq!("  604800 ".parse::<TimeWindow>().unwrap(), TimeWindow::WEEK);
    }

    #[test]
    fn conform_drops_unknown_and_fills_missing() {
        let mut vector = TallyVector::from_counts([
            (TimeWindow::from_secs(3600), 9),
            (TimeWindow::DAY, 4),
        ]);
        vector.conform(&[TimeWindow::ALL_TIME, TimeWindow::DAY]);

        assert_eq!(vector.count(TimeWindow::DAY), 4);
        assert_eq!(vector.count(TimeWindow::ALL_TIME), 0);
        assert_eq!(vector.iter().count(), 2);
    }

    #[test]
    fn last_visit_never_regresses() {
        let mut snapshot = TallySnapshot::default();
        snapshot.set_last_visit(COURSE_5, 7, 200);
        snapshot.set_last_visit(COURSE_5, 7, 100);
        assert_eq!(snapshot.last_visit(COURSE_5, 7), Some(200));
    }

    #[test]
    fn loaded_rows_are_clean_until_touched() {
        let mut snapshot = TallySnapshot::default();
        snapshot.load_tally(COURSE_5, TallyVector::zeroed(&[TimeWindow::ALL_TIME]));
        snapshot.load_visit(COURSE_5, 7, 100);
        assert_eq!(snapshot.dirty_tallies().count(), 0);
        assert_eq!(snapshot.dirty_visits().count(), 0);

        snapshot
            .tally_mut(COURSE_5, &[TimeWindow::ALL_TIME])
            .increment(TimeWindow::ALL_TIME);
        assert_eq!(snapshot.dirty_tallies().count(), 1);
        assert_eq!(
            snapshot.tally(COURSE_5).map(|v| v.count(TimeWindow::ALL_TIME)),
            Some(1)
        );
    }

    #[test]
    fn remove_identity_clears_visits_and_dirt() {
        let mut snapshot = TallySnapshot::default();
        snapshot.tally_mut(COURSE_5, &[TimeWindow::ALL_TIME]);
        snapshot.set_last_visit(COURSE_5, 7, 100);

        assert!(snapshot.remove_identity(COURSE_5));
        assert!(snapshot.tally(COURSE_5).is_none());
        assert_eq!(snapshot.visits().count(), 0);
        assert_eq!(snapshot.dirty_visits().count(), 0);
        assert!(!snapshot.remove_identity(COURSE_5));
    }

    #[test]
    fn delta_report_keeps_zero_entries_out_of_nonzero() {
        let mut report = DeltaReport::default();
        report.touch(COURSE_5);
        report.record(TargetIdentity::new(TargetKind::Module, 3));
        report.record(TargetIdentity::new(TargetKind::Module, 3));

        assert_eq!(report.len(), 2);
        assert_eq!(report.total(), 2);
        assert_eq!(report.nonzero().collect::<Vec<_>>().len(), 1);
        assert_eq!(report.get(COURSE_5), 0);
    }
}
