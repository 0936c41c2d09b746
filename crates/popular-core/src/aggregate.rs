//! The tally fold: one pass over ascending view events.
//!
//! Per event, in order:
//! 1. events newer than `now` are deferred to the next run
//! 2. sentinel identities (instance id 0) are skipped
//! 3. the identity enters the delta report, even if nothing tallies
//! 4. identities deleted this run are skipped
//! 5. the tally vector is created if absent
//! 6. a qualifying user's last visit is read, then replaced by this event
//! 7. blacklisted origins stop here
//! 8. the event tallies into every covering window if there is no prior
//!    visit or it is at least `debounce_interval` seconds after it
//!
//! A user qualifies for last-visit tracking if active, or if anonymous
//! while anonymous counting is on (all anonymous users then share
//! [`GUEST_USER`]). Other users never have a prior visit, so they are never
//! debounced.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use crate::config::TallySettings;
use crate::model::{DeltaReport, GUEST_USER, TallySnapshot, TargetIdentity, ViewEvent};

/// What the fold did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Tallied,
    Debounced,
    Blacklisted,
    SkippedSentinel,
    SkippedDeleted,
    Deferred,
}

/// Per-outcome event counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub tallied: u64,
    pub debounced: u64,
    pub blacklisted: u64,
    pub skipped_sentinel: u64,
    pub skipped_deleted: u64,
    pub deferred: u64,
}

impl EventCounts {
    pub const fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Tallied => self.tallied += 1,
            Outcome::Debounced => self.debounced += 1,
            Outcome::Blacklisted => self.blacklisted += 1,
            Outcome::SkippedSentinel => self.skipped_sentinel += 1,
            Outcome::SkippedDeleted => self.skipped_deleted += 1,
            Outcome::Deferred => self.deferred += 1,
        }
    }

    /// Events consumed by the fold (deferred events are left for later).
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.tallied + self.debounced + self.blacklisted + self.skipped_sentinel + self.skipped_deleted
    }
}

/// Fold state that stays fixed for a run.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator<'a> {
    settings: &'a TallySettings,
    active_users: &'a HashSet<i64>,
    deleted: &'a BTreeSet<TargetIdentity>,
    now: i64,
}

impl<'a> Aggregator<'a> {
    #[must_use]
    pub const fn new(
        settings: &'a TallySettings,
        active_users: &'a HashSet<i64>,
        deleted: &'a BTreeSet<TargetIdentity>,
        now: i64,
    ) -> Self {
        Self {
            settings,
            active_users,
            deleted,
            now,
        }
    }

    #[must_use]
    pub const fn now(&self) -> i64 {
        self.now
    }

    /// The user id last visits are tracked under, or `None` when the user
    /// does not qualify for tracking.
    #[must_use]
    pub fn tracked_user(&self, user_id: i64) -> Option<i64> {
        if self.settings.count_anonymous && user_id <= GUEST_USER {
            Some(GUEST_USER)
        } else if self.active_users.contains(&user_id) {
            Some(user_id)
        } else {
            None
        }
    }

    /// Fold one event into `snapshot` and `delta`.
    pub fn apply(&self, snapshot: &mut TallySnapshot, delta: &mut DeltaReport, event: &ViewEvent) -> Outcome {
        if event.timestamp > self.now {
            return Outcome::Deferred;
        }

        let identity = event.identity();
        if identity.is_sentinel() {
            return Outcome::SkippedSentinel;
        }

        delta.touch(identity);
        if self.deleted.contains(&identity) {
            return Outcome::SkippedDeleted;
        }

        let windows = &self.settings.windows;
        snapshot.tally_mut(identity, windows);

        let mut prior_last = None;
        if let Some(user) = self.tracked_user(event.user_id) {
            prior_last = snapshot.last_visit(identity, user);
            snapshot.set_last_visit(identity, user, event.timestamp);
        }

        if self.settings.is_blacklisted(&event.origin_ip) {
            return Outcome::Blacklisted;
        }

        if let Some(prior) = prior_last
            && event.timestamp.saturating_sub(prior) < self.settings.debounce_interval
        {
            return Outcome::Debounced;
        }

        let vector = snapshot.tally_mut(identity, windows);
        for window in windows {
            if window.covers(event.timestamp, self.now) {
                vector.increment(*window);
            }
        }
        delta.record(identity);
        Outcome::Tallied
    }

    /// Fold a whole sequence, stopping at the first deferred event.
    pub fn fold<'e>(
        &self,
        snapshot: &mut TallySnapshot,
        events: impl IntoIterator<Item = &'e ViewEvent>,
    ) -> (DeltaReport, EventCounts) {
        let mut delta = DeltaReport::default();
        let mut counts = EventCounts::default();
        for event in events {
            let outcome = self.apply(snapshot, &mut delta, event);
            counts.record(outcome);
            if outcome == Outcome::Deferred {
                break;
            }
        }
        (delta, counts)
    }
}
