//! Pre-aggregation cleanup for incremental runs.
//!
//! Identities the host no longer knows lose their tally and last visits,
//! and are handed to the aggregator so events for them in this run are
//! dropped. Last visits of users that are no longer active are removed;
//! tallies are never decremented.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use crate::db::store::TallyStore;
use crate::error::{HostError, TallyError};
use crate::host::DirectoryTable;
use crate::model::{TallySnapshot, TargetIdentity};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Identities purged because the host no longer has them.
    pub deleted: BTreeSet<TargetIdentity>,
    /// Last-visit rows removed for inactive users.
    pub purged_visits: usize,
    /// Identity checks were skipped because a directory failed.
    pub degraded: bool,
}

pub struct Reconciler<'a> {
    directories: &'a DirectoryTable<'a>,
    active_users: &'a HashSet<i64>,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub const fn new(directories: &'a DirectoryTable<'a>, active_users: &'a HashSet<i64>) -> Self {
        Self {
            directories,
            active_users,
        }
    }

    /// Purge stale state from `store` and `snapshot`.
    ///
    /// A directory failure is not fatal: identity purges are skipped for
    /// this run, the report is marked degraded, and user cleanup still runs.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if a delete fails.
    pub fn reconcile(
        &self,
        store: &TallyStore,
        snapshot: &mut TallySnapshot,
    ) -> Result<ReconcileReport, TallyError> {
        let mut report = ReconcileReport::default();

        match self.missing_identities(snapshot) {
            Ok(missing) => {
                for identity in missing {
                    store.delete_identity(identity)?;
                    snapshot.remove_identity(identity);
                    tracing::debug!(identity = %identity, "purged deleted identity");
                    report.deleted.insert(identity);
                }
            }
            Err(error) => {
                let error = TallyError::Reconciliation(error);
                tracing::warn!(
                    code = %error.code(),
                    error = %error,
                    "skipping identity reconciliation for this run"
                );
                report.degraded = true;
            }
        }

        let stale: Vec<(TargetIdentity, i64)> = snapshot
            .visits()
            .filter(|(_, user_id, _)| !self.active_users.contains(user_id))
            .map(|(identity, user_id, _)| (identity, user_id))
            .collect();
        for (identity, user_id) in stale {
            store.delete_last_visit(identity, user_id)?;
            snapshot.remove_visit(identity, user_id);
            report.purged_visits += 1;
        }
        if report.purged_visits > 0 {
            tracing::debug!(rows = report.purged_visits, "purged visits of inactive users");
        }

        Ok(report)
    }

    /// Every identity with state in `snapshot` that the host no longer has.
    /// Any directory error aborts the whole check.
    fn missing_identities(&self, snapshot: &TallySnapshot) -> Result<Vec<TargetIdentity>, HostError> {
        let held: BTreeSet<TargetIdentity> = snapshot
            .tallies()
            .keys()
            .chain(snapshot.last_visits().keys())
            .copied()
            .collect();

        let mut missing = Vec::new();
        for identity in held {
            if !self.directories.exists(identity)? {
                missing.push(identity);
            }
        }
        Ok(missing)
    }
}
