//! Read side: top-N rankings and per-identity visit listings over
//! committed state.
//!
//! Rankings read through the store's per-kind cache, so they never observe
//! a run in progress.

use serde::Serialize;

use crate::db::store::TallyStore;
use crate::error::{HostError, TallyError};
use crate::host::{DirectoryTable, IdentityRecord};
use crate::model::{TallyVector, TargetIdentity, TargetKind, TimeWindow};

/// One ranked tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedTally {
    pub identity: TargetIdentity,
    /// Count at the ranked window.
    pub count: u64,
    pub vector: TallyVector,
}

/// A ranked tally joined with its live host record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopItem {
    pub identity: TargetIdentity,
    pub count: u64,
    pub vector: TallyVector,
    pub record: IdentityRecord,
}

/// One last-visit row of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisitRow {
    pub user_id: i64,
    pub last_visit: i64,
}

/// Tallies of `kind` by descending count at `window`, ties by ascending
/// instance id. The site front page course is never listed. A `limit` of 0
/// means no limit.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if the cache fill fails.
pub fn top_tallies(
    store: &TallyStore,
    kind: TargetKind,
    window: TimeWindow,
    limit: usize,
    site_course_id: i64,
) -> Result<Vec<RankedTally>, TallyError> {
    let tallies = store.kind_tallies(kind)?;

    let mut ranked: Vec<RankedTally> = tallies
        .iter()
        .filter(|(id, _)| !(kind == TargetKind::Course && **id == site_course_id))
        .map(|(id, vector)| RankedTally {
            identity: TargetIdentity::new(kind, *id),
            count: vector.count(window),
            vector: vector.clone(),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.identity.instance_id.cmp(&b.identity.instance_id))
    });
    if limit > 0 {
        ranked.truncate(limit);
    }
    Ok(ranked)
}

/// [`top_tallies`] joined with live host records, dropping zero counts and
/// identities the host no longer has.
///
/// The limit applies to the ranking first, so fewer than `limit` items may
/// come back.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if the cache fill fails, or
/// [`TallyError::Reconciliation`] if the directory cannot be read.
pub fn top_items(
    store: &TallyStore,
    directories: &DirectoryTable<'_>,
    kind: TargetKind,
    window: TimeWindow,
    limit: usize,
    site_course_id: i64,
) -> Result<Vec<TopItem>, TallyError> {
    let ranked = top_tallies(store, kind, window, limit, site_course_id)?;
    let mut items = Vec::with_capacity(ranked.len());
    for entry in ranked {
        if entry.count == 0 {
            continue;
        }
        let record = directories
            .lookup(entry.identity)
            .map_err(TallyError::Reconciliation)?;
        if let Some(record) = record {
            items.push(TopItem {
                identity: entry.identity,
                count: entry.count,
                vector: entry.vector,
                record,
            });
        }
    }
    Ok(items)
}

/// Last visits of one identity, most recent first.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if the cache fill fails.
pub fn last_visits_for(store: &TallyStore, identity: TargetIdentity) -> Result<Vec<VisitRow>, TallyError> {
    let visits = store.kind_visits(identity.kind)?;
    let mut rows: Vec<VisitRow> = visits
        .get(&identity.instance_id)
        .map(|users| {
            users
                .iter()
                .map(|(user_id, at)| VisitRow {
                    user_id: *user_id,
                    last_visit: *at,
                })
                .collect()
        })
        .unwrap_or_default();
    rows.sort_by(|a, b| b.last_visit.cmp(&a.last_visit).then(a.user_id.cmp(&b.user_id)));
    Ok(rows)
}

/// Live host record for `identity`, if any.
///
/// # Errors
///
/// Returns [`HostError`] if the directory cannot be read.
pub fn describe(
    directories: &DirectoryTable<'_>,
    identity: TargetIdentity,
) -> Result<Option<IdentityRecord>, HostError> {
    directories.lookup(identity)
}
