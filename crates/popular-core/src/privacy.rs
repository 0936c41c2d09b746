//! Personal data held by popular: last-visit rows, which link a user to the
//! content they viewed. Tallies are anonymous counts and are never touched
//! here.

use rusqlite::params;
use serde::Serialize;

use crate::db::store::TallyStore;
use crate::error::TallyError;
use crate::model::{TargetIdentity, TargetKind};

/// One exported last-visit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserVisit {
    pub identity: TargetIdentity,
    pub last_visit: i64,
}

/// Every last visit recorded for `user_id`, in identity order.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if the query fails.
pub fn export_user(store: &TallyStore, user_id: i64) -> Result<Vec<UserVisit>, TallyError> {
    let mut stmt = store.connection().prepare(
        "SELECT kind, instance_id, last_visit FROM last_visits
         WHERE user_id = ?1
         ORDER BY kind, instance_id",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok(UserVisit {
                identity: TargetIdentity::new(row.get::<_, TargetKind>(0)?, row.get(1)?),
                last_visit: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Erase every last visit of `user_id`. Returns the number of rows removed.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if the delete fails.
pub fn delete_user(store: &TallyStore, user_id: i64) -> Result<usize, TallyError> {
    let removed = store.delete_visits_for_user(user_id)?;
    for kind in TargetKind::ALL {
        store.cache().invalidate_visits(kind);
    }
    tracing::info!(user_id, rows = removed, "erased user visits");
    Ok(removed)
}

/// Erase the last visits of `user_ids` on one identity.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if a delete fails.
pub fn delete_users_for_identity(
    store: &TallyStore,
    identity: TargetIdentity,
    user_ids: &[i64],
) -> Result<usize, TallyError> {
    let mut removed = 0;
    for user_id in user_ids {
        if store.delete_last_visit(identity, *user_id)? {
            removed += 1;
        }
    }
    store.cache().invalidate_visits(identity.kind);
    Ok(removed)
}

/// Erase every last visit on one identity.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if the delete fails.
pub fn delete_for_identity(store: &TallyStore, identity: TargetIdentity) -> Result<usize, TallyError> {
    let removed = store.delete_visits_for_identity(identity)?;
    store.cache().invalidate_visits(identity.kind);
    tracing::info!(identity = %identity, rows = removed, "erased identity visits");
    Ok(removed)
}

/// Erase every last visit of one kind.
///
/// # Errors
///
/// Returns [`TallyError::Persistence`] if the delete fails.
pub fn delete_for_kind(store: &TallyStore, kind: TargetKind) -> Result<usize, TallyError> {
    let removed = store.delete_visits_for_kind(kind)?;
    store.cache().invalidate_visits(kind);
    tracing::info!(kind = %kind, rows = removed, "erased kind visits");
    Ok(removed)
}
