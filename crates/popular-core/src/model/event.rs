//! The view event consumed by the aggregator.

use serde::{Deserialize, Serialize};

use super::target::{TargetIdentity, TargetKind};

/// User id the log records for visitors who are not logged in.
pub const NOT_LOGGED_IN_USER: i64 = 0;

/// User id of the shared guest account; also the merged anonymous bucket.
pub const GUEST_USER: i64 = 1;

/// One "viewed" record from the event log.
///
/// Timestamps are Unix seconds. The source delivers events in ascending
/// timestamp order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    pub kind: TargetKind,
    pub instance_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub course_id: i64,
    pub timestamp: i64,
    #[serde(default)]
    pub origin_ip: String,
}

impl ViewEvent {
    #[must_use]
    pub const fn identity(&self) -> TargetIdentity {
        TargetIdentity::new(self.kind, self.instance_id)
    }

    /// `true` for users who are not logged in or use the guest account.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        self.user_id <= GUEST_USER
    }
}
