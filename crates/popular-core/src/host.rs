//! Seams to the systems a run reads from but does not own: the view log,
//! the per-kind identity directories, the user directory and the watermark
//! store.
//!
//! SQLite implementations over host tables live in [`crate::db::host`].

use serde::Serialize;
use std::collections::HashSet;
use std::ops::ControlFlow;

use crate::error::HostError;
use crate::model::{TargetIdentity, TargetKind, ViewEvent};

/// Ordered log of "viewed" events.
pub trait EventSource {
    /// Stream events of `kinds` with `timestamp > after` (every event when
    /// `after` is `None`) in ascending timestamp order to `visit`.
    ///
    /// The scan stops early when `visit` breaks. Any cursor is closed
    /// before returning. Returns the number of events delivered.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the log cannot be read.
    fn scan(
        &self,
        after: Option<i64>,
        kinds: &[TargetKind],
        visit: &mut dyn FnMut(ViewEvent) -> ControlFlow<()>,
    ) -> Result<u64, HostError>;
}

/// A live content node as the host knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityRecord {
    pub instance_id: i64,
    pub name: String,
}

/// Existence and lookup over the backing collection of one kind.
pub trait KindDirectory {
    /// # Errors
    ///
    /// Returns [`HostError`] if the directory is unreachable.
    fn exists(&self, instance_id: i64) -> Result<bool, HostError>;

    /// # Errors
    ///
    /// Returns [`HostError`] if the directory is unreachable.
    fn lookup(&self, instance_id: i64) -> Result<Option<IdentityRecord>, HostError>;
}

/// One directory per [`TargetKind`], dispatched by kind.
pub struct DirectoryTable<'a> {
    category: Box<dyn KindDirectory + 'a>,
    course: Box<dyn KindDirectory + 'a>,
    module: Box<dyn KindDirectory + 'a>,
}

impl<'a> DirectoryTable<'a> {
    #[must_use]
    pub fn new(
        category: Box<dyn KindDirectory + 'a>,
        course: Box<dyn KindDirectory + 'a>,
        module: Box<dyn KindDirectory + 'a>,
    ) -> Self {
        Self {
            category,
            course,
            module,
        }
    }

    #[must_use]
    pub fn for_kind(&self, kind: TargetKind) -> &dyn KindDirectory {
        match kind {
            TargetKind::Category => self.category.as_ref(),
            TargetKind::Course => self.course.as_ref(),
            TargetKind::Module => self.module.as_ref(),
        }
    }

    /// # Errors
    ///
    /// Returns [`HostError`] if the kind's directory is unreachable.
    pub fn exists(&self, identity: TargetIdentity) -> Result<bool, HostError> {
        self.for_kind(identity.kind).exists(identity.instance_id)
    }

    /// # Errors
    ///
    /// Returns [`HostError`] if the kind's directory is unreachable.
    pub fn lookup(&self, identity: TargetIdentity) -> Result<Option<IdentityRecord>, HostError> {
        self.for_kind(identity.kind).lookup(identity.instance_id)
    }
}

/// The set of users that still exist.
pub trait ActiveUserDirectory {
    /// # Errors
    ///
    /// Returns [`HostError`] if the directory is unreachable.
    fn active_user_ids(&self) -> Result<HashSet<i64>, HostError>;
}

/// Exclusive lower bound of processed history, plus the settings that
/// produced the state behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub at: i64,
    pub settings_fingerprint: String,
}

/// Where the watermark lives between runs.
pub trait WatermarkStore {
    /// `None` when no run has completed (or the mark was reset).
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the store cannot be read.
    fn last_run(&self) -> Result<Option<Watermark>, HostError>;

    /// # Errors
    ///
    /// Returns [`HostError`] if the store cannot be written.
    fn set_last_run(&self, mark: &Watermark) -> Result<(), HostError>;
}

/// The external collaborators of one run, borrowed for its duration.
pub struct Hosts<'a> {
    pub events: &'a dyn EventSource,
    pub directories: &'a DirectoryTable<'a>,
    pub users: &'a dyn ActiveUserDirectory,
    pub watermark: &'a dyn WatermarkStore,
}
