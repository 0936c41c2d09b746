//! Domain types shared by every stage of a tally run.

pub mod event;
pub mod tally;
pub mod target;

pub use event::{GUEST_USER, NOT_LOGGED_IN_USER, ViewEvent};
pub use tally::{DeltaReport, TallySnapshot, TallyVector, TimeWindow, VisitMap};
pub use target::{ParseKindError, TargetIdentity, TargetKind};
