use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The closed set of content node kinds that receive tallies.
///
/// Variant order is the storage and display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[serde(rename = "course_category", alias = "category")]
    Category,
    #[serde(rename = "course")]
    Course,
    #[serde(rename = "course_module", alias = "module")]
    Module,
}

impl TargetKind {
    /// Every kind, in storage order.
    pub const ALL: [Self; 3] = [Self::Category, Self::Course, Self::Module];

    /// Name used by the view log and the tally tables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Category => "course_category",
            Self::Course => "course",
            Self::Module => "course_module",
        }
    }

    /// Short operator-facing name.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Course => "course",
            Self::Module => "module",
        }
    }

    /// Host table holding the live records of this kind.
    #[must_use]
    pub const fn host_table(self) -> &'static str {
        match self {
            Self::Category => "course_categories",
            Self::Course => "courses",
            Self::Module => "course_modules",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`TargetKind`] from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKindError {
    pub got: String,
}

impl fmt::Display for ParseKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid target kind: '{}' (expected category, course or module)",
            self.got
        )
    }
}

impl std::error::Error for ParseKindError {}

impl FromStr for TargetKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "course_category" | "category" => Ok(Self::Category),
            "course" => Ok(Self::Course),
            "course_module" | "module" => Ok(Self::Module),
            _ => Err(ParseKindError { got: s.to_string() }),
        }
    }
}

/// Unique key of a content node: `(kind, instance_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub kind: TargetKind,
    pub instance_id: i64,
}

impl TargetIdentity {
    #[must_use]
    pub const fn new(kind: TargetKind, instance_id: i64) -> Self {
        Self { kind, instance_id }
    }

    /// Instance id 0 is the log's "no concrete node" sentinel
    /// (e.g. the top-level category index page).
    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.instance_id == 0
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.instance_id)
    }
}
