use std::fmt;

use crate::config::ConfigError;
use crate::lock::LockError;
use crate::model::TargetIdentity;

/// Machine-readable error codes for operator and scheduler decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InvalidSettings,
    SourceReadFailed,
    DirectoryUnavailable,
    PersistenceFailed,
    CorruptTally,
    WatermarkFailed,
    LockContention,
    LockIo,
    RunCancelled,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InvalidSettings => "E1002",
            Self::SourceReadFailed => "E2001",
            Self::DirectoryUnavailable => "E2002",
            Self::PersistenceFailed => "E3001",
            Self::CorruptTally => "E3002",
            Self::WatermarkFailed => "E3003",
            Self::LockContention => "E5001",
            Self::LockIo => "E5002",
            Self::RunCancelled => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidSettings => "Invalid tally settings",
            Self::SourceReadFailed => "Event source read failed",
            Self::DirectoryUnavailable => "Identity directory unavailable",
            Self::PersistenceFailed => "Tally persistence failed",
            Self::CorruptTally => "Corrupt stored tally",
            Self::WatermarkFailed => "Watermark store failed",
            Self::LockContention => "Lock contention",
            Self::LockIo => "Lock file I/O failed",
            Self::RunCancelled => "Run cancelled",
        }
    }

    /// Whether the scheduler may simply invoke the run again.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::ConfigParseError | Self::InvalidSettings)
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in popular.toml and retry."),
            Self::InvalidSettings => {
                Some("Windows must be non-negative integers; blacklist entries must be IP addresses.")
            }
            Self::SourceReadFailed => Some("Retry once the event log is reachable."),
            Self::DirectoryUnavailable => None,
            Self::PersistenceFailed => Some("Check disk space and write permissions, then retry."),
            Self::CorruptTally => Some("Run `popular rebuild` to regenerate tallies from the log."),
            Self::WatermarkFailed => Some("Retry; the watermark was not advanced."),
            Self::LockContention => Some("Another run holds the lock; retry after it finishes."),
            Self::LockIo => Some("Check that the lock file directory is writable."),
            Self::RunCancelled => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failure reported by an external collaborator (event log, directories,
/// watermark store).
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("host unavailable: {0}")]
    Unavailable(String),
    #[error("invalid host row: {0}")]
    InvalidRow(String),
}

/// Errors that abort (or degrade) a tally run.
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("event source read failed: {0}")]
    SourceRead(#[source] HostError),

    #[error("identity directory unavailable: {0}")]
    Reconciliation(#[source] HostError),

    #[error("watermark store failed: {0}")]
    Watermark(#[source] HostError),

    #[error("tally persistence failed: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("corrupt tally blob for {identity}: {source}")]
    CorruptTally {
        identity: TargetIdentity,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("run cancelled before commit")]
    Cancelled,
}

impl TallyError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::InvalidSettings,
            Self::SourceRead(_) => ErrorCode::SourceReadFailed,
            Self::Reconciliation(_) => ErrorCode::DirectoryUnavailable,
            Self::Watermark(_) => ErrorCode::WatermarkFailed,
            Self::Persistence(_) => ErrorCode::PersistenceFailed,
            Self::CorruptTally { .. } => ErrorCode::CorruptTally,
            Self::Lock(err) => err.code(),
            Self::Cancelled => ErrorCode::RunCancelled,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}
