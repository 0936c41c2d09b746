//! Shared output layer for pretty/text/JSON parity across all CLI commands.
//!
//! Every command handler receives an [`OutputMode`] and formats its output
//! accordingly: pretty output for operators, compact `key=value` text for
//! schedulers and pipes, or stable JSON.
//!
//! # Output mode resolution
//!
//! Precedence (highest wins):
//! 1. `--format` / hidden `--json` flag
//! 2. `FORMAT` env var → `"pretty"` | `"text"` | `"json"`
//! 3. Default: [`OutputMode::Pretty`] if stdout is a TTY; [`OutputMode::Text`] if piped.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use popular_core::config::ConfigError;
use popular_core::error::{ErrorCode, TallyError};
use popular_core::lock::LockError;
use popular_core::model::TimeWindow;
use serde::Serialize;
use std::io::{self, IsTerminal, Write};

/// Shared width for human pretty separators.
pub const PRETTY_RULE_WIDTH: usize = 72;

/// Write a horizontal separator used by pretty human output.
pub fn pretty_rule(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{:-<width$}", "", width = PRETTY_RULE_WIDTH)
}

/// Write a section heading followed by a separator.
pub fn pretty_section(w: &mut dyn Write, heading: &str) -> io::Result<()> {
    writeln!(w, "{heading}")?;
    pretty_rule(w)
}

/// Render a left-aligned key/value line in human output.
pub fn pretty_kv(w: &mut dyn Write, key: &str, value: impl AsRef<str>) -> io::Result<()> {
    writeln!(w, "{:<16} {}", format!("{key}:"), value.as_ref())
}

/// Window name for display: the well-known label, or the span in seconds.
pub fn window_label(window: TimeWindow) -> String {
    window
        .label()
        .map_or_else(|| format!("{}s", window.secs()), str::to_string)
}

/// Unix seconds as an RFC 3339 UTC timestamp, falling back to the raw value.
pub fn format_timestamp(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map_or_else(|| secs.to_string(), |at| at.to_rfc3339())
}

/// The three output modes supported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Human-optimized output (tables, sections, visual framing).
    Pretty,
    /// Token-efficient plain text for schedulers and pipes.
    Text,
    /// Machine-readable JSON.
    Json,
}

impl OutputMode {
    /// Returns `true` if JSON output was requested.
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Core resolution logic, separated from I/O for testability.
fn resolve_output_mode_inner(
    format_flag: Option<OutputMode>,
    json_flag: bool,
    format_env: Option<&str>,
    is_tty: bool,
) -> OutputMode {
    if let Some(mode) = format_flag {
        return mode;
    }

    if json_flag {
        return OutputMode::Json;
    }

    if let Some(val) = format_env {
        match val.to_lowercase().as_str() {
            "json" => return OutputMode::Json,
            "text" => return OutputMode::Text,
            "pretty" => return OutputMode::Pretty,
            _ => {}
        }
    }

    if is_tty {
        OutputMode::Pretty
    } else {
        OutputMode::Text
    }
}

/// Resolve the output mode from CLI flags, environment, and TTY defaults.
pub fn resolve_output_mode(format_flag: Option<OutputMode>, json_flag: bool) -> OutputMode {
    let env_val = std::env::var("FORMAT").ok();
    let is_tty = io::stdout().is_terminal();
    resolve_output_mode_inner(format_flag, json_flag, env_val.as_deref(), is_tty)
}

/// Render a serializable value with explicit pretty/text renderers.
pub fn render_mode<T: Serialize>(
    mode: OutputMode,
    value: &T,
    text_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
    pretty_fn: impl FnOnce(&T, &mut dyn Write) -> io::Result<()>,
) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match mode {
        OutputMode::Json => {
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
        OutputMode::Text => text_fn(value, &mut out)?,
        OutputMode::Pretty => pretty_fn(value, &mut out)?,
    }
    Ok(())
}

/// A structured error with optional suggestion and error code.
#[derive(Debug, Serialize)]
pub struct CliError {
    /// Human-readable error message.
    pub message: String,
    /// Optional suggestion for how to fix the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Machine-readable error code (`E####`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Whether the scheduler may simply invoke the command again.
    pub retryable: bool,
}

impl CliError {
    /// Create a simple error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            error_code: None,
            retryable: false,
        }
    }

    fn with_code(message: String, code: ErrorCode, hint: Option<&str>) -> Self {
        Self {
            message,
            suggestion: hint.map(str::to_string),
            error_code: Some(code.code().to_string()),
            retryable: code.is_retryable(),
        }
    }

    /// Process exit status: 2 for errors a rerun cannot fix, 75
    /// (`EX_TEMPFAIL`) for retryable ones, 1 otherwise.
    pub const fn exit_code(&self) -> u8 {
        match (&self.error_code, self.retryable) {
            (None, _) => 1,
            (Some(_), true) => 75,
            (Some(_), false) => 2,
        }
    }
}

/// Classify an error chain by the first library error found in it.
impl From<&anyhow::Error> for CliError {
    fn from(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        for cause in err.chain() {
            if let Some(tally) = cause.downcast_ref::<TallyError>() {
                return Self::with_code(message, tally.code(), tally.hint());
            }
            if let Some(lock) = cause.downcast_ref::<LockError>() {
                return Self::with_code(message, lock.code(), lock.hint());
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                let code = ErrorCode::InvalidSettings;
                return Self::with_code(message, code, code.hint());
            }
            if cause.downcast_ref::<toml::de::Error>().is_some() {
                let code = ErrorCode::ConfigParseError;
                return Self::with_code(message, code, code.hint());
            }
        }
        Self::new(message)
    }
}

/// Render an error to stderr in the requested format.
pub fn render_error(mode: OutputMode, error: &CliError) -> anyhow::Result<()> {
    let stderr = io::stderr();
    let mut out = stderr.lock();
    match mode {
        OutputMode::Json => {
            let wrapper = serde_json::json!({
                "error": error,
            });
            serde_json::to_writer_pretty(&mut out, &wrapper)?;
            writeln!(out)?;
        }
        OutputMode::Pretty | OutputMode::Text => {
            match error.error_code {
                Some(ref code) => writeln!(out, "error[{code}]: {}", error.message)?,
                None => writeln!(out, "error: {}", error.message)?,
            }
            if let Some(ref suggestion) = error.suggestion {
                writeln!(out, "  suggestion: {suggestion}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── resolve_output_mode_inner ───────────────────────────────────────────

    #[test]
    fn resolve_format_flag_wins_over_json_and_env() {
        let mode = resolve_output_mode_inner(Some(OutputMode::Text), true, Some("pretty"), true);
        assert_eq!(mode, OutputMode::Text);
    }

    #[test]
    fn resolve_json_flag_wins_over_env() {
        let mode = resolve_output_mode_inner(None, true, Some("pretty"), true);
        assert_eq!(mode, OutputMode::Json);
    }

    #[test]
    fn resolve_format_env_case_insensitive() {
        let mode = resolve_output_mode_inner(None, false, Some("TEXT"), true);
        assert_eq!(mode, OutputMode::Text);
    }

    #[test]
    fn resolve_format_env_unknown_falls_through_to_tty() {
        let mode_tty = resolve_output_mode_inner(None, false, Some("fancy"), true);
        assert_eq!(mode_tty, OutputMode::Pretty);
        let mode_pipe = resolve_output_mode_inner(None, false, Some("fancy"), false);
        assert_eq!(mode_pipe, OutputMode::Text);
    }

    #[test]
    fn resolve_default_no_tty_is_text() {
        let mode = resolve_output_mode_inner(None, false, None, false);
        assert_eq!(mode, OutputMode::Text);
        assert!(!mode.is_json());
    }

    // ── Display helpers ─────────────────────────────────────────────────────

    #[test]
    fn window_labels_fall_back_to_seconds() {
        assert_eq!(window_label(TimeWindow::ALL_TIME), "All Time");
        assert_eq!(window_label(TimeWindow::WEEK), "Past Week");
        assert_eq!(window_label(TimeWindow::from_secs(90)), "90s");
    }

    #[test]
    fn timestamps_render_as_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00+00:00");
    }

    // ── CliError classification ─────────────────────────────────────────────

    #[test]
    fn plain_errors_have_no_code() {
        let err = CliError::from(&anyhow::anyhow!("something went wrong"));
        assert_eq!(err.message, "something went wrong");
        assert!(err.error_code.is_none());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn tally_errors_carry_code_and_hint() {
        let err = anyhow::Error::from(TallyError::Cancelled).context("run failed");
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E9001"));
        assert!(cli.message.starts_with("run failed: "));
        assert!(cli.retryable);
        assert_eq!(cli.exit_code(), 75);
    }

    #[test]
    fn invalid_settings_are_not_retryable() {
        let err = anyhow::Error::from(ConfigError::EmptyWindows);
        let cli = CliError::from(&err);
        assert_eq!(cli.error_code.as_deref(), Some("E1002"));
        assert!(cli.suggestion.is_some());
        assert_eq!(cli.exit_code(), 2);
    }

    #[test]
    fn render_error_in_every_mode() {
        let err = CliError::from(&anyhow::Error::from(TallyError::Cancelled));
        for mode in [OutputMode::Pretty, OutputMode::Text, OutputMode::Json] {
            assert!(render_error(mode, &err).is_ok());
        }
    }
}
