//! Structured error reporting for failures the scheduler swallows.
use std::fmt;

use serde::Serialize;

/// What a report is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Task,
    Group,
}

/// Where in the task lifecycle the failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// A task's `on_complete` callback failed.
    OnComplete,
    /// A task's `on_error` callback failed.
    OnError,
    /// A group's `on_complete` callback failed.
    GroupComplete,
    /// A finished member could not find the group it joined.
    GroupLookup,
    /// A member result could not be handed to its group, or had the wrong
    /// shape when the group collected it.
    GroupAssembly,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::OnComplete => "onComplete",
            Stage::OnError => "onError",
            Stage::GroupComplete => "group onComplete",
            Stage::GroupLookup => "group lookup",
            Stage::GroupAssembly => "group assembly",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: Subject,
    pub subject: String,
    pub stage: Stage,
    pub message: String,
    pub trace: Option<String>,
}

impl ErrorReport {
    pub(crate) fn new(
        kind: Subject,
        subject: &str,
        stage: Stage,
        message: impl Into<String>,
    ) -> Self {
        let subject = if subject.is_empty() {
            String::from("<unnamed>")
        } else {
            subject.to_string()
        };

        Self {
            kind,
            subject,
            stage,
            message: message.into(),
            trace: None,
        }
    }

    pub(crate) fn from_error(
        kind: Subject,
        subject: &str,
        stage: Stage,
        err: &anyhow::Error,
    ) -> Self {
        Self {
            trace: Some(format!("{err:?}")),
            ..Self::new(kind, subject, stage, format!("{err:#}"))
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Subject::Task => "Task",
            Subject::Group => "Group",
        };
        write!(f, "{kind} '{}' failed in {}: {}", self.subject, self.stage, self.message)
    }
}

/// Receives every failure that cannot be handed back to a caller.
///
/// Implementations must not panic and must not block for long, they are
/// called from worker threads and from inside `drain()`.
pub trait ErrorSink: Send + Sync {
    fn log_error(&self, report: &ErrorReport);
}

/// Forwards reports to `tracing` at the error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn log_error(&self, report: &ErrorReport) {
        tracing::error!(
            kind = ?report.kind,
            subject = %report.subject,
            stage = %report.stage,
            trace = report.trace.as_deref().unwrap_or(""),
            "{}",
            report
        );
    }
}

impl<F> ErrorSink for F
where
    F: Fn(&ErrorReport) + Send + Sync,
{
    fn log_error(&self, report: &ErrorReport) {
        self(report)
    }
}
