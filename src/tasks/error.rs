//! Failure taxonomy for a solve.
//!
//! Every terminal non-ready state maps to its own [`SolveError`] variant, and
//! [`SolveError::kind`] gives callers a `Copy` tag to branch on without
//! looking at messages.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::external_deps::providers::{AdapterError, ProviderFault};
use crate::tasks::core::{CaptchaKind, DescriptorError, TaskId, TransportError};
use crate::tasks::normalizer::NormalizeError;

/// Result alias used by the lifecycle engine and the broker.
pub type SolveResult<T> = Result<T, SolveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolveErrorKind {
    BadAuthentication,
    TaskCreationFailed,
    TaskSolutionFailed,
    UnsupportedTaskKind,
    InvalidDescriptor,
    Timeout,
    Cancelled,
    Transport,
}

impl SolveErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolveErrorKind::BadAuthentication => "bad_authentication",
            SolveErrorKind::TaskCreationFailed => "task_creation_failed",
            SolveErrorKind::TaskSolutionFailed => "task_solution_failed",
            SolveErrorKind::UnsupportedTaskKind => "unsupported_task_kind",
            SolveErrorKind::InvalidDescriptor => "invalid_descriptor",
            SolveErrorKind::Timeout => "timeout",
            SolveErrorKind::Cancelled => "cancelled",
            SolveErrorKind::Transport => "transport",
        }
    }
}

impl fmt::Display for SolveErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why task creation did not produce a task id.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CreationFailure {
    #[error("provider rejected task: {0}")]
    Rejected(ProviderFault),
    #[error("submission failed in transit: {0}")]
    Transport(TransportError),
    #[error("could not encode submission: {0}")]
    Encoding(AdapterError),
}

/// Why an accepted task did not yield a usable solution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolutionFailure {
    #[error("provider reported failure: {0}")]
    Provider(ProviderFault),
    #[error("incomplete solution: {0}")]
    Incomplete(NormalizeError),
    #[error("could not encode poll request: {0}")]
    Encoding(AdapterError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("provider rejected credentials: {0}")]
    BadAuthentication(ProviderFault),
    #[error("task creation failed: {0}")]
    TaskCreationFailed(CreationFailure),
    #[error("task {task_id} could not be solved: {reason}")]
    TaskSolutionFailed {
        task_id: TaskId,
        kind: CaptchaKind,
        reason: SolutionFailure,
    },
    #[error("{provider} cannot solve {kind} captchas")]
    UnsupportedTaskKind {
        provider: &'static str,
        kind: CaptchaKind,
    },
    #[error("invalid task descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("task timed out after {elapsed:?}")]
    Timeout {
        task_id: Option<TaskId>,
        elapsed: Duration,
    },
    #[error("task cancelled")]
    Cancelled { task_id: Option<TaskId> },
    #[error("polling task {task_id} failed after {attempts} transport errors: {source}")]
    Transport {
        task_id: TaskId,
        attempts: u32,
        source: TransportError,
    },
}

impl SolveError {
    pub fn kind(&self) -> SolveErrorKind {
        match self {
            SolveError::BadAuthentication(_) => SolveErrorKind::BadAuthentication,
            SolveError::TaskCreationFailed(_) => SolveErrorKind::TaskCreationFailed,
            SolveError::TaskSolutionFailed { .. } => SolveErrorKind::TaskSolutionFailed,
            SolveError::UnsupportedTaskKind { .. } => SolveErrorKind::UnsupportedTaskKind,
            SolveError::InvalidDescriptor(_) => SolveErrorKind::InvalidDescriptor,
            SolveError::Timeout { .. } => SolveErrorKind::Timeout,
            SolveError::Cancelled { .. } => SolveErrorKind::Cancelled,
            SolveError::Transport { .. } => SolveErrorKind::Transport,
        }
    }

    /// Backend task id, when the failure happened after submission.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            SolveError::TaskSolutionFailed { task_id, .. } | SolveError::Transport { task_id, .. } => {
                Some(task_id)
            }
            SolveError::Timeout { task_id, .. } | SolveError::Cancelled { task_id } => {
                task_id.as_ref()
            }
            _ => None,
        }
    }

    /// A fresh solve may succeed where this one did not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SolveError::Timeout { .. } | SolveError::Transport { .. })
    }

    pub(crate) fn from_adapter(err: AdapterError) -> Self {
        match err {
            AdapterError::UnsupportedKind { provider, kind } => {
                SolveError::UnsupportedTaskKind { provider, kind }
            }
            AdapterError::InvalidDescriptor(err) => SolveError::InvalidDescriptor(err),
            other => SolveError::TaskCreationFailed(CreationFailure::Encoding(other)),
        }
    }
}
