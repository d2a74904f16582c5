//! Post-completion feedback.
//!
//! Reports whether a solution worked. Runs through the same adapter and
//! gateway pair as a solve but is independent of any lifecycle state: the
//! task may have finished long ago. Duplicate reports are not filtered;
//! backends treat them as no-ops or benign errors.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::external_deps::providers::{
    AdapterError, FeedbackOutcome, ProviderAdapter, ProviderFault,
};
use crate::modules::events::{EventDispatcher, FeedbackEvent, LifecycleEvent};
use crate::tasks::core::{CaptchaKind, TaskId, TransportError, TransportGateway};
use crate::tasks::error::SolveError;
use crate::tasks::normalizer::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Good,
    Bad,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Good => f.write_str("good"),
            Verdict::Bad => f.write_str("bad"),
        }
    }
}

/// A verdict about a task that has already finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackRequest {
    task_id: TaskId,
    kind: CaptchaKind,
    verdict: Verdict,
    detail: Option<String>,
}

impl FeedbackRequest {
    /// Rebuilds a request for a task id persisted from an earlier [`Response`].
    pub fn new(task_id: TaskId, kind: CaptchaKind, verdict: Verdict) -> Self {
        Self {
            task_id,
            kind,
            verdict,
            detail: None,
        }
    }

    pub fn for_response(response: &Response, verdict: Verdict) -> Self {
        Self::new(response.task_id.clone(), response.kind, verdict)
    }

    /// Only definitive solution failures can be reported; anything else has
    /// no finished task behind it.
    pub fn for_failure(error: &SolveError) -> Option<Self> {
        match error {
            SolveError::TaskSolutionFailed {
                task_id,
                kind,
                reason,
            } => Some(Self::new(task_id.clone(), *kind, Verdict::Bad).with_detail(reason.to_string())),
            _ => None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn kind(&self) -> CaptchaKind {
        self.kind
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedbackError {
    #[error("feedback not supported: {0}")]
    Unsupported(AdapterError),
    #[error("task {0} not found or expired")]
    NotFoundOrExpired(TaskId),
    #[error("feedback for task {task_id} rejected: {fault}")]
    Rejected { task_id: TaskId, fault: ProviderFault },
    #[error("feedback transport error: {0}")]
    Transport(TransportError),
    #[error("feedback cancelled")]
    Cancelled,
}

/// Sends feedback reports. Stateless apart from its collaborators.
#[derive(Clone)]
pub struct FeedbackReporter {
    adapter: Arc<dyn ProviderAdapter>,
    gateway: Arc<dyn TransportGateway>,
    events: Arc<EventDispatcher>,
}

impl FeedbackReporter {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, gateway: Arc<dyn TransportGateway>) -> Self {
        Self {
            adapter,
            gateway,
            events: Arc::new(EventDispatcher::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub async fn report(
        &self,
        request: &FeedbackRequest,
        cancel: &CancellationToken,
    ) -> Result<(), FeedbackError> {
        if cancel.is_cancelled() {
            return Err(FeedbackError::Cancelled);
        }

        let call = self
            .adapter
            .encode_feedback(request)
            .map_err(FeedbackError::Unsupported)?;

        let response = self
            .gateway
            .send(&call, cancel)
            .await
            .map_err(FeedbackError::Transport)?;
        if cancel.is_cancelled() {
            return Err(FeedbackError::Cancelled);
        }
        if response.is_server_error() {
            return Err(FeedbackError::Transport(TransportError::Server(response.status)));
        }

        let outcome = self.adapter.decode_feedback(&response);
        self.events.dispatch(LifecycleEvent::Feedback(FeedbackEvent {
            provider: self.adapter.name(),
            task_id: request.task_id.clone(),
            verdict: request.verdict,
            accepted: outcome == FeedbackOutcome::Accepted,
            timestamp: Utc::now(),
        }));

        match outcome {
            FeedbackOutcome::Accepted => Ok(()),
            FeedbackOutcome::NotFoundOrExpired => {
                Err(FeedbackError::NotFoundOrExpired(request.task_id.clone()))
            }
            FeedbackOutcome::Rejected(fault) => Err(FeedbackError::Rejected {
                task_id: request.task_id.clone(),
                fault,
            }),
        }
    }
}
