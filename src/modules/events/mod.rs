//! Lifecycle event system.
//!
//! Provides hooks for metrics, logging, and custom reactions around task
//! submission, polling, completion, and feedback.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::tasks::core::{CaptchaKind, TaskId};
use crate::tasks::error::SolveErrorKind;
use crate::tasks::feedback::Verdict;

/// A backend accepted a task.
#[derive(Debug, Clone)]
pub struct SubmittedEvent {
    pub provider: &'static str,
    pub kind: CaptchaKind,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
}

/// One poll attempt finished.
#[derive(Debug, Clone)]
pub struct PollEvent {
    pub provider: &'static str,
    pub task_id: TaskId,
    pub attempt: u32,
    pub outcome: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub provider: &'static str,
    pub kind: CaptchaKind,
    pub task_id: TaskId,
    pub polls: u32,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub provider: &'static str,
    pub kind: CaptchaKind,
    pub task_id: Option<TaskId>,
    pub error: SolveErrorKind,
    pub message: String,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

/// A transient poll fault is about to be retried.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub provider: &'static str,
    pub task_id: TaskId,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FeedbackEvent {
    pub provider: &'static str,
    pub task_id: TaskId,
    pub verdict: Verdict,
    pub accepted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Submitted(SubmittedEvent),
    Polled(PollEvent),
    Completed(CompletedEvent),
    Failed(FailedEvent),
    Retry(RetryEvent),
    Feedback(FeedbackEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &LifecycleEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: LifecycleEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Submitted(submitted) => {
                log::debug!(
                    "{} accepted {} task {}",
                    submitted.provider,
                    submitted.kind,
                    submitted.task_id
                );
            }
            LifecycleEvent::Polled(poll) => {
                log::trace!(
                    "{} task {} poll #{} -> {}",
                    poll.provider,
                    poll.task_id,
                    poll.attempt,
                    poll.outcome
                );
            }
            LifecycleEvent::Completed(done) => {
                log::info!(
                    "{} solved {} task {} in {:.2}s ({} polls)",
                    done.provider,
                    done.kind,
                    done.task_id,
                    done.elapsed.as_secs_f64(),
                    done.polls
                );
            }
            LifecycleEvent::Failed(failed) => {
                let task = failed
                    .task_id
                    .as_ref()
                    .map(TaskId::to_string)
                    .unwrap_or_else(|| "-".into());
                if failed.error == SolveErrorKind::Cancelled {
                    log::debug!("{} task {} cancelled", failed.provider, task);
                } else {
                    log::warn!(
                        "{} {} task {} failed ({}): {}",
                        failed.provider,
                        failed.kind,
                        task,
                        failed.error,
                        failed.message
                    );
                }
            }
            LifecycleEvent::Retry(retry) => {
                log::info!(
                    "retry {} task {} attempt {} after {:.2}s: {}",
                    retry.provider,
                    retry.task_id,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            LifecycleEvent::Feedback(feedback) => {
                log::debug!(
                    "{} feedback {} for task {} accepted={}",
                    feedback.provider,
                    feedback.verdict,
                    feedback.task_id,
                    feedback.accepted
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Submitted(submitted) => {
                self.metrics.record_submitted(submitted.provider);
            }
            LifecycleEvent::Completed(done) => {
                self.metrics.record_solved(done.provider, done.elapsed);
            }
            LifecycleEvent::Failed(failed) => {
                self.metrics.record_failure(failed.provider, failed.error);
            }
            _ => {}
        }
    }
}
