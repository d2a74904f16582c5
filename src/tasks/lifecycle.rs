//! Task lifecycle engine.
//!
//! Drives one captcha task from submission to a terminal state:
//!
//! ```text
//! Created -> Submitting -> Polling -> Ready | Failed | TimedOut | Cancelled
//! ```
//!
//! The engine owns the task handle and the poll loop of each solve and keeps
//! no state between solves, so one instance can be shared by any number of
//! concurrent callers. The only suspension points are the inter-poll waits
//! and gateway calls; both observe the cancellation token and the deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::external_deps::providers::{
    PollOutcome, ProviderAdapter, RawSolution, RejectionKind, SubmissionRejection,
};
use crate::modules::events::{
    CompletedEvent, EventDispatcher, FailedEvent, LifecycleEvent, PollEvent, RetryEvent,
    SubmittedEvent,
};
use crate::tasks::core::{
    CaptchaKind, GatewayResponse, PollSchedule, ProviderRequest, TaskDescriptor, TaskHandle,
    TaskId, TransportError, TransportGateway,
};
use crate::tasks::error::{CreationFailure, SolutionFailure, SolveError, SolveResult};
use crate::tasks::normalizer::{Response, normalize};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_TRANSPORT_RETRIES: u32 = 3;
/// Cap on any deadline or wake-up offset; `Duration::MAX` means "no limit".
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Tunables shared by every solve an engine runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_schedule: PollSchedule,
    /// Prefer the adapter's cadence for a kind over `poll_schedule`.
    pub honor_provider_hints: bool,
    /// Consecutive poll transport faults tolerated before giving up.
    pub max_transport_retries: u32,
    pub default_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_schedule: PollSchedule::default(),
            honor_provider_hints: true,
            max_transport_retries: DEFAULT_MAX_TRANSPORT_RETRIES,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// States of a single solve. Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Submitting,
    Polling,
    Ready,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Ready | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }

    fn for_error(error: &SolveError) -> Self {
        match error {
            SolveError::Timeout { .. } => TaskState::TimedOut,
            SolveError::Cancelled { .. } => TaskState::Cancelled,
            _ => TaskState::Failed,
        }
    }
}

/// Bookkeeping for one solve; never shared.
struct Progress {
    state: TaskState,
    kind: CaptchaKind,
    started: Instant,
    task_id: Option<TaskId>,
    polls: u32,
}

impl Progress {
    fn new(kind: CaptchaKind) -> Self {
        Self {
            state: TaskState::Created,
            kind,
            started: Instant::now(),
            task_id: None,
            polls: 0,
        }
    }

    fn transition(&mut self, next: TaskState) {
        debug_assert!(!self.state.is_terminal(), "left terminal state {:?}", self.state);
        log::trace!("{} task {:?} -> {:?}", self.kind, self.state, next);
        self.state = next;
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn timed_out(&self) -> SolveError {
        SolveError::Timeout {
            task_id: self.task_id.clone(),
            elapsed: self.elapsed(),
        }
    }

    fn cancelled(&self) -> SolveError {
        SolveError::Cancelled {
            task_id: self.task_id.clone(),
        }
    }
}

/// Orchestrates submit, poll, and normalize for one provider.
#[derive(Clone)]
pub struct LifecycleEngine {
    adapter: Arc<dyn ProviderAdapter>,
    gateway: Arc<dyn TransportGateway>,
    config: EngineConfig,
    events: Arc<EventDispatcher>,
}

impl LifecycleEngine {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, gateway: Arc<dyn TransportGateway>) -> Self {
        Self {
            adapter,
            gateway,
            config: EngineConfig::default(),
            events: Arc::new(EventDispatcher::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub fn gateway(&self) -> &Arc<dyn TransportGateway> {
        &self.gateway
    }

    /// Solves `descriptor` within `timeout`, or the descriptor's own timeout
    /// override when it has one.
    ///
    /// The budget is wall-clock time measured from submission, independent
    /// of cancellation. A token that is already cancelled returns
    /// [`SolveError::Cancelled`] without any gateway call.
    pub async fn solve(
        &self,
        descriptor: TaskDescriptor,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SolveResult<Response> {
        let timeout = descriptor.options().timeout.unwrap_or(timeout);
        let mut progress = Progress::new(descriptor.kind());

        let result = self.drive(&descriptor, timeout, cancel, &mut progress).await;
        match &result {
            Ok(response) => {
                progress.transition(TaskState::Ready);
                self.events.dispatch(LifecycleEvent::Completed(CompletedEvent {
                    provider: self.adapter.name(),
                    kind: response.kind,
                    task_id: response.task_id.clone(),
                    polls: progress.polls,
                    elapsed: progress.elapsed(),
                    timestamp: Utc::now(),
                }));
            }
            Err(error) => {
                progress.transition(TaskState::for_error(error));
                self.events.dispatch(LifecycleEvent::Failed(FailedEvent {
                    provider: self.adapter.name(),
                    kind: progress.kind,
                    task_id: progress.task_id.clone(),
                    error: error.kind(),
                    message: error.to_string(),
                    elapsed: progress.elapsed(),
                    timestamp: Utc::now(),
                }));
            }
        }
        result
    }

    /// Same as [`solve`](Self::solve) with the configured default timeout.
    pub async fn solve_default(
        &self,
        descriptor: TaskDescriptor,
        cancel: &CancellationToken,
    ) -> SolveResult<Response> {
        self.solve(descriptor, self.config.default_timeout, cancel)
            .await
    }

    async fn drive(
        &self,
        descriptor: &TaskDescriptor,
        timeout: Duration,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> SolveResult<Response> {
        if cancel.is_cancelled() {
            return Err(progress.cancelled());
        }

        let kind = descriptor.kind();
        descriptor.validate()?;
        if !self.adapter.supports(kind) {
            return Err(SolveError::UnsupportedTaskKind {
                provider: self.adapter.name(),
                kind,
            });
        }
        let submission = self
            .adapter
            .encode_submission(descriptor)
            .map_err(SolveError::from_adapter)?;

        progress.transition(TaskState::Submitting);
        progress.started = Instant::now();
        let deadline = instant_after(progress.started, timeout);

        let response = match self.call(&submission, deadline, cancel, progress).await? {
            Ok(response) if response.is_server_error() => {
                return Err(SolveError::TaskCreationFailed(CreationFailure::Transport(
                    TransportError::Server(response.status),
                )));
            }
            Ok(response) => response,
            Err(err) => {
                return Err(SolveError::TaskCreationFailed(CreationFailure::Transport(err)));
            }
        };

        let receipt = self
            .adapter
            .decode_submission(kind, &response)
            .map_err(rejection_error)?;
        let handle = TaskHandle::new(receipt.task_id, self.adapter.name());
        progress.task_id = Some(handle.id().clone());
        self.events.dispatch(LifecycleEvent::Submitted(SubmittedEvent {
            provider: handle.provider(),
            kind,
            task_id: handle.id().clone(),
            timestamp: handle.submitted_at(),
        }));

        if let Some(raw) = receipt.immediate {
            log::debug!("{} answered task {} synchronously", handle.provider(), handle.id());
            return self.finish(&handle, descriptor, &raw);
        }

        progress.transition(TaskState::Polling);
        self.poll_until_done(&handle, descriptor, deadline, cancel, progress)
            .await
    }

    async fn poll_until_done(
        &self,
        handle: &TaskHandle,
        descriptor: &TaskDescriptor,
        deadline: Instant,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> SolveResult<Response> {
        let kind = descriptor.kind();
        let schedule = self.schedule_for(kind);
        let mut transport_failures = 0u32;
        let mut delay = schedule.delay_for(progress.polls);

        loop {
            self.wait(delay, deadline, cancel, progress).await?;

            let request = self.adapter.encode_poll(handle.id()).map_err(|err| {
                SolveError::TaskSolutionFailed {
                    task_id: handle.id().clone(),
                    kind,
                    reason: SolutionFailure::Encoding(err),
                }
            })?;

            let sent = self.call(&request, deadline, cancel, progress).await?;
            progress.polls += 1;
            delay = schedule.delay_for(progress.polls);
            let outcome = match sent {
                Ok(response) if response.is_server_error() => {
                    PollOutcome::TransportError(TransportError::Server(response.status))
                }
                Ok(response) => self.adapter.decode_poll(kind, &response),
                Err(err) => PollOutcome::TransportError(err),
            };

            self.events.dispatch(LifecycleEvent::Polled(PollEvent {
                provider: handle.provider(),
                task_id: handle.id().clone(),
                attempt: progress.polls,
                outcome: outcome.label(),
                timestamp: Utc::now(),
            }));

            match outcome {
                PollOutcome::Pending => {
                    transport_failures = 0;
                }
                PollOutcome::Ready(raw) => return self.finish(handle, descriptor, &raw),
                PollOutcome::Failed(fault) => {
                    return Err(SolveError::TaskSolutionFailed {
                        task_id: handle.id().clone(),
                        kind,
                        reason: SolutionFailure::Provider(fault),
                    });
                }
                PollOutcome::TransportError(err) => {
                    transport_failures += 1;
                    if transport_failures > self.config.max_transport_retries {
                        return Err(SolveError::Transport {
                            task_id: handle.id().clone(),
                            attempts: transport_failures,
                            source: err,
                        });
                    }
                    self.events.dispatch(LifecycleEvent::Retry(RetryEvent {
                        provider: handle.provider(),
                        task_id: handle.id().clone(),
                        attempt: transport_failures,
                        reason: err.to_string(),
                        scheduled_after: delay,
                        timestamp: Utc::now(),
                    }));
                }
            }

            if Instant::now() >= deadline {
                return Err(progress.timed_out());
            }
        }
    }

    /// Sleeps for `delay`, cut short by cancellation or the deadline.
    async fn wait(
        &self,
        delay: Duration,
        deadline: Instant,
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> SolveResult<()> {
        let wake = instant_after(Instant::now(), delay);
        let expires = wake >= deadline;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(progress.cancelled()),
            _ = sleep_until(if expires { deadline } else { wake }) => {
                if expires {
                    Err(progress.timed_out())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// One gateway call bounded by the deadline. A cancellation observed once
    /// the call returns discards its result.
    async fn call(
        &self,
        request: &ProviderRequest,
        deadline: Instant,
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> SolveResult<Result<GatewayResponse, TransportError>> {
        let result = timeout_at(deadline, self.gateway.send(request, cancel))
            .await
            .map_err(|_| progress.timed_out())?;
        if cancel.is_cancelled() {
            return Err(progress.cancelled());
        }
        Ok(result)
    }

    fn finish(
        &self,
        handle: &TaskHandle,
        descriptor: &TaskDescriptor,
        raw: &RawSolution,
    ) -> SolveResult<Response> {
        let kind = descriptor.kind();
        normalize(handle, kind, raw, descriptor.session()).map_err(|err| {
            SolveError::TaskSolutionFailed {
                task_id: handle.id().clone(),
                kind,
                reason: SolutionFailure::Incomplete(err),
            }
        })
    }

    fn schedule_for(&self, kind: CaptchaKind) -> PollSchedule {
        if self.config.honor_provider_hints {
            self.adapter
                .poll_schedule(kind)
                .unwrap_or(self.config.poll_schedule)
        } else {
            self.config.poll_schedule
        }
    }
}

fn instant_after(start: Instant, span: Duration) -> Instant {
    start + span.min(FAR_FUTURE)
}

fn rejection_error(rejection: SubmissionRejection) -> SolveError {
    match rejection.kind {
        RejectionKind::Authentication => SolveError::BadAuthentication(rejection.fault),
        RejectionKind::Creation => {
            SolveError::TaskCreationFailed(CreationFailure::Rejected(rejection.fault))
        }
    }
}
