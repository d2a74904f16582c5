//! Captcha provider integrations.
//!
//! Every backend speaks its own dialect: field names, casing, task type
//! names, status vocabulary, and error codes all differ. A
//! [`ProviderAdapter`] absorbs one dialect behind pure encode/decode
//! functions so the lifecycle engine can drive any of them the same way.
//! Adapters never perform I/O; the engine hands their requests to a
//! [`TransportGateway`](crate::tasks::core::TransportGateway).

mod anticaptcha;
mod capsolver;
mod twocaptcha;

pub use anticaptcha::AntiCaptchaAdapter;
pub use capsolver::CapSolverAdapter;
pub use twocaptcha::TwoCaptchaAdapter;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::tasks::core::{
    CaptchaKind, DescriptorError, GatewayResponse, PollSchedule, ProviderRequest, TaskDescriptor,
    TaskId, TransportError,
};
use crate::tasks::feedback::{FeedbackRequest, Verdict};

/// Error code and message exactly as a backend reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFault {
    pub code: String,
    pub description: Option<String>,
}

impl ProviderFault {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Used when a reply cannot be parsed at all.
    pub fn malformed(body: &str) -> Self {
        let snippet: String = body.chars().take(120).collect();
        Self::new("MALFORMED_RESPONSE").with_description(snippet)
    }
}

impl fmt::Display for ProviderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{} ({description})", self.code),
            None => f.write_str(&self.code),
        }
    }
}

/// Canonical names for the pieces of a solution, independent of backend casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SolutionField {
    Text,
    Token,
    UserAgent,
    RespKey,
    Cookie,
    Challenge,
    Validate,
    Seccode,
    CaptchaId,
    LotNumber,
    PassToken,
    GenTime,
    CaptchaOutput,
    CaptchaKey,
    ChallengeKey,
    Answer,
    ChallengeId,
    Ticket,
    RandStr,
}

/// Solution fields extracted by an adapter, keyed by canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawSolution {
    fields: BTreeMap<SolutionField, String>,
}

impl RawSolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: SolutionField, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: SolutionField, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.fields.insert(field, value);
        }
    }

    /// Copies `key` from a JSON object when present, stringifying numbers.
    pub fn insert_json(&mut self, field: SolutionField, object: &Value, key: &str) {
        if let Some(value) = object.get(key).and_then(json_scalar) {
            self.insert(field, value);
        }
    }

    pub fn get(&self, field: SolutionField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

pub(crate) fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Result of decoding one poll response.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending,
    Ready(RawSolution),
    Failed(ProviderFault),
    /// Produced by the engine when the poll call itself failed; adapters
    /// never return it.
    TransportError(TransportError),
}

impl PollOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::Pending => "pending",
            PollOutcome::Ready(_) => "ready",
            PollOutcome::Failed(_) => "failed",
            PollOutcome::TransportError(_) => "transport_error",
        }
    }
}

/// Successful task creation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    pub task_id: TaskId,
    /// Present when the backend solved the task synchronously.
    pub immediate: Option<RawSolution>,
}

impl SubmissionReceipt {
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            immediate: None,
        }
    }

    pub fn with_solution(mut self, solution: RawSolution) -> Self {
        self.immediate = Some(solution);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Credentials or account state; resubmitting cannot help.
    Authentication,
    /// Task shape or parameters.
    Creation,
}

/// A backend refused to create the task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{fault}")]
pub struct SubmissionRejection {
    pub kind: RejectionKind,
    pub fault: ProviderFault,
}

impl SubmissionRejection {
    pub fn authentication(fault: ProviderFault) -> Self {
        Self {
            kind: RejectionKind::Authentication,
            fault,
        }
    }

    pub fn creation(fault: ProviderFault) -> Self {
        Self {
            kind: RejectionKind::Creation,
            fault,
        }
    }
}

/// Backend answer to a feedback report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Accepted,
    NotFoundOrExpired,
    Rejected(ProviderFault),
}

/// Problems found while encoding, before any network call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    #[error("{provider} has no equivalent for {kind} captchas")]
    UnsupportedKind {
        provider: &'static str,
        kind: CaptchaKind,
    },
    #[error("invalid task descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("{provider} does not accept {verdict} reports for {kind} tasks")]
    FeedbackUnsupported {
        provider: &'static str,
        kind: CaptchaKind,
        verdict: Verdict,
    },
    #[error("failed to build request url: {0}")]
    Url(#[from] url::ParseError),
}

/// Translation layer between normalized tasks and one backend's wire format.
///
/// Implementations are pure and stateless apart from their credentials, so a
/// single instance can serve any number of concurrent solves.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend can express `kind` at all.
    fn supports(&self, kind: CaptchaKind) -> bool;

    /// Backend-specific poll cadence; `None` keeps the engine default.
    fn poll_schedule(&self, _kind: CaptchaKind) -> Option<PollSchedule> {
        None
    }

    fn encode_submission(&self, descriptor: &TaskDescriptor) -> Result<ProviderRequest, AdapterError>;

    /// `kind` is the kind that was submitted; backends answering
    /// synchronously need it to read the solution.
    fn decode_submission(
        &self,
        kind: CaptchaKind,
        response: &GatewayResponse,
    ) -> Result<SubmissionReceipt, SubmissionRejection>;

    fn encode_poll(&self, task_id: &TaskId) -> Result<ProviderRequest, AdapterError>;

    /// Never fails: anything unrecognized maps to [`PollOutcome::Pending`].
    fn decode_poll(&self, kind: CaptchaKind, response: &GatewayResponse) -> PollOutcome;

    fn encode_feedback(&self, request: &FeedbackRequest) -> Result<ProviderRequest, AdapterError>;

    fn decode_feedback(&self, response: &GatewayResponse) -> FeedbackOutcome;
}

/// Backends selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    TwoCaptcha,
    AntiCaptcha,
    CapMonster,
    CapSolver,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::TwoCaptcha => "twocaptcha",
            ProviderKind::AntiCaptcha => "anticaptcha",
            ProviderKind::CapMonster => "capmonster",
            ProviderKind::CapSolver => "capsolver",
        }
    }

    /// Instantiate the adapter for this backend, optionally pointed at a
    /// different host (self-hosted mirrors, test servers).
    pub fn build(
        &self,
        api_key: impl Into<String>,
        base_url: Option<Url>,
    ) -> Arc<dyn ProviderAdapter> {
        let api_key = api_key.into();
        match self {
            ProviderKind::TwoCaptcha => {
                let adapter = TwoCaptchaAdapter::new(api_key);
                Arc::new(match base_url {
                    Some(url) => adapter.with_base_url(url),
                    None => adapter,
                })
            }
            ProviderKind::AntiCaptcha => {
                let adapter = AntiCaptchaAdapter::new(api_key);
                Arc::new(match base_url {
                    Some(url) => adapter.with_base_url(url),
                    None => adapter,
                })
            }
            ProviderKind::CapMonster => {
                let adapter = AntiCaptchaAdapter::capmonster(api_key);
                Arc::new(match base_url {
                    Some(url) => adapter.with_base_url(url),
                    None => adapter,
                })
            }
            ProviderKind::CapSolver => {
                let adapter = CapSolverAdapter::new(api_key);
                Arc::new(match base_url {
                    Some(url) => adapter.with_base_url(url),
                    None => adapter,
                })
            }
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown captcha provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "twocaptcha" | "2captcha" | "rucaptcha" => Ok(ProviderKind::TwoCaptcha),
            "anticaptcha" => Ok(ProviderKind::AntiCaptcha),
            "capmonster" | "capmonstercloud" => Ok(ProviderKind::CapMonster),
            "capsolver" => Ok(ProviderKind::CapSolver),
            _ => Err(UnknownProvider(value.to_string())),
        }
    }
}

/// Joins `path` onto a base URL that may or may not end in a slash.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    if base.path().ends_with('/') {
        base.join(path)
    } else {
        Url::parse(&format!("{}/", base.as_str()))?.join(path)
    }
}
