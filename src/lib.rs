//! # captcha-broker
//!
//! One submit/poll/feedback contract over several third-party captcha
//! solving services.
//!
//! Callers describe a captcha once as a [`TaskDescriptor`]. The broker
//! translates it for the configured backend, submits it, polls until the
//! backend reaches a verdict, and hands back a normalized [`Response`] whose
//! shape depends only on the captcha kind.
//!
//! ## Features
//!
//! - 2Captcha, Anti-Captcha, CapMonster Cloud, and CapSolver adapters
//! - Image, reCAPTCHA v2/v3, hCaptcha, FunCaptcha, GeeTest v3/v4, Turnstile,
//!   DataDome, Capy, Lemin, and Tencent captchas
//! - Per-solve timeouts and cooperative cancellation
//! - Post-solve good/bad feedback reporting
//! - Lifecycle events and per-provider metrics
//!
//! ## Example
//!
//! ```no_run
//! use captcha_broker::{BrokerSettings, CaptchaBroker, ProviderKind, TaskDescriptor};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = BrokerSettings::new(ProviderKind::TwoCaptcha, "YOUR_API_KEY");
//!     let broker = CaptchaBroker::from_settings(&settings)?;
//!
//!     let page = Url::parse("https://example.com/login")?;
//!     let task = TaskDescriptor::recaptcha_v2(page, "6Le-wvkSAAAAAPBMRTvw0Q4Muexq9bi0DJwx_mJ-");
//!     let response = broker.solve(task).await?;
//!     println!("token: {:?}", response.value());
//!     Ok(())
//! }
//! ```

mod broker;

pub mod config;
pub mod external_deps;
pub mod modules;
pub mod tasks;

pub use crate::broker::{BrokerError, CaptchaBroker, CaptchaBrokerBuilder};

pub use crate::config::{BrokerSettings, ConfigError};

pub use crate::external_deps::providers::{
    AdapterError,
    AntiCaptchaAdapter,
    CapSolverAdapter,
    FeedbackOutcome,
    PollOutcome,
    ProviderAdapter,
    ProviderFault,
    ProviderKind,
    RawSolution,
    RejectionKind,
    SolutionField,
    SubmissionReceipt,
    SubmissionRejection,
    TwoCaptchaAdapter,
    UnknownProvider,
};

pub use crate::tasks::core::{
    CaptchaKind,
    Challenge,
    CharacterSet,
    DelayBand,
    DescriptorError,
    EnterpriseOptions,
    GatewayResponse,
    ImageChallenge,
    PollSchedule,
    ProviderRequest,
    Proxy,
    ProxyScheme,
    RequestBody,
    ReqwestGateway,
    SessionContext,
    TaskDescriptor,
    TaskHandle,
    TaskId,
    TaskOptions,
    TransportError,
    TransportGateway,
};

pub use crate::tasks::{
    CreationFailure,
    EngineConfig,
    FeedbackError,
    FeedbackReporter,
    FeedbackRequest,
    LifecycleEngine,
    NormalizeError,
    Response,
    Solution,
    SolutionFailure,
    SolveError,
    SolveErrorKind,
    SolveResult,
    TaskState,
    Verdict,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    GlobalStats,
    LifecycleEvent,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    ProviderStats,
};

pub use tokio_util::sync::CancellationToken;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
