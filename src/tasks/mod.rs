//! Captcha task pipeline: descriptors in, normalized responses out.

pub mod core;
pub mod error;
pub mod feedback;
pub mod lifecycle;
pub mod normalizer;

pub use error::{CreationFailure, SolutionFailure, SolveError, SolveErrorKind, SolveResult};
pub use feedback::{FeedbackError, FeedbackReporter, FeedbackRequest, Verdict};
pub use lifecycle::{EngineConfig, LifecycleEngine, TaskState};
pub use normalizer::{NormalizeError, Response, Solution, normalize};
