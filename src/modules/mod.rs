//! Cross-cutting services.
//!
//! Lifecycle events and the metrics they feed.

pub mod events;
pub mod metrics;

pub use events::{
    CompletedEvent, EventDispatcher, EventHandler, FailedEvent, FeedbackEvent, LifecycleEvent,
    LoggingHandler, MetricsHandler, PollEvent, RetryEvent, SubmittedEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, ProviderStats};
