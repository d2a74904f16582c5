//! High level broker.
//!
//! Wires one provider adapter, a transport gateway, the lifecycle engine,
//! the feedback reporter, and the event/metrics subsystem behind a small
//! API: solve a descriptor, report a verdict, read metrics.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{BrokerSettings, ConfigError};
use crate::external_deps::providers::ProviderAdapter;
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler, MetricsHandler};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::tasks::core::reqwest_gateway::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::tasks::core::{ReqwestGateway, TaskDescriptor, TransportError, TransportGateway};
use crate::tasks::error::SolveResult;
use crate::tasks::feedback::{FeedbackError, FeedbackReporter, FeedbackRequest};
use crate::tasks::lifecycle::{EngineConfig, LifecycleEngine};
use crate::tasks::normalizer::Response;

/// Errors raised while assembling a broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to initialise http transport: {0}")]
    Transport(#[from] TransportError),
}

/// Fluent builder for [`CaptchaBroker`].
pub struct CaptchaBrokerBuilder {
    adapter: Arc<dyn ProviderAdapter>,
    gateway: Option<Arc<dyn TransportGateway>>,
    engine: EngineConfig,
    request_timeout: Duration,
    soft_id: Option<String>,
    handlers: Vec<Arc<dyn EventHandler>>,
    enable_metrics: bool,
    enable_logging: bool,
}

impl CaptchaBrokerBuilder {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            gateway: None,
            engine: EngineConfig::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            soft_id: None,
            handlers: Vec::new(),
            enable_metrics: true,
            enable_logging: true,
        }
    }

    pub fn from_settings(settings: &BrokerSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let adapter = settings
            .provider_kind()?
            .build(settings.api_key.clone(), settings.base_url.clone());

        let mut builder = Self::new(adapter)
            .with_engine_config(settings.engine_config())
            .with_request_timeout(settings.request_timeout());
        if let Some(soft_id) = &settings.soft_id {
            builder = builder.with_soft_id(soft_id.clone());
        }
        Ok(builder)
    }

    /// Replaces the default reqwest-backed gateway.
    pub fn with_gateway(mut self, gateway: Arc<dyn TransportGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.engine.default_timeout = timeout;
        self
    }

    /// Per-request timeout of the default gateway. Ignored with a custom one.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_soft_id(mut self, soft_id: impl Into<String>) -> Self {
        self.soft_id = Some(soft_id.into());
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn disable_metrics(mut self) -> Self {
        self.enable_metrics = false;
        self
    }

    pub fn disable_logging(mut self) -> Self {
        self.enable_logging = false;
        self
    }

    pub fn build(self) -> Result<CaptchaBroker, BrokerError> {
        let gateway = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(ReqwestGateway::with_timeout(self.request_timeout)?),
        };

        let mut dispatcher = EventDispatcher::new();
        if self.enable_logging {
            dispatcher.register_handler(Arc::new(LoggingHandler));
        }
        let metrics = self.enable_metrics.then(MetricsCollector::new);
        if let Some(metrics) = &metrics {
            dispatcher.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
        }
        for handler in self.handlers {
            dispatcher.register_handler(handler);
        }
        let events = Arc::new(dispatcher);

        let engine = LifecycleEngine::new(self.adapter.clone(), gateway.clone())
            .with_config(self.engine)
            .with_events(events.clone());
        let reporter = FeedbackReporter::new(self.adapter, gateway).with_events(events);

        log::debug!(
            "captcha broker ready: provider={} default_timeout={:?}",
            engine.adapter().name(),
            engine.config().default_timeout
        );

        Ok(CaptchaBroker {
            engine,
            reporter,
            metrics,
            soft_id: self.soft_id,
        })
    }
}

/// Solves captchas through one configured provider.
///
/// Cheap to clone; clones share the adapter, gateway, and metrics, so a
/// single broker can serve concurrent solves from many tasks.
#[derive(Clone)]
pub struct CaptchaBroker {
    engine: LifecycleEngine,
    reporter: FeedbackReporter,
    metrics: Option<MetricsCollector>,
    soft_id: Option<String>,
}

impl CaptchaBroker {
    pub fn builder(adapter: Arc<dyn ProviderAdapter>) -> CaptchaBrokerBuilder {
        CaptchaBrokerBuilder::new(adapter)
    }

    pub fn from_settings(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        CaptchaBrokerBuilder::from_settings(settings)?.build()
    }

    /// Settings from `CAPTCHA_BROKER_*` environment variables.
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::from_settings(&BrokerSettings::from_env()?)
    }

    pub fn provider(&self) -> &'static str {
        self.engine.adapter().name()
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    /// Solves with the configured default timeout and no external cancellation.
    pub async fn solve(&self, descriptor: TaskDescriptor) -> SolveResult<Response> {
        let timeout = self.engine.config().default_timeout;
        self.solve_with_cancel(descriptor, timeout, &CancellationToken::new())
            .await
    }

    pub async fn solve_with_timeout(
        &self,
        descriptor: TaskDescriptor,
        timeout: Duration,
    ) -> SolveResult<Response> {
        self.solve_with_cancel(descriptor, timeout, &CancellationToken::new())
            .await
    }

    pub async fn solve_with_cancel(
        &self,
        descriptor: TaskDescriptor,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SolveResult<Response> {
        let descriptor = match &self.soft_id {
            Some(soft_id) if descriptor.options().soft_id.is_none() => {
                descriptor.with_soft_id(soft_id.clone())
            }
            _ => descriptor,
        };
        self.engine.solve(descriptor, timeout, cancel).await
    }

    pub async fn report(&self, request: &FeedbackRequest) -> Result<(), FeedbackError> {
        self.reporter.report(request, &CancellationToken::new()).await
    }

    pub async fn report_with_cancel(
        &self,
        request: &FeedbackRequest,
        cancel: &CancellationToken,
    ) -> Result<(), FeedbackError> {
        self.reporter.report(request, cancel).await
    }

    /// `None` when metrics were disabled at build time.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(MetricsCollector::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::providers::ProviderKind;

    #[test]
    fn settings_select_the_adapter() {
        let settings = BrokerSettings::new(ProviderKind::CapMonster, "key");
        let broker = CaptchaBroker::from_settings(&settings).unwrap();
        assert_eq!(broker.provider(), "capmonster");
        assert_eq!(broker.engine().config().default_timeout, Duration::from_secs(120));
        assert!(broker.metrics().is_some());
    }

    #[test]
    fn metrics_can_be_disabled() {
        let broker = CaptchaBroker::builder(ProviderKind::TwoCaptcha.build("key", None))
            .disable_metrics()
            .disable_logging()
            .build()
            .unwrap();
        assert!(broker.metrics().is_none());
    }
}
