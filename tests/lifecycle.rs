use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use captcha_broker::modules::events::LifecycleEvent;
use captcha_broker::{
    BrokerSettings, CancellationToken, CaptchaBroker, CaptchaBrokerBuilder, CaptchaKind, EngineConfig, EventHandler, FeedbackError,
    FeedbackRequest, GatewayResponse, ImageChallenge, PollSchedule, ProviderRequest, Solution,
    ProviderKind, SolveError, SolveErrorKind, TaskDescriptor, TaskId, TransportError,
    TransportGateway, TwoCaptchaAdapter, Verdict,
};
use url::Url;

/// Replays canned 2Captcha replies in order and records every request.
struct StubGateway {
    replies: Mutex<Vec<Result<GatewayResponse, TransportError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl StubGateway {
    fn new(replies: Vec<Result<(u16, &str), TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .rev()
                    .map(|reply| reply.map(|(status, body)| GatewayResponse::new(status, body.to_string())))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TransportGateway for StubGateway {
    async fn send(
        &self,
        request: &ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<GatewayResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Ok(GatewayResponse::new(200, NOT_READY)))
    }
}

/// Issues sequential task ids and answers every poll with `answer-<id>`.
struct EchoGateway {
    next_id: AtomicUsize,
}

#[async_trait]
impl TransportGateway for EchoGateway {
    async fn send(
        &self,
        request: &ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<GatewayResponse, TransportError> {
        if request.url.path().ends_with("in.php") {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 100;
            return Ok(GatewayResponse::new(200, format!(r#"{{"status":1,"request":"{id}"}}"#)));
        }
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let id = query.get("id").cloned().unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(id.len() as u64 * 100)).await;
        Ok(GatewayResponse::new(
            200,
            format!(r#"{{"status":1,"request":"answer-{id}"}}"#),
        ))
    }
}

/// Cancels the caller's token while answering the first poll with a solution.
struct CancelOnPollGateway {
    cancel: CancellationToken,
    calls: AtomicUsize,
}

#[async_trait]
impl TransportGateway for CancelOnPollGateway {
    async fn send(
        &self,
        request: &ProviderRequest,
        _cancel: &CancellationToken,
    ) -> Result<GatewayResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.url.path().ends_with("in.php") {
            return Ok(GatewayResponse::new(200, r#"{"status":1,"request":"61"}"#));
        }
        self.cancel.cancel();
        Ok(GatewayResponse::new(200, r#"{"status":1,"request":"too-late"}"#))
    }
}

#[derive(Default)]
struct RetryCounter(AtomicUsize);

impl EventHandler for RetryCounter {
    fn handle(&self, event: &LifecycleEvent) {
        if matches!(event, LifecycleEvent::Retry(_)) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

const NOT_READY: &str = r#"{"status":0,"request":"CAPCHA_NOT_READY"}"#;

fn broker(gateway: Arc<dyn TransportGateway>) -> CaptchaBroker {
    broker_with(gateway, |builder| builder)
}

fn broker_with(
    gateway: Arc<dyn TransportGateway>,
    customize: impl FnOnce(captcha_broker::CaptchaBrokerBuilder) -> captcha_broker::CaptchaBrokerBuilder,
) -> CaptchaBroker {
    let adapter = TwoCaptchaAdapter::new("test-key").with_base_url(Url::parse("https://solver.test/").unwrap());
    let builder = CaptchaBroker::builder(Arc::new(adapter))
        .with_gateway(gateway)
        .with_engine_config(EngineConfig {
            poll_schedule: PollSchedule::fixed(Duration::from_secs(5), Duration::from_secs(2)),
            honor_provider_hints: false,
            ..EngineConfig::default()
        });
    customize(builder).build().unwrap()
}

fn image() -> TaskDescriptor {
    TaskDescriptor::image(ImageChallenge::new(b"\x89PNG\r\n".to_vec()))
}

#[tokio::test(start_paused = true)]
async fn image_task_is_polled_until_ready() {
    let gateway = StubGateway::new(vec![
        Ok((200, r#"{"status":1,"request":"42"}"#)),
        Ok((200, NOT_READY)),
        Ok((200, r#"{"status":1,"request":"ab12"}"#)),
    ]);
    let response = broker(gateway.clone()).solve(image()).await.unwrap();

    assert_eq!(response.task_id, TaskId::from("42"));
    assert_eq!(response.kind, CaptchaKind::Image);
    assert_eq!(response.provider, "twocaptcha");
    assert_eq!(response.solution, Solution::Text { text: "ab12".into() });
    assert_eq!(gateway.calls(), 3);

    let poll = gateway.request(1);
    assert_eq!(poll.url.path(), "/res.php");
    assert!(poll.url.query_pairs().any(|(key, value)| key == "id" && value == "42"));
}

#[tokio::test(start_paused = true)]
async fn n_pending_polls_take_n_plus_one_poll_calls() {
    let pending = 4;
    let mut replies = vec![Ok((200, r#"{"status":1,"request":"9"}"#))];
    replies.extend((0..pending).map(|_| Ok((200, NOT_READY))));
    replies.push(Ok((200, r#"{"status":1,"request":"done"}"#)));
    let gateway = StubGateway::new(replies);

    broker(gateway.clone()).solve(image()).await.unwrap();
    assert_eq!(gateway.calls(), 1 + pending + 1);
}

#[tokio::test(start_paused = true)]
async fn already_cancelled_token_sends_nothing() {
    let gateway = StubGateway::new(vec![]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = broker(gateway.clone())
        .solve_with_cancel(image(), Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), SolveErrorKind::Cancelled);
    assert_eq!(err.task_id(), None);
    assert_eq!(gateway.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_polling_keeps_task_id() {
    let gateway = StubGateway::new(vec![Ok((200, r#"{"status":1,"request":"77"}"#))]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(8)).await;
        trigger.cancel();
    });

    let err = broker(gateway)
        .solve_with_cancel(image(), Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SolveError::Cancelled { task_id: Some(ref id) } if *id == TaskId::from("77")));
}

#[tokio::test(start_paused = true)]
async fn short_timeout_ends_in_timeout() {
    let gateway = StubGateway::new(vec![Ok((200, r#"{"status":1,"request":"5"}"#))]);
    let err = broker(gateway.clone())
        .solve_with_timeout(image(), Duration::from_secs(12))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), SolveErrorKind::Timeout);
    assert_eq!(err.task_id(), Some(&TaskId::from("5")));
    assert!(err.is_retryable());
    // polls at 5s, 7s, 9s and 11s; the next wait would pass the deadline
    assert_eq!(gateway.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn timeout_before_first_poll_never_returns_ready() {
    let gateway = StubGateway::new(vec![
        Ok((200, r#"{"status":1,"request":"8"}"#)),
        Ok((200, r#"{"status":1,"request":"would-be-ready"}"#)),
    ]);
    let err = broker(gateway.clone())
        .solve_with_timeout(image(), Duration::from_secs(3))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), SolveErrorKind::Timeout);
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn unbounded_timeout_does_not_overflow() {
    let gateway = StubGateway::new(vec![
        Ok((200, r#"{"status":1,"request":"12"}"#)),
        Ok((200, r#"{"status":1,"request":"fine"}"#)),
    ]);
    let response = broker(gateway.clone())
        .solve_with_timeout(image().with_timeout(Duration::MAX), Duration::MAX)
        .await
        .unwrap();

    assert_eq!(response.value(), Some("fine"));
    assert_eq!(gateway.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_a_poll_discards_its_answer() {
    let cancel = CancellationToken::new();
    let gateway = Arc::new(CancelOnPollGateway {
        cancel: cancel.clone(),
        calls: AtomicUsize::new(0),
    });

    let err = broker(gateway.clone())
        .solve_with_cancel(image(), Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SolveError::Cancelled { task_id: Some(ref id) } if *id == TaskId::from("61")));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn configured_poll_band_wins_over_provider_hint() {
    let mut settings = BrokerSettings::new(ProviderKind::TwoCaptcha, "test-key");
    settings.base_url = Some(Url::parse("https://solver.test/").unwrap());
    settings.initial_poll_secs = Some([1, 1]);
    let gateway = StubGateway::new(vec![
        Ok((200, r#"{"status":1,"request":"4"}"#)),
        Ok((200, r#"{"status":1,"request":"quick"}"#)),
    ]);
    let broker = CaptchaBrokerBuilder::from_settings(&settings)
        .unwrap()
        .with_gateway(gateway.clone())
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let response = broker.solve(image()).await.unwrap();

    assert_eq!(response.value(), Some("quick"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn transient_transport_error_is_retried() {
    let retries = Arc::new(RetryCounter::default());
    let gateway = StubGateway::new(vec![
        Ok((200, r#"{"status":1,"request":"3"}"#)),
        Err(TransportError::Connect("reset by peer".into())),
        Ok((503, "Service Unavailable")),
        Ok((200, r#"{"status":1,"request":"xyz"}"#)),
    ]);
    let handler = retries.clone();
    let response = broker_with(gateway.clone(), move |builder| builder.with_event_handler(handler))
        .solve(image())
        .await
        .unwrap();

    assert_eq!(response.value(), Some("xyz"));
    assert_eq!(retries.0.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn invalid_key_is_bad_authentication_without_polling() {
    let gateway = StubGateway::new(vec![Ok((200, r#"{"status":0,"request":"ERROR_WRONG_USER_KEY"}"#))]);
    let descriptor = TaskDescriptor::recaptcha_v2(Url::parse("https://example.com/").unwrap(), "6Lc-site");

    let err = broker(gateway.clone()).solve(descriptor).await.unwrap_err();
    assert_eq!(err.kind(), SolveErrorKind::BadAuthentication);
    assert!(!err.is_retryable());
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn submission_server_error_is_creation_failure() {
    let gateway = StubGateway::new(vec![Ok((502, "Bad Gateway"))]);
    let err = broker(gateway.clone()).solve(image()).await.unwrap_err();
    assert_eq!(err.kind(), SolveErrorKind::TaskCreationFailed);
    assert_eq!(gateway.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_descriptor_is_rejected_locally() {
    let gateway = StubGateway::new(vec![]);
    let descriptor = TaskDescriptor::recaptcha_v3(
        Url::parse("https://example.com/").unwrap(),
        "key",
        None,
        1.5,
    );
    let err = broker(gateway.clone()).solve(descriptor).await.unwrap_err();
    assert_eq!(err.kind(), SolveErrorKind::InvalidDescriptor);
    assert_eq!(gateway.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_solves_do_not_mix_results() {
    let gateway = Arc::new(EchoGateway {
        next_id: AtomicUsize::new(0),
    });
    let broker = broker(gateway);

    let (first, second, third) = tokio::join!(
        broker.solve(image()),
        broker.solve(image()),
        broker.solve(image()),
    );

    let mut ids = Vec::new();
    for response in [first, second, third] {
        let response = response.unwrap();
        assert_eq!(response.value(), Some(format!("answer-{}", response.task_id).as_str()));
        ids.push(response.task_id.to_string());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn metrics_follow_outcomes() {
    let gateway = StubGateway::new(vec![
        Ok((200, r#"{"status":1,"request":"1"}"#)),
        Ok((200, r#"{"status":1,"request":"abc"}"#)),
        Ok((200, r#"{"status":1,"request":"2"}"#)),
        Ok((200, r#"{"status":0,"request":"ERROR_CAPTCHA_UNSOLVABLE"}"#)),
    ]);
    let broker = broker(gateway);
    broker.solve(image()).await.unwrap();
    let err = broker.solve(image()).await.unwrap_err();
    assert_eq!(err.kind(), SolveErrorKind::TaskSolutionFailed);

    let snapshot = broker.metrics().unwrap();
    assert_eq!(snapshot.global.submitted, 2);
    assert_eq!(snapshot.global.solved, 1);
    assert_eq!(snapshot.global.failed, 1);
    let provider = snapshot
        .providers
        .iter()
        .find(|stats| stats.provider == "twocaptcha")
        .unwrap();
    assert_eq!(provider.failures.get(&SolveErrorKind::TaskSolutionFailed), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn feedback_after_failure() {
    let gateway = StubGateway::new(vec![
        Ok((200, r#"{"status":1,"request":"314"}"#)),
        Ok((200, r#"{"status":0,"request":"ERROR_CAPTCHA_UNSOLVABLE"}"#)),
        Ok((200, r#"{"status":1,"request":"OK_REPORT_RECORDED"}"#)),
        Ok((200, r#"{"status":0,"request":"ERROR_WRONG_CAPTCHA_ID"}"#)),
    ]);
    let broker = broker(gateway.clone());

    let err = broker.solve(image()).await.unwrap_err();
    let report = FeedbackRequest::for_failure(&err).unwrap();
    assert_eq!(report.verdict(), Verdict::Bad);
    broker.report(&report).await.unwrap();

    let call = gateway.request(2);
    assert!(call.url.query_pairs().any(|(key, value)| key == "action" && value == "reportbad"));
    assert!(call.url.query_pairs().any(|(key, value)| key == "id" && value == "314"));

    let stale = FeedbackRequest::new(TaskId::from("1"), CaptchaKind::Image, Verdict::Good);
    assert!(matches!(
        broker.report(&stale).await,
        Err(FeedbackError::NotFoundOrExpired(_))
    ));
}
