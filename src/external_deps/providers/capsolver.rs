//! Adapter for the CapSolver task API.
//!
//! Image recognition is answered synchronously in the `createTask` reply;
//! every other kind is polled through `getTaskResult`.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use url::Url;

use super::{
    AdapterError, FeedbackOutcome, PollOutcome, ProviderAdapter, ProviderFault, RawSolution,
    SolutionField, SubmissionReceipt, SubmissionRejection, endpoint,
};
use crate::tasks::core::{
    CaptchaKind, Challenge, DelayBand, GatewayResponse, PollSchedule, ProviderRequest, Proxy,
    TaskDescriptor, TaskId,
};
use crate::tasks::feedback::{FeedbackRequest, Verdict};

static DEFAULT_BASE_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://api.capsolver.com/").expect("invalid capsolver url"));

const AUTH_ERRORS: &[&str] = &[
    "ERROR_KEY_DENIED_ACCESS",
    "ERROR_KEY_DOES_NOT_EXIST",
    "ERROR_ZERO_BALANCE",
    "ERROR_IP_BANNED",
    "ERROR_ACCOUNT_SUSPENDED",
];

const TERMINAL_POLL_ERRORS: &[&str] = &[
    "ERROR_CAPTCHA_SOLVE_FAILED",
    "ERROR_TASKID_INVALID",
    "ERROR_TASK_TIMEOUT",
    "ERROR_INVALID_TASK_DATA",
    "ERROR_PROXY_BANNED",
    "ERROR_KEY_DENIED_ACCESS",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reply {
    #[serde(default)]
    error_id: u32,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<TaskId>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Value>,
}

impl Reply {
    fn fault(&self, fallback: &str) -> ProviderFault {
        let fault = ProviderFault::new(self.error_code.as_deref().unwrap_or(fallback));
        match &self.error_description {
            Some(description) if !description.is_empty() => {
                fault.with_description(description.clone())
            }
            _ => fault,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapSolverAdapter {
    api_key: String,
    base_url: Url,
}

impl CapSolverAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.clone(),
        }
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    fn call(&self, method: &str, mut body: Map<String, Value>) -> Result<ProviderRequest, AdapterError> {
        body.insert("clientKey".into(), Value::from(self.api_key.as_str()));
        Ok(ProviderRequest::post_json(
            endpoint(&self.base_url, method)?,
            Value::Object(body),
        ))
    }

    /// `scheme:host:port[:login:password]`, the only proxy form CapSolver takes.
    fn proxy_string(proxy: &Proxy) -> String {
        match (&proxy.login, &proxy.password) {
            (Some(login), Some(password)) => format!(
                "{}:{}:{}:{login}:{password}",
                proxy.scheme.as_str(),
                proxy.host,
                proxy.port
            ),
            _ => format!("{}:{}:{}", proxy.scheme.as_str(), proxy.host, proxy.port),
        }
    }

    fn task(descriptor: &TaskDescriptor) -> Map<String, Value> {
        let proxy = descriptor.proxy();
        let suffix = if proxy.is_some() { "" } else { "ProxyLess" };
        let mut task = Map::new();
        let mut set = |key: &str, value: Value| {
            task.insert(key.to_string(), value);
        };

        let task_type = match descriptor.challenge() {
            Challenge::Image(image) => {
                set("body", Value::from(BASE64.encode(&image.body)));
                if image.case_sensitive {
                    set("case", Value::from(true));
                }
                "ImageToTextTask".to_string()
            }
            Challenge::ReCaptchaV2 {
                site_url,
                site_key,
                invisible,
                data_s,
                enterprise,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("websiteKey", Value::from(site_key.as_str()));
                if *invisible {
                    set("isInvisible", Value::from(true));
                }
                if let Some(data_s) = data_s {
                    set("recaptchaDataSValue", Value::from(data_s.as_str()));
                }
                match enterprise {
                    Some(enterprise) => {
                        if !enterprise.payload.is_empty() {
                            set("enterprisePayload", Value::Object(enterprise.payload.clone()));
                        }
                        if let Some(domain) = &enterprise.api_domain {
                            set("apiDomain", Value::from(domain.as_str()));
                        }
                        format!("ReCaptchaV2EnterpriseTask{suffix}")
                    }
                    None => format!("ReCaptchaV2Task{suffix}"),
                }
            }
            Challenge::ReCaptchaV3 {
                site_url,
                site_key,
                action,
                enterprise,
                ..
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("websiteKey", Value::from(site_key.as_str()));
                if let Some(action) = action {
                    set("pageAction", Value::from(action.as_str()));
                }
                if *enterprise {
                    format!("ReCaptchaV3EnterpriseTask{suffix}")
                } else {
                    format!("ReCaptchaV3Task{suffix}")
                }
            }
            Challenge::FunCaptcha {
                site_url,
                public_key,
                service_url,
                data_blob,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("websitePublicKey", Value::from(public_key.as_str()));
                if let Some(service_url) = service_url {
                    set("funcaptchaApiJSSubdomain", Value::from(service_url.as_str()));
                }
                if let Some(blob) = data_blob {
                    set("data", Value::from(json!({ "blob": blob }).to_string()));
                }
                format!("FunCaptchaTask{suffix}")
            }
            Challenge::GeeTestV3 {
                site_url,
                gt,
                challenge,
                api_server,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("gt", Value::from(gt.as_str()));
                set("challenge", Value::from(challenge.as_str()));
                if let Some(api_server) = api_server {
                    set("geetestApiServerSubdomain", Value::from(api_server.as_str()));
                }
                format!("GeeTestTask{suffix}")
            }
            Challenge::GeeTestV4 {
                site_url,
                captcha_id,
                ..
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("captchaId", Value::from(captcha_id.as_str()));
                format!("GeeTestTask{suffix}")
            }
            Challenge::Turnstile {
                site_url,
                site_key,
                action,
                cdata,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("websiteKey", Value::from(site_key.as_str()));
                let mut metadata = Map::new();
                if let Some(action) = action {
                    metadata.insert("action".into(), Value::from(action.as_str()));
                }
                if let Some(cdata) = cdata {
                    metadata.insert("cdata".into(), Value::from(cdata.as_str()));
                }
                if !metadata.is_empty() {
                    set("metadata", Value::Object(metadata));
                }
                "AntiTurnstileTaskProxyLess".to_string()
            }
            Challenge::DataDome {
                site_url,
                captcha_url,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("captchaUrl", Value::from(captcha_url.as_str()));
                "DatadomeSliderTask".to_string()
            }
            Challenge::HCaptcha { .. }
            | Challenge::Capy { .. }
            | Challenge::Lemin { .. }
            | Challenge::Tencent { .. } => String::new(),
        };

        if let Some(user_agent) = descriptor.user_agent() {
            set("userAgent", Value::from(user_agent));
        }
        let proxied = !matches!(
            descriptor.challenge(),
            Challenge::Image(_) | Challenge::Turnstile { .. }
        );
        if proxied && let Some(proxy) = proxy {
            set("proxy", Value::from(Self::proxy_string(proxy)));
        }
        set("type", Value::from(task_type));
        task
    }

    fn read_solution(kind: CaptchaKind, solution: &Value) -> RawSolution {
        let mut raw = RawSolution::new();
        match kind {
            CaptchaKind::Image => raw.insert_json(SolutionField::Text, solution, "text"),
            CaptchaKind::ReCaptchaV2 | CaptchaKind::ReCaptchaV3 => {
                raw.insert_json(SolutionField::Token, solution, "gRecaptchaResponse");
                raw.insert_json(SolutionField::UserAgent, solution, "userAgent");
            }
            CaptchaKind::FunCaptcha | CaptchaKind::Turnstile => {
                raw.insert_json(SolutionField::Token, solution, "token");
                raw.insert_json(SolutionField::UserAgent, solution, "userAgent");
            }
            CaptchaKind::GeeTestV3 => {
                raw.insert_json(SolutionField::Challenge, solution, "challenge");
                raw.insert_json(SolutionField::Validate, solution, "validate");
                raw.insert_json(SolutionField::Seccode, solution, "seccode");
            }
            CaptchaKind::GeeTestV4 => {
                raw.insert_json(SolutionField::CaptchaId, solution, "captcha_id");
                raw.insert_json(SolutionField::LotNumber, solution, "lot_number");
                raw.insert_json(SolutionField::PassToken, solution, "pass_token");
                raw.insert_json(SolutionField::GenTime, solution, "gen_time");
                raw.insert_json(SolutionField::CaptchaOutput, solution, "captcha_output");
            }
            CaptchaKind::DataDome => {
                raw.insert_json(SolutionField::Cookie, solution, "cookie");
                raw.insert_json(SolutionField::UserAgent, solution, "userAgent");
            }
            CaptchaKind::HCaptcha | CaptchaKind::Capy | CaptchaKind::Lemin | CaptchaKind::Tencent => {}
        }
        raw
    }
}

impl ProviderAdapter for CapSolverAdapter {
    fn name(&self) -> &'static str {
        "capsolver"
    }

    fn supports(&self, kind: CaptchaKind) -> bool {
        matches!(
            kind,
            CaptchaKind::Image
                | CaptchaKind::ReCaptchaV2
                | CaptchaKind::ReCaptchaV3
                | CaptchaKind::FunCaptcha
                | CaptchaKind::GeeTestV3
                | CaptchaKind::GeeTestV4
                | CaptchaKind::Turnstile
                | CaptchaKind::DataDome
        )
    }

    fn poll_schedule(&self, _kind: CaptchaKind) -> Option<PollSchedule> {
        Some(PollSchedule::new(
            DelayBand::new(Duration::from_secs(3), Duration::from_secs(5)),
            DelayBand::new(Duration::from_secs(1), Duration::from_secs(3)),
        ))
    }

    fn encode_submission(&self, descriptor: &TaskDescriptor) -> Result<ProviderRequest, AdapterError> {
        let kind = descriptor.kind();
        if !self.supports(kind) {
            return Err(AdapterError::UnsupportedKind {
                provider: self.name(),
                kind,
            });
        }
        descriptor.validate()?;

        let mut body = Map::new();
        body.insert("task".into(), Value::Object(Self::task(descriptor)));
        let options = descriptor.options();
        if let Some(app_id) = options.affiliate_id.as_ref().or(options.soft_id.as_ref()) {
            body.insert("appId".into(), Value::from(app_id.as_str()));
        }
        self.call("createTask", body)
    }

    fn decode_submission(
        &self,
        kind: CaptchaKind,
        response: &GatewayResponse,
    ) -> Result<SubmissionReceipt, SubmissionRejection> {
        let reply: Reply = response.json().map_err(|_| {
            SubmissionRejection::creation(ProviderFault::malformed(&response.text()))
        })?;

        if reply.error_id != 0 {
            let fault = reply.fault("ERROR_UNKNOWN");
            return Err(if AUTH_ERRORS.contains(&fault.code.as_str()) {
                SubmissionRejection::authentication(fault)
            } else {
                SubmissionRejection::creation(fault)
            });
        }

        let Some(task_id) = reply.task_id.clone() else {
            return Err(SubmissionRejection::creation(ProviderFault::malformed(
                &response.text(),
            )));
        };
        let receipt = SubmissionReceipt::new(task_id);
        match (reply.status.as_deref(), &reply.solution) {
            (Some("ready"), Some(solution)) => {
                Ok(receipt.with_solution(Self::read_solution(kind, solution)))
            }
            _ => Ok(receipt),
        }
    }

    fn encode_poll(&self, task_id: &TaskId) -> Result<ProviderRequest, AdapterError> {
        let mut body = Map::new();
        body.insert("taskId".into(), task_id.to_json());
        self.call("getTaskResult", body)
    }

    fn decode_poll(&self, kind: CaptchaKind, response: &GatewayResponse) -> PollOutcome {
        let Ok(reply) = response.json::<Reply>() else {
            log::debug!("capsolver: unparseable poll reply, treating as pending");
            return PollOutcome::Pending;
        };

        if reply.error_id != 0 {
            let fault = reply.fault("ERROR_UNKNOWN");
            if TERMINAL_POLL_ERRORS.contains(&fault.code.as_str()) {
                return PollOutcome::Failed(fault);
            }
            log::debug!("capsolver: non-fatal poll error {fault}, treating as pending");
            return PollOutcome::Pending;
        }

        match reply.status.as_deref() {
            Some("ready") => PollOutcome::Ready(
                reply
                    .solution
                    .as_ref()
                    .map(|solution| Self::read_solution(kind, solution))
                    .unwrap_or_default(),
            ),
            Some("failed") => PollOutcome::Failed(reply.fault("ERROR_TASK_FAILED")),
            _ => PollOutcome::Pending,
        }
    }

    fn encode_feedback(&self, request: &FeedbackRequest) -> Result<ProviderRequest, AdapterError> {
        if !self.supports(request.kind()) {
            return Err(AdapterError::FeedbackUnsupported {
                provider: self.name(),
                kind: request.kind(),
                verdict: request.verdict(),
            });
        }

        let mut result = Map::new();
        result.insert("invalid".into(), Value::from(request.verdict() == Verdict::Bad));
        if let Some(detail) = request.detail() {
            result.insert("message".into(), Value::from(detail));
        }

        let mut body = Map::new();
        body.insert("taskId".into(), request.task_id().to_json());
        body.insert("result".into(), Value::Object(result));
        self.call("feedbackTask", body)
    }

    fn decode_feedback(&self, response: &GatewayResponse) -> FeedbackOutcome {
        let Ok(reply) = response.json::<Reply>() else {
            return FeedbackOutcome::Rejected(ProviderFault::malformed(&response.text()));
        };
        if reply.error_id == 0 {
            return FeedbackOutcome::Accepted;
        }
        match reply.error_code.as_deref() {
            Some("ERROR_TASKID_INVALID" | "ERROR_TASK_NOT_FOUND") => FeedbackOutcome::NotFoundOrExpired,
            _ => FeedbackOutcome::Rejected(reply.fault("ERROR_UNKNOWN")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::providers::RejectionKind;
    use crate::tasks::core::{ImageChallenge, ProxyScheme};

    fn page() -> Url {
        Url::parse("https://shop.test/").unwrap()
    }

    fn reply(body: &str) -> GatewayResponse {
        GatewayResponse::new(200, body.to_string())
    }

    #[test]
    fn image_results_come_back_with_the_receipt() {
        let adapter = CapSolverAdapter::new("CAP-key");
        let receipt = adapter
            .decode_submission(
                CaptchaKind::Image,
                &reply(r#"{"errorId":0,"status":"ready","solution":{"text":"44795sds"},"taskId":"2ffb-11"}"#),
            )
            .unwrap();
        assert_eq!(receipt.task_id, TaskId::from("2ffb-11"));
        assert_eq!(
            receipt.immediate,
            Some(RawSolution::new().with(SolutionField::Text, "44795sds"))
        );
    }

    #[test]
    fn token_tasks_are_polled() {
        let adapter = CapSolverAdapter::new("CAP-key");
        let receipt = adapter
            .decode_submission(CaptchaKind::ReCaptchaV2, &reply(r#"{"errorId":0,"taskId":"abc"}"#))
            .unwrap();
        assert!(receipt.immediate.is_none());

        assert_eq!(
            adapter.decode_poll(CaptchaKind::ReCaptchaV2, &reply(r#"{"errorId":0,"status":"idle"}"#)),
            PollOutcome::Pending
        );
        assert!(matches!(
            adapter.decode_poll(CaptchaKind::ReCaptchaV2, &reply(r#"{"errorId":0,"status":"failed"}"#)),
            PollOutcome::Failed(fault) if fault.code == "ERROR_TASK_FAILED"
        ));
    }

    #[test]
    fn datadome_task_carries_proxy_string() {
        let descriptor = TaskDescriptor::datadome(
            page(),
            Url::parse("https://geo.captcha-delivery.com/captcha/?initialCid=x").unwrap(),
        )
        .with_proxy(Proxy::new(ProxyScheme::Http, "1.1.1.1", 8000).with_credentials("u", "p"))
        .with_user_agent("Mozilla/5.0");
        let call = CapSolverAdapter::new("CAP-key").encode_submission(&descriptor).unwrap();
        let task = &call.json_body().unwrap()["task"];
        assert_eq!(task["type"], "DatadomeSliderTask");
        assert_eq!(task["proxy"], "http:1.1.1.1:8000:u:p");
        assert_eq!(task["userAgent"], "Mozilla/5.0");
    }

    #[test]
    fn image_and_turnstile_types() {
        let adapter = CapSolverAdapter::new("CAP-key");
        let image = adapter
            .encode_submission(&TaskDescriptor::image(ImageChallenge::new(b"gif".to_vec())))
            .unwrap();
        assert_eq!(image.json_body().unwrap()["task"]["type"], "ImageToTextTask");

        let turnstile = adapter
            .encode_submission(&TaskDescriptor::turnstile(page(), "0x4AAA"))
            .unwrap();
        assert_eq!(
            turnstile.json_body().unwrap()["task"]["type"],
            "AntiTurnstileTaskProxyLess"
        );
    }

    #[test]
    fn auth_and_feedback_codes() {
        let adapter = CapSolverAdapter::new("CAP-key");
        let rejection = adapter
            .decode_submission(
                CaptchaKind::Turnstile,
                &reply(r#"{"errorId":1,"errorCode":"ERROR_KEY_DENIED_ACCESS","errorDescription":"bad key"}"#),
            )
            .unwrap_err();
        assert_eq!(rejection.kind, RejectionKind::Authentication);

        let request = FeedbackRequest::new(TaskId::from("abc"), CaptchaKind::Turnstile, Verdict::Bad);
        let call = adapter.encode_feedback(&request).unwrap();
        assert_eq!(call.json_body().unwrap()["result"]["invalid"], true);
        assert_eq!(
            adapter.decode_feedback(&reply(r#"{"errorId":1,"errorCode":"ERROR_TASKID_INVALID"}"#)),
            FeedbackOutcome::NotFoundOrExpired
        );
    }
}
