//! Adapter for the `createTask` / `getTaskResult` JSON protocol spoken by
//! Anti-Captcha and CapMonster Cloud.

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
    CaptchaKind, Challenge, CharacterSet, DelayBand, GatewayResponse, PollSchedule,
    ProviderRequest, SessionContext, TaskDescriptor, TaskId,
};
use crate::tasks::feedback::{FeedbackRequest, Verdict};

static ANTICAPTCHA_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://api.anti-captcha.com/").expect("invalid anti-captcha url"));
static CAPMONSTER_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://api.capmonster.cloud/").expect("invalid capmonster url"));

const AUTH_ERRORS: &[&str] = &[
    "ERROR_KEY_DOES_NOT_EXIST",
    "ERROR_ZERO_BALANCE",
    "ERROR_IP_NOT_ALLOWED",
    "ERROR_IP_BLOCKED",
    "ERROR_ACCOUNT_SUSPENDED",
];

const TERMINAL_POLL_ERRORS: &[&str] = &[
    "ERROR_CAPTCHA_UNSOLVABLE",
    "ERROR_NO_SUCH_CAPCHA_ID",
    "ERROR_TASK_ABSENT",
    "ERROR_TASK_NOT_SUPPORTED",
    "ERROR_KEY_DOES_NOT_EXIST",
    "ERROR_PROXY_CONNECT_REFUSED",
    "ERROR_PROXY_CONNECT_TIMEOUT",
    "ERROR_PROXY_BANNED",
    "ERROR_PROXY_TRANSPARENT",
    "ERROR_RECAPTCHA_INVALID_SITEKEY",
    "ERROR_RECAPTCHA_INVALID_DOMAIN",
    "ERROR_TOKEN_EXPIRED",
    "ERROR_FAILED_LOADING_WIDGET",
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
    fn fault(&self) -> ProviderFault {
        let fault = ProviderFault::new(
            self.error_code
                .clone()
                .unwrap_or_else(|| format!("ERROR_ID_{}", self.error_id)),
        );
        match &self.error_description {
            Some(description) => fault.with_description(description.clone()),
            None => fault,
        }
    }
}

/// Anti-Captcha style JSON API client.
#[derive(Debug, Clone)]
pub struct AntiCaptchaAdapter {
    name: &'static str,
    api_key: String,
    base_url: Url,
}

impl AntiCaptchaAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "anticaptcha",
            api_key: api_key.into(),
            base_url: ANTICAPTCHA_URL.clone(),
        }
    }

    /// CapMonster Cloud speaks the same protocol on its own host.
    pub fn capmonster(api_key: impl Into<String>) -> Self {
        Self {
            name: "capmonster",
            api_key: api_key.into(),
            base_url: CAPMONSTER_URL.clone(),
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

    /// Task object without session fields; returns the base type name.
    fn task_body(challenge: &Challenge) -> (&'static str, Map<String, Value>) {
        let mut task = Map::new();
        let mut set = |key: &str, value: Value| {
            task.insert(key.to_string(), value);
        };

        let task_type = match challenge {
            Challenge::Image(image) => {
                set("body", Value::from(BASE64.encode(&image.body)));
                set("phrase", Value::from(image.phrase));
                set("case", Value::from(image.case_sensitive));
                set("math", Value::from(image.math));
                let numeric = match image.characters {
                    CharacterSet::Any => 0,
                    CharacterSet::NumbersOnly => 1,
                    CharacterSet::LettersOnly => 2,
                };
                set("numeric", Value::from(numeric));
                if let Some(min) = image.min_length {
                    set("minLength", Value::from(min));
                }
                if let Some(max) = image.max_length {
                    set("maxLength", Value::from(max));
                }
                if let Some(comment) = &image.comment {
                    set("comment", Value::from(comment.as_str()));
                }
                "ImageToTextTask"
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
                        "RecaptchaV2EnterpriseTask"
                    }
                    None => "RecaptchaV2Task",
                }
            }
            Challenge::ReCaptchaV3 {
                site_url,
                site_key,
                action,
                min_score,
                enterprise,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("websiteKey", Value::from(site_key.as_str()));
                set("minScore", Value::from((f64::from(*min_score) * 10.0).round() / 10.0));
                if let Some(action) = action {
                    set("pageAction", Value::from(action.as_str()));
                }
                set("isEnterprise", Value::from(*enterprise));
                "RecaptchaV3Task"
            }
            Challenge::HCaptcha {
                site_url,
                site_key,
                invisible,
                enterprise,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("websiteKey", Value::from(site_key.as_str()));
                if *invisible {
                    set("isInvisible", Value::from(true));
                }
                if let Some(enterprise) = enterprise
                    && !enterprise.payload.is_empty()
                {
                    set("enterprisePayload", Value::Object(enterprise.payload.clone()));
                }
                "HCaptchaTask"
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
                "FunCaptchaTask"
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
                "GeeTestTask"
            }
            Challenge::GeeTestV4 {
                site_url,
                captcha_id,
                init_parameters,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("gt", Value::from(captcha_id.as_str()));
                set("version", Value::from(4));
                if !init_parameters.is_empty() {
                    set("initParameters", Value::Object(init_parameters.clone()));
                }
                "GeeTestTask"
            }
            Challenge::Turnstile {
                site_url,
                site_key,
                action,
                cdata,
            } => {
                set("websiteURL", Value::from(site_url.as_str()));
                set("websiteKey", Value::from(site_key.as_str()));
                if let Some(action) = action {
                    set("action", Value::from(action.as_str()));
                }
                if let Some(cdata) = cdata {
                    set("cData", Value::from(cdata.as_str()));
                }
                "TurnstileTask"
            }
            Challenge::DataDome { .. }
            | Challenge::Capy { .. }
            | Challenge::Lemin { .. }
            | Challenge::Tencent { .. } => "",
        };

        (task_type, task)
    }

    fn apply_session(
        task_type: &'static str,
        session: &SessionContext,
        task: &mut Map<String, Value>,
    ) -> String {
        if let Some(user_agent) = &session.user_agent {
            task.insert("userAgent".into(), Value::from(user_agent.as_str()));
        }
        if let Some(cookies) = &session.cookies {
            task.insert("cookies".into(), Value::from(cookies.as_str()));
        }

        // Image recognition and v3 scoring never run through a caller proxy.
        if task_type == "ImageToTextTask" {
            return task_type.to_string();
        }
        if task_type == "RecaptchaV3Task" {
            return format!("{task_type}Proxyless");
        }

        match &session.proxy {
            Some(proxy) => {
                task.insert("proxyType".into(), Value::from(proxy.scheme.as_str()));
                task.insert("proxyAddress".into(), Value::from(proxy.host.as_str()));
                task.insert("proxyPort".into(), Value::from(proxy.port));
                if let Some(login) = &proxy.login {
                    task.insert("proxyLogin".into(), Value::from(login.as_str()));
                }
                if let Some(password) = &proxy.password {
                    task.insert("proxyPassword".into(), Value::from(password.as_str()));
                }
                task_type.to_string()
            }
            None => format!("{task_type}Proxyless"),
        }
    }

    fn read_solution(kind: CaptchaKind, solution: &Value) -> RawSolution {
        let mut raw = RawSolution::new();
        match kind {
            CaptchaKind::Image => raw.insert_json(SolutionField::Text, solution, "text"),
            CaptchaKind::ReCaptchaV2 | CaptchaKind::ReCaptchaV3 | CaptchaKind::HCaptcha => {
                raw.insert_json(SolutionField::Token, solution, "gRecaptchaResponse");
                raw.insert_json(SolutionField::RespKey, solution, "respKey");
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
            CaptchaKind::DataDome | CaptchaKind::Capy | CaptchaKind::Lemin | CaptchaKind::Tencent => {}
        }
        raw
    }
}

impl ProviderAdapter for AntiCaptchaAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, kind: CaptchaKind) -> bool {
        matches!(
            kind,
            CaptchaKind::Image
                | CaptchaKind::ReCaptchaV2
                | CaptchaKind::ReCaptchaV3
                | CaptchaKind::HCaptcha
                | CaptchaKind::FunCaptcha
                | CaptchaKind::GeeTestV3
                | CaptchaKind::GeeTestV4
                | CaptchaKind::Turnstile
        )
    }

    fn poll_schedule(&self, kind: CaptchaKind) -> Option<PollSchedule> {
        let initial = if kind.is_token_based() {
            DelayBand::new(Duration::from_secs(10), Duration::from_secs(12))
        } else {
            DelayBand::new(Duration::from_secs(3), Duration::from_secs(5))
        };
        Some(PollSchedule::new(
            initial,
            DelayBand::new(Duration::from_secs(2), Duration::from_secs(3)),
        ))
    }

    fn encode_submission(&self, descriptor: &TaskDescriptor) -> Result<ProviderRequest, AdapterError> {
        let kind = descriptor.kind();
        if !self.supports(kind) {
            return Err(AdapterError::UnsupportedKind {
                provider: self.name,
                kind,
            });
        }
        descriptor.validate()?;

        let (base_type, mut task) = Self::task_body(descriptor.challenge());
        let task_type = Self::apply_session(base_type, descriptor.session(), &mut task);
        task.insert("type".into(), Value::from(task_type));

        let mut body = Map::new();
        body.insert("task".into(), Value::Object(task));
        let options = descriptor.options();
        if let Some(soft_id) = &options.soft_id {
            let soft_id = soft_id
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(soft_id.as_str()));
            body.insert("softId".into(), soft_id);
        }
        if let Some(language) = &options.language {
            body.insert("languagePool".into(), Value::from(language.as_str()));
        }
        self.call("createTask", body)
    }

    fn decode_submission(
        &self,
        _kind: CaptchaKind,
        response: &GatewayResponse,
    ) -> Result<SubmissionReceipt, SubmissionRejection> {
        let reply: Reply = response.json().map_err(|_| {
            SubmissionRejection::creation(ProviderFault::malformed(&response.text()))
        })?;

        if reply.error_id != 0 {
            let fault = reply.fault();
            return Err(if AUTH_ERRORS.contains(&fault.code.as_str()) {
                SubmissionRejection::authentication(fault)
            } else {
                SubmissionRejection::creation(fault)
            });
        }

        reply
            .task_id
            .map(SubmissionReceipt::new)
            .ok_or_else(|| SubmissionRejection::creation(ProviderFault::malformed(&response.text())))
    }

    fn encode_poll(&self, task_id: &TaskId) -> Result<ProviderRequest, AdapterError> {
        let mut body = Map::new();
        body.insert("taskId".into(), task_id.to_json());
        self.call("getTaskResult", body)
    }

    fn decode_poll(&self, kind: CaptchaKind, response: &GatewayResponse) -> PollOutcome {
        let Ok(reply) = response.json::<Reply>() else {
            log::debug!("{}: unparseable poll reply, treating as pending", self.name);
            return PollOutcome::Pending;
        };

        if reply.error_id != 0 {
            let fault = reply.fault();
            if TERMINAL_POLL_ERRORS.contains(&fault.code.as_str()) {
                return PollOutcome::Failed(fault);
            }
            log::debug!("{}: non-fatal poll error {fault}, treating as pending", self.name);
            return PollOutcome::Pending;
        }

        match (reply.status.as_deref(), &reply.solution) {
            (Some("ready"), Some(solution)) => PollOutcome::Ready(Self::read_solution(kind, solution)),
            (Some("ready"), None) => PollOutcome::Ready(RawSolution::new()),
            _ => PollOutcome::Pending,
        }
    }

    fn encode_feedback(&self, request: &FeedbackRequest) -> Result<ProviderRequest, AdapterError> {
        let method = match (request.kind(), request.verdict()) {
            (CaptchaKind::Image, Verdict::Bad) => "reportIncorrectImageCaptcha",
            (CaptchaKind::ReCaptchaV2 | CaptchaKind::ReCaptchaV3, Verdict::Bad) => {
                "reportIncorrectRecaptcha"
            }
            (CaptchaKind::ReCaptchaV2 | CaptchaKind::ReCaptchaV3, Verdict::Good) => {
                "reportCorrectRecaptcha"
            }
            (CaptchaKind::HCaptcha, Verdict::Bad) => "reportIncorrectHcaptcha",
            (kind, verdict) => {
                return Err(AdapterError::FeedbackUnsupported {
                    provider: self.name,
                    kind,
                    verdict,
                });
            }
        };

        let mut body = Map::new();
        body.insert("taskId".into(), request.task_id().to_json());
        self.call(method, body)
    }

    fn decode_feedback(&self, response: &GatewayResponse) -> FeedbackOutcome {
        let Ok(reply) = response.json::<Reply>() else {
            return FeedbackOutcome::Rejected(ProviderFault::malformed(&response.text()));
        };
        if reply.error_id == 0 {
            return FeedbackOutcome::Accepted;
        }
        match reply.error_code.as_deref() {
            Some("ERROR_NO_SUCH_CAPCHA_ID" | "ERROR_TASK_ABSENT" | "ERROR_RECORD_NOT_FOUND") => {
                FeedbackOutcome::NotFoundOrExpired
            }
            _ => FeedbackOutcome::Rejected(reply.fault()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::providers::RejectionKind;
    use crate::tasks::core::{Proxy, ProxyScheme};

    fn page() -> Url {
        Url::parse("https://shop.test/checkout").unwrap()
    }

    fn reply(body: &str) -> GatewayResponse {
        GatewayResponse::new(200, body.to_string())
    }

    #[test]
    fn proxyless_suffix_follows_session() {
        let adapter = AntiCaptchaAdapter::new("key");
        let bare = adapter
            .encode_submission(&TaskDescriptor::recaptcha_v2(page(), "site"))
            .unwrap();
        let task = &bare.json_body().unwrap()["task"];
        assert_eq!(task["type"], "RecaptchaV2TaskProxyless");
        assert_eq!(task["websiteKey"], "site");
        assert_eq!(bare.json_body().unwrap()["clientKey"], "key");
        assert_eq!(bare.url.as_str(), "https://api.anti-captcha.com/createTask");

        let proxied = adapter
            .encode_submission(
                &TaskDescriptor::hcaptcha(page(), "site")
                    .with_proxy(Proxy::new(ProxyScheme::Http, "10.1.1.1", 3128)),
            )
            .unwrap();
        let task = &proxied.json_body().unwrap()["task"];
        assert_eq!(task["type"], "HCaptchaTask");
        assert_eq!(task["proxyAddress"], "10.1.1.1");
        assert_eq!(task["proxyPort"], 3128);
    }

    #[test]
    fn capmonster_uses_its_own_host() {
        let adapter = AntiCaptchaAdapter::capmonster("key");
        let call = adapter.encode_poll(&TaskId::from(7u64)).unwrap();
        assert_eq!(call.url.as_str(), "https://api.capmonster.cloud/getTaskResult");
        assert_eq!(call.json_body().unwrap()["taskId"], 7);
        assert_eq!(adapter.name(), "capmonster");
    }

    #[test]
    fn unsupported_kinds_are_refused_before_encoding() {
        let adapter = AntiCaptchaAdapter::new("key");
        let descriptor = TaskDescriptor::tencent(page(), "190014885");
        assert!(!adapter.supports(CaptchaKind::Tencent));
        assert!(matches!(
            adapter.encode_submission(&descriptor),
            Err(AdapterError::UnsupportedKind { .. })
        ));
    }

    #[test]
    fn creation_errors() {
        let adapter = AntiCaptchaAdapter::new("key");
        let auth = adapter
            .decode_submission(
                CaptchaKind::Image,
                &reply(r#"{"errorId":1,"errorCode":"ERROR_ZERO_BALANCE","errorDescription":"no funds"}"#),
            )
            .unwrap_err();
        assert_eq!(auth.kind, RejectionKind::Authentication);

        let receipt = adapter
            .decode_submission(CaptchaKind::Image, &reply(r#"{"errorId":0,"taskId":7654321}"#))
            .unwrap();
        assert_eq!(receipt.task_id, TaskId::from(7654321u64));
    }

    #[test]
    fn poll_reads_token_solution() {
        let adapter = AntiCaptchaAdapter::new("key");
        assert_eq!(
            adapter.decode_poll(CaptchaKind::HCaptcha, &reply(r#"{"errorId":0,"status":"processing"}"#)),
            PollOutcome::Pending
        );
        let outcome = adapter.decode_poll(
            CaptchaKind::HCaptcha,
            &reply(
                r#"{"errorId":0,"status":"ready","solution":{"gRecaptchaResponse":"P1_abc","respKey":"E0_x","userAgent":"UA"}}"#,
            ),
        );
        assert_eq!(
            outcome,
            PollOutcome::Ready(
                RawSolution::new()
                    .with(SolutionField::Token, "P1_abc")
                    .with(SolutionField::RespKey, "E0_x")
                    .with(SolutionField::UserAgent, "UA")
            )
        );
        assert!(matches!(
            adapter.decode_poll(
                CaptchaKind::HCaptcha,
                &reply(r#"{"errorId":12,"errorCode":"ERROR_CAPTCHA_UNSOLVABLE"}"#)
            ),
            PollOutcome::Failed(_)
        ));
    }

    #[test]
    fn feedback_methods_depend_on_kind() {
        let adapter = AntiCaptchaAdapter::new("key");
        let good = FeedbackRequest::new(TaskId::from(1u64), CaptchaKind::ReCaptchaV2, Verdict::Good);
        assert!(adapter
            .encode_feedback(&good)
            .unwrap()
            .url
            .as_str()
            .ends_with("reportCorrectRecaptcha"));

        let turnstile = FeedbackRequest::new(TaskId::from(1u64), CaptchaKind::Turnstile, Verdict::Bad);
        assert!(matches!(
            adapter.encode_feedback(&turnstile),
            Err(AdapterError::FeedbackUnsupported { .. })
        ));
        assert_eq!(
            adapter.decode_feedback(&reply(r#"{"errorId":16,"errorCode":"ERROR_NO_SUCH_CAPCHA_ID"}"#)),
            FeedbackOutcome::NotFoundOrExpired
        );
    }
}
