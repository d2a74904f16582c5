//! Adapter for the 2Captcha form API (`in.php` / `res.php`).
//!
//! Submissions are urlencoded forms with a `method` naming the captcha type;
//! every reply is `{"status": 0|1, "request": ...}` when `json=1` is sent.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::{
    AdapterError, FeedbackOutcome, PollOutcome, ProviderAdapter, ProviderFault, RawSolution,
    SolutionField, SubmissionReceipt, SubmissionRejection, endpoint, json_scalar,
};
use crate::tasks::core::{
    CaptchaKind, Challenge, CharacterSet, DelayBand, GatewayResponse, PollSchedule,
    ProviderRequest, ProxyScheme, TaskDescriptor, TaskId,
};
use crate::tasks::feedback::{FeedbackRequest, Verdict};

static DEFAULT_BASE_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://2captcha.com/").expect("invalid 2captcha base url"));

const NOT_READY: &str = "CAPCHA_NOT_READY";

const AUTH_ERRORS: &[&str] = &[
    "ERROR_WRONG_USER_KEY",
    "ERROR_KEY_DOES_NOT_EXIST",
    "ERROR_ZERO_BALANCE",
    "ERROR_IP_NOT_ALLOWED",
    "IP_BANNED",
    "ERROR_IP_BANNED",
    "ERROR_ACCOUNT_SUSPENDED",
];

/// Poll codes after which the task id is dead.
const TERMINAL_POLL_ERRORS: &[&str] = &[
    "ERROR_CAPTCHA_UNSOLVABLE",
    "ERROR_WRONG_CAPTCHA_ID",
    "ERROR_WRONG_ID_FORMAT",
    "ERROR_BAD_DUPLICATES",
    "ERROR_PROXY_CONNECTION_FAILED",
    "ERROR_WRONG_USER_KEY",
    "ERROR_KEY_DOES_NOT_EXIST",
    "ERROR_EMPTY_ACTION",
];

#[derive(Debug, Deserialize)]
struct Reply {
    status: u8,
    request: Value,
    #[serde(default)]
    error_text: Option<String>,
    #[serde(default)]
    useragent: Option<String>,
    #[serde(default, rename = "respKey")]
    resp_key: Option<String>,
}

impl Reply {
    fn code(&self) -> String {
        json_scalar(&self.request).unwrap_or_default()
    }

    fn fault(&self) -> ProviderFault {
        let fault = ProviderFault::new(self.code());
        match &self.error_text {
            Some(text) if !text.is_empty() => fault.with_description(text.clone()),
            _ => fault,
        }
    }
}

/// 2Captcha (and its rucaptcha mirror) adapter.
#[derive(Debug, Clone)]
pub struct TwoCaptchaAdapter {
    api_key: String,
    base_url: Url,
}

impl TwoCaptchaAdapter {
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

    fn result_url(&self, action: &str, task_id: &TaskId) -> Result<Url, AdapterError> {
        let mut url = endpoint(&self.base_url, "res.php")?;
        url.query_pairs_mut()
            .append_pair("key", &self.api_key)
            .append_pair("action", action)
            .append_pair("id", &task_id.to_string())
            .append_pair("json", "1");
        Ok(url)
    }

    fn challenge_fields(challenge: &Challenge, fields: &mut Vec<(String, String)>) {
        let mut push = |key: &str, value: String| fields.push((key.to_string(), value));
        let flag = |enabled: bool| if enabled { "1" } else { "0" }.to_string();

        match challenge {
            Challenge::Image(image) => {
                push("method", "base64".into());
                push("body", BASE64.encode(&image.body));
                push("phrase", flag(image.phrase));
                push("regsense", flag(image.case_sensitive));
                push("calc", flag(image.math));
                let numeric = match image.characters {
                    CharacterSet::Any => "0",
                    CharacterSet::NumbersOnly => "1",
                    CharacterSet::LettersOnly => "2",
                };
                push("numeric", numeric.into());
                if let Some(min) = image.min_length {
                    push("min_len", min.to_string());
                }
                if let Some(max) = image.max_length {
                    push("max_len", max.to_string());
                }
                if let Some(comment) = &image.comment {
                    push("textinstructions", comment.clone());
                }
            }
            Challenge::ReCaptchaV2 {
                site_url,
                site_key,
                invisible,
                data_s,
                enterprise,
            } => {
                push("method", "userrecaptcha".into());
                push("googlekey", site_key.clone());
                push("pageurl", site_url.to_string());
                if *invisible {
                    push("invisible", "1".into());
                }
                if let Some(data_s) = data_s {
                    push("data-s", data_s.clone());
                }
                if let Some(enterprise) = enterprise {
                    push("enterprise", "1".into());
                    if let Some(domain) = &enterprise.api_domain {
                        push("domain", domain.clone());
                    }
                }
            }
            Challenge::ReCaptchaV3 {
                site_url,
                site_key,
                action,
                min_score,
                enterprise,
            } => {
                push("method", "userrecaptcha".into());
                push("version", "v3".into());
                push("googlekey", site_key.clone());
                push("pageurl", site_url.to_string());
                push("min_score", format!("{min_score:.1}"));
                if let Some(action) = action {
                    push("action", action.clone());
                }
                if *enterprise {
                    push("enterprise", "1".into());
                }
            }
            Challenge::HCaptcha {
                site_url,
                site_key,
                invisible,
                enterprise,
            } => {
                push("method", "hcaptcha".into());
                push("sitekey", site_key.clone());
                push("pageurl", site_url.to_string());
                if *invisible {
                    push("invisible", "1".into());
                }
                if let Some(rqdata) = enterprise
                    .as_ref()
                    .and_then(|enterprise| enterprise.payload.get("rqdata"))
                    .and_then(json_scalar)
                {
                    push("data", rqdata);
                }
            }
            Challenge::FunCaptcha {
                site_url,
                public_key,
                service_url,
                data_blob,
            } => {
                push("method", "funcaptcha".into());
                push("publickey", public_key.clone());
                push("pageurl", site_url.to_string());
                if let Some(service_url) = service_url {
                    push("surl", service_url.clone());
                }
                if let Some(blob) = data_blob {
                    push("data[blob]", blob.clone());
                }
            }
            Challenge::GeeTestV3 {
                site_url,
                gt,
                challenge,
                api_server,
            } => {
                push("method", "geetest".into());
                push("gt", gt.clone());
                push("challenge", challenge.clone());
                push("pageurl", site_url.to_string());
                if let Some(api_server) = api_server {
                    push("api_server", api_server.clone());
                }
            }
            Challenge::GeeTestV4 {
                site_url,
                captcha_id,
                init_parameters,
            } => {
                push("method", "geetest_v4".into());
                push("captcha_id", captcha_id.clone());
                push("pageurl", site_url.to_string());
                if !init_parameters.is_empty() {
                    push(
                        "init_parameters",
                        Value::Object(init_parameters.clone()).to_string(),
                    );
                }
            }
            Challenge::Turnstile {
                site_url,
                site_key,
                action,
                cdata,
            } => {
                push("method", "turnstile".into());
                push("sitekey", site_key.clone());
                push("pageurl", site_url.to_string());
                if let Some(action) = action {
                    push("action", action.clone());
                }
                if let Some(cdata) = cdata {
                    push("data", cdata.clone());
                }
            }
            Challenge::DataDome {
                site_url,
                captcha_url,
            } => {
                push("method", "datadome".into());
                push("captcha_url", captcha_url.to_string());
                push("pageurl", site_url.to_string());
            }
            Challenge::Capy {
                site_url,
                site_key,
                api_server,
            } => {
                push("method", "capy".into());
                push("captchakey", site_key.clone());
                push("pageurl", site_url.to_string());
                if let Some(api_server) = api_server {
                    push("api_server", api_server.clone());
                }
            }
            Challenge::Lemin {
                site_url,
                captcha_id,
                div_id,
                api_server,
            } => {
                push("method", "lemin".into());
                push("captcha_id", captcha_id.clone());
                push("div_id", div_id.clone());
                push("pageurl", site_url.to_string());
                if let Some(api_server) = api_server {
                    push("api_server", api_server.clone());
                }
            }
            Challenge::Tencent { site_url, app_id } => {
                push("method", "tencent".into());
                push("app_id", app_id.clone());
                push("pageurl", site_url.to_string());
            }
        }
    }

    fn read_solution(kind: CaptchaKind, reply: &Reply) -> RawSolution {
        let mut raw = RawSolution::new();
        let request = &reply.request;
        match kind {
            CaptchaKind::Image => {
                if let Some(text) = json_scalar(request) {
                    raw.insert(SolutionField::Text, text);
                }
            }
            CaptchaKind::ReCaptchaV2
            | CaptchaKind::ReCaptchaV3
            | CaptchaKind::HCaptcha
            | CaptchaKind::FunCaptcha
            | CaptchaKind::Turnstile => {
                if let Some(token) = json_scalar(request) {
                    raw.insert(SolutionField::Token, token);
                }
                if let Some(user_agent) = &reply.useragent {
                    raw.insert(SolutionField::UserAgent, user_agent.clone());
                }
                if let Some(resp_key) = &reply.resp_key {
                    raw.insert(SolutionField::RespKey, resp_key.clone());
                }
            }
            CaptchaKind::DataDome => {
                if let Some(cookie) = json_scalar(request) {
                    raw.insert(SolutionField::Cookie, cookie);
                }
                if let Some(user_agent) = &reply.useragent {
                    raw.insert(SolutionField::UserAgent, user_agent.clone());
                }
            }
            CaptchaKind::GeeTestV3 => {
                raw.insert_json(SolutionField::Challenge, request, "geetest_challenge");
                raw.insert_json(SolutionField::Validate, request, "geetest_validate");
                raw.insert_json(SolutionField::Seccode, request, "geetest_seccode");
            }
            CaptchaKind::GeeTestV4 => {
                raw.insert_json(SolutionField::CaptchaId, request, "captcha_id");
                raw.insert_json(SolutionField::LotNumber, request, "lot_number");
                raw.insert_json(SolutionField::PassToken, request, "pass_token");
                raw.insert_json(SolutionField::GenTime, request, "gen_time");
                raw.insert_json(SolutionField::CaptchaOutput, request, "captcha_output");
            }
            CaptchaKind::Capy => {
                raw.insert_json(SolutionField::CaptchaKey, request, "captchakey");
                raw.insert_json(SolutionField::ChallengeKey, request, "challengekey");
                raw.insert_json(SolutionField::Answer, request, "answer");
            }
            CaptchaKind::Lemin => {
                raw.insert_json(SolutionField::Answer, request, "answer");
                raw.insert_json(SolutionField::ChallengeId, request, "challenge_id");
            }
            CaptchaKind::Tencent => {
                raw.insert_json(SolutionField::Ticket, request, "ticket");
                raw.insert_json(SolutionField::RandStr, request, "randstr");
                raw.insert_json(SolutionField::RandStr, request, "rand_str");
            }
        }
        raw
    }
}

impl ProviderAdapter for TwoCaptchaAdapter {
    fn name(&self) -> &'static str {
        "twocaptcha"
    }

    fn supports(&self, _kind: CaptchaKind) -> bool {
        true
    }

    /// Image answers arrive within seconds; browser-based tokens need 15-20s
    /// before the first check is worth making.
    fn poll_schedule(&self, kind: CaptchaKind) -> Option<PollSchedule> {
        let initial = if kind.is_token_based() {
            DelayBand::new(Duration::from_secs(15), Duration::from_secs(20))
        } else {
            DelayBand::new(Duration::from_secs(5), Duration::from_secs(6))
        };
        Some(PollSchedule::new(initial, DelayBand::fixed(Duration::from_secs(5))))
    }

    fn encode_submission(&self, descriptor: &TaskDescriptor) -> Result<ProviderRequest, AdapterError> {
        descriptor.validate()?;

        let mut fields = vec![
            ("key".to_string(), self.api_key.clone()),
            ("json".to_string(), "1".to_string()),
        ];
        Self::challenge_fields(descriptor.challenge(), &mut fields);

        let session = descriptor.session();
        if let Some(proxy) = &session.proxy {
            let proxy_type = match proxy.scheme {
                ProxyScheme::Http => "HTTP",
                ProxyScheme::Https => "HTTPS",
                ProxyScheme::Socks4 => "SOCKS4",
                ProxyScheme::Socks5 => "SOCKS5",
            };
            fields.push(("proxy".into(), proxy.authority()));
            fields.push(("proxytype".into(), proxy_type.into()));
        }
        if let Some(user_agent) = &session.user_agent {
            fields.push(("userAgent".into(), user_agent.clone()));
        }
        if let Some(cookies) = &session.cookies {
            fields.push(("cookies".into(), cookies.clone()));
        }

        let options = descriptor.options();
        if let Some(soft_id) = &options.soft_id {
            fields.push(("soft_id".into(), soft_id.clone()));
        }
        if let Some(language) = &options.language {
            fields.push(("lang".into(), language.clone()));
        }

        Ok(ProviderRequest::post_form(
            endpoint(&self.base_url, "in.php")?,
            fields,
        ))
    }

    fn decode_submission(
        &self,
        _kind: CaptchaKind,
        response: &GatewayResponse,
    ) -> Result<SubmissionReceipt, SubmissionRejection> {
        let reply: Reply = response.json().map_err(|_| {
            SubmissionRejection::creation(ProviderFault::malformed(&response.text()))
        })?;

        if reply.status == 1 {
            return match json_scalar(&reply.request) {
                Some(id) if !id.is_empty() => Ok(SubmissionReceipt::new(id)),
                _ => Err(SubmissionRejection::creation(ProviderFault::malformed(
                    &response.text(),
                ))),
            };
        }

        let fault = reply.fault();
        if AUTH_ERRORS.contains(&fault.code.as_str()) {
            Err(SubmissionRejection::authentication(fault))
        } else {
            Err(SubmissionRejection::creation(fault))
        }
    }

    fn encode_poll(&self, task_id: &TaskId) -> Result<ProviderRequest, AdapterError> {
        Ok(ProviderRequest::get(self.result_url("get", task_id)?))
    }

    fn decode_poll(&self, kind: CaptchaKind, response: &GatewayResponse) -> PollOutcome {
        let Ok(reply) = response.json::<Reply>() else {
            log::debug!("twocaptcha: unparseable poll reply, treating as pending");
            return PollOutcome::Pending;
        };

        if reply.status == 1 {
            return PollOutcome::Ready(Self::read_solution(kind, &reply));
        }

        let code = reply.code();
        if code == NOT_READY {
            PollOutcome::Pending
        } else if TERMINAL_POLL_ERRORS.contains(&code.as_str()) {
            PollOutcome::Failed(reply.fault())
        } else {
            log::debug!("twocaptcha: unrecognized poll status '{code}', treating as pending");
            PollOutcome::Pending
        }
    }

    fn encode_feedback(&self, request: &FeedbackRequest) -> Result<ProviderRequest, AdapterError> {
        let action = match request.verdict() {
            Verdict::Good => "reportgood",
            Verdict::Bad => "reportbad",
        };
        Ok(ProviderRequest::get(
            self.result_url(action, request.task_id())?,
        ))
    }

    fn decode_feedback(&self, response: &GatewayResponse) -> FeedbackOutcome {
        let Ok(reply) = response.json::<Reply>() else {
            return FeedbackOutcome::Rejected(ProviderFault::malformed(&response.text()));
        };
        if reply.status == 1 {
            return FeedbackOutcome::Accepted;
        }
        match reply.code().as_str() {
            "ERROR_DUPLICATE_REPORT" => FeedbackOutcome::Accepted,
            "ERROR_WRONG_CAPTCHA_ID" | "ERROR_REPORT_NOT_RECORDED" => {
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
    use crate::tasks::core::{ImageChallenge, Proxy};

    fn adapter() -> TwoCaptchaAdapter {
        TwoCaptchaAdapter::new("secret")
    }

    fn reply(body: &str) -> GatewayResponse {
        GatewayResponse::new(200, body.to_string())
    }

    #[test]
    fn image_submission_is_base64_form() {
        let descriptor = TaskDescriptor::image(
            ImageChallenge::new(b"png".to_vec()).with_characters(CharacterSet::NumbersOnly),
        )
        .with_soft_id("4580");
        let request = adapter().encode_submission(&descriptor).unwrap();

        assert_eq!(request.url.as_str(), "https://2captcha.com/in.php");
        assert_eq!(request.form_field("method"), Some("base64"));
        assert_eq!(request.form_field("body"), Some("cG5n"));
        assert_eq!(request.form_field("numeric"), Some("1"));
        assert_eq!(request.form_field("soft_id"), Some("4580"));
        assert_eq!(request.form_field("key"), Some("secret"));
    }

    #[test]
    fn proxy_is_forwarded() {
        let descriptor = TaskDescriptor::hcaptcha(Url::parse("https://shop.test").unwrap(), "site")
            .with_proxy(Proxy::new(ProxyScheme::Socks5, "1.2.3.4", 1080).with_credentials("u", "p"));
        let request = adapter().encode_submission(&descriptor).unwrap();
        assert_eq!(request.form_field("proxy"), Some("u:p@1.2.3.4:1080"));
        assert_eq!(request.form_field("proxytype"), Some("SOCKS5"));
        assert_eq!(request.form_field("method"), Some("hcaptcha"));
    }

    #[test]
    fn submission_errors_are_classified() {
        let auth = adapter()
            .decode_submission(
                CaptchaKind::ReCaptchaV2,
                &reply(r#"{"status":0,"request":"ERROR_WRONG_USER_KEY"}"#),
            )
            .unwrap_err();
        assert_eq!(auth.kind, RejectionKind::Authentication);

        let creation = adapter()
            .decode_submission(
                CaptchaKind::ReCaptchaV2,
                &reply(r#"{"status":0,"request":"ERROR_GOOGLEKEY","error_text":"bad sitekey"}"#),
            )
            .unwrap_err();
        assert_eq!(creation.kind, RejectionKind::Creation);
        assert_eq!(creation.fault.description.as_deref(), Some("bad sitekey"));
    }

    #[test]
    fn poll_statuses() {
        let adapter = adapter();
        assert_eq!(
            adapter.decode_poll(CaptchaKind::Image, &reply(r#"{"status":0,"request":"CAPCHA_NOT_READY"}"#)),
            PollOutcome::Pending
        );
        assert!(matches!(
            adapter.decode_poll(
                CaptchaKind::Image,
                &reply(r#"{"status":0,"request":"ERROR_CAPTCHA_UNSOLVABLE"}"#)
            ),
            PollOutcome::Failed(_)
        ));
        assert_eq!(
            adapter.decode_poll(CaptchaKind::Image, &reply("<html>busy</html>")),
            PollOutcome::Pending
        );
        assert_eq!(
            adapter.decode_poll(
                CaptchaKind::Image,
                &reply(r#"{"status":0,"request":"ERROR_NO_SLOT_AVAILABLE"}"#)
            ),
            PollOutcome::Pending
        );
    }

    #[test]
    fn geetest_object_solution() {
        let outcome = adapter().decode_poll(
            CaptchaKind::GeeTestV3,
            &reply(
                r#"{"status":1,"request":{"geetest_challenge":"c","geetest_validate":"v","geetest_seccode":"s"}}"#,
            ),
        );
        let PollOutcome::Ready(raw) = outcome else {
            panic!("expected ready");
        };
        assert_eq!(raw.get(SolutionField::Validate), Some("v"));
        assert_eq!(raw.get(SolutionField::Seccode), Some("s"));
    }

    #[test]
    fn feedback_routes_to_report_actions() {
        let request = FeedbackRequest::new(TaskId::from("42"), CaptchaKind::Image, Verdict::Bad);
        let call = adapter().encode_feedback(&request).unwrap();
        let query: Vec<(String, String)> = call.url.query_pairs().into_owned().collect();
        assert!(query.contains(&("action".into(), "reportbad".into())));
        assert!(query.contains(&("id".into(), "42".into())));

        assert_eq!(
            adapter().decode_feedback(&reply(r#"{"status":1,"request":"OK_REPORT_RECORDED"}"#)),
            FeedbackOutcome::Accepted
        );
        assert_eq!(
            adapter().decode_feedback(&reply(r#"{"status":0,"request":"ERROR_WRONG_CAPTCHA_ID"}"#)),
            FeedbackOutcome::NotFoundOrExpired
        );
    }
}
