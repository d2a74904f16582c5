//! Provider-agnostic description of a captcha to solve.
//!
//! A [`TaskDescriptor`] is built by the caller, validated once, and consumed
//! by a single solve. The [`Challenge`] tagged union carries exactly the site
//! parameters each captcha kind needs, so adapters never have to guess which
//! optional fields are meaningful.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

/// Closed set of captcha families the broker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptchaKind {
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "recaptcha_v2")]
    ReCaptchaV2,
    #[serde(rename = "recaptcha_v3")]
    ReCaptchaV3,
    #[serde(rename = "hcaptcha")]
    HCaptcha,
    #[serde(rename = "funcaptcha")]
    FunCaptcha,
    #[serde(rename = "geetest_v3")]
    GeeTestV3,
    #[serde(rename = "geetest_v4")]
    GeeTestV4,
    #[serde(rename = "turnstile")]
    Turnstile,
    #[serde(rename = "datadome")]
    DataDome,
    #[serde(rename = "capy")]
    Capy,
    #[serde(rename = "lemin")]
    Lemin,
    #[serde(rename = "tencent")]
    Tencent,
}

impl CaptchaKind {
    pub const ALL: [CaptchaKind; 12] = [
        CaptchaKind::Image,
        CaptchaKind::ReCaptchaV2,
        CaptchaKind::ReCaptchaV3,
        CaptchaKind::HCaptcha,
        CaptchaKind::FunCaptcha,
        CaptchaKind::GeeTestV3,
        CaptchaKind::GeeTestV4,
        CaptchaKind::Turnstile,
        CaptchaKind::DataDome,
        CaptchaKind::Capy,
        CaptchaKind::Lemin,
        CaptchaKind::Tencent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaKind::Image => "image",
            CaptchaKind::ReCaptchaV2 => "recaptcha_v2",
            CaptchaKind::ReCaptchaV3 => "recaptcha_v3",
            CaptchaKind::HCaptcha => "hcaptcha",
            CaptchaKind::FunCaptcha => "funcaptcha",
            CaptchaKind::GeeTestV3 => "geetest_v3",
            CaptchaKind::GeeTestV4 => "geetest_v4",
            CaptchaKind::Turnstile => "turnstile",
            CaptchaKind::DataDome => "datadome",
            CaptchaKind::Capy => "capy",
            CaptchaKind::Lemin => "lemin",
            CaptchaKind::Tencent => "tencent",
        }
    }

    /// Token-style captchas are solved in a browser context and take longer
    /// than plain image recognition.
    pub fn is_token_based(&self) -> bool {
        !matches!(self, CaptchaKind::Image)
    }
}

impl fmt::Display for CaptchaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character classes accepted by image captcha workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CharacterSet {
    #[default]
    Any,
    NumbersOnly,
    LettersOnly,
}

/// Raw image plus the hints workers use to read it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageChallenge {
    pub body: Vec<u8>,
    pub phrase: bool,
    pub case_sensitive: bool,
    pub characters: CharacterSet,
    pub math: bool,
    pub min_length: Option<u8>,
    pub max_length: Option<u8>,
    pub comment: Option<String>,
}

impl ImageChallenge {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn case_sensitive(mut self, enabled: bool) -> Self {
        self.case_sensitive = enabled;
        self
    }

    pub fn with_characters(mut self, characters: CharacterSet) -> Self {
        self.characters = characters;
        self
    }

    pub fn with_length(mut self, min: Option<u8>, max: Option<u8>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn math(mut self, enabled: bool) -> Self {
        self.math = enabled;
        self
    }

    pub fn phrase(mut self, enabled: bool) -> Self {
        self.phrase = enabled;
        self
    }
}

/// Extra parameters for enterprise editions of reCAPTCHA and hCaptcha.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnterpriseOptions {
    pub payload: Map<String, Value>,
    pub api_domain: Option<String>,
}

/// The captcha itself, one variant per [`CaptchaKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Challenge {
    Image(ImageChallenge),
    ReCaptchaV2 {
        site_url: Url,
        site_key: String,
        invisible: bool,
        data_s: Option<String>,
        enterprise: Option<EnterpriseOptions>,
    },
    ReCaptchaV3 {
        site_url: Url,
        site_key: String,
        action: Option<String>,
        min_score: f32,
        enterprise: bool,
    },
    HCaptcha {
        site_url: Url,
        site_key: String,
        invisible: bool,
        enterprise: Option<EnterpriseOptions>,
    },
    FunCaptcha {
        site_url: Url,
        public_key: String,
        service_url: Option<String>,
        data_blob: Option<String>,
    },
    GeeTestV3 {
        site_url: Url,
        gt: String,
        challenge: String,
        api_server: Option<String>,
    },
    GeeTestV4 {
        site_url: Url,
        captcha_id: String,
        init_parameters: Map<String, Value>,
    },
    Turnstile {
        site_url: Url,
        site_key: String,
        action: Option<String>,
        cdata: Option<String>,
    },
    DataDome {
        site_url: Url,
        captcha_url: Url,
    },
    Capy {
        site_url: Url,
        site_key: String,
        api_server: Option<String>,
    },
    Lemin {
        site_url: Url,
        captcha_id: String,
        div_id: String,
        api_server: Option<String>,
    },
    Tencent {
        site_url: Url,
        app_id: String,
    },
}

impl Challenge {
    pub fn kind(&self) -> CaptchaKind {
        match self {
            Challenge::Image(_) => CaptchaKind::Image,
            Challenge::ReCaptchaV2 { .. } => CaptchaKind::ReCaptchaV2,
            Challenge::ReCaptchaV3 { .. } => CaptchaKind::ReCaptchaV3,
            Challenge::HCaptcha { .. } => CaptchaKind::HCaptcha,
            Challenge::FunCaptcha { .. } => CaptchaKind::FunCaptcha,
            Challenge::GeeTestV3 { .. } => CaptchaKind::GeeTestV3,
            Challenge::GeeTestV4 { .. } => CaptchaKind::GeeTestV4,
            Challenge::Turnstile { .. } => CaptchaKind::Turnstile,
            Challenge::DataDome { .. } => CaptchaKind::DataDome,
            Challenge::Capy { .. } => CaptchaKind::Capy,
            Challenge::Lemin { .. } => CaptchaKind::Lemin,
            Challenge::Tencent { .. } => CaptchaKind::Tencent,
        }
    }

    /// Page hosting the widget, absent only for image captchas.
    pub fn site_url(&self) -> Option<&Url> {
        match self {
            Challenge::Image(_) => None,
            Challenge::ReCaptchaV2 { site_url, .. }
            | Challenge::ReCaptchaV3 { site_url, .. }
            | Challenge::HCaptcha { site_url, .. }
            | Challenge::FunCaptcha { site_url, .. }
            | Challenge::GeeTestV3 { site_url, .. }
            | Challenge::GeeTestV4 { site_url, .. }
            | Challenge::Turnstile { site_url, .. }
            | Challenge::DataDome { site_url, .. }
            | Challenge::Capy { site_url, .. }
            | Challenge::Lemin { site_url, .. }
            | Challenge::Tencent { site_url, .. } => Some(site_url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

/// Proxy the solving worker should route through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl Proxy {
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            login: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.password = Some(password.into());
        self
    }

    /// `login:password@host:port`, or `host:port` without credentials.
    pub fn authority(&self) -> String {
        match (&self.login, &self.password) {
            (Some(login), Some(password)) => {
                format!("{login}:{password}@{}:{}", self.host, self.port)
            }
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Browser session the token will be replayed from. Read-only to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionContext {
    pub proxy: Option<Proxy>,
    pub user_agent: Option<String>,
    pub cookies: Option<String>,
}

/// Per-call options that are not part of the captcha itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskOptions {
    pub language: Option<String>,
    pub soft_id: Option<String>,
    pub affiliate_id: Option<String>,
    pub timeout: Option<Duration>,
}

/// Immutable description of one captcha solve.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    challenge: Challenge,
    session: SessionContext,
    options: TaskOptions,
}

impl TaskDescriptor {
    pub fn new(challenge: Challenge) -> Self {
        Self {
            challenge,
            session: SessionContext::default(),
            options: TaskOptions::default(),
        }
    }

    pub fn image(image: ImageChallenge) -> Self {
        Self::new(Challenge::Image(image))
    }

    pub fn recaptcha_v2(site_url: Url, site_key: impl Into<String>) -> Self {
        Self::new(Challenge::ReCaptchaV2 {
            site_url,
            site_key: site_key.into(),
            invisible: false,
            data_s: None,
            enterprise: None,
        })
    }

    pub fn recaptcha_v3(
        site_url: Url,
        site_key: impl Into<String>,
        action: Option<String>,
        min_score: f32,
    ) -> Self {
        Self::new(Challenge::ReCaptchaV3 {
            site_url,
            site_key: site_key.into(),
            action,
            min_score,
            enterprise: false,
        })
    }

    pub fn hcaptcha(site_url: Url, site_key: impl Into<String>) -> Self {
        Self::new(Challenge::HCaptcha {
            site_url,
            site_key: site_key.into(),
            invisible: false,
            enterprise: None,
        })
    }

    pub fn funcaptcha(site_url: Url, public_key: impl Into<String>) -> Self {
        Self::new(Challenge::FunCaptcha {
            site_url,
            public_key: public_key.into(),
            service_url: None,
            data_blob: None,
        })
    }

    pub fn geetest_v3(site_url: Url, gt: impl Into<String>, challenge: impl Into<String>) -> Self {
        Self::new(Challenge::GeeTestV3 {
            site_url,
            gt: gt.into(),
            challenge: challenge.into(),
            api_server: None,
        })
    }

    pub fn geetest_v4(site_url: Url, captcha_id: impl Into<String>) -> Self {
        Self::new(Challenge::GeeTestV4 {
            site_url,
            captcha_id: captcha_id.into(),
            init_parameters: Map::new(),
        })
    }

    pub fn turnstile(site_url: Url, site_key: impl Into<String>) -> Self {
        Self::new(Challenge::Turnstile {
            site_url,
            site_key: site_key.into(),
            action: None,
            cdata: None,
        })
    }

    pub fn datadome(site_url: Url, captcha_url: Url) -> Self {
        Self::new(Challenge::DataDome {
            site_url,
            captcha_url,
        })
    }

    pub fn capy(site_url: Url, site_key: impl Into<String>) -> Self {
        Self::new(Challenge::Capy {
            site_url,
            site_key: site_key.into(),
            api_server: None,
        })
    }

    pub fn lemin(site_url: Url, captcha_id: impl Into<String>, div_id: impl Into<String>) -> Self {
        Self::new(Challenge::Lemin {
            site_url,
            captcha_id: captcha_id.into(),
            div_id: div_id.into(),
            api_server: None,
        })
    }

    pub fn tencent(site_url: Url, app_id: impl Into<String>) -> Self {
        Self::new(Challenge::Tencent {
            site_url,
            app_id: app_id.into(),
        })
    }

    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.session.proxy = Some(proxy);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.session.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_cookies(mut self, cookies: impl Into<String>) -> Self {
        self.session.cookies = Some(cookies.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.options.language = Some(language.into());
        self
    }

    pub fn with_soft_id(mut self, soft_id: impl Into<String>) -> Self {
        self.options.soft_id = Some(soft_id.into());
        self
    }

    pub fn with_affiliate_id(mut self, affiliate_id: impl Into<String>) -> Self {
        self.options.affiliate_id = Some(affiliate_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> CaptchaKind {
        self.challenge.kind()
    }

    pub fn challenge(&self) -> &Challenge {
        &self.challenge
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.session.proxy.as_ref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.session.user_agent.as_deref()
    }

    /// Checks the invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let kind = self.kind();
        match &self.challenge {
            Challenge::Image(image) => {
                if image.body.is_empty() {
                    return Err(DescriptorError::EmptyImage);
                }
                if let (Some(min), Some(max)) = (image.min_length, image.max_length)
                    && min > max
                {
                    return Err(DescriptorError::InvalidLengthRange { min, max });
                }
            }
            Challenge::ReCaptchaV2 { site_key, .. }
            | Challenge::HCaptcha { site_key, .. }
            | Challenge::Turnstile { site_key, .. }
            | Challenge::Capy { site_key, .. } => require(kind, "site_key", site_key)?,
            Challenge::ReCaptchaV3 {
                site_key,
                min_score,
                ..
            } => {
                require(kind, "site_key", site_key)?;
                if !(0.1..=0.9).contains(min_score) {
                    return Err(DescriptorError::InvalidMinScore(*min_score));
                }
            }
            Challenge::FunCaptcha { public_key, .. } => require(kind, "public_key", public_key)?,
            Challenge::GeeTestV3 { gt, challenge, .. } => {
                require(kind, "gt", gt)?;
                require(kind, "challenge", challenge)?;
            }
            Challenge::GeeTestV4 { captcha_id, .. } => require(kind, "captcha_id", captcha_id)?,
            Challenge::DataDome { .. } => {
                if self.session.proxy.is_none() {
                    return Err(DescriptorError::ProxyRequired(kind));
                }
                if self.user_agent().is_none_or(str::is_empty) {
                    return Err(DescriptorError::UserAgentRequired(kind));
                }
            }
            Challenge::Lemin {
                captcha_id, div_id, ..
            } => {
                require(kind, "captcha_id", captcha_id)?;
                require(kind, "div_id", div_id)?;
            }
            Challenge::Tencent { app_id, .. } => require(kind, "app_id", app_id)?,
        }

        if let Some(proxy) = &self.session.proxy {
            if proxy.host.trim().is_empty() {
                return Err(DescriptorError::MissingField {
                    kind,
                    field: "proxy.host",
                });
            }
            if proxy.port == 0 {
                return Err(DescriptorError::InvalidProxyPort);
            }
        }

        Ok(())
    }
}

fn require(kind: CaptchaKind, field: &'static str, value: &str) -> Result<(), DescriptorError> {
    if value.trim().is_empty() {
        Err(DescriptorError::MissingField { kind, field })
    } else {
        Ok(())
    }
}

/// Descriptor shapes rejected before anything is sent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DescriptorError {
    #[error("{kind} task is missing required field '{field}'")]
    MissingField {
        kind: CaptchaKind,
        field: &'static str,
    },
    #[error("image captcha body is empty")]
    EmptyImage,
    #[error("image length range {min}..{max} is inverted")]
    InvalidLengthRange { min: u8, max: u8 },
    #[error("reCAPTCHA v3 min score {0} is outside 0.1..=0.9")]
    InvalidMinScore(f32),
    #[error("{0} tasks require a proxy")]
    ProxyRequired(CaptchaKind),
    #[error("{0} tasks require a user agent")]
    UserAgentRequired(CaptchaKind),
    #[error("proxy port must be non-zero")]
    InvalidProxyPort,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://example.com/login").unwrap()
    }

    #[test]
    fn kinds_round_trip_through_their_names() {
        for kind in CaptchaKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn empty_site_key_fails_fast() {
        let descriptor = TaskDescriptor::recaptcha_v2(page(), "  ");
        assert_eq!(
            descriptor.validate(),
            Err(DescriptorError::MissingField {
                kind: CaptchaKind::ReCaptchaV2,
                field: "site_key"
            })
        );
    }

    #[test]
    fn min_score_is_bounded() {
        let descriptor = TaskDescriptor::recaptcha_v3(page(), "key", None, 0.95);
        assert!(matches!(
            descriptor.validate(),
            Err(DescriptorError::InvalidMinScore(_))
        ));
        let descriptor = TaskDescriptor::recaptcha_v3(page(), "key", Some("login".into()), 0.3);
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn datadome_needs_proxy_and_user_agent() {
        let captcha_url = Url::parse("https://geo.captcha-delivery.com/captcha/").unwrap();
        let descriptor = TaskDescriptor::datadome(page(), captcha_url);
        assert_eq!(
            descriptor.clone().validate(),
            Err(DescriptorError::ProxyRequired(CaptchaKind::DataDome))
        );

        let with_proxy = descriptor.with_proxy(Proxy::new(ProxyScheme::Http, "10.0.0.1", 8080));
        assert_eq!(
            with_proxy.clone().validate(),
            Err(DescriptorError::UserAgentRequired(CaptchaKind::DataDome))
        );
        assert!(with_proxy.with_user_agent("Mozilla/5.0").validate().is_ok());
    }

    #[test]
    fn image_requires_bytes() {
        let descriptor = TaskDescriptor::image(ImageChallenge::new(Vec::new()));
        assert_eq!(descriptor.validate(), Err(DescriptorError::EmptyImage));
    }

    #[test]
    fn proxy_authority_includes_credentials() {
        let proxy = Proxy::new(ProxyScheme::Socks5, "proxy.local", 1080).with_credentials("u", "p");
        assert_eq!(proxy.authority(), "u:p@proxy.local:1080");
        assert_eq!(
            Proxy::new(ProxyScheme::Http, "proxy.local", 3128).authority(),
            "proxy.local:3128"
        );
    }
}
