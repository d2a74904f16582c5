//! Broker settings.
//!
//! Settings can be loaded from a JSON document, a JSON file, or
//! `CAPTCHA_BROKER_*` environment variables. Everything except the provider
//! and API key has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::external_deps::providers::{ProviderKind, UnknownProvider};
use crate::tasks::core::reqwest_gateway::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::tasks::core::{DelayBand, PollSchedule};
use crate::tasks::lifecycle::EngineConfig;

const ENV_PREFIX: &str = "CAPTCHA_BROKER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("environment variable {0} is not set")]
    MissingVar(String),
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidVar { name: String, value: String },
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    #[error("api key must not be empty")]
    EmptyApiKey,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Everything needed to build a [`CaptchaBroker`](crate::CaptchaBroker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub provider: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<Url>,
    /// Developer id applied to tasks that do not carry their own.
    #[serde(default)]
    pub soft_id: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// `[min, max]` wait before the first poll. Setting either band replaces
    /// the adapter's own poll hints.
    #[serde(default)]
    pub initial_poll_secs: Option<[u64; 2]>,
    /// `[min, max]` wait between later polls.
    #[serde(default)]
    pub poll_interval_secs: Option<[u64; 2]>,
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,
    #[serde(default = "default_honor_provider_hints")]
    pub honor_provider_hints: bool,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_transport_retries() -> u32 {
    3
}

fn default_honor_provider_hints() -> bool {
    true
}

impl BrokerSettings {
    pub fn new(provider: ProviderKind, api_key: impl Into<String>) -> Self {
        Self {
            provider: provider.as_str().to_string(),
            api_key: api_key.into(),
            base_url: None,
            soft_id: None,
            timeout_secs: default_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            initial_poll_secs: None,
            poll_interval_secs: None,
            max_transport_retries: default_max_transport_retries(),
            honor_provider_hints: default_honor_provider_hints(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Reads `CAPTCHA_BROKER_PROVIDER`, `CAPTCHA_BROKER_API_KEY` and the
    /// optional `CAPTCHA_BROKER_*` overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (name, value))
        };
        let required = |suffix: &str| {
            var(suffix)
                .map(|(_, value)| value)
                .ok_or_else(|| ConfigError::MissingVar(format!("{ENV_PREFIX}{suffix}")))
        };

        let provider: ProviderKind = required("PROVIDER")?.parse()?;
        let mut settings = Self::new(provider, required("API_KEY")?);

        if let Some((name, value)) = var("BASE_URL") {
            settings.base_url = Some(Url::parse(&value).map_err(|_| invalid(name, value))?);
        }
        if let Some((_, value)) = var("SOFT_ID") {
            settings.soft_id = Some(value);
        }
        if let Some((name, value)) = var("TIMEOUT_SECS") {
            settings.timeout_secs = parse_number(name, value)?;
        }
        if let Some((name, value)) = var("REQUEST_TIMEOUT_SECS") {
            settings.request_timeout_secs = parse_number(name, value)?;
        }
        if let Some((name, value)) = var("INITIAL_POLL_SECS") {
            settings.initial_poll_secs = Some(parse_band(name, value)?);
        }
        if let Some((name, value)) = var("POLL_INTERVAL_SECS") {
            settings.poll_interval_secs = Some(parse_band(name, value)?);
        }
        if let Some((name, value)) = var("MAX_TRANSPORT_RETRIES") {
            settings.max_transport_retries = parse_number(name, value)?;
        }
        if let Some((name, value)) = var("HONOR_PROVIDER_HINTS") {
            settings.honor_provider_hints = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(name, value)),
            };
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider_kind()?;
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("timeout_secs"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("request_timeout_secs"));
        }
        Ok(())
    }

    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        Ok(self.provider.parse()?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Whether either poll band was set explicitly.
    pub fn has_poll_bands(&self) -> bool {
        self.initial_poll_secs.is_some() || self.poll_interval_secs.is_some()
    }

    pub fn engine_config(&self) -> EngineConfig {
        let band = |[min, max]: [u64; 2]| {
            DelayBand::new(Duration::from_secs(min), Duration::from_secs(max))
        };
        let defaults = PollSchedule::default();
        EngineConfig {
            poll_schedule: PollSchedule::new(
                self.initial_poll_secs.map_or(defaults.initial, band),
                self.poll_interval_secs.map_or(defaults.subsequent, band),
            ),
            honor_provider_hints: self.honor_provider_hints && !self.has_poll_bands(),
            max_transport_retries: self.max_transport_retries,
            default_timeout: self.timeout(),
        }
    }
}

fn invalid(name: String, value: String) -> ConfigError {
    ConfigError::InvalidVar { name, value }
}

fn parse_number<T: std::str::FromStr>(name: String, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(name, value))
}

/// Accepts `7` or `5-10`.
fn parse_band(name: String, value: String) -> Result<[u64; 2], ConfigError> {
    let parsed: Option<(u64, u64)> = match value.split_once('-') {
        Some((min, max)) => min.trim().parse().ok().zip(max.trim().parse().ok()),
        None => value.parse().ok().map(|fixed| (fixed, fixed)),
    };
    match parsed {
        Some((min, max)) if min <= max => Ok([min, max]),
        _ => Err(invalid(name, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn json_defaults_fill_in() {
        let settings =
            BrokerSettings::from_json_str(r#"{"provider":"2captcha","api_key":"abc"}"#).unwrap();
        assert_eq!(settings.provider_kind().unwrap(), ProviderKind::TwoCaptcha);
        assert_eq!(settings.timeout(), Duration::from_secs(120));
        assert_eq!(
            settings.request_timeout(),
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
        assert_eq!(settings.max_transport_retries, 3);
        assert!(settings.honor_provider_hints);
        assert_eq!(settings.initial_poll_secs, None);

        let engine = settings.engine_config();
        assert!(engine.honor_provider_hints);
        assert_eq!(engine.poll_schedule.initial.min(), Duration::from_secs(5));
        assert_eq!(engine.poll_schedule.subsequent.max(), Duration::from_secs(5));
    }

    #[test]
    fn configured_band_replaces_provider_hints() {
        let settings = BrokerSettings::from_json_str(
            r#"{"provider":"2captcha","api_key":"abc","initial_poll_secs":[1,1]}"#,
        )
        .unwrap();
        assert!(settings.honor_provider_hints);

        let engine = settings.engine_config();
        assert!(!engine.honor_provider_hints);
        assert_eq!(engine.poll_schedule.initial.max(), Duration::from_secs(1));
        assert_eq!(engine.poll_schedule.subsequent.min(), Duration::from_secs(2));
    }

    #[test]
    fn json_rejects_unknown_provider_and_empty_key() {
        assert!(matches!(
            BrokerSettings::from_json_str(r#"{"provider":"nobody","api_key":"abc"}"#),
            Err(ConfigError::UnknownProvider(_))
        ));
        assert!(matches!(
            BrokerSettings::from_json_str(r#"{"provider":"capsolver","api_key":" "}"#),
            Err(ConfigError::EmptyApiKey)
        ));
    }

    #[test]
    fn environment_overrides() {
        let settings = BrokerSettings::from_lookup(env(&[
            ("CAPTCHA_BROKER_PROVIDER", "anti-captcha"),
            ("CAPTCHA_BROKER_API_KEY", "k"),
            ("CAPTCHA_BROKER_TIMEOUT_SECS", "300"),
            ("CAPTCHA_BROKER_INITIAL_POLL_SECS", "15-20"),
            ("CAPTCHA_BROKER_HONOR_PROVIDER_HINTS", "off"),
        ]))
        .unwrap();
        assert_eq!(settings.provider, "anticaptcha");
        assert_eq!(settings.timeout_secs, 300);
        assert_eq!(settings.initial_poll_secs, Some([15, 20]));
        assert!(!settings.honor_provider_hints);
    }

    #[test]
    fn environment_errors_name_the_variable() {
        let missing = BrokerSettings::from_lookup(env(&[("CAPTCHA_BROKER_PROVIDER", "capsolver")]));
        assert!(matches!(missing, Err(ConfigError::MissingVar(name)) if name == "CAPTCHA_BROKER_API_KEY"));

        let bad = BrokerSettings::from_lookup(env(&[
            ("CAPTCHA_BROKER_PROVIDER", "capsolver"),
            ("CAPTCHA_BROKER_API_KEY", "k"),
            ("CAPTCHA_BROKER_POLL_INTERVAL_SECS", "9-3"),
        ]));
        assert!(matches!(bad, Err(ConfigError::InvalidVar { name, .. }) if name == "CAPTCHA_BROKER_POLL_INTERVAL_SECS"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = BrokerSettings::from_path("/nonexistent/broker.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/broker.json"));
    }
}
