//! Result normalization.
//!
//! Each captcha kind maps to exactly one [`Solution`] variant whichever
//! backend solved it, so callers can consume results without knowing the
//! provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::external_deps::providers::{RawSolution, SolutionField};
use crate::tasks::core::{CaptchaKind, SessionContext, TaskHandle, TaskId};

/// Caller-facing solution payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Solution {
    /// Recognized image text.
    Text { text: String },
    /// Widget token (reCAPTCHA, hCaptcha, FunCaptcha, Turnstile).
    Token {
        token: String,
        user_agent: Option<String>,
        resp_key: Option<String>,
    },
    /// Session cookie bound to the proxy and user agent that earned it.
    Cookie { cookie: String, user_agent: String },
    GeeTestV3 {
        challenge: String,
        validate: String,
        seccode: String,
    },
    GeeTestV4 {
        captcha_id: String,
        lot_number: String,
        pass_token: String,
        gen_time: String,
        captcha_output: String,
    },
    Capy {
        captcha_key: String,
        challenge_key: String,
        answer: String,
    },
    Lemin { answer: String, challenge_id: String },
    Tencent { ticket: String, rand_str: String },
}

/// Solved task. The only value that outlives a solve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub task_id: TaskId,
    pub kind: CaptchaKind,
    pub provider: String,
    pub completed_at: DateTime<Utc>,
    pub solution: Solution,
}

impl Response {
    /// The single string most callers submit: text, token, or cookie.
    pub fn value(&self) -> Option<&str> {
        match &self.solution {
            Solution::Text { text } => Some(text),
            Solution::Token { token, .. } => Some(token),
            Solution::Cookie { cookie, .. } => Some(cookie),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{kind} solution is missing {field:?}")]
    MissingField {
        kind: CaptchaKind,
        field: SolutionField,
    },
}

/// Builds the [`Response`] for a finished task.
///
/// `session` supplies the user agent for cookie solutions when the backend
/// does not echo it back.
pub fn normalize(
    handle: &TaskHandle,
    kind: CaptchaKind,
    raw: &RawSolution,
    session: &SessionContext,
) -> Result<Response, NormalizeError> {
    let require = |field: SolutionField| {
        raw.get(field)
            .map(str::to_string)
            .ok_or(NormalizeError::MissingField { kind, field })
    };
    let optional = |field: SolutionField| raw.get(field).map(str::to_string);

    let solution = match kind {
        CaptchaKind::Image => Solution::Text {
            text: require(SolutionField::Text)?,
        },
        CaptchaKind::ReCaptchaV2
        | CaptchaKind::ReCaptchaV3
        | CaptchaKind::HCaptcha
        | CaptchaKind::FunCaptcha
        | CaptchaKind::Turnstile => Solution::Token {
            token: require(SolutionField::Token)?,
            user_agent: optional(SolutionField::UserAgent),
            resp_key: optional(SolutionField::RespKey),
        },
        CaptchaKind::DataDome => {
            let user_agent = optional(SolutionField::UserAgent)
                .or_else(|| session.user_agent.clone())
                .ok_or(NormalizeError::MissingField {
                    kind,
                    field: SolutionField::UserAgent,
                })?;
            Solution::Cookie {
                cookie: require(SolutionField::Cookie)?,
                user_agent,
            }
        }
        CaptchaKind::GeeTestV3 => Solution::GeeTestV3 {
            challenge: require(SolutionField::Challenge)?,
            validate: require(SolutionField::Validate)?,
            seccode: require(SolutionField::Seccode)?,
        },
        CaptchaKind::GeeTestV4 => Solution::GeeTestV4 {
            captcha_id: require(SolutionField::CaptchaId)?,
            lot_number: require(SolutionField::LotNumber)?,
            pass_token: require(SolutionField::PassToken)?,
            gen_time: require(SolutionField::GenTime)?,
            captcha_output: require(SolutionField::CaptchaOutput)?,
        },
        CaptchaKind::Capy => Solution::Capy {
            captcha_key: require(SolutionField::CaptchaKey)?,
            challenge_key: require(SolutionField::ChallengeKey)?,
            answer: require(SolutionField::Answer)?,
        },
        CaptchaKind::Lemin => Solution::Lemin {
            answer: require(SolutionField::Answer)?,
            challenge_id: require(SolutionField::ChallengeId)?,
        },
        CaptchaKind::Tencent => Solution::Tencent {
            ticket: require(SolutionField::Ticket)?,
            rand_str: require(SolutionField::RandStr)?,
        },
    };

    Ok(Response {
        task_id: handle.id().clone(),
        kind,
        provider: handle.provider().to_string(),
        completed_at: Utc::now(),
        solution,
    })
}
