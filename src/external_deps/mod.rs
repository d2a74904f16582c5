//! Integrations that rely on third-party services.
//!
//! Each captcha solving backend gets an adapter under [`providers`].

pub mod providers;

pub use providers::{
    AntiCaptchaAdapter, CapSolverAdapter, ProviderAdapter, ProviderKind, TwoCaptchaAdapter,
};
