//! Core types shared by the lifecycle engine, the adapters, and the gateway.

pub mod descriptor;
pub mod handle;
pub mod reqwest_gateway;
pub mod timing;
pub mod transport;

pub use descriptor::{
    CaptchaKind, Challenge, CharacterSet, DescriptorError, EnterpriseOptions, ImageChallenge,
    Proxy, ProxyScheme, SessionContext, TaskDescriptor, TaskOptions,
};
pub use handle::{TaskHandle, TaskId};
pub use reqwest_gateway::ReqwestGateway;
pub use timing::{DelayBand, PollSchedule};
pub use transport::{
    GatewayResponse, ProviderRequest, RequestBody, TransportError, TransportGateway,
};
