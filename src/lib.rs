//! Declarative, resilient HTTP API clients.
//!
//! Declare an [`Api`] with a [`ClientConfig`], register [`EndpointSpec`]s on
//! it, and invoke them by name. Sessions are pooled per API and rebuilt after
//! their TTL; transient failures are retried with backoff.

pub mod api;
pub mod apis;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod runtime;
pub mod settings;

pub use api::Api;
pub use config::{ClientConfig, ConfigUpdate};
pub use endpoint::{Call, EndpointRegistry, EndpointSpec, HandlerInput, expect_ok};
pub use error::{ApiError, Result};
pub use http::{Method, Payload, RetryPolicy, TransportOptions};

/// `User-Agent` sent on every session.
pub const USER_AGENT: &str = concat!("apibase/", env!("APIBASE_VERSION"));
