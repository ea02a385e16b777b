//! Endpoint declarations for concrete remote APIs.

pub mod mistral;
pub mod rootme;
