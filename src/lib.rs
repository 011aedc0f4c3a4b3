//! Tollgate - JWT-authenticating stream proxy for event-driven messaging fabrics
//!
//! Sits between an accepting endpoint (typically HTTP) and a downstream
//! service. For every new stream it verifies a bearer JWT, maps the
//! token's realm/scope claims to a compact 64-bit authorization word,
//! opens a paired forwarding stream to the resolved route, relays frames
//! between the halves, and enforces token expiry with an optional
//! in-band re-authentication challenge.

pub mod auth;
pub mod config;
pub mod fabric;
pub mod proxy;

pub use auth::{AccessGrant, KeyStore, Realms, TokenVerifier};
pub use config::ProxyConfig;
pub use fabric::{Frame, Route, Router, SignalingExecutor, StreamIds};
pub use proxy::{FrameSink, StreamProxy};
