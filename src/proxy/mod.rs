//! The stream proxy
//!
//! Pairs each accepted stream with a forwarding stream to the resolved
//! route, relays frames between the halves, and enforces token expiry.

mod stream;
mod writer;

pub use stream::{StreamProxy, EXPIRES_NEVER};
pub use writer::{FrameSink, Writer};
