//! Interfaces to the surrounding messaging fabric
//!
//! The proxy never talks to a network directly. The fabric delivers framed
//! messages to it, resolves routes, supplies stream identifiers, and runs
//! the timer wheel. Everything in this module is either a frame value or a
//! trait the host implements.

pub mod executor;
pub mod frames;
pub mod router;

pub use executor::{ScheduledSignal, SignalingExecutor, TimerKey, TokioExecutor};
pub use frames::{
    can_challenge, is_initial, Abort, Begin, Data, End, Extension, Frame, HttpHeaders, Reset,
    Signal, Window, CHALLENGE_CAPABILITY, GRANT_VALIDATION_SIGNAL,
};
pub use router::{Route, Router, StreamIds};
