//! Route resolution and stream identifier supply

/// A resolved downstream target.
///
/// `route_id` addresses the connect side; `authorization` is the bit set a
/// stream must carry for the route to have matched
/// (`route.authorization & stream.authorization == route.authorization`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub route_id: u64,
    pub authorization: u64,
}

/// The host fabric's routing table and throttle registry.
///
/// Throttle registration tells the fabric where to deliver WINDOW/RESET/
/// SIGNAL frames for a stream the proxy writes; the proxy keeps its own
/// dispatch index in parallel.
pub trait Router {
    /// Resolve a route for the given authorization, or `None` to drop the
    /// stream unacknowledged.
    fn resolve(&mut self, route_id: u64, authorization: u64) -> Option<Route>;

    /// Register interest in throttle frames for `stream_id`.
    fn set_throttle(&mut self, stream_id: u64);

    /// Drop the throttle registration for `stream_id`.
    fn clear_throttle(&mut self, stream_id: u64);
}

/// Stream and trace identifier supply.
///
/// Initial ids are odd and unique for the process lifetime; the reply id
/// of an initial stream is fixed by the fabric's pairing rule.
pub trait StreamIds {
    /// Next initial (odd) stream id for a route.
    fn supply_initial_id(&mut self, route_id: u64) -> u64;

    /// The reply (even) stream id paired with an initial id.
    fn supply_reply_id(&mut self, initial_id: u64) -> u64;

    /// Next trace id for frames the proxy originates.
    fn supply_trace_id(&mut self) -> u64;
}
