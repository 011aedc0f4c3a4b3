//! Paired half-stream state machine
//!
//! Each accepted stream gets two halves: the initial half forwards
//! accept-side frames to the connect side, the reply half forwards the
//! downstream's response back. Both share one access grant; the reply
//! half owns the expiry/challenge timer. Teardown of either half releases
//! its grant reference exactly once and keeps the correlation and
//! throttle registries consistent.

use crate::auth::{
    realm_index, GrantTable, KeyStore, Realms, SharedGrant, TokenVerifier, VerifiedToken,
};
use crate::config::ProxyConfig;
use crate::fabric::executor::{ScheduledSignal, SignalingExecutor, TimerKey};
use crate::fabric::frames::{
    can_challenge, is_initial, Abort, Begin, Data, End, Extension, Frame, HttpHeaders, Reset,
    Signal, Window, GRANT_VALIDATION_SIGNAL,
};
use crate::fabric::router::{Router, StreamIds};
use crate::proxy::writer::{FrameSink, Writer};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace};

/// Expiry sentinel for grants that never run out.
pub const EXPIRES_NEVER: i64 = i64::MAX;

const STATUS_HEADER: &str = ":status";
const METHOD_HEADER: &str = ":method";
const CONTENT_TYPE_HEADER: &str = "content-type";
const CHALLENGE_CONTENT_TYPE: &str = "application/x-challenge-response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfState {
    /// Reply half waiting for the downstream BEGIN.
    PendingReply,
    Active,
    /// A closing frame has been forwarded; teardown is in progress.
    Closing,
    Closed,
}

struct ProxyHalf {
    state: HalfState,
    source_route_id: u64,
    source_stream_id: u64,
    source_authorization: u64,
    target_route_id: u64,
    target_stream_id: u64,
    target_authorization: u64,
    accept_initial_id: u64,
    connect_reply_id: u64,
    capabilities: u8,
    grant: SharedGrant,
    timer: Option<TimerKey>,
}

impl ProxyHalf {
    fn is_reply(&self) -> bool {
        self.source_stream_id == self.connect_reply_id
    }
}

/// The proxy itself: accepts streams, verifies tokens, relays frames.
///
/// Single-threaded by contract; every callback runs to completion on the
/// worker that owns this value.
pub struct StreamProxy {
    expire_in_flight_requests: bool,
    challenge_claim: String,
    realms: Rc<RefCell<Realms>>,
    verifier: TokenVerifier,
    grants: GrantTable,
    /// Live halves, keyed by the stream id each half reads.
    streams: HashMap<u64, ProxyHalf>,
    /// Dispatch index for throttle frames, keyed by the stream id each
    /// half writes.
    throttles: HashMap<u64, u64>,
    /// Reply stream ids whose downstream BEGIN has not arrived yet.
    correlations: HashSet<u64>,
    router: Box<dyn Router>,
    ids: Box<dyn StreamIds>,
    executor: Box<dyn SignalingExecutor>,
    writer: Writer,
}

impl StreamProxy {
    pub fn new(
        config: &ProxyConfig,
        keys: Arc<KeyStore>,
        realms: Rc<RefCell<Realms>>,
        router: Box<dyn Router>,
        ids: Box<dyn StreamIds>,
        executor: Box<dyn SignalingExecutor>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            expire_in_flight_requests: config.expire_in_flight_requests,
            challenge_claim: config.challenge_delta_claim(),
            realms,
            verifier: TokenVerifier::new(keys),
            grants: GrantTable::new(),
            streams: HashMap::new(),
            throttles: HashMap::new(),
            correlations: HashSet::new(),
            router,
            ids,
            executor,
            writer: Writer::new(sink),
        }
    }

    /// Handle a BEGIN that opens a stream. Returns whether the proxy
    /// accepted it; a dropped stream gets no acknowledgment at all.
    pub fn new_stream(&mut self, begin: Begin) -> bool {
        if is_initial(begin.stream_id) {
            self.new_initial_stream(begin)
        } else {
            self.new_reply_stream(begin)
        }
    }

    /// Dispatch a frame arriving on an accepted stream.
    pub fn on_stream_frame(&mut self, frame: Frame) {
        let key = frame.stream_id();
        if !self.streams.contains_key(&key) {
            trace!(stream_id = key, kind = frame.kind(), "frame for unknown stream");
            return;
        }

        match frame {
            // The opening BEGIN was consumed by new_stream.
            Frame::Begin(_) => {}
            Frame::Data(data) => self.on_data(key, data),
            Frame::End(end) => self.on_end(key, end),
            Frame::Abort(abort) => self.on_abort(key, abort),
            other => self.on_unexpected(key, other),
        }
    }

    /// Dispatch a throttle frame for a stream the proxy writes.
    pub fn on_throttle_frame(&mut self, frame: Frame) {
        let Some(&key) = self.throttles.get(&frame.stream_id()) else {
            trace!(
                stream_id = frame.stream_id(),
                kind = frame.kind(),
                "throttle frame for unknown stream"
            );
            return;
        };

        match frame {
            Frame::Window(window) => self.on_window(key, window),
            Frame::Reset(reset) => self.on_reset(key, reset),
            Frame::Signal(signal) => self.on_signal(key, signal),
            _ => {}
        }
    }

    /// Feed a fired timer back into the proxy as a SIGNAL frame.
    pub fn on_scheduled_signal(&mut self, signal: ScheduledSignal) {
        let trace_id = self.ids.supply_trace_id();
        self.on_throttle_frame(Frame::Signal(Signal {
            route_id: signal.route_id,
            stream_id: signal.stream_id,
            trace_id,
            authorization: 0,
            signal_id: signal.signal_id,
            extension: Extension::None,
        }));
    }

    fn new_initial_stream(&mut self, begin: Begin) -> bool {
        let accept_authorization = begin.authorization;
        let now = self.executor.now_millis();
        let verified = self
            .verifier
            .bearer_token(&begin.extension)
            .and_then(|token| self.verifier.verify(&token, now));

        // An unverified token leaves the inbound authorization untouched.
        let connect_authorization = match &verified {
            Some(token) => self.realms.borrow().lookup(token),
            None => accept_authorization,
        };

        let Some(route) = self.router.resolve(begin.route_id, connect_authorization) else {
            debug!(
                route_id = begin.route_id,
                stream_id = begin.stream_id,
                "no route for stream"
            );
            return false;
        };

        let accept_route_id = begin.route_id;
        let accept_initial_id = begin.stream_id;
        let accept_reply_id = self.ids.supply_reply_id(accept_initial_id);
        let connect_route_id = route.route_id;
        let connect_initial_id = self.ids.supply_initial_id(connect_route_id);
        let connect_reply_id = self.ids.supply_reply_id(connect_initial_id);

        let expires_at = if self.expire_in_flight_requests {
            expires_at_millis(verified.as_ref())
        } else {
            EXPIRES_NEVER
        };
        let subject = verified
            .as_ref()
            .and_then(|token| token.subject().map(str::to_string));
        let capabilities = begin.capabilities;
        let challenge_delta =
            self.resolve_challenge_delta(verified.as_ref(), capabilities, expires_at);

        let grant = self.grants.supply(
            realm_index(connect_authorization),
            begin.affinity,
            subject.as_deref(),
        );
        grant.borrow_mut().reauthorize(
            subject.as_deref(),
            connect_authorization,
            expires_at,
            challenge_delta,
        );

        debug!(
            stream_id = accept_initial_id,
            authorization = %format_args!("{connect_authorization:#018x}"),
            subject = subject.as_deref(),
            expires_at,
            "stream accepted"
        );

        let initial = ProxyHalf {
            state: HalfState::Active,
            source_route_id: accept_route_id,
            source_stream_id: accept_initial_id,
            source_authorization: accept_authorization,
            target_route_id: connect_route_id,
            target_stream_id: connect_initial_id,
            target_authorization: connect_authorization,
            accept_initial_id,
            connect_reply_id,
            capabilities,
            grant: Rc::clone(&grant),
            timer: None,
        };
        initial.grant.borrow_mut().acquire();

        let mut reply = ProxyHalf {
            state: HalfState::PendingReply,
            source_route_id: connect_route_id,
            source_stream_id: connect_reply_id,
            source_authorization: connect_authorization,
            target_route_id: accept_route_id,
            target_stream_id: accept_reply_id,
            target_authorization: accept_authorization,
            accept_initial_id,
            connect_reply_id,
            capabilities,
            grant,
            timer: None,
        };
        reply.grant.borrow_mut().acquire();

        // The expiry/challenge timer lives on the reply half, addressed to
        // the stream the half writes so the signal dispatches back to it.
        reply.timer = if can_challenge(capabilities) && challenge_delta > 0 {
            Some(self.executor.schedule(
                expires_at - challenge_delta,
                accept_route_id,
                accept_reply_id,
                GRANT_VALIDATION_SIGNAL,
            ))
        } else if expires_at != EXPIRES_NEVER {
            Some(self.executor.schedule(
                expires_at,
                accept_route_id,
                accept_reply_id,
                GRANT_VALIDATION_SIGNAL,
            ))
        } else {
            None
        };

        self.correlations.insert(connect_reply_id);
        self.throttles.insert(accept_reply_id, connect_reply_id);
        self.router.set_throttle(accept_reply_id);
        self.streams.insert(connect_reply_id, reply);

        self.writer.do_begin(
            connect_route_id,
            connect_initial_id,
            begin.trace_id,
            connect_authorization,
            begin.affinity,
            capabilities,
            begin.extension,
        );

        self.throttles.insert(connect_initial_id, accept_initial_id);
        self.router.set_throttle(connect_initial_id);
        self.streams.insert(accept_initial_id, initial);

        true
    }

    fn new_reply_stream(&mut self, begin: Begin) -> bool {
        let connect_reply_id = begin.stream_id;
        if !self.correlations.remove(&connect_reply_id) {
            debug!(stream_id = connect_reply_id, "reply stream without correlation");
            return false;
        }

        let Some(half) = self.streams.get_mut(&connect_reply_id) else {
            return false;
        };
        half.state = HalfState::Active;
        let (route_id, stream_id) = (half.target_route_id, half.target_stream_id);

        self.writer.do_begin(
            route_id,
            stream_id,
            begin.trace_id,
            begin.authorization,
            begin.affinity,
            begin.capabilities,
            begin.extension,
        );
        true
    }

    fn on_data(&mut self, key: u64, data: Data) {
        let Some(half) = self.streams.get(&key) else {
            return;
        };
        let (route_id, stream_id) = (half.target_route_id, half.target_stream_id);

        self.writer.do_data(
            route_id,
            stream_id,
            data.trace_id,
            data.authorization,
            data.group_id,
            data.padding,
            data.payload,
            data.extension,
        );
    }

    fn on_end(&mut self, key: u64, end: End) {
        let Some(half) = self.streams.get_mut(&key) else {
            return;
        };
        half.state = HalfState::Closing;
        let (route_id, stream_id, authorization) = (
            half.target_route_id,
            half.target_stream_id,
            half.target_authorization,
        );

        self.writer
            .do_end(route_id, stream_id, end.trace_id, authorization, end.extension);
        self.teardown(key, false);
    }

    fn on_abort(&mut self, key: u64, abort: Abort) {
        let Some(half) = self.streams.get_mut(&key) else {
            return;
        };
        half.state = HalfState::Closing;
        let (route_id, stream_id, authorization) = (
            half.target_route_id,
            half.target_stream_id,
            half.target_authorization,
        );

        self.writer
            .do_abort(route_id, stream_id, abort.trace_id, authorization);
        self.teardown(key, true);
    }

    fn on_unexpected(&mut self, key: u64, frame: Frame) {
        let Some(half) = self.streams.get_mut(&key) else {
            return;
        };
        debug!(stream_id = key, kind = frame.kind(), "unexpected frame on stream");
        half.state = HalfState::Closing;
        let (route_id, stream_id, authorization) = (
            half.source_route_id,
            half.source_stream_id,
            half.source_authorization,
        );

        let trace_id = self.ids.supply_trace_id();
        self.writer.do_reset(route_id, stream_id, trace_id, authorization);
        self.teardown(key, true);
    }

    fn on_window(&mut self, key: u64, window: Window) {
        let Some(half) = self.streams.get_mut(&key) else {
            return;
        };
        // Track the peer's current willingness to be challenged.
        half.capabilities = window.capabilities;
        let (route_id, stream_id) = (half.source_route_id, half.source_stream_id);

        self.writer.do_window(
            route_id,
            stream_id,
            window.trace_id,
            window.credit,
            window.padding,
            window.group_id,
        );
    }

    fn on_reset(&mut self, key: u64, reset: Reset) {
        let Some(half) = self.streams.get_mut(&key) else {
            return;
        };
        half.state = HalfState::Closing;
        let (route_id, stream_id, authorization) = (
            half.source_route_id,
            half.source_stream_id,
            half.source_authorization,
        );

        self.writer
            .do_reset(route_id, stream_id, reset.trace_id, authorization);
        self.teardown(key, true);
    }

    fn on_signal(&mut self, key: u64, signal: Signal) {
        if signal.signal_id == GRANT_VALIDATION_SIGNAL {
            self.on_grant_validation(key, signal);
        }
    }

    fn on_grant_validation(&mut self, key: u64, signal: Signal) {
        let Some(half) = self.streams.get_mut(&key) else {
            return;
        };
        // The timer that carried this signal has fired.
        half.timer = None;

        let (expires_at, challenge_after) = {
            let grant = half.grant.borrow();
            (grant.expires_at(), grant.challenge_after())
        };
        let now = self.executor.now_millis();
        let remaining = expires_at - now;

        if remaining > 0 {
            // Reauthorized under us; keep watching.
            let challenge = can_challenge(half.capabilities);
            let in_challenge_window = challenge && now >= challenge_after && now < expires_at;
            let deadline = if challenge && now < challenge_after {
                challenge_after
            } else {
                expires_at
            };

            let (target_route_id, target_stream_id) =
                (half.target_route_id, half.target_stream_id);
            half.timer = Some(self.executor.schedule(
                deadline,
                target_route_id,
                target_stream_id,
                GRANT_VALIDATION_SIGNAL,
            ));

            if in_challenge_window {
                let (route_id, stream_id, authorization) = (
                    half.source_route_id,
                    half.source_stream_id,
                    half.source_authorization,
                );
                debug!(stream_id, expires_at, "issuing re-authentication challenge");
                self.writer.do_signal(
                    route_id,
                    stream_id,
                    signal.trace_id,
                    authorization,
                    0,
                    challenge_extension(),
                );
            }
        } else {
            let source = (
                half.source_route_id,
                half.source_stream_id,
                half.source_authorization,
            );
            let target = (
                half.target_route_id,
                half.target_stream_id,
                half.target_authorization,
            );
            let is_reply = half.is_reply();
            let (connect_reply_id, accept_initial_id) =
                (half.connect_reply_id, half.accept_initial_id);

            debug!(stream_id = key, expires_at, "grant expired");
            self.writer
                .do_reset(source.0, source.1, signal.trace_id, source.2);

            let reply_not_started = self.cleanup_correlation(connect_reply_id, accept_initial_id);

            if is_reply && reply_not_started {
                // The downstream never answered; synthesize the response.
                let headers = HttpHeaders::new().with(STATUS_HEADER, "401");
                self.writer.do_begin(
                    target.0,
                    target.1,
                    signal.trace_id,
                    target.2,
                    0,
                    0,
                    Extension::Http(headers),
                );
                self.writer
                    .do_end(target.0, target.1, signal.trace_id, target.2, Extension::None);
            } else {
                self.writer
                    .do_abort(target.0, target.1, signal.trace_id, target.2);
            }

            self.teardown(key, false);
        }
    }

    /// Remove a half and settle its obligations: throttle index entry,
    /// pending timer, and exactly one grant reference. Idempotent; a
    /// second call for the same key finds nothing.
    fn teardown(&mut self, key: u64, detach_correlation: bool) {
        let Some(mut half) = self.streams.remove(&key) else {
            return;
        };
        self.throttles.remove(&half.target_stream_id);

        if detach_correlation {
            self.cleanup_correlation(half.connect_reply_id, half.accept_initial_id);
        }

        if let Some(timer) = half.timer.take() {
            self.executor.cancel(timer);
        }
        half.grant.borrow_mut().release();
        half.state = HalfState::Closed;
        trace!(stream_id = key, state = ?half.state, "stream closed");
    }

    fn cleanup_correlation(&mut self, connect_reply_id: u64, accept_initial_id: u64) -> bool {
        let removed = self.correlations.remove(&connect_reply_id);
        if removed {
            self.router.clear_throttle(accept_initial_id);
        }
        removed
    }

    fn resolve_challenge_delta(
        &self,
        verified: Option<&VerifiedToken>,
        capabilities: u8,
        expires_at: i64,
    ) -> i64 {
        if !can_challenge(capabilities) {
            return 0;
        }
        let Some(token) = verified else {
            return 0;
        };
        match token.claims().numeric_date_millis(&self.challenge_claim) {
            Some(challenge_after) => expires_at - challenge_after,
            None => 0,
        }
    }
}

fn expires_at_millis(verified: Option<&VerifiedToken>) -> i64 {
    verified
        .and_then(|token| token.claims().expires_at_millis())
        .unwrap_or(EXPIRES_NEVER)
}

fn challenge_extension() -> Extension {
    Extension::Http(
        HttpHeaders::new()
            .with(METHOD_HEADER, "post")
            .with(CONTENT_TYPE_HEADER, CHALLENGE_CONTENT_TYPE),
    )
}
