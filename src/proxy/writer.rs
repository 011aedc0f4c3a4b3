//! Frame emission glue
//!
//! Thin helpers that assemble outbound frames with the right route,
//! stream, and authorization fields and push them into the host's sink.

use crate::fabric::frames::{
    Abort, Begin, Data, End, Extension, Frame, Reset, Signal, Window,
};
use bytes::Bytes;

/// Destination for frames the proxy emits.
pub trait FrameSink {
    fn write(&mut self, frame: Frame);
}

pub struct Writer {
    sink: Box<dyn FrameSink>,
}

impl Writer {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self { sink }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_begin(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        authorization: u64,
        affinity: u64,
        capabilities: u8,
        extension: Extension,
    ) {
        self.sink.write(Frame::Begin(Begin {
            route_id,
            stream_id,
            trace_id,
            authorization,
            affinity,
            capabilities,
            extension,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_data(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        authorization: u64,
        group_id: u64,
        padding: u32,
        payload: Bytes,
        extension: Extension,
    ) {
        self.sink.write(Frame::Data(Data {
            route_id,
            stream_id,
            trace_id,
            authorization,
            group_id,
            padding,
            payload,
            extension,
        }));
    }

    pub fn do_end(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        authorization: u64,
        extension: Extension,
    ) {
        self.sink.write(Frame::End(End {
            route_id,
            stream_id,
            trace_id,
            authorization,
            extension,
        }));
    }

    pub fn do_abort(&mut self, route_id: u64, stream_id: u64, trace_id: u64, authorization: u64) {
        self.sink.write(Frame::Abort(Abort {
            route_id,
            stream_id,
            trace_id,
            authorization,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_window(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        credit: u32,
        padding: u32,
        group_id: u64,
    ) {
        self.sink.write(Frame::Window(Window {
            route_id,
            stream_id,
            trace_id,
            credit,
            padding,
            group_id,
            capabilities: 0,
        }));
    }

    pub fn do_reset(&mut self, route_id: u64, stream_id: u64, trace_id: u64, authorization: u64) {
        self.sink.write(Frame::Reset(Reset {
            route_id,
            stream_id,
            trace_id,
            authorization,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_signal(
        &mut self,
        route_id: u64,
        stream_id: u64,
        trace_id: u64,
        authorization: u64,
        signal_id: u64,
        extension: Extension,
    ) {
        self.sink.write(Frame::Signal(Signal {
            route_id,
            stream_id,
            trace_id,
            authorization,
            signal_id,
            extension,
        }));
    }
}
