//! Per-stream state tracking (RFC 7540 Section 5.1, server side).
//!
//! A stream only ever moves forward along
//! `Idle -> Reserved | Open -> HalfClosed(remote) -> Closed`; the engine
//! drives the transitions, this module owns the data attached to each
//! state.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;

use crate::body::BodyBuffer;
use crate::error::{ErrorCode, RequestError};
use crate::hpack::HeaderField;

/// A parsed request: the pseudo-header tuple plus the remaining header
/// fields in arrival order.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub scheme: String,
    pub authority: Option<String>,
    pub headers: Vec<HeaderField>,
}

impl Request {
    /// First value of a (lowercase) header name, if present.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value[..])
    }
}

/// A response head: status plus header fields.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<HeaderField>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<bytes::Bytes>, value: impl Into<bytes::Bytes>) -> Self {
        self.headers.push(HeaderField::new(name, value));
        self
    }
}

/// Declared request body length, from `content-length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Fixed(u64),
    Unknown,
}

/// An in-progress header block, accumulated across HEADERS/CONTINUATION
/// until END_HEADERS.
pub(crate) struct HeaderBlock {
    pub buf: BytesMut,
    pub end_stream: bool,
}

impl HeaderBlock {
    /// Sizing follows the expected total: the first fragment's length when
    /// the block is already complete, twice that when continuations are
    /// still coming.
    pub fn new(fragment: &[u8], end_headers: bool, end_stream: bool) -> Self {
        let capacity = if end_headers {
            fragment.len()
        } else {
            fragment.len() * 2
        };
        let mut buf = BytesMut::with_capacity(capacity);
        buf.extend_from_slice(fragment);
        Self { buf, end_stream }
    }

    pub fn push(&mut self, fragment: &[u8]) {
        self.buf.extend_from_slice(fragment);
    }
}

/// Request bookkeeping attached to a stream once its headers decoded.
pub(crate) struct Message {
    pub request: Rc<Request>,
    pub body_length: BodyLength,
    pub body_bytes_received: u64,
}

impl Message {
    pub fn new(request: Rc<Request>, body_length: BodyLength) -> Self {
        Self {
            request,
            body_length,
            body_bytes_received: 0,
        }
    }
}

pub(crate) enum OpenPhase {
    /// Header block still accumulating.
    PartialHeaders(HeaderBlock),
    /// Headers decoded but no message attached (rejected requests keep
    /// accepting an error response here).
    FullHeaders,
    /// Request dispatched, body streaming in.
    ActiveMessage(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosedReason {
    Finished,
    ResetByUs(ErrorCode),
    ResetByThem(ErrorCode),
}

pub(crate) enum StreamState {
    Idle,
    /// Created by an outbound PUSH_PROMISE; transitions to
    /// HalfClosedRemote as soon as the promise frame is written.
    ReservedLocal,
    Open(OpenPhase),
    /// Peer finished sending; our response may still be in flight.
    HalfClosedRemote(Message),
    Closed(ClosedReason),
}

/// State the application handle mutates: the engine drains it on every
/// write cycle. Kept behind a `Rc<RefCell>` because handler callbacks run
/// while the engine is borrowed elsewhere.
pub(crate) struct StreamShared {
    pub request_body: BodyBuffer,
    pub response_body: BodyBuffer,
    /// Set once by `respond`; consumed when the HEADERS frame goes out.
    pub response: Option<Response>,
    /// Latched on the first `respond`; double responses are a programming
    /// error.
    pub responded: bool,
    /// Application-reported failure, picked up by the error path.
    pub error: Option<RequestError>,
    /// Trailer fields delivered after the request body, if any.
    pub trailers: Option<Vec<HeaderField>>,
}

impl StreamShared {
    pub fn new(request_capacity: usize, response_capacity: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            request_body: BodyBuffer::with_capacity(request_capacity),
            response_body: BodyBuffer::with_capacity(response_capacity),
            response: None,
            responded: false,
            error: None,
            trailers: None,
        }))
    }
}

pub(crate) struct Stream {
    pub id: u32,
    pub state: StreamState,
    /// Write-side DATA cap; follows the peer's SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: u32,
    pub shared: Rc<RefCell<StreamShared>>,
    /// In-progress trailing header block; lives outside the state enum so
    /// a rejected request can still keep the shared HPACK decoder in sync.
    pub trailer_block: Option<HeaderBlock>,
    pub response_headers_sent: bool,
    /// RST_STREAM code to emit once the (error) response has drained.
    pub reset_after_output: Option<ErrorCode>,
    /// Whether this stream is included in the concurrent-streams count.
    pub counted: bool,
    /// The error handler runs at most once per stream.
    pub errored: bool,
}

impl Stream {
    pub fn new(
        id: u32,
        max_frame_size: u32,
        shared: Rc<RefCell<StreamShared>>,
    ) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            max_frame_size,
            shared,
            trailer_block: None,
            response_headers_sent: false,
            reset_after_output: None,
            counted: false,
            errored: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed(_))
    }

    /// Move to Closed. Repeated transitions keep the first reason; the
    /// return value says whether this call performed the close.
    pub fn finish(&mut self, reason: ClosedReason) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = StreamState::Closed(reason);
        true
    }

    /// The message currently receiving from the peer, in either Open or
    /// HalfClosed position.
    pub fn message_mut(&mut self) -> Option<&mut Message> {
        match &mut self.state {
            StreamState::Open(OpenPhase::ActiveMessage(msg)) => Some(msg),
            StreamState::HalfClosedRemote(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn request(&self) -> Option<Rc<Request>> {
        match &self.state {
            StreamState::Open(OpenPhase::ActiveMessage(msg)) => Some(msg.request.clone()),
            StreamState::HalfClosedRemote(msg) => Some(msg.request.clone()),
            _ => None,
        }
    }

    /// Whether the writer still owes this stream anything: unsent response
    /// headers, buffered body bytes, or the final empty DATA frame.
    pub fn requires_output(&self) -> bool {
        match self.state {
            StreamState::Idle | StreamState::Closed(_) => false,
            _ => {
                let shared = self.shared.borrow();
                (shared.response.is_some() && !self.response_headers_sent)
                    || shared.response_body.has_output()
            }
        }
    }

    /// Whether the response has fully left the building.
    pub fn response_complete(&self) -> bool {
        self.response_headers_sent && self.shared.borrow().response_body.final_frame_sent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stream() -> Stream {
        Stream::new(1, 16384, StreamShared::new(64, 64))
    }

    #[test]
    fn finish_is_idempotent_and_keeps_first_reason() {
        let mut s = test_stream();
        assert!(s.finish(ClosedReason::ResetByUs(ErrorCode::Cancel)));
        assert!(!s.finish(ClosedReason::Finished));
        match s.state {
            StreamState::Closed(ClosedReason::ResetByUs(ErrorCode::Cancel)) => {}
            _ => panic!("first close reason must win"),
        }
    }

    #[test]
    fn requires_output_tracks_response_lifecycle() {
        let mut s = test_stream();
        s.state = StreamState::Open(OpenPhase::FullHeaders);
        assert!(!s.requires_output());
        s.shared.borrow_mut().response = Some(Response::new(200));
        assert!(s.requires_output());
        s.response_headers_sent = true;
        s.shared.borrow_mut().response = None;
        assert!(!s.requires_output());
        s.shared.borrow_mut().response_body.write_str("tail");
        assert!(s.requires_output());
    }

    #[test]
    fn closed_streams_never_require_output() {
        let mut s = test_stream();
        s.shared.borrow_mut().response = Some(Response::new(200));
        s.finish(ClosedReason::Finished);
        assert!(!s.requires_output());
    }

    #[test]
    fn header_block_capacity_doubles_without_end_headers() {
        let complete = HeaderBlock::new(&[0u8; 10], true, false);
        let partial = HeaderBlock::new(&[0u8; 10], false, false);
        assert!(complete.buf.capacity() >= 10);
        assert!(partial.buf.capacity() >= 20);
    }
}
