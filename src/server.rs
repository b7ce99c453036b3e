//! Server-side HTTP/2 connection engine.
//!
//! `ServerConnection` is sans-IO: the embedding feeds bytes in through
//! `read`/`read_eof`, asks for output with `next_write_operation`, and
//! acknowledges transport writes with `report_write_result`. One engine
//! instance demultiplexes every stream of one connection; the request
//! handler runs inline, single-threaded, and talks back through the
//! `RequestStream` handle.
//!
//! ```text
//!   client bytes
//!        |
//!   +----v--------------+   RequestStream    +-------------+
//!   | ServerConnection  |------------------->| app handler |
//!   | dispatch + flush  |<-------------------|             |
//!   +----+--------------+   respond / body   +-------------+
//!        |
//!   server bytes
//! ```

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::body::{BodyBuffer, Wakeup};
use crate::config::Config;
use crate::error::{ErrorCode, ProtocolError, RequestError};
use crate::frame::{self, Frame, FrameWriter, Priority};
use crate::hpack::{self, HeaderField};
use crate::scheduler::{DEFAULT_WINDOW, PriorityTree};
use crate::settings::{self, Setting, Settings};
use crate::stream::{
    BodyLength, ClosedReason, HeaderBlock, Message, OpenPhase, Request, Response, Stream,
    StreamShared, StreamState,
};

/// The 24-octet client connection preface (RFC 7540 Section 3.5).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const CONTINUATION_EXPECTED: &str = "HEADERS or PUSH_PROMISE without the END_HEADERS flag set \
     must be followed by a CONTINUATION frame for the same stream";

/// What the engine wants from the read side of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOperation {
    Read,
    Close,
}

/// What the engine wants from the write side of the transport.
pub enum WriteOperation<'a> {
    Write(&'a [u8]),
    Yield,
    Close,
}

/// Transport acknowledgment for a previous `WriteOperation::Write`.
pub enum WriteResult {
    Written(usize),
    Closed,
}

/// Failure modes of `RequestStream::push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// One of the two sides disabled server push.
    PushDisabled,
    /// The even stream-id space is spent; a graceful GOAWAY went out.
    StreamIdsExhausted,
}

type RequestHandler = Box<dyn FnMut(RequestStream)>;
type ErrorHandler = Box<dyn FnMut(Option<Rc<Request>>, &RequestError, ErrorResponse)>;

/// Connection-level state the application handles can reach without the
/// engine on the stack: push bookkeeping and the writer wakeup.
pub(crate) struct ConnShared {
    wakeup: Wakeup,
    local_push_enabled: bool,
    peer_push_enabled: bool,
    next_push_id: u32,
    ids_exhausted: bool,
    pending_pushes: Vec<PendingPush>,
    request_body_capacity: usize,
    response_body_capacity: usize,
}

struct PendingPush {
    parent_id: u32,
    promised_id: u32,
    request: Rc<Request>,
    shared: Rc<RefCell<StreamShared>>,
}

// -- Application handles --

/// Read side of a request body. Reads are one-shot: each delivery consumes
/// the registration.
pub struct RequestBody {
    shared: Rc<RefCell<StreamShared>>,
}

impl RequestBody {
    /// Register callbacks for the next chunk or EOF. Dispatches
    /// immediately when bytes are already buffered.
    pub fn schedule_read(
        &self,
        on_read: impl FnOnce(Bytes) + 'static,
        on_eof: impl FnOnce() + 'static,
    ) {
        let dispatch = self
            .shared
            .borrow_mut()
            .request_body
            .schedule_read(Box::new(on_read), Box::new(on_eof));
        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
    }
}

/// Write side of a response body. Every write arms the connection writer.
pub struct ResponseBody {
    shared: Rc<RefCell<StreamShared>>,
    wakeup: Wakeup,
}

impl ResponseBody {
    pub fn write_byte(&self, byte: u8) {
        self.shared.borrow_mut().response_body.write_byte(byte);
        self.wakeup.fire();
    }

    pub fn write_str(&self, s: &str) {
        self.shared.borrow_mut().response_body.write_str(s);
        self.wakeup.fire();
    }

    pub fn write_bytes(&self, data: &[u8]) {
        self.shared.borrow_mut().response_body.write_bytes(data);
        self.wakeup.fire();
    }

    /// Zero-copy hand-off of an owned chunk.
    pub fn schedule_bytes(&self, data: Bytes) {
        self.shared.borrow_mut().response_body.schedule_bytes(data);
        self.wakeup.fire();
    }

    /// Finish the response. The engine closes the stream once everything
    /// drained, with exactly one empty END_STREAM DATA frame.
    pub fn close(&self) {
        self.shared.borrow_mut().response_body.close_writer();
        self.wakeup.fire();
    }
}

/// Response channel handed to the error handler.
pub struct ErrorResponse {
    shared: Rc<RefCell<StreamShared>>,
    wakeup: Wakeup,
}

impl ErrorResponse {
    /// Start the synthesized response and return its body sink.
    pub fn start(self, response: Response) -> ResponseBody {
        {
            let mut shared = self.shared.borrow_mut();
            shared.responded = true;
            shared.response = Some(response);
        }
        self.wakeup.fire();
        ResponseBody {
            shared: self.shared,
            wakeup: self.wakeup,
        }
    }
}

/// The per-request descriptor passed to the request handler.
pub struct RequestStream {
    id: u32,
    request: Rc<Request>,
    shared: Rc<RefCell<StreamShared>>,
    conn: Rc<RefCell<ConnShared>>,
}

impl RequestStream {
    pub fn stream_id(&self) -> u32 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_body(&self) -> RequestBody {
        RequestBody {
            shared: self.shared.clone(),
        }
    }

    /// Trailer fields received after the request body, once the peer's
    /// half is complete.
    pub fn trailers(&self) -> Option<Vec<HeaderField>> {
        self.shared.borrow().trailers.clone()
    }

    /// Send the response head and obtain the body sink.
    ///
    /// # Panics
    ///
    /// Panics when called twice for the same stream.
    pub fn respond(&self, response: Response) -> ResponseBody {
        let wakeup = {
            let mut shared = self.shared.borrow_mut();
            assert!(!shared.responded, "respond called twice on stream");
            shared.responded = true;
            shared.response = Some(response);
            self.conn.borrow().wakeup.clone()
        };
        wakeup.fire();
        ResponseBody {
            shared: self.shared.clone(),
            wakeup,
        }
    }

    /// Route a request failure through the connection's error handler.
    pub fn report_error(&self, error: RequestError) {
        let wakeup = {
            let mut shared = self.shared.borrow_mut();
            shared.error.get_or_insert(error);
            self.conn.borrow().wakeup.clone()
        };
        wakeup.fire();
    }

    /// Promise a pushed response correlated with this request. Returns a
    /// descriptor for the promised stream; the caller responds on it as
    /// usual.
    pub fn push(&self, request: Request) -> Result<RequestStream, PushError> {
        let request = Rc::new(request);
        let (wakeup, result) = {
            let mut conn = self.conn.borrow_mut();
            let wakeup = conn.wakeup.clone();
            if !(conn.local_push_enabled && conn.peer_push_enabled) {
                return Err(PushError::PushDisabled);
            }
            if conn.next_push_id > 0x7fff_ffff {
                conn.ids_exhausted = true;
                (wakeup, Err(PushError::StreamIdsExhausted))
            } else {
                let promised_id = conn.next_push_id;
                conn.next_push_id += 2;
                let shared =
                    StreamShared::new(conn.request_body_capacity, conn.response_body_capacity);
                // A pushed request has no body; its read side is born at
                // EOF.
                shared.borrow_mut().request_body.close_writer();
                conn.pending_pushes.push(PendingPush {
                    parent_id: self.id,
                    promised_id,
                    request: request.clone(),
                    shared: shared.clone(),
                });
                (
                    wakeup,
                    Ok(RequestStream {
                        id: promised_id,
                        request,
                        shared,
                        conn: self.conn.clone(),
                    }),
                )
            }
        };
        wakeup.fire();
        result
    }
}

fn default_error_handler(
    _request: Option<Rc<Request>>,
    error: &RequestError,
    response: ErrorResponse,
) {
    let body = response.start(Response::new(error.status()));
    body.write_str(&error.to_string());
    body.close();
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}

// -- The engine --

pub struct ServerConnection {
    config: Config,
    local_settings: Settings,
    peer_settings: Settings,
    tree: PriorityTree,
    writer: FrameWriter,
    recv_buf: BytesMut,
    hpack_encoder: hpack::Encoder,
    hpack_decoder: hpack::Decoder,
    request_handler: RequestHandler,
    error_handler: ErrorHandler,
    conn: Rc<RefCell<ConnShared>>,
    wakeup: Wakeup,

    preface_consumed: bool,
    received_first_settings: bool,
    current_client_streams: u32,
    max_client_stream_id: u32,
    max_pushed_stream_id: u32,
    receiving_headers_for_stream: Option<u32>,
    unacked_settings: u32,
    did_send_go_away: bool,
    /// A non-NoError GOAWAY went out: stop reading, close once drained.
    hard_shutdown: bool,
    /// Peer GOAWAY received: drain active streams, then close.
    shutdown: bool,
    reader_closed: bool,
    wake_requested: bool,
}

impl ServerConnection {
    /// Create an engine with the default error handler.
    pub fn new(config: Config, request_handler: impl FnMut(RequestStream) + 'static) -> Self {
        Self::with_error_handler(config, default_error_handler, request_handler)
    }

    pub fn with_error_handler(
        config: Config,
        error_handler: impl FnMut(Option<Rc<Request>>, &RequestError, ErrorResponse) + 'static,
        request_handler: impl FnMut(RequestStream) + 'static,
    ) -> Self {
        let local_settings = Settings {
            enable_push: config.enable_server_push,
            max_concurrent_streams: Some(config.max_concurrent_streams),
            initial_window_size: config.initial_window_size.min(0x7fff_ffff),
            max_frame_size: config
                .read_buffer_size
                .clamp(settings::DEFAULT_MAX_FRAME_SIZE, settings::MAX_FRAME_SIZE_CEILING),
            ..Settings::default()
        };

        let mut writer = FrameWriter::new();
        writer.write(&Frame::Settings {
            ack: false,
            entries: local_settings.non_default_entries(),
        });

        let mut tree = PriorityTree::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        // The connection window starts at the RFC default; anything larger
        // that we advertise is granted explicitly.
        if i64::from(local_settings.initial_window_size) > DEFAULT_WINDOW {
            let increment = i64::from(local_settings.initial_window_size) - DEFAULT_WINDOW;
            writer.write(&Frame::WindowUpdate {
                stream_id: 0,
                increment: increment as u32,
            });
            tree.add_inflow(0, increment);
        }

        let wakeup = Wakeup::default();
        let conn = Rc::new(RefCell::new(ConnShared {
            wakeup: wakeup.clone(),
            local_push_enabled: local_settings.enable_push,
            peer_push_enabled: true,
            next_push_id: 2,
            ids_exhausted: false,
            pending_pushes: Vec::new(),
            request_body_capacity: config.request_body_buffer_size,
            response_body_capacity: config.response_body_buffer_size,
        }));

        let hpack_decoder = hpack::Decoder::new(local_settings.header_table_size as usize);
        let hpack_encoder = hpack::Encoder::new(settings::DEFAULT_HEADER_TABLE_SIZE as usize);

        Self {
            config,
            local_settings,
            peer_settings: Settings::default(),
            tree,
            writer,
            recv_buf: BytesMut::new(),
            hpack_encoder,
            hpack_decoder,
            request_handler: Box::new(request_handler),
            error_handler: Box::new(error_handler),
            conn,
            wakeup,
            preface_consumed: false,
            received_first_settings: false,
            current_client_streams: 0,
            max_client_stream_id: 0,
            max_pushed_stream_id: 0,
            receiving_headers_for_stream: None,
            unacked_settings: 0,
            did_send_go_away: false,
            hard_shutdown: false,
            shutdown: false,
            reader_closed: false,
            wake_requested: false,
        }
    }

    // -- Driver-facing read side --

    pub fn next_read_operation(&self) -> ReadOperation {
        if self.hard_shutdown || self.reader_closed || self.writer.is_closed() {
            ReadOperation::Close
        } else {
            ReadOperation::Read
        }
    }

    /// Feed transport bytes. Always consumes the whole slice; partial
    /// frames stay buffered internally.
    pub fn read(&mut self, input: &[u8]) -> usize {
        if self.reader_closed || self.hard_shutdown {
            return 0;
        }
        self.recv_buf.extend_from_slice(input);
        self.process_frames();
        input.len()
    }

    /// Feed the final transport bytes; the read side closes afterwards.
    pub fn read_eof(&mut self, input: &[u8]) -> usize {
        let consumed = self.read(input);
        self.reader_closed = true;
        self.fire_wakeup_if_needed();
        consumed
    }

    // -- Driver-facing write side --

    pub fn next_write_operation(&mut self) -> WriteOperation<'_> {
        if !self.writer.is_closed() && !self.hard_shutdown {
            self.prepare_output();
        }
        if self.writer.is_closed() {
            return WriteOperation::Close;
        }
        if self.writer.has_pending() {
            return WriteOperation::Write(self.writer.pending());
        }
        if self.write_side_finished() {
            self.writer.close();
            return WriteOperation::Close;
        }
        WriteOperation::Yield
    }

    pub fn report_write_result(&mut self, result: WriteResult) {
        match result {
            WriteResult::Written(n) => {
                self.writer.consume(n);
                // GOAWAY flushed: tear the writer down.
                if self.hard_shutdown && !self.writer.has_pending() {
                    self.writer.close();
                }
            }
            WriteResult::Closed => self.writer.close(),
        }
    }

    /// Park the writer until there is more to send. One-shot.
    ///
    /// # Panics
    ///
    /// Panics when the connection is already closed.
    pub fn yield_writer(&mut self, k: impl FnOnce() + 'static) {
        assert!(!self.is_closed(), "yield_writer on a closed connection");
        self.wakeup.register(Box::new(k));
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed() && (self.reader_closed || self.did_send_go_away)
    }

    // -- Input processing --

    fn process_frames(&mut self) {
        if !self.preface_consumed && !self.consume_preface() {
            return;
        }
        while !self.hard_shutdown {
            match frame::decode(&mut self.recv_buf, self.local_settings.max_frame_size) {
                Ok(Some(frame)) => {
                    if let Err(error) = self.dispatch(frame) {
                        self.report_error(error);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    self.report_error(error);
                    break;
                }
            }
        }
        self.fire_wakeup_if_needed();
    }

    /// Returns true once the 24-octet magic has been consumed.
    fn consume_preface(&mut self) -> bool {
        let have = self.recv_buf.len().min(PREFACE.len());
        if self.recv_buf[..have] != PREFACE[..have] {
            self.report_error(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "invalid connection preface",
            ));
            return false;
        }
        if have < PREFACE.len() {
            return false;
        }
        let _ = self.recv_buf.split_to(PREFACE.len());
        self.preface_consumed = true;
        true
    }

    fn fire_wakeup_if_needed(&mut self) {
        if self.wake_requested || self.writer.has_pending() {
            self.wake_requested = false;
            self.wakeup.fire();
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        // Header-continuation gate: a started header block owns the
        // connection until END_HEADERS.
        if let Some(expected) = self.receiving_headers_for_stream {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == expected => {}
                _ => {
                    return Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        CONTINUATION_EXPECTED,
                    ));
                }
            }
        }
        if !self.received_first_settings {
            match &frame {
                Frame::Settings { ack: false, .. } => {}
                _ => {
                    return Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        "connection preface must continue with a SETTINGS frame",
                    ));
                }
            }
        }
        match frame {
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
                priority,
            } => self.handle_headers(stream_id, fragment, end_stream, end_headers, priority),
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                wire_len,
            } => self.handle_data(stream_id, payload, end_stream, wire_len),
            Frame::Priority {
                stream_id,
                priority,
            } => self.handle_priority(stream_id, priority),
            Frame::RstStream {
                stream_id,
                error_code,
            } => self.handle_rst_stream(stream_id, error_code),
            Frame::Settings { ack, entries } => self.handle_settings(ack, entries),
            Frame::PushPromise { .. } => Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "clients cannot push",
            )),
            Frame::Ping { ack, payload } => {
                if !ack {
                    // Liveness probes jump ahead of body traffic.
                    self.writer
                        .write_urgent(&Frame::Ping { ack: true, payload });
                }
                Ok(())
            }
            Frame::GoAway { .. } => {
                self.shutdown = true;
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.handle_window_update(stream_id, increment),
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => self.handle_continuation(stream_id, fragment, end_headers),
            Frame::Unknown { .. } => Ok(()),
        }
    }

    // -- HEADERS / CONTINUATION --

    fn handle_headers(
        &mut self,
        stream_id: u32,
        fragment: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    ) -> Result<(), ProtocolError> {
        if stream_id % 2 == 0 {
            return Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "HEADERS on a server-initiated stream id",
            ));
        }
        if let Some(pri) = priority
            && pri.dependency == stream_id
        {
            return Err(ProtocolError::stream(stream_id, ErrorCode::ProtocolError));
        }

        enum Route {
            Opening { fresh: bool },
            Trailers,
            StreamClosed,
            ConnClosed,
        }
        let route = match self.tree.stream(stream_id) {
            None => {
                if stream_id <= self.max_client_stream_id {
                    return Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        "HEADERS stream id is not above the last opened stream",
                    ));
                }
                Route::Opening { fresh: true }
            }
            Some(stream) => match &stream.state {
                StreamState::Idle => Route::Opening { fresh: false },
                StreamState::Open(OpenPhase::FullHeaders)
                | StreamState::Open(OpenPhase::ActiveMessage(_)) => Route::Trailers,
                StreamState::Open(OpenPhase::PartialHeaders(_)) => {
                    // Unreachable past the continuation gate.
                    return Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        "HEADERS inside another header block",
                    ));
                }
                StreamState::HalfClosedRemote(_)
                | StreamState::Closed(ClosedReason::ResetByThem(_)) => Route::StreamClosed,
                StreamState::ReservedLocal | StreamState::Closed(_) => Route::ConnClosed,
            },
        };

        match route {
            Route::Opening { fresh } => {
                let block = HeaderBlock::new(&fragment, end_headers, end_stream);
                if fresh {
                    let shared = StreamShared::new(
                        self.config.request_body_buffer_size,
                        self.config.response_body_buffer_size,
                    );
                    let mut stream =
                        Stream::new(stream_id, self.peer_settings.max_frame_size, shared);
                    stream.state = StreamState::Open(OpenPhase::PartialHeaders(block));
                    self.tree.add(
                        stream,
                        priority,
                        i64::from(self.peer_settings.initial_window_size),
                        i64::from(self.local_settings.initial_window_size),
                    );
                } else {
                    let stream = self.tree.stream_mut(stream_id).expect("routed as known");
                    stream.state = StreamState::Open(OpenPhase::PartialHeaders(block));
                    if let Some(pri) = priority {
                        self.tree.reprioritize(stream_id, pri);
                    }
                }
                if end_headers {
                    self.finish_header_block(stream_id)
                } else {
                    self.receiving_headers_for_stream = Some(stream_id);
                    Ok(())
                }
            }
            Route::Trailers => {
                if !end_stream {
                    // A trailer block must end the stream.
                    self.report_request_error(
                        stream_id,
                        RequestError::BadRequest("trailer block without END_STREAM".into()),
                    );
                    return Ok(());
                }
                let stream = self.tree.stream_mut(stream_id).expect("routed as known");
                stream.trailer_block = Some(HeaderBlock::new(&fragment, end_headers, true));
                if end_headers {
                    self.finish_trailer_block(stream_id)
                } else {
                    self.receiving_headers_for_stream = Some(stream_id);
                    Ok(())
                }
            }
            Route::StreamClosed => Err(ProtocolError::stream(stream_id, ErrorCode::StreamClosed)),
            Route::ConnClosed => Err(ProtocolError::connection(
                ErrorCode::StreamClosed,
                "HEADERS on a closed or reserved stream",
            )),
        }
    }

    fn handle_continuation(
        &mut self,
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<(), ProtocolError> {
        if stream_id % 2 == 0 {
            return Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "CONTINUATION on a server-initiated stream id",
            ));
        }
        enum Block {
            Opening,
            Trailers,
        }
        let block = {
            let Some(stream) = self.tree.stream_mut(stream_id) else {
                return Err(ProtocolError::connection(
                    ErrorCode::ProtocolError,
                    "CONTINUATION for an unknown stream",
                ));
            };
            if let StreamState::Open(OpenPhase::PartialHeaders(block)) = &mut stream.state {
                block.push(&fragment);
                Block::Opening
            } else if let Some(block) = &mut stream.trailer_block {
                block.push(&fragment);
                Block::Trailers
            } else {
                return Err(ProtocolError::connection(
                    ErrorCode::ProtocolError,
                    "CONTINUATION without an open header block",
                ));
            }
        };
        if !end_headers {
            self.receiving_headers_for_stream = Some(stream_id);
            return Ok(());
        }
        match block {
            Block::Opening => self.finish_header_block(stream_id),
            Block::Trailers => self.finish_trailer_block(stream_id),
        }
    }

    /// END_HEADERS on an opening block: decode, validate, dispatch to the
    /// request handler.
    fn finish_header_block(&mut self, stream_id: u32) -> Result<(), ProtocolError> {
        self.receiving_headers_for_stream = None;
        let (block, end_stream) = {
            let stream = self.tree.stream_mut(stream_id).expect("block owner exists");
            match std::mem::replace(&mut stream.state, StreamState::Open(OpenPhase::FullHeaders)) {
                StreamState::Open(OpenPhase::PartialHeaders(block)) => {
                    (block.buf.freeze(), block.end_stream)
                }
                other => {
                    stream.state = other;
                    return Ok(());
                }
            }
        };
        let fields = self
            .hpack_decoder
            .decode(&block)
            .map_err(|e| ProtocolError::connection(ErrorCode::CompressionError, e.to_string()))?;

        // The GOAWAY watermark records every stream whose headers decoded,
        // accepted or not.
        self.max_client_stream_id = stream_id;

        if self.current_client_streams + 1 > self.config.max_concurrent_streams {
            // With a SETTINGS exchange in flight the peer may not know the
            // limit yet; REFUSED_STREAM tells it to retry elsewhere.
            let code = if self.unacked_settings > 0 {
                ErrorCode::RefusedStream
            } else {
                ErrorCode::ProtocolError
            };
            return Err(ProtocolError::stream(stream_id, code));
        }

        let request = match parse_request(fields) {
            Ok(request) => request,
            Err(reason) => {
                self.report_request_error(stream_id, RequestError::BadRequest(reason));
                return Ok(());
            }
        };
        let body_length = match parse_content_length(&request) {
            Ok(length) => length,
            Err(reason) => {
                self.report_request_error(stream_id, RequestError::BadRequest(reason));
                return Ok(());
            }
        };
        if end_stream && matches!(body_length, BodyLength::Fixed(n) if n != 0) {
            self.report_request_error(
                stream_id,
                RequestError::BadRequest("non-zero content-length on an empty body".into()),
            );
            return Ok(());
        }

        let request = Rc::new(request);
        let message = Message::new(request.clone(), body_length);
        let shared = {
            let stream = self.tree.stream_mut(stream_id).expect("block owner exists");
            {
                let mut shared = stream.shared.borrow_mut();
                if let BodyLength::Fixed(n) = body_length {
                    let capacity = usize::try_from(n).unwrap_or(usize::MAX).min(1 << 20);
                    shared.request_body = BodyBuffer::with_capacity(capacity);
                }
                if end_stream {
                    shared.request_body.close_writer();
                }
            }
            stream.counted = true;
            stream.state = if end_stream {
                StreamState::HalfClosedRemote(message)
            } else {
                StreamState::Open(OpenPhase::ActiveMessage(message))
            };
            stream.shared.clone()
        };
        self.current_client_streams += 1;

        let descriptor = RequestStream {
            id: stream_id,
            request,
            shared,
            conn: self.conn.clone(),
        };
        let handler = &mut self.request_handler;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(descriptor))) {
            return Err(ProtocolError::connection(
                ErrorCode::InternalError,
                panic_message(payload),
            ));
        }
        Ok(())
    }

    /// END_HEADERS on a trailer block: decode, validate, deliver, close
    /// the request body.
    fn finish_trailer_block(&mut self, stream_id: u32) -> Result<(), ProtocolError> {
        self.receiving_headers_for_stream = None;
        let block = {
            let stream = self.tree.stream_mut(stream_id).expect("block owner exists");
            match stream.trailer_block.take() {
                Some(block) => block.buf.freeze(),
                None => return Ok(()),
            }
        };
        let fields = self
            .hpack_decoder
            .decode(&block)
            .map_err(|e| ProtocolError::connection(ErrorCode::CompressionError, e.to_string()))?;
        if fields.iter().any(|f| f.name.starts_with(b":")) {
            self.report_request_error(
                stream_id,
                RequestError::BadRequest("pseudo-header field in trailers".into()),
            );
            return Ok(());
        }

        let dispatch = {
            let Some(stream) = self.tree.stream_mut(stream_id) else {
                return Ok(());
            };
            let mut shared = stream.shared.borrow_mut();
            shared.trailers = Some(fields);
            shared.request_body.close_reader()
        };
        self.end_peer_half(stream_id);
        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        Ok(())
    }

    /// The peer finished its half: move to HalfClosed while our response
    /// is still owed, straight to Finished otherwise.
    fn end_peer_half(&mut self, stream_id: u32) {
        let finished = {
            let Some(stream) = self.tree.stream_mut(stream_id) else {
                return;
            };
            let owes_output = stream.requires_output() || !stream.response_complete();
            let state = std::mem::replace(&mut stream.state, StreamState::Idle);
            match state {
                StreamState::Open(OpenPhase::ActiveMessage(message)) if owes_output => {
                    stream.state = StreamState::HalfClosedRemote(message);
                    false
                }
                StreamState::Open(_) if owes_output => {
                    stream.state = StreamState::Open(OpenPhase::FullHeaders);
                    false
                }
                _ => {
                    stream.state = state;
                    stream.finish(ClosedReason::Finished)
                }
            }
        };
        if finished {
            self.on_close(stream_id);
        }
    }

    // -- DATA --

    fn handle_data(
        &mut self,
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        wire_len: u32,
    ) -> Result<(), ProtocolError> {
        if stream_id % 2 == 0 {
            return Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "DATA on a server-initiated stream id",
            ));
        }
        // The connection window pays for the frame no matter what; padding
        // counts, errors do not excuse it.
        self.tree.deduct_inflow(0, wire_len);

        enum Route {
            Receive,
            LateSilent,
            LateClosed,
            Conn(&'static str),
        }
        let route = match self.tree.stream(stream_id) {
            None => {
                if stream_id > self.max_client_stream_id {
                    Route::Conn("DATA for an idle stream")
                } else {
                    // Evicted after close; late frames are forgiven.
                    Route::LateSilent
                }
            }
            Some(stream) => match &stream.state {
                StreamState::Idle => Route::Conn("DATA for an idle stream"),
                StreamState::Open(OpenPhase::ActiveMessage(_)) => Route::Receive,
                StreamState::Open(_) => Route::Conn("DATA before the request headers completed"),
                StreamState::ReservedLocal => Route::Conn("DATA on a reserved stream"),
                StreamState::Closed(ClosedReason::ResetByUs(ErrorCode::NoError)) => {
                    Route::LateSilent
                }
                StreamState::HalfClosedRemote(_) | StreamState::Closed(_) => Route::LateClosed,
            },
        };
        match route {
            Route::Conn(reason) => Err(ProtocolError::connection(ErrorCode::ProtocolError, reason)),
            Route::LateSilent => {
                self.return_connection_flow(wire_len);
                Ok(())
            }
            Route::LateClosed => {
                self.return_connection_flow(wire_len);
                Err(ProtocolError::stream(stream_id, ErrorCode::StreamClosed))
            }
            Route::Receive => self.receive_data(stream_id, payload, end_stream, wire_len),
        }
    }

    fn receive_data(
        &mut self,
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        wire_len: u32,
    ) -> Result<(), ProtocolError> {
        if !self.tree.allowed_to_receive(stream_id, wire_len) {
            // The connection already paid; give those bytes back before
            // the error frame goes out.
            self.return_connection_flow(wire_len);
            return Err(ProtocolError::stream(stream_id, ErrorCode::FlowControlError));
        }
        self.tree.deduct_inflow(stream_id, wire_len);

        let over_declared = {
            let stream = self.tree.stream_mut(stream_id).expect("routed as active");
            let message = stream.message_mut().expect("routed as active");
            message.body_bytes_received += payload.len() as u64;
            matches!(message.body_length, BodyLength::Fixed(n)
                if message.body_bytes_received > n)
        };
        if over_declared {
            self.return_connection_flow(wire_len);
            self.report_request_error(
                stream_id,
                RequestError::BadRequest("request body exceeds content-length".into()),
            );
            return Ok(());
        }

        if end_stream {
            self.end_peer_half(stream_id);
        }

        // Replenish both windows eagerly; the request body buffer is the
        // real backpressure here.
        self.return_connection_flow(wire_len);
        self.tree.add_inflow(stream_id, i64::from(wire_len));
        self.writer.write(&Frame::WindowUpdate {
            stream_id,
            increment: wire_len,
        });

        let dispatch = {
            let stream = self.tree.stream_mut(stream_id).expect("still tracked");
            let mut shared = stream.shared.borrow_mut();
            shared.request_body.schedule_bytes(payload);
            if end_stream {
                shared.request_body.close_writer();
            }
            shared.request_body.take_ready_dispatch()
        };
        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        Ok(())
    }

    fn return_connection_flow(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        self.tree.add_inflow(0, i64::from(n));
        self.writer.write(&Frame::WindowUpdate {
            stream_id: 0,
            increment: n,
        });
    }

    // -- PRIORITY / RST_STREAM --

    fn handle_priority(&mut self, stream_id: u32, priority: Priority) -> Result<(), ProtocolError> {
        if stream_id % 2 == 0 {
            return Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "PRIORITY on a server-initiated stream id",
            ));
        }
        if priority.dependency == stream_id {
            return Err(ProtocolError::stream(stream_id, ErrorCode::ProtocolError));
        }
        if self.tree.contains(stream_id) {
            self.tree.reprioritize(stream_id, priority);
        } else if stream_id > self.max_client_stream_id {
            // Idle stream, known only through its priority.
            let shared = StreamShared::new(
                self.config.request_body_buffer_size,
                self.config.response_body_buffer_size,
            );
            let stream = Stream::new(stream_id, self.peer_settings.max_frame_size, shared);
            self.tree.add(
                stream,
                Some(priority),
                i64::from(self.peer_settings.initial_window_size),
                i64::from(self.local_settings.initial_window_size),
            );
        }
        Ok(())
    }

    fn handle_rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> Result<(), ProtocolError> {
        if stream_id % 2 == 0 {
            return Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "RST_STREAM on a server-initiated stream id",
            ));
        }
        let known = self.tree.contains(stream_id);
        if !known {
            if stream_id > self.max_client_stream_id {
                return Err(ProtocolError::connection(
                    ErrorCode::ProtocolError,
                    "RST_STREAM for an idle stream",
                ));
            }
            // Already evicted; frames in flight are expected.
            return Ok(());
        }
        if matches!(
            self.tree.stream(stream_id).map(|s| &s.state),
            Some(StreamState::Idle)
        ) {
            return Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "RST_STREAM for an idle stream",
            ));
        }
        let (finished, dispatch) = {
            let stream = self.tree.stream_mut(stream_id).expect("known");
            let dispatch = stream.shared.borrow_mut().request_body.close_reader();
            (stream.finish(ClosedReason::ResetByThem(error_code)), dispatch)
        };
        if finished {
            self.on_close(stream_id);
        }
        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        Ok(())
    }

    // -- SETTINGS --

    fn handle_settings(&mut self, ack: bool, entries: Vec<Setting>) -> Result<(), ProtocolError> {
        if ack {
            if self.unacked_settings == 0 {
                return Err(ProtocolError::connection(
                    ErrorCode::ProtocolError,
                    "Received SETTINGS with ACK but no ACK was pending",
                ));
            }
            self.unacked_settings -= 1;
            return Ok(());
        }
        self.received_first_settings = true;
        for entry in entries {
            match entry {
                Setting::HeaderTableSize(v) => {
                    self.peer_settings.header_table_size = v;
                    self.hpack_encoder.set_capacity(v as usize);
                }
                Setting::EnablePush(v) => {
                    self.peer_settings.enable_push = v;
                    self.conn.borrow_mut().peer_push_enabled = v;
                }
                Setting::MaxConcurrentStreams(v) => {
                    self.peer_settings.max_concurrent_streams = Some(v);
                }
                Setting::InitialWindowSize(v) => {
                    let delta = i64::from(v) - i64::from(self.peer_settings.initial_window_size);
                    self.peer_settings.initial_window_size = v;
                    if delta != 0 {
                        for id in self.tree.ids() {
                            if !self.tree.add_flow(id, delta) {
                                return Err(ProtocolError::connection(
                                    ErrorCode::FlowControlError,
                                    "INITIAL_WINDOW_SIZE overflows a stream window",
                                ));
                            }
                            if self.tree.flow(id) > 0 {
                                self.wake_requested = true;
                            }
                        }
                    }
                }
                Setting::MaxFrameSize(v) => {
                    self.peer_settings.max_frame_size = v;
                    for id in self.tree.ids() {
                        let stream = self.tree.stream_mut(id).expect("listed");
                        if stream.requires_output() {
                            stream.max_frame_size = v;
                        }
                    }
                }
                Setting::MaxHeaderListSize(v) => {
                    self.peer_settings.max_header_list_size = Some(v);
                }
            }
        }
        self.writer.write(&Frame::Settings {
            ack: true,
            entries: Vec::new(),
        });
        self.unacked_settings += 1;
        Ok(())
    }

    // -- WINDOW_UPDATE --

    fn handle_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), ProtocolError> {
        if stream_id == 0 {
            if !self.tree.add_flow(0, i64::from(increment)) {
                return Err(ProtocolError::connection(
                    ErrorCode::FlowControlError,
                    "connection window overflow",
                ));
            }
            if self.tree.flow(0) > 0 {
                self.wake_requested = true;
            }
            return Ok(());
        }
        enum Route {
            Unknown,
            Idle,
            Closed,
            Live,
        }
        let route = match self.tree.stream(stream_id).map(|s| &s.state) {
            None => Route::Unknown,
            Some(StreamState::Idle) => Route::Idle,
            Some(StreamState::Closed(_)) => Route::Closed,
            Some(_) => Route::Live,
        };
        match route {
            Route::Unknown => {
                if self.above_watermark(stream_id) {
                    Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        "WINDOW_UPDATE for an idle stream",
                    ))
                } else {
                    Ok(())
                }
            }
            Route::Idle => Err(ProtocolError::connection(
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE for an idle stream",
            )),
            Route::Closed => Ok(()),
            Route::Live => {
                if !self.tree.add_flow(stream_id, i64::from(increment)) {
                    return Err(ProtocolError::stream(stream_id, ErrorCode::FlowControlError));
                }
                if self.tree.flow(stream_id) > 0 {
                    self.wake_requested = true;
                }
                Ok(())
            }
        }
    }

    fn above_watermark(&self, stream_id: u32) -> bool {
        if stream_id % 2 == 1 {
            stream_id > self.max_client_stream_id
        } else {
            stream_id > self.max_pushed_stream_id
        }
    }

    // -- Error reporting --

    pub(crate) fn report_error(&mut self, error: ProtocolError) {
        match error {
            ProtocolError::Connection { code, reason } => {
                self.send_goaway(code, reason);
            }
            ProtocolError::Stream { id, code } => {
                if self.tree.contains(id) {
                    self.reset_stream(id, code);
                } else if self.above_watermark(id) {
                    self.writer.write(&Frame::RstStream {
                        stream_id: id,
                        error_code: code,
                    });
                }
                // Below the watermark: a late frame for an evicted stream;
                // drop it.
            }
        }
    }

    /// First connection error wins; every later one is suppressed.
    fn send_goaway(&mut self, code: ErrorCode, reason: String) {
        if self.did_send_go_away {
            return;
        }
        self.did_send_go_away = true;
        if code != ErrorCode::NoError {
            self.hard_shutdown = true;
        }
        self.writer.write(&Frame::GoAway {
            last_stream_id: self.max_client_stream_id,
            error_code: code,
            debug_data: Bytes::from(reason.into_bytes()),
        });
        self.wake_requested = true;
    }

    fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        self.writer.write(&Frame::RstStream {
            stream_id,
            error_code: code,
        });
        let (finished, dispatch) = {
            let Some(stream) = self.tree.stream_mut(stream_id) else {
                return;
            };
            let dispatch = stream.shared.borrow_mut().request_body.close_reader();
            (stream.finish(ClosedReason::ResetByUs(code)), dispatch)
        };
        if finished {
            self.on_close(stream_id);
        }
        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        self.wake_requested = true;
    }

    /// Close-time bookkeeping: exactly once per stream.
    fn on_close(&mut self, stream_id: u32) {
        if let Some(stream) = self.tree.stream_mut(stream_id)
            && stream.counted
        {
            stream.counted = false;
            self.current_client_streams -= 1;
        }
        self.tree.mark_for_removal(stream_id);
    }

    /// Route a request-level failure through the user error handler, then
    /// arrange the stream's fate (reset for malformed input, normal finish
    /// otherwise).
    fn report_request_error(&mut self, stream_id: u32, error: RequestError) {
        let (request, shared) = {
            let Some(stream) = self.tree.stream_mut(stream_id) else {
                return;
            };
            if stream.errored || stream.is_closed() {
                return;
            }
            stream.errored = true;
            (stream.request(), stream.shared.clone())
        };
        let reset_code = match &error {
            RequestError::BadRequest(_) => Some(ErrorCode::ProtocolError),
            RequestError::InternalServerError(_) => None,
        };
        if shared.borrow().responded {
            // Too late to synthesize anything; tear the stream down.
            self.reset_stream(
                stream_id,
                reset_code.unwrap_or(ErrorCode::InternalError),
            );
            return;
        }
        if let Some(stream) = self.tree.stream_mut(stream_id) {
            stream.reset_after_output = reset_code;
        }
        let handler = &mut self.error_handler;
        (handler)(
            request,
            &error,
            ErrorResponse {
                shared: shared.clone(),
                wakeup: self.wakeup.clone(),
            },
        );
        if !shared.borrow().responded {
            // The handler declined to answer; nothing will ever drain, so
            // reset now.
            self.reset_stream(
                stream_id,
                reset_code.unwrap_or(ErrorCode::InternalError),
            );
        }
    }

    // -- Output assembly --

    fn prepare_output(&mut self) {
        self.adopt_pushes();
        self.drain_application_errors();
        self.write_response_heads();
        let completed = self.tree.flush(&mut self.writer);
        for stream_id in completed {
            self.finish_response(stream_id);
        }
    }

    fn adopt_pushes(&mut self) {
        let (pushes, exhausted) = {
            let mut conn = self.conn.borrow_mut();
            (
                std::mem::take(&mut conn.pending_pushes),
                std::mem::replace(&mut conn.ids_exhausted, false),
            )
        };
        if exhausted {
            self.send_goaway(ErrorCode::NoError, String::new());
        }
        for push in pushes {
            if self.did_send_go_away || self.shutdown {
                continue;
            }
            let fields = request_to_fields(&push.request);
            let mut block = BytesMut::new();
            self.hpack_encoder.encode(&fields, &mut block);
            write_promise_frames(
                &mut self.writer,
                push.parent_id,
                push.promised_id,
                block.freeze(),
                self.peer_settings.max_frame_size,
            );
            self.max_pushed_stream_id = push.promised_id;
            let mut stream = Stream::new(
                push.promised_id,
                self.peer_settings.max_frame_size,
                push.shared,
            );
            // Reserved only until the promise hits the wire, which just
            // happened; the peer's half is closed from birth.
            stream.state = StreamState::HalfClosedRemote(Message::new(
                push.request,
                BodyLength::Fixed(0),
            ));
            self.tree.add(
                stream,
                Some(Priority {
                    exclusive: false,
                    dependency: push.parent_id,
                    weight: 15,
                }),
                i64::from(self.peer_settings.initial_window_size),
                i64::from(self.local_settings.initial_window_size),
            );
        }
    }

    fn drain_application_errors(&mut self) {
        let mut errored = Vec::new();
        for id in self.tree.ids() {
            if let Some(stream) = self.tree.stream_mut(id)
                && let Some(error) = stream.shared.borrow_mut().error.take()
            {
                errored.push((id, error));
            }
        }
        for (id, error) in errored {
            self.report_request_error(id, error);
        }
    }

    /// Emit HEADERS (+ CONTINUATION) for every stream whose response head
    /// is waiting. Body bytes follow through the scheduler flush.
    fn write_response_heads(&mut self) {
        for id in self.tree.ids() {
            let Some(stream) = self.tree.stream_mut(id) else {
                continue;
            };
            if stream.is_closed() || stream.response_headers_sent {
                continue;
            }
            let Some(response) = stream.shared.borrow_mut().response.take() else {
                continue;
            };
            let mut fields =
                vec![HeaderField::new(":status", response.status.to_string())];
            fields.extend(response.headers);
            let max_frame_size = stream.max_frame_size;
            stream.response_headers_sent = true;
            let mut block = BytesMut::new();
            self.hpack_encoder.encode(&fields, &mut block);
            write_headers_frames(&mut self.writer, id, block.freeze(), max_frame_size);
        }
    }

    /// A stream's final DATA frame went out: settle its fate.
    fn finish_response(&mut self, stream_id: u32) {
        let (reset_code, peer_done) = {
            let Some(stream) = self.tree.stream_mut(stream_id) else {
                return;
            };
            if stream.is_closed() {
                return;
            }
            let peer_done = matches!(stream.state, StreamState::HalfClosedRemote(_));
            (stream.reset_after_output, peer_done)
        };
        if let Some(code) = reset_code {
            self.reset_stream(stream_id, code);
        } else if peer_done {
            let finished = self
                .tree
                .stream_mut(stream_id)
                .map(|s| s.finish(ClosedReason::Finished))
                .unwrap_or(false);
            if finished {
                self.on_close(stream_id);
            }
        } else {
            // Response done but the peer is still sending; drain politely
            // with a NoError reset and forgive whatever is in flight.
            self.reset_stream(stream_id, ErrorCode::NoError);
        }
    }

    fn write_side_finished(&self) -> bool {
        if self.did_send_go_away {
            // GOAWAY (and everything before it) has drained by the time
            // this is consulted.
            return self.hard_shutdown || !self.tree.any_output();
        }
        if (self.reader_closed || self.shutdown) && !self.tree.any_output() {
            return true;
        }
        false
    }

    // -- Introspection for tests --

    #[cfg(test)]
    pub(crate) fn unacked_settings(&self) -> u32 {
        self.unacked_settings
    }

    #[cfg(test)]
    pub(crate) fn max_client_stream_id(&self) -> u32 {
        self.max_client_stream_id
    }

    #[cfg(test)]
    pub(crate) fn current_client_streams(&self) -> u32 {
        self.current_client_streams
    }
}

// -- Request parsing --

fn utf8(value: &Bytes, what: &str) -> Result<String, String> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| format!("{what} is not valid UTF-8"))
}

/// Split pseudo-headers from the field list and validate them
/// (RFC 7540 Section 8.1.2).
fn parse_request(fields: Vec<HeaderField>) -> Result<Request, String> {
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut authority = None;
    let mut headers = Vec::new();
    let mut saw_regular = false;
    for field in fields {
        if field.name.starts_with(b":") {
            if saw_regular {
                return Err("pseudo-header after a regular header".into());
            }
            let slot = match &field.name[..] {
                b":method" => &mut method,
                b":path" => &mut path,
                b":scheme" => &mut scheme,
                b":authority" => &mut authority,
                _ => return Err("unknown pseudo-header in a request".into()),
            };
            if slot.is_some() {
                return Err("duplicate pseudo-header".into());
            }
            *slot = Some(utf8(&field.value, "pseudo-header value")?);
        } else {
            saw_regular = true;
            headers.push(field);
        }
    }
    let method = method.ok_or_else(|| ":method is required".to_string())?;
    let path = path.ok_or_else(|| ":path is required".to_string())?;
    let scheme = scheme.ok_or_else(|| ":scheme is required".to_string())?;
    if path.is_empty() {
        return Err(":path must not be empty".into());
    }
    Ok(Request {
        method,
        path,
        scheme,
        authority,
        headers,
    })
}

fn parse_content_length(request: &Request) -> Result<BodyLength, String> {
    match request.header(b"content-length") {
        None => Ok(BodyLength::Unknown),
        Some(raw) => {
            let text =
                std::str::from_utf8(raw).map_err(|_| "malformed content-length".to_string())?;
            let n: u64 = text
                .parse()
                .map_err(|_| "malformed content-length".to_string())?;
            Ok(BodyLength::Fixed(n))
        }
    }
}

/// Pseudo-header rendering of a promised request.
fn request_to_fields(request: &Request) -> Vec<HeaderField> {
    let mut fields = vec![
        HeaderField::new(":method", request.method.clone()),
        HeaderField::new(":scheme", request.scheme.clone()),
        HeaderField::new(":path", request.path.clone()),
    ];
    if let Some(authority) = &request.authority {
        fields.push(HeaderField::new(":authority", authority.clone()));
    }
    fields.extend(request.headers.iter().cloned());
    fields
}

// -- Header block framing --

fn write_headers_frames(writer: &mut FrameWriter, stream_id: u32, block: Bytes, max_frame_size: u32) {
    let max = max_frame_size as usize;
    let first_len = block.len().min(max);
    let first = block.slice(..first_len);
    let mut rest = block.slice(first_len..);
    writer.write(&Frame::Headers {
        stream_id,
        fragment: first,
        end_stream: false,
        end_headers: rest.is_empty(),
        priority: None,
    });
    while !rest.is_empty() {
        let take = rest.len().min(max);
        let fragment = rest.slice(..take);
        rest = rest.slice(take..);
        writer.write(&Frame::Continuation {
            stream_id,
            fragment,
            end_headers: rest.is_empty(),
        });
    }
}

fn write_promise_frames(
    writer: &mut FrameWriter,
    stream_id: u32,
    promised_stream_id: u32,
    block: Bytes,
    max_frame_size: u32,
) {
    // The promised-stream-id octets count against the frame size.
    let max = (max_frame_size as usize).saturating_sub(4).max(1);
    let first_len = block.len().min(max);
    let first = block.slice(..first_len);
    let mut rest = block.slice(first_len..);
    writer.write(&Frame::PushPromise {
        stream_id,
        promised_stream_id,
        fragment: first,
        end_headers: rest.is_empty(),
    });
    while !rest.is_empty() {
        let take = rest.len().min(max_frame_size as usize);
        let fragment = rest.slice(..take);
        rest = rest.slice(take..);
        writer.write(&Frame::Continuation {
            stream_id: promised_stream_id,
            fragment,
            end_headers: rest.is_empty(),
        });
    }
}
