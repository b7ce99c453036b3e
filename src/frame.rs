//! HTTP/2 frame codec (RFC 7540 Sections 4 and 6).
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+---------------+
//! |R|           Stream Identifier (31)            |
//! +-+---------------------------------------------+
//! ```
//!
//! Decoding consumes whole frames from an accumulation buffer and returns
//! `None` until one is complete. Per-type validation (stream-zero rules,
//! fixed payload sizes, padding bounds) happens here, at parse time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, ProtocolError};
use crate::settings::{self, Setting};

pub const FRAME_HEADER_LEN: usize = 9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// Frame type discriminant (RFC 7540 Section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Unknown(other) => other,
        }
    }
}

/// Stream dependency carried by PRIORITY frames and prioritized HEADERS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

/// A decoded HTTP/2 frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        /// Payload length as it appeared on the wire, padding included.
        /// Flow control debits this, not `payload.len()` (RFC 7540
        /// Section 6.9.1). Encoding never pads, so writers set it to the
        /// payload length.
        wire_len: u32,
    },
    Headers {
        stream_id: u32,
        fragment: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        entries: Vec<Setting>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    },
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    },
}

fn conn_err(reason: &'static str) -> ProtocolError {
    ProtocolError::connection(ErrorCode::ProtocolError, reason)
}

fn size_err(reason: &'static str) -> ProtocolError {
    ProtocolError::connection(ErrorCode::FrameSizeError, reason)
}

/// Decode one frame from the front of `src`, consuming it. Returns
/// `Ok(None)` while the buffer holds less than a whole frame.
pub fn decode(src: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, ProtocolError> {
    if src.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let length = u32::from(src[0]) << 16 | u32::from(src[1]) << 8 | u32::from(src[2]);
    let frame_type = FrameType::from_u8(src[3]);

    // The cap applies as soon as the header is readable; waiting for a
    // 16 MiB payload just to reject it would let the peer balloon our
    // buffer. SETTINGS is exempt: its length is 6 * entry count.
    if length > max_frame_size && frame_type != FrameType::Settings {
        return Err(size_err("frame exceeds SETTINGS_MAX_FRAME_SIZE"));
    }

    let total = FRAME_HEADER_LEN + length as usize;
    if src.len() < total {
        return Ok(None);
    }

    let mut header = src.split_to(FRAME_HEADER_LEN);
    header.advance(3);
    let _type = header.get_u8();
    let flags = header.get_u8();
    let stream_id = header.get_u32() & 0x7fff_ffff;
    let payload = src.split_to(length as usize).freeze();

    let frame = match frame_type {
        FrameType::Data => {
            if stream_id == 0 {
                return Err(conn_err("DATA on stream 0"));
            }
            let (data, _pad) = strip_padding(payload, flags)?;
            Frame::Data {
                stream_id,
                payload: data,
                end_stream: flags & FLAG_END_STREAM != 0,
                wire_len: length,
            }
        }
        FrameType::Headers => {
            if stream_id == 0 {
                return Err(conn_err("HEADERS on stream 0"));
            }
            let (mut data, _pad) = strip_padding(payload, flags)?;
            let priority = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return Err(size_err("HEADERS priority section truncated"));
                }
                Some(read_priority(&mut data))
            } else {
                None
            };
            Frame::Headers {
                stream_id,
                fragment: data,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FrameType::Priority => {
            if stream_id == 0 {
                return Err(conn_err("PRIORITY on stream 0"));
            }
            if payload.len() != 5 {
                return Err(ProtocolError::stream(stream_id, ErrorCode::FrameSizeError));
            }
            let mut data = payload;
            Frame::Priority {
                stream_id,
                priority: read_priority(&mut data),
            }
        }
        FrameType::RstStream => {
            if stream_id == 0 {
                return Err(conn_err("RST_STREAM on stream 0"));
            }
            if payload.len() != 4 {
                return Err(size_err("RST_STREAM payload must be 4 octets"));
            }
            let mut data = payload;
            // Unregistered codes carry no special meaning and collapse to
            // INTERNAL_ERROR (RFC 7540 Section 7).
            let error_code = ErrorCode::try_from(data.get_u32())
                .unwrap_or(ErrorCode::InternalError);
            Frame::RstStream {
                stream_id,
                error_code,
            }
        }
        FrameType::Settings => {
            if stream_id != 0 {
                return Err(conn_err("SETTINGS on a non-zero stream"));
            }
            let ack = flags & FLAG_ACK != 0;
            if ack {
                if !payload.is_empty() {
                    return Err(size_err("SETTINGS ACK with a payload"));
                }
                Frame::Settings {
                    ack: true,
                    entries: Vec::new(),
                }
            } else {
                Frame::Settings {
                    ack: false,
                    entries: settings::decode_entries(&payload)?,
                }
            }
        }
        FrameType::PushPromise => {
            if stream_id == 0 {
                return Err(conn_err("PUSH_PROMISE on stream 0"));
            }
            let (mut data, _pad) = strip_padding(payload, flags)?;
            if data.len() < 4 {
                return Err(size_err("PUSH_PROMISE payload truncated"));
            }
            let promised_stream_id = data.get_u32() & 0x7fff_ffff;
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                fragment: data,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FrameType::Ping => {
            if stream_id != 0 {
                return Err(conn_err("PING on a non-zero stream"));
            }
            if payload.len() != 8 {
                return Err(size_err("PING payload must be 8 octets"));
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(&payload);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                payload: data,
            }
        }
        FrameType::GoAway => {
            if stream_id != 0 {
                return Err(conn_err("GOAWAY on a non-zero stream"));
            }
            if payload.len() < 8 {
                return Err(size_err("GOAWAY payload truncated"));
            }
            let mut data = payload;
            let last_stream_id = data.get_u32() & 0x7fff_ffff;
            let error_code =
                ErrorCode::try_from(data.get_u32()).unwrap_or(ErrorCode::InternalError);
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data: data,
            }
        }
        FrameType::WindowUpdate => {
            if payload.len() != 4 {
                return Err(size_err("WINDOW_UPDATE payload must be 4 octets"));
            }
            let mut data = payload;
            let increment = data.get_u32() & 0x7fff_ffff;
            if increment == 0 {
                // RFC 7540 Section 6.9: zero increments are rejected at the
                // parser, connection-wide on stream 0.
                return Err(if stream_id == 0 {
                    conn_err("WINDOW_UPDATE with zero increment")
                } else {
                    ProtocolError::stream(stream_id, ErrorCode::ProtocolError)
                });
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        FrameType::Continuation => {
            if stream_id == 0 {
                return Err(conn_err("CONTINUATION on stream 0"));
            }
            Frame::Continuation {
                stream_id,
                fragment: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FrameType::Unknown(frame_type) => Frame::Unknown {
            frame_type,
            flags,
            stream_id,
            payload,
        },
    };
    Ok(Some(frame))
}

fn read_priority(data: &mut Bytes) -> Priority {
    let raw = data.get_u32();
    Priority {
        exclusive: raw & 0x8000_0000 != 0,
        dependency: raw & 0x7fff_ffff,
        weight: data.get_u8(),
    }
}

fn strip_padding(payload: Bytes, flags: u8) -> Result<(Bytes, usize), ProtocolError> {
    if flags & FLAG_PADDED == 0 {
        return Ok((payload, 0));
    }
    if payload.is_empty() {
        return Err(size_err("PADDED frame without a pad length octet"));
    }
    let pad_len = payload[0] as usize;
    if pad_len + 1 > payload.len() {
        return Err(conn_err("padding exceeds the frame payload"));
    }
    Ok((payload.slice(1..payload.len() - pad_len), pad_len))
}

fn put_frame_header(
    dst: &mut BytesMut,
    payload_len: usize,
    frame_type: FrameType,
    flags: u8,
    stream_id: u32,
) {
    dst.put_uint(payload_len as u64, 3);
    dst.put_u8(frame_type.to_u8());
    dst.put_u8(flags);
    dst.put_u32(stream_id & 0x7fff_ffff);
}

impl Frame {
    /// Serialize this frame (header and payload) into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                put_frame_header(dst, payload.len(), FrameType::Data, flags, *stream_id);
                dst.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                let extra = if priority.is_some() {
                    flags |= FLAG_PRIORITY;
                    5
                } else {
                    0
                };
                put_frame_header(
                    dst,
                    fragment.len() + extra,
                    FrameType::Headers,
                    flags,
                    *stream_id,
                );
                if let Some(pri) = priority {
                    put_priority(dst, pri);
                }
                dst.extend_from_slice(fragment);
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                put_frame_header(dst, 5, FrameType::Priority, 0, *stream_id);
                put_priority(dst, priority);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                put_frame_header(dst, 4, FrameType::RstStream, 0, *stream_id);
                dst.put_u32(error_code.wire());
            }
            Frame::Settings { ack, entries } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                let mut payload = BytesMut::new();
                settings::encode_entries(entries, &mut payload);
                put_frame_header(dst, payload.len(), FrameType::Settings, flags, 0);
                dst.extend_from_slice(&payload);
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                fragment,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                put_frame_header(
                    dst,
                    fragment.len() + 4,
                    FrameType::PushPromise,
                    flags,
                    *stream_id,
                );
                dst.put_u32(*promised_stream_id & 0x7fff_ffff);
                dst.extend_from_slice(fragment);
            }
            Frame::Ping { ack, payload } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                put_frame_header(dst, 8, FrameType::Ping, flags, 0);
                dst.extend_from_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                put_frame_header(dst, 8 + debug_data.len(), FrameType::GoAway, 0, 0);
                dst.put_u32(*last_stream_id & 0x7fff_ffff);
                dst.put_u32(error_code.wire());
                dst.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                put_frame_header(dst, 4, FrameType::WindowUpdate, 0, *stream_id);
                dst.put_u32(*increment & 0x7fff_ffff);
            }
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                put_frame_header(
                    dst,
                    fragment.len(),
                    FrameType::Continuation,
                    flags,
                    *stream_id,
                );
                dst.extend_from_slice(fragment);
            }
            Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            } => {
                put_frame_header(
                    dst,
                    payload.len(),
                    FrameType::Unknown(*frame_type),
                    *flags,
                    *stream_id,
                );
                dst.extend_from_slice(payload);
            }
        }
    }
}

fn put_priority(dst: &mut BytesMut, pri: &Priority) {
    let mut raw = pri.dependency & 0x7fff_ffff;
    if pri.exclusive {
        raw |= 0x8000_0000;
    }
    dst.put_u32(raw);
    dst.put_u8(pri.weight);
}

/// Outbound frame buffer. Tracks closed state for the driver and keeps an
/// urgent lane that jumps the queue; PING ACKs use it so liveness probes are
/// not stuck behind a large response body.
pub(crate) struct FrameWriter {
    urgent: BytesMut,
    buf: BytesMut,
    closed: bool,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            urgent: BytesMut::new(),
            buf: BytesMut::new(),
            closed: false,
        }
    }

    pub fn write(&mut self, frame: &Frame) {
        frame.encode(&mut self.buf);
    }

    pub fn write_urgent(&mut self, frame: &Frame) {
        frame.encode(&mut self.urgent);
    }

    pub fn has_pending(&self) -> bool {
        !self.urgent.is_empty() || !self.buf.is_empty()
    }

    /// The next contiguous chunk to hand to the transport.
    pub fn pending(&self) -> &[u8] {
        if self.urgent.is_empty() {
            &self.buf
        } else {
            &self.urgent
        }
    }

    /// Acknowledge `n` transport-written bytes, front first.
    pub fn consume(&mut self, mut n: usize) {
        let from_urgent = n.min(self.urgent.len());
        self.urgent.advance(from_urgent);
        n -= from_urgent;
        self.buf.advance(n.min(self.buf.len()));
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
