//! End-to-end scenarios: a synthetic HTTP/2 client assembled from the
//! crate's own frame and HPACK codecs drives a `ServerConnection` through
//! its sans-IO interface, and the tests assert on the decoded server
//! output.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use strand_h2::frame::{self, Frame, Priority};
use strand_h2::server::PREFACE;
use strand_h2::settings::Setting;
use strand_h2::{
    Config, ErrorCode, HeaderField, ReadOperation, RequestStream, Response, ServerConnection,
    WriteOperation, WriteResult, hpack,
};

// -- Client-side helpers --

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);
    buf.to_vec()
}

struct TestClient {
    enc: hpack::Encoder,
    dec: hpack::Decoder,
}

impl TestClient {
    fn new() -> Self {
        Self {
            enc: hpack::Encoder::new(4096),
            dec: hpack::Decoder::new(4096),
        }
    }

    /// Magic + our (empty) SETTINGS + the ACK of the server's SETTINGS.
    fn preface(&self) -> Vec<u8> {
        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&encode_frame(&Frame::Settings {
            ack: false,
            entries: Vec::new(),
        }));
        bytes.extend_from_slice(&encode_frame(&Frame::Settings {
            ack: true,
            entries: Vec::new(),
        }));
        bytes
    }

    fn headers(
        &mut self,
        stream_id: u32,
        fields: &[HeaderField],
        end_stream: bool,
        end_headers: bool,
    ) -> Vec<u8> {
        let mut block = BytesMut::new();
        self.enc.encode(fields, &mut block);
        encode_frame(&Frame::Headers {
            stream_id,
            fragment: block.freeze(),
            end_stream,
            end_headers,
            priority: None,
        })
    }

    fn data(&self, stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
        encode_frame(&Frame::Data {
            stream_id,
            payload: Bytes::copy_from_slice(payload),
            end_stream,
            wire_len: payload.len() as u32,
        })
    }

    fn decode_headers(&mut self, fragment: &[u8]) -> Vec<HeaderField> {
        self.dec.decode(fragment).expect("server header block")
    }
}

fn get_request(path: &'static str) -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":path", path),
        HeaderField::new(":scheme", "https"),
    ]
}

fn drain(conn: &mut ServerConnection) -> Vec<Frame> {
    let mut out = BytesMut::new();
    loop {
        let chunk = match conn.next_write_operation() {
            WriteOperation::Write(buf) => buf.to_vec(),
            WriteOperation::Yield | WriteOperation::Close => break,
        };
        conn.report_write_result(WriteResult::Written(chunk.len()));
        out.extend_from_slice(&chunk);
    }
    let mut frames = Vec::new();
    while let Some(frame) = frame::decode(&mut out, (1 << 24) - 1).unwrap() {
        frames.push(frame);
    }
    frames
}

fn rst_frames(frames: &[Frame]) -> Vec<(u32, ErrorCode)> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::RstStream {
                stream_id,
                error_code,
            } => Some((*stream_id, *error_code)),
            _ => None,
        })
        .collect()
}

fn status_of(client: &mut TestClient, frames: &[Frame], stream_id: u32) -> Option<String> {
    frames.iter().find_map(|f| match f {
        Frame::Headers {
            stream_id: sid,
            fragment,
            ..
        } if *sid == stream_id => {
            let fields = client.decode_headers(fragment);
            fields
                .iter()
                .find(|h| h.name == b":status"[..])
                .map(|h| String::from_utf8_lossy(&h.value).into_owned())
        }
        _ => None,
    })
}

// -- Scenario 1: GET with an empty body --

#[test]
fn get_with_empty_body() {
    let invoked = Rc::new(Cell::new(0u32));
    let saw_eof = Rc::new(Cell::new(false));
    let (invoked2, saw_eof2) = (invoked.clone(), saw_eof.clone());
    let mut conn = ServerConnection::new(Config::default(), move |reqd| {
        invoked2.set(invoked2.get() + 1);
        assert_eq!(reqd.request().method, "GET");
        assert_eq!(reqd.request().path, "/");
        assert_eq!(reqd.request().scheme, "https");
        let saw_eof = saw_eof2.clone();
        reqd.request_body()
            .schedule_read(|_| panic!("no body expected"), move || saw_eof.set(true));
        let body = reqd.respond(Response::new(204));
        body.close();
    });

    let mut client = TestClient::new();
    conn.read(&client.preface());
    let preface_frames = drain(&mut conn);
    assert!(matches!(preface_frames[0], Frame::Settings { ack: false, .. }));
    assert!(matches!(preface_frames[1], Frame::Settings { ack: true, .. }));

    conn.read(&client.headers(1, &get_request("/"), true, true));
    let frames = drain(&mut conn);
    assert_eq!(invoked.get(), 1);
    assert!(saw_eof.get(), "request body must be born at EOF");
    assert_eq!(status_of(&mut client, &frames, 1).as_deref(), Some("204"));
}

// -- Scenario 2: concurrent-stream limit --

#[test]
fn concurrent_stream_limit_protocol_error_when_settled() {
    let config = Config {
        max_concurrent_streams: 1,
        ..Config::default()
    };
    let mut conn = ServerConnection::new(config, |_| {});
    let mut client = TestClient::new();
    // The preface includes our ACK of the server SETTINGS, so no exchange
    // is in flight by the time the streams open.
    conn.read(&client.preface());
    drain(&mut conn);

    let mut bytes = client.headers(1, &get_request("/a"), false, true);
    bytes.extend_from_slice(&client.headers(3, &get_request("/b"), false, true));
    conn.read(&bytes);
    let frames = drain(&mut conn);
    assert_eq!(rst_frames(&frames), vec![(3, ErrorCode::ProtocolError)]);
    assert!(!frames.iter().any(|f| matches!(f, Frame::GoAway { .. })));
}

#[test]
fn concurrent_stream_limit_refused_during_settings_flight() {
    let config = Config {
        max_concurrent_streams: 1,
        ..Config::default()
    };
    let mut conn = ServerConnection::new(config, |_| {});
    let mut client = TestClient::new();
    // No ACK from the client: our SETTINGS are still in flight, so the
    // excess stream is refused rather than faulted.
    let mut bytes = PREFACE.to_vec();
    bytes.extend_from_slice(&encode_frame(&Frame::Settings {
        ack: false,
        entries: Vec::new(),
    }));
    bytes.extend_from_slice(&client.headers(1, &get_request("/a"), false, true));
    bytes.extend_from_slice(&client.headers(3, &get_request("/b"), false, true));
    conn.read(&bytes);
    let frames = drain(&mut conn);
    assert_eq!(rst_frames(&frames), vec![(3, ErrorCode::RefusedStream)]);
}

// -- Scenario 3: content-length mismatch --

#[test]
fn content_length_mismatch_synthesizes_bad_request() {
    let mut conn = ServerConnection::new(Config::default(), |_| {});
    let mut client = TestClient::new();
    conn.read(&client.preface());
    drain(&mut conn);

    let mut fields = get_request("/upload");
    fields.push(HeaderField::new("content-length", "5"));
    conn.read(&client.headers(5, &fields, false, true));
    conn.read(&client.data(5, b"toolong", true));
    let frames = drain(&mut conn);

    assert_eq!(status_of(&mut client, &frames, 5).as_deref(), Some("400"));
    assert_eq!(rst_frames(&frames), vec![(5, ErrorCode::ProtocolError)]);
    assert!(!frames.iter().any(|f| matches!(f, Frame::GoAway { .. })));

    // The connection survives.
    conn.read(&encode_frame(&Frame::Ping {
        ack: false,
        payload: [7; 8],
    }));
    let frames = drain(&mut conn);
    assert!(matches!(frames[0], Frame::Ping { ack: true, .. }));
}

// -- Scenario 4: self-dependent priority --

#[test]
fn self_dependent_priority_resets_without_state() {
    let mut conn = ServerConnection::new(Config::default(), |_| {});
    let mut client = TestClient::new();
    conn.read(&client.preface());
    drain(&mut conn);

    conn.read(&encode_frame(&Frame::Priority {
        stream_id: 7,
        priority: Priority {
            exclusive: false,
            dependency: 7,
            weight: 16,
        },
    }));
    let frames = drain(&mut conn);
    assert_eq!(rst_frames(&frames), vec![(7, ErrorCode::ProtocolError)]);
    assert!(!frames.iter().any(|f| matches!(f, Frame::GoAway { .. })));
    assert_eq!(conn.next_read_operation(), ReadOperation::Read);
}

// -- Scenario 5: flow-control violation --

#[test]
fn oversized_data_returns_connection_credit_then_resets() {
    let config = Config {
        initial_window_size: 100,
        ..Config::default()
    };
    let mut conn = ServerConnection::new(config, |_| {});
    let mut client = TestClient::new();
    conn.read(&client.preface());
    drain(&mut conn);

    conn.read(&client.headers(1, &get_request("/"), false, true));
    conn.read(&client.data(1, &[0u8; 150], false));
    let frames = drain(&mut conn);

    // The connection's 150 octets come back first, then the stream dies.
    let updates: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => Some((*stream_id, *increment)),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![(0, 150)]);
    assert_eq!(rst_frames(&frames), vec![(1, ErrorCode::FlowControlError)]);
    let wu_at = frames
        .iter()
        .position(|f| matches!(f, Frame::WindowUpdate { .. }))
        .unwrap();
    let rst_at = frames
        .iter()
        .position(|f| matches!(f, Frame::RstStream { .. }))
        .unwrap();
    assert!(wu_at < rst_at, "flow credit must precede the error frame");
}

// -- Scenario 6: CONTINUATION interleaving --

#[test]
fn interleaved_frame_during_header_block_is_fatal() {
    let mut conn = ServerConnection::new(Config::default(), |_| {});
    let mut client = TestClient::new();
    conn.read(&client.preface());
    drain(&mut conn);

    let mut bytes = client.headers(1, &get_request("/"), false, false);
    bytes.extend_from_slice(&encode_frame(&Frame::Ping {
        ack: false,
        payload: [0; 8],
    }));
    conn.read(&bytes);
    let frames = drain(&mut conn);
    match frames.last().unwrap() {
        Frame::GoAway {
            error_code,
            debug_data,
            ..
        } => {
            assert_eq!(*error_code, ErrorCode::ProtocolError);
            let text = String::from_utf8_lossy(debug_data);
            assert!(text.contains("CONTINUATION"), "debug text was {text:?}");
        }
        other => panic!("expected GOAWAY, got {other:?}"),
    }
    assert_eq!(conn.next_read_operation(), ReadOperation::Close);
    assert!(matches!(conn.next_write_operation(), WriteOperation::Close));
}

// -- Header blocks split across CONTINUATION --

#[test]
fn continuation_reassembles_the_header_block() {
    let served_path = Rc::new(RefCell::new(String::new()));
    let served_path2 = served_path.clone();
    let mut conn = ServerConnection::new(Config::default(), move |reqd| {
        *served_path2.borrow_mut() = reqd.request().path.clone();
        let body = reqd.respond(Response::new(204));
        body.close();
    });
    let mut client = TestClient::new();
    conn.read(&client.preface());
    drain(&mut conn);

    // Encode the block once, then split it by hand.
    let mut block = BytesMut::new();
    client.enc.encode(&get_request("/split"), &mut block);
    let block = block.freeze();
    let cut = block.len() / 2;
    let mut bytes = encode_frame(&Frame::Headers {
        stream_id: 1,
        fragment: block.slice(..cut),
        end_stream: true,
        end_headers: false,
        priority: None,
    });
    bytes.extend_from_slice(&encode_frame(&Frame::Continuation {
        stream_id: 1,
        fragment: block.slice(cut..),
        end_headers: true,
    }));
    conn.read(&bytes);
    let frames = drain(&mut conn);
    assert_eq!(&*served_path.borrow(), "/split");
    assert_eq!(status_of(&mut client, &frames, 1).as_deref(), Some("204"));
}

// -- Body accounting --

#[test]
fn echoed_body_matches_data_payload_sum() {
    fn pump(reqd: Rc<RequestStream>, acc: Rc<RefCell<Vec<u8>>>) {
        let reqd_next = reqd.clone();
        let acc_next = acc.clone();
        reqd.request_body().schedule_read(
            move |chunk| {
                acc_next.borrow_mut().extend_from_slice(&chunk);
                pump(reqd_next, acc_next.clone());
            },
            move || {
                let collected = acc.borrow().clone();
                let body = reqd.respond(
                    Response::new(200).with_header("content-type", "application/octet-stream"),
                );
                body.schedule_bytes(Bytes::from(collected));
                body.close();
            },
        );
    }
    let mut conn = ServerConnection::new(Config::default(), |reqd| {
        pump(Rc::new(reqd), Rc::new(RefCell::new(Vec::new())));
    });
    let mut client = TestClient::new();
    conn.read(&client.preface());
    drain(&mut conn);

    conn.read(&client.headers(1, &get_request("/echo"), false, true));
    conn.read(&client.data(1, &[1u8; 10], false));
    conn.read(&client.data(1, &[2u8; 20], false));
    conn.read(&client.data(1, &[3u8; 30], true));
    let frames = drain(&mut conn);

    let mut echoed = Vec::new();
    let mut final_frames = 0;
    for frame in &frames {
        if let Frame::Data {
            payload,
            end_stream,
            ..
        } = frame
        {
            echoed.extend_from_slice(payload);
            if *end_stream {
                final_frames += 1;
                assert!(payload.is_empty());
            }
        }
    }
    assert_eq!(echoed.len(), 60);
    assert_eq!(&echoed[..10], &[1u8; 10]);
    assert_eq!(&echoed[40..], &[3u8; 30]);
    assert_eq!(final_frames, 1, "exactly one final DATA frame");
}

// -- Flow-controlled response delivery --

#[test]
fn response_body_waits_for_window_updates() {
    let mut conn = ServerConnection::new(Config::default(), |reqd| {
        let body = reqd.respond(Response::new(200));
        body.write_bytes(&[9u8; 100]);
        body.close();
    });
    let mut client = TestClient::new();
    // Client announces a 10-octet initial window for server sends.
    let mut bytes = PREFACE.to_vec();
    bytes.extend_from_slice(&encode_frame(&Frame::Settings {
        ack: false,
        entries: vec![Setting::InitialWindowSize(10)],
    }));
    conn.read(&bytes);
    drain(&mut conn);

    conn.read(&client.headers(1, &get_request("/big"), true, true));
    let frames = drain(&mut conn);
    let sent: usize = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Data { payload, .. } => Some(payload.len()),
            _ => None,
        })
        .sum();
    assert_eq!(sent, 10, "stream window caps the first burst");

    // Grant 90 more octets; the rest follows, then the final frame.
    conn.read(&encode_frame(&Frame::WindowUpdate {
        stream_id: 1,
        increment: 90,
    }));
    let frames = drain(&mut conn);
    let sent: usize = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Data { payload, .. } => Some(payload.len()),
            _ => None,
        })
        .sum();
    assert_eq!(sent, 90);
    assert!(frames.iter().any(|f| matches!(
        f,
        Frame::Data {
            end_stream: true,
            ..
        }
    )));
}

// -- Lifecycle --

#[test]
fn read_eof_drains_pending_responses_then_closes() {
    let mut conn = ServerConnection::new(Config::default(), |reqd| {
        let body = reqd.respond(Response::new(200));
        body.write_str("bye");
        body.close();
    });
    let mut client = TestClient::new();
    conn.read(&client.preface());
    drain(&mut conn);
    // The transport delivers the last request together with EOF.
    conn.read_eof(&client.headers(1, &get_request("/"), true, true));
    let frames = drain(&mut conn);
    assert!(frames.iter().any(|f| matches!(
        f,
        Frame::Data {
            end_stream: true,
            ..
        }
    )));
    assert!(matches!(conn.next_write_operation(), WriteOperation::Close));
    assert_eq!(conn.next_read_operation(), ReadOperation::Close);
}
