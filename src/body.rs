//! Request and response body conduits.
//!
//! A `BodyBuffer` is a single-producer, single-consumer byte queue. For a
//! request body the dispatcher produces (DATA payloads) and the application
//! consumes via one-shot scheduled reads; for a response body the
//! application produces and the flush path drains the bytes into DATA
//! frames.
//!
//! The buffer itself never invokes callbacks: every operation that could
//! complete a scheduled read returns a [`ReadDispatch`] for the caller to
//! run once the surrounding `RefCell` borrow is released. That keeps
//! re-entrant `schedule_read` calls from a read callback legal.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::frame::{Frame, FrameWriter};

/// One-shot writer wakeup slot: a callback cell that starts as a no-op.
/// Firing takes the stored callback and leaves the no-op behind, so a
/// wakeup is consumed by delivery and re-arming requires re-registration.
#[derive(Clone, Default)]
pub(crate) struct Wakeup {
    slot: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
}

impl Wakeup {
    pub fn register(&self, k: Box<dyn FnOnce()>) {
        *self.slot.borrow_mut() = Some(k);
    }

    pub fn fire(&self) {
        let k = self.slot.borrow_mut().take();
        if let Some(k) = k {
            k();
        }
    }
}

pub type OnRead = Box<dyn FnOnce(Bytes)>;
pub type OnEof = Box<dyn FnOnce()>;

/// A completed read obligation, to be invoked by the caller after dropping
/// any shared-state borrow.
pub(crate) enum ReadDispatch {
    Data(OnRead, Bytes),
    Eof(OnEof),
}

impl ReadDispatch {
    pub fn run(self) {
        match self {
            Self::Data(on_read, chunk) => on_read(chunk),
            Self::Eof(on_eof) => on_eof(),
        }
    }
}

pub(crate) struct BodyBuffer {
    /// Copying writes accumulate here until sealed into a chunk.
    staged: BytesMut,
    chunks: VecDeque<Bytes>,
    /// Bytes currently transferable (staged + chunks). Backs
    /// `requires_output` so repeated transfers cannot double-count.
    pending_bytes: usize,
    writer_closed: bool,
    /// Exactly-once latch for the closing empty DATA + END_STREAM frame.
    final_frame_sent: bool,
    pending_read: Option<(OnRead, OnEof)>,
}

impl BodyBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            staged: BytesMut::with_capacity(capacity),
            chunks: VecDeque::new(),
            pending_bytes: 0,
            writer_closed: false,
            final_frame_sent: false,
            pending_read: None,
        }
    }

    // -- Producer side --

    pub fn write_byte(&mut self, byte: u8) {
        self.write_bytes(&[byte]);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        if self.writer_closed || data.is_empty() {
            return;
        }
        self.staged.extend_from_slice(data);
        self.pending_bytes += data.len();
    }

    /// Zero-copy hand-off of an owned chunk.
    pub fn schedule_bytes(&mut self, data: Bytes) {
        if self.writer_closed || data.is_empty() {
            return;
        }
        self.seal();
        self.pending_bytes += data.len();
        self.chunks.push_back(data);
    }

    /// Idempotent. Later writes are dropped; EOF becomes observable once
    /// the buffered bytes drain.
    pub fn close_writer(&mut self) {
        self.writer_closed = true;
    }

    // -- Consumer side --

    /// Register a one-shot read. Dispatches immediately when bytes are
    /// already buffered or EOF is already observable.
    ///
    /// # Panics
    ///
    /// Panics if a read is already pending; the conduit is single-consumer
    /// and re-registration before delivery is a programming error.
    pub fn schedule_read(&mut self, on_read: OnRead, on_eof: OnEof) -> Option<ReadDispatch> {
        assert!(
            self.pending_read.is_none(),
            "schedule_read while a read is already pending"
        );
        self.pending_read = Some((on_read, on_eof));
        self.take_ready_dispatch()
    }

    /// Complete the pending read if data or EOF is available. The producer
    /// side calls this after writing or closing.
    pub fn take_ready_dispatch(&mut self) -> Option<ReadDispatch> {
        if self.pending_read.is_none() {
            return None;
        }
        if let Some(chunk) = self.pop_chunk() {
            let (on_read, _) = self.pending_read.take().expect("checked above");
            return Some(ReadDispatch::Data(on_read, chunk));
        }
        if self.writer_closed {
            let (_, on_eof) = self.pending_read.take().expect("checked above");
            return Some(ReadDispatch::Eof(on_eof));
        }
        None
    }

    /// Drop buffered input and make EOF observable, completing a pending
    /// read with EOF. Used when a stream is reset or trailers end the
    /// message.
    pub fn close_reader(&mut self) -> Option<ReadDispatch> {
        self.staged.clear();
        self.chunks.clear();
        self.pending_bytes = 0;
        self.writer_closed = true;
        self.pending_read
            .take()
            .map(|(_, on_eof)| ReadDispatch::Eof(on_eof))
    }

    // -- Writer drain (response side) --

    /// True while the buffer still owes the writer something: bytes, or
    /// the final empty DATA frame.
    pub fn has_output(&self) -> bool {
        self.pending_bytes > 0 || (self.writer_closed && !self.final_frame_sent)
    }

    pub fn final_frame_sent(&self) -> bool {
        self.final_frame_sent
    }

    /// Drain up to `max_bytes` into DATA frames of at most `max_frame_size`
    /// payload octets each. Once closed and drained, exactly one empty
    /// DATA frame with END_STREAM goes out, regardless of `max_bytes` —
    /// ending a stream consumes no flow-control credit.
    pub fn transfer_to_writer(
        &mut self,
        writer: &mut FrameWriter,
        stream_id: u32,
        max_frame_size: u32,
        max_bytes: usize,
    ) -> usize {
        let mut written = 0usize;
        while written < max_bytes {
            let Some(mut chunk) = self.pop_chunk() else {
                break;
            };
            let take = chunk
                .len()
                .min(max_frame_size as usize)
                .min(max_bytes - written);
            let payload = chunk.split_to(take);
            if !chunk.is_empty() {
                self.pending_bytes += chunk.len();
                self.chunks.push_front(chunk);
            }
            written += payload.len();
            writer.write(&Frame::Data {
                stream_id,
                wire_len: payload.len() as u32,
                payload,
                end_stream: false,
            });
        }
        if self.writer_closed && self.pending_bytes == 0 && !self.final_frame_sent {
            self.final_frame_sent = true;
            writer.write(&Frame::Data {
                stream_id,
                payload: Bytes::new(),
                end_stream: true,
                wire_len: 0,
            });
        }
        written
    }

    fn seal(&mut self) {
        if !self.staged.is_empty() {
            self.chunks.push_back(self.staged.split().freeze());
        }
    }

    fn pop_chunk(&mut self) -> Option<Bytes> {
        self.seal();
        let chunk = self.chunks.pop_front()?;
        self.pending_bytes -= chunk.len();
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use std::cell::Cell;

    fn drain_frames(writer: &mut FrameWriter) -> Vec<Frame> {
        let mut src = BytesMut::from(writer.pending());
        let n = writer.pending().len();
        writer.consume(n);
        let mut frames = Vec::new();
        while let Some(f) = frame::decode(&mut src, 1 << 24).unwrap() {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn immediate_dispatch_when_data_buffered() {
        let mut body = BodyBuffer::with_capacity(64);
        body.write_str("hello");
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        let dispatch = body.schedule_read(
            Box::new(move |chunk| got2.borrow_mut().extend_from_slice(&chunk)),
            Box::new(|| panic!("not eof")),
        );
        dispatch.unwrap().run();
        assert_eq!(&*got.borrow(), b"hello");
    }

    #[test]
    fn pending_read_completes_on_write() {
        let mut body = BodyBuffer::with_capacity(64);
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        assert!(
            body.schedule_read(
                Box::new(move |chunk| {
                    assert_eq!(&chunk[..], b"later");
                    fired2.set(true);
                }),
                Box::new(|| panic!("not eof")),
            )
            .is_none()
        );
        body.write_bytes(b"later");
        body.take_ready_dispatch().unwrap().run();
        assert!(fired.get());
    }

    #[test]
    fn eof_delivered_after_drain() {
        let mut body = BodyBuffer::with_capacity(64);
        body.write_str("x");
        body.close_writer();
        let dispatch = body.schedule_read(
            Box::new(|chunk| assert_eq!(&chunk[..], b"x")),
            Box::new(|| panic!("data first")),
        );
        dispatch.unwrap().run();
        let eof = Rc::new(Cell::new(false));
        let eof2 = eof.clone();
        body.schedule_read(
            Box::new(|_| panic!("drained")),
            Box::new(move || eof2.set(true)),
        )
        .unwrap()
        .run();
        assert!(eof.get());
    }

    #[test]
    #[should_panic(expected = "read is already pending")]
    fn double_schedule_panics() {
        let mut body = BodyBuffer::with_capacity(64);
        let _ = body.schedule_read(Box::new(|_| {}), Box::new(|| {}));
        let _ = body.schedule_read(Box::new(|_| {}), Box::new(|| {}));
    }

    #[test]
    fn writes_after_close_are_dropped() {
        let mut body = BodyBuffer::with_capacity(64);
        body.close_writer();
        body.write_str("nope");
        body.schedule_bytes(Bytes::from_static(b"nope"));
        assert_eq!(body.pending_bytes, 0);
    }

    #[test]
    fn transfer_splits_at_max_frame_size() {
        let mut body = BodyBuffer::with_capacity(64);
        body.write_bytes(&[7u8; 10]);
        let mut writer = FrameWriter::new();
        let n = body.transfer_to_writer(&mut writer, 1, 4, usize::MAX);
        assert_eq!(n, 10);
        let frames = drain_frames(&mut writer);
        let sizes: Vec<usize> = frames
            .iter()
            .map(|f| match f {
                Frame::Data { payload, .. } => payload.len(),
                other => panic!("expected DATA, got {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn transfer_respects_flow_budget() {
        let mut body = BodyBuffer::with_capacity(64);
        body.write_bytes(&[1u8; 100]);
        let mut writer = FrameWriter::new();
        assert_eq!(body.transfer_to_writer(&mut writer, 1, 1000, 30), 30);
        assert_eq!(body.pending_bytes, 70);
        assert!(body.has_output());
    }

    #[test]
    fn final_frame_exactly_once_even_with_zero_budget() {
        let mut body = BodyBuffer::with_capacity(64);
        body.close_writer();
        let mut writer = FrameWriter::new();
        assert_eq!(body.transfer_to_writer(&mut writer, 5, 1000, 0), 0);
        let frames = drain_frames(&mut writer);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Data {
                payload,
                end_stream,
                ..
            } => {
                assert!(payload.is_empty());
                assert!(end_stream);
            }
            other => panic!("expected DATA, got {other:?}"),
        }
        // A second transfer emits nothing.
        assert_eq!(body.transfer_to_writer(&mut writer, 5, 1000, 1000), 0);
        assert!(drain_frames(&mut writer).is_empty());
        assert!(!body.has_output());
    }

    #[test]
    fn close_reader_discards_and_delivers_eof() {
        let mut body = BodyBuffer::with_capacity(64);
        body.write_str("stale");
        let eof = Rc::new(Cell::new(false));
        let eof2 = eof.clone();
        // Drain the buffered chunk so the read parks.
        let d = body.schedule_read(Box::new(|_| {}), Box::new(|| {}));
        d.unwrap().run();
        assert!(
            body.schedule_read(
                Box::new(|_| panic!("discarded")),
                Box::new(move || eof2.set(true)),
            )
            .is_none()
        );
        body.write_str("more");
        body.close_reader().unwrap().run();
        assert!(eof.get());
        assert_eq!(body.pending_bytes, 0);
    }

    #[test]
    fn wakeup_is_one_shot() {
        let wakeup = Wakeup::default();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        wakeup.register(Box::new(move || count2.set(count2.get() + 1)));
        wakeup.fire();
        wakeup.fire();
        assert_eq!(count.get(), 1);
    }
}
