//! Sans-IO server-side HTTP/2 connection engine.
//!
//! This crate implements the server half of RFC 7540 as a pure state
//! machine: no sockets, no TLS, no runtime. The embedding owns the
//! transport and drives the engine through an explicit operation
//! interface; the engine demultiplexes frames into request streams,
//! enforces flow control and concurrency limits, runs the shared HPACK
//! contexts, and serializes the outbound side through a priority
//! scheduler.
//!
//! # Architecture
//!
//! ```text
//!   transport bytes
//!        |
//!   +----v-------------+
//!   | strand-h2        |  framing + HPACK + stream state
//!   | ServerConnection |  RequestStream handles out to the app
//!   +----+-------------+
//!        |
//!   transport bytes
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_h2::{Config, Response, ServerConnection, WriteOperation};
//!
//! let mut conn = ServerConnection::new(Config::default(), |reqd| {
//!     let body = reqd.respond(Response::new(200));
//!     body.write_str("hello");
//!     body.close();
//! });
//!
//! // Feed bytes from the transport.
//! conn.read(&received);
//!
//! // Drain bytes toward the transport.
//! match conn.next_write_operation() {
//!     WriteOperation::Write(buf) => { let n = transport_send(buf); /* ... */ }
//!     WriteOperation::Yield => { /* park until conn wakes the writer */ }
//!     WriteOperation::Close => { /* shut the socket down */ }
//! }
//! ```

mod body;
pub mod config;
pub mod error;
pub mod frame;
pub mod hpack;
mod huffman;
mod scheduler;
pub mod server;
pub mod settings;
pub mod stream;

pub use config::Config;
pub use error::{ErrorCode, ProtocolError, RequestError, UnknownErrorCode};
pub use frame::{Frame, FrameType};
pub use hpack::HeaderField;
pub use server::{
    ErrorResponse, PushError, ReadOperation, RequestBody, RequestStream, ResponseBody,
    ServerConnection, WriteOperation, WriteResult,
};
pub use settings::Settings;
pub use stream::{BodyLength, Request, Response};
