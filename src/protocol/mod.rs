//! Native binary protocol.
//!
//! This module defines the wire protocol spoken between rime and the nodes of a
//! cluster: frame layout, opcodes, body compression and the request/response bodies
//! the request engine needs. Both directions are implemented, the node side being
//! used by the `rime_node` binary and by tests.
//!
//! # Overview
//!
//! Every message is a frame: a 9-byte header followed by a body. The header carries
//! the protocol version (with the high bit set on responses), a flag byte, a signed
//! stream id used to multiplex concurrent requests over one connection, the opcode
//! and the body length. Bodies are written with the protocol's primitive notations
//! (`[string]`, `[long string]`, `[bytes]`, ...), all integers big-endian.
//!
//! A connection starts uncompressed. The client may send OPTIONS to learn what the
//! node supports, then STARTUP naming a compression algorithm. Once the node answers
//! READY every non-empty body on that connection is compressed with the agreed
//! algorithm.
//!
//! # Key Components
//!
//! - [`FrameCodec`]: encodes and decodes whole frames for one negotiated [`Compression`].
//! - [`Request`] / [`Response`]: message bodies keyed by [`Opcode`].
//! - [`ResponseMessage`]: a response plus its tracing id and server warnings.
//! - [`ProtocolTransport`]: sequential frame exchange over any async byte stream.
//! - [`NodeServer`]: a protocol-speaking node driven by a [`Responder`].
//!
//! # See Also
//!
//! - [`connection`](crate::connection): multiplexes requests over one transport.
mod compression;
mod frame;
mod request;
mod response;
mod server;
mod transport;
mod types;

pub use compression::{Compression, CompressionError};
pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, EVENT_STREAM_ID, Frame, FrameCodec, FrameError, FrameHeader,
    HEADER_LEN, Opcode, PROTOCOL_VERSION, RESPONSE_DIRECTION, flags,
};
pub use request::{BatchEntry, BatchKind, BatchRequest, QueryParameters, Request};
pub use response::{
    ErrorDetails, Response, ResponseMessage, ResultBody, ServerError, WriteType, error_codes,
};
pub use server::{EchoResponder, NodeServer, Responder, serve_connection};
pub use transport::{ProtocolTransport, encode_request, encode_response, read_frame};
