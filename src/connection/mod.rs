//! Multiplexed connections to a single node.
//!
//! A [`Connection`] owns one transport and lets many requests share it. Each
//! request reserves a stream id, writes one frame tagged with it, and waits for the
//! response frame carrying the same id. Responses come back in whatever order the
//! node produces them.
//!
//! # Overview
//!
//! Opening a connection splits the transport between two tasks:
//!
//! - the writer drains a channel of encoded frames, so frames leave in the order
//!   they were submitted;
//! - the reader decodes incoming frames and routes each one to the waiter
//!   registered for its stream id.
//!
//! Both hold only a weak reference to the connection. Closing it, for whatever
//! reason, fails every outstanding request with [`ConnectionError::Closed`] and
//! releases all stream ids in one step.
//!
//! A waiter that loses interest (its [`ResponseHandle`] is dropped) abandons its
//! stream: the id stays taken until the node answers, then the answer is decoded
//! and dropped and the id goes back to the free list.
//!
//! # Key Components
//!
//! - [`Connection`]: state machine, stream id arena and task handles.
//! - [`PendingRequest`]: a reserved stream id, released again if nothing is sent.
//! - [`ResponseHandle`]: the receiving end of one sent request.
//!
//! # See Also
//!
//! - [`pool`](crate::pool): opens, hands out and replaces connections.
mod streams;

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::DriverConfig,
    error::{ErrorKind, QueryError},
    protocol::{
        Compression, EVENT_STREAM_ID, Frame, FrameCodec, FrameError, Request, Response,
        ResponseMessage, encode_request, flags, read_frame,
    },
};

use streams::{Completion, StreamTable};

/// Number of non-negative stream ids of the protocol.
pub const MAX_STREAM_IDS: usize = 32768;

const CQL_VERSION: &str = "3.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("closed on request")]
    Requested,

    #[error("drained")]
    Drained,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("IO error: {0}")]
    Io(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("response on stream {0} with no request outstanding")]
    UnexpectedStream(i16),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("heartbeat failed: {0}")]
    Heartbeat(String),

    #[error("connection dropped")]
    Dropped,
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connection closed: {0}")]
    Closed(CloseReason),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connect failed: {0}")]
    Connect(Arc<std::io::Error>),

    #[error("frame body of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::Connect(Arc::new(value))
    }
}

impl From<FrameError> for ConnectionError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::TooLarge { size, max } => ConnectionError::FrameTooLarge { size, max },
            other => ConnectionError::Encode(other.to_string()),
        }
    }
}

impl From<ConnectionError> for QueryError {
    fn from(value: ConnectionError) -> Self {
        let kind = match &value {
            ConnectionError::FrameTooLarge { .. } => ErrorKind::FrameTooLarge,
            ConnectionError::Encode(_) => ErrorKind::ProtocolError,
            ConnectionError::Closed(_)
            | ConnectionError::Handshake(_)
            | ConnectionError::ConnectTimeout(_)
            | ConnectionError::Connect(_) => ErrorKind::ConnectionClosed,
        };
        QueryError::new(kind, value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// STARTUP sent, READY not received yet.
    Connecting,
    Ready,
    /// Outstanding requests finish, no new ones are accepted.
    Draining,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

pub struct Connection {
    id: u64,
    node: SocketAddr,
    codec: FrameCodec,
    state: AtomicU8,
    streams: Mutex<StreamTable>,
    writer: mpsc::UnboundedSender<Bytes>,
    last_write: Mutex<Instant>,
    closed: watch::Sender<Option<CloseReason>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Start a connection over an established transport and run the STARTUP
    /// handshake, negotiating the configured compression.
    pub async fn open<S>(
        id: u64,
        node: SocketAddr,
        stream: S,
        config: &DriverConfig,
    ) -> Result<Arc<Self>, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let compression = config.compression();
        let codec = FrameCodec::new(compression, config.max_frame_size);
        let (read_half, write_half) = tokio::io::split(stream);
        let (frames, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);

        let connection = Arc::new(Self {
            id,
            node,
            codec,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            streams: Mutex::new(StreamTable::new(config.max_requests_per_connection)),
            writer: frames,
            last_write: Mutex::new(Instant::now()),
            closed,
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(reader(Arc::downgrade(&connection), read_half, codec));
        let writer = tokio::spawn(writer(Arc::downgrade(&connection), write_half, rx));
        connection.tasks().extend([reader, writer]);

        if let Err(e) = connection.startup(compression).await {
            connection.close(CloseReason::Handshake(e.to_string()));
            return Err(e);
        }
        connection.set_state(ConnectionState::Ready);
        info!("connection {} to {} ready, compression {compression:?}", id, node);

        if let Some(interval) = config.heartbeat_interval {
            let heartbeat = tokio::spawn(heartbeat(Arc::downgrade(&connection), interval));
            connection.tasks().push(heartbeat);
        }
        Ok(connection)
    }

    async fn startup(self: &Arc<Self>, compression: Compression) -> Result<(), ConnectionError> {
        let mut options = BTreeMap::new();
        options.insert("CQL_VERSION".to_string(), CQL_VERSION.to_string());
        if let Some(name) = compression.name() {
            options.insert("COMPRESSION".to_string(), name.to_string());
        }

        let pending = self
            .reserve_stream()
            .ok_or_else(|| ConnectionError::Handshake("no stream id for STARTUP".into()))?;
        // The node reads STARTUP before compression is in effect.
        let plain = FrameCodec::new(Compression::None, self.codec.max_frame_size());
        let raw = encode_request(&plain, pending.stream, &Request::Startup { options }, 0)?;
        let message = pending.dispatch(raw)?.recv().await?;

        match message.response {
            Response::Ready => Ok(()),
            Response::Authenticate { authenticator } => Err(ConnectionError::Handshake(format!(
                "node requires authentication through {authenticator}"
            ))),
            Response::Error(error) => Err(ConnectionError::Handshake(error.message)),
            other => Err(ConnectionError::Handshake(format!(
                "unexpected {:?} response to STARTUP",
                other.opcode()
            ))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> SocketAddr {
        self.node
    }

    pub fn compression(&self) -> Compression {
        self.codec.compression()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Stream ids currently taken.
    pub fn in_flight(&self) -> usize {
        self.streams().in_use()
    }

    pub fn available_streams(&self) -> usize {
        self.streams().available()
    }

    /// Reserve a stream id for one request. Fails instead of waiting when the
    /// connection is not ready or all its ids are taken.
    pub fn reserve(self: &Arc<Self>) -> Option<PendingRequest> {
        if !self.is_ready() {
            return None;
        }
        let pending = self.reserve_stream();
        if pending.is_none() {
            trace!("connection {} to {} has no free stream id", self.id, self.node);
        }
        pending
    }

    fn reserve_stream(self: &Arc<Self>) -> Option<PendingRequest> {
        let (stream, ticket) = self.streams().reserve()?;
        Some(PendingRequest {
            connection: Arc::clone(self),
            stream,
            ticket,
            sent: false,
        })
    }

    /// Stop accepting requests and close once the outstanding ones are answered.
    pub fn drain(&self) {
        let drained = self
            .state
            .compare_exchange(
                ConnectionState::Ready as u8,
                ConnectionState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if drained {
            debug!("connection {} to {} draining", self.id, self.node);
            self.close_if_drained();
        }
    }

    /// Close the connection. Every outstanding request fails with
    /// [`ConnectionError::Closed`] and every stream id is released. Closing an
    /// already closed connection does nothing.
    pub fn close(&self, reason: CloseReason) {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return;
        }

        let waiters = self.streams().drain();
        match &reason {
            CloseReason::Requested | CloseReason::Drained => info!(
                "connection {} to {} closed: {reason}",
                self.id, self.node
            ),
            _ => warn!(
                "connection {} to {} closed: {reason}, failing {} request(s)",
                self.id,
                self.node,
                waiters.len()
            ),
        }
        for tx in waiters {
            let _ = tx.send(Err(ConnectionError::Closed(reason.clone())));
        }
        self.closed.send_replace(Some(reason));

        for task in self.tasks().drain(..) {
            task.abort();
        }
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Dropped;
            }
        }
    }

    fn closed_error(&self) -> ConnectionError {
        let reason = self
            .closed
            .borrow()
            .clone()
            .unwrap_or(CloseReason::Dropped);
        ConnectionError::Closed(reason)
    }

    /// Route one incoming frame. An `Err` means the connection can no longer be
    /// trusted and must close.
    fn dispatch(&self, frame: Frame) -> Result<(), CloseReason> {
        let stream = frame.stream();
        if stream < 0 {
            if stream == EVENT_STREAM_ID {
                trace!("ignoring event pushed by {}", self.node);
            }
            return Ok(());
        }

        let completion = self.streams().complete(stream);
        match completion {
            Completion::Waiting(tx) => match ResponseMessage::decode(frame) {
                Ok(message) => {
                    let _ = tx.send(Ok(message));
                }
                Err(e) => {
                    let reason = CloseReason::Protocol(e.to_string());
                    let _ = tx.send(Err(ConnectionError::Closed(reason.clone())));
                    return Err(reason);
                }
            },
            Completion::Abandoned => {
                ResponseMessage::decode(frame)
                    .map_err(|e| CloseReason::Protocol(e.to_string()))?;
                debug!(
                    "discarded response to abandoned stream {stream} on connection {}",
                    self.id
                );
            }
            Completion::Unknown => return Err(CloseReason::UnexpectedStream(stream)),
        }
        self.close_if_drained();
        Ok(())
    }

    fn close_if_drained(&self) {
        if self.state() == ConnectionState::Draining && self.in_flight() == 0 {
            self.close(CloseReason::Drained);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        // Never leave Closed.
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Closed as u8).then_some(state as u8)
            });
    }

    fn streams(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_write.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_write(&self) -> Instant {
        *self.last_write.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(CloseReason::Dropped);
    }
}

/// A reserved stream id. Dropping it without sending releases the id.
#[derive(Debug)]
pub struct PendingRequest {
    connection: Arc<Connection>,
    stream: i16,
    ticket: u64,
    sent: bool,
}

impl PendingRequest {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn stream(&self) -> i16 {
        self.stream
    }

    /// Encode and queue `request`. Oversized bodies fail here, before anything is
    /// written.
    pub fn send(self, request: &Request, tracing: bool) -> Result<ResponseHandle, ConnectionError> {
        let flags = if tracing { flags::TRACING } else { 0 };
        let raw = encode_request(&self.connection.codec, self.stream, request, flags)?;
        self.dispatch(raw)
    }

    fn dispatch(mut self, raw: Bytes) -> Result<ResponseHandle, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        if !self.connection.streams().attach(self.stream, self.ticket, tx) {
            return Err(self.connection.closed_error());
        }
        self.sent = true;

        let handle = ResponseHandle {
            connection: Arc::clone(&self.connection),
            stream: self.stream,
            ticket: self.ticket,
            rx,
            done: false,
        };
        if self.connection.writer.send(raw).is_err() {
            return Err(self.connection.closed_error());
        }
        Ok(handle)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.sent {
            self.connection.streams().abandon(self.stream, self.ticket);
            self.connection.close_if_drained();
        }
    }
}

/// Receiving end of a sent request. Dropping it before the response arrives
/// abandons the stream.
#[derive(Debug)]
pub struct ResponseHandle {
    connection: Arc<Connection>,
    stream: i16,
    ticket: u64,
    rx: oneshot::Receiver<Result<ResponseMessage, ConnectionError>>,
    done: bool,
}

impl ResponseHandle {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn stream(&self) -> i16 {
        self.stream
    }

    pub async fn recv(mut self) -> Result<ResponseMessage, ConnectionError> {
        let result = match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(self.connection.closed_error()),
        };
        self.done = true;
        result
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if !self.done {
            trace!(
                "abandoning stream {} on connection {}",
                self.stream, self.connection.id
            );
            self.connection.streams().abandon(self.stream, self.ticket);
        }
    }
}

async fn reader<R>(connection: Weak<Connection>, mut read_half: R, codec: FrameCodec)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let frame = match read_frame(&mut read_half, &codec).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break CloseReason::PeerClosed,
            Err(FrameError::Io(e)) => break CloseReason::Io(e.to_string()),
            Err(e) => break CloseReason::Protocol(e.to_string()),
        };
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if let Err(reason) = connection.dispatch(frame) {
            break reason;
        }
    };
    if let Some(connection) = connection.upgrade() {
        connection.close(reason);
    }
}

async fn writer<W>(connection: Weak<Connection>, mut write_half: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(raw) = rx.recv().await {
        let mut result = write_half.write_all(&raw).await;
        let mut frames = 1;
        // Coalesce whatever is already queued into one flush.
        while result.is_ok() {
            match rx.try_recv() {
                Ok(raw) => {
                    result = write_half.write_all(&raw).await;
                    frames += 1;
                }
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = write_half.flush().await;
        }

        let Some(connection) = connection.upgrade() else {
            return;
        };
        match result {
            Ok(()) => {
                trace!("connection {} wrote {frames} frame(s)", connection.id);
                connection.touch();
            }
            Err(e) => {
                connection.close(CloseReason::Io(e.to_string()));
                return;
            }
        }
    }
}

/// Send OPTIONS whenever the connection has been idle for `interval`; a failed or
/// unanswered heartbeat closes it.
async fn heartbeat(connection: Weak<Connection>, interval: Duration) {
    loop {
        let deadline = match connection.upgrade() {
            Some(connection) => connection.last_write() + interval,
            None => return,
        };
        tokio::time::sleep_until(deadline).await;

        let Some(connection) = connection.upgrade() else {
            return;
        };
        if !connection.is_ready() {
            return;
        }
        if connection.last_write() + interval > Instant::now() {
            continue;
        }

        let Some(pending) = connection.reserve() else {
            // Every stream is busy, so the connection is anything but idle.
            connection.touch();
            continue;
        };
        trace!("heartbeat on connection {} to {}", connection.id, connection.node);
        let outcome = match pending.send(&Request::Options, false) {
            Ok(handle) => tokio::time::timeout(interval, handle.recv()).await,
            Err(e) => Ok(Err(e)),
        };
        let failure = match outcome {
            Ok(Ok(ResponseMessage {
                response: Response::Supported { .. },
                ..
            })) => continue,
            Ok(Ok(message)) => format!("unexpected {:?} response", message.response.opcode()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no answer within {interval:?}"),
        };
        connection.close(CloseReason::Heartbeat(failure));
        return;
    }
}
