//! Per-node connection pools.
//!
//! A [`NodePool`] keeps `connections_per_node` connections open to one node and
//! hands out stream ids on the least busy of them. Acquisition never waits: when
//! every connection is saturated the pool reports exhaustion right away and, if it
//! is still below `max_connections_per_node`, opens one more connection in the
//! background for the requests that follow.
//!
//! # Overview
//!
//! Each open connection is watched by a monitor task. When a connection closes,
//! the monitor removes it from the pool and, if the pool fell below its core size,
//! starts a reconnection loop. The loop waits out the delays of a
//! [`ReconnectionSchedule`] between attempts and keeps going for as long as the
//! node is marked up and the pool has not been shut down.
//!
//! # Key Components
//!
//! - [`Connector`]: opens raw transports; [`TcpConnector`] for real nodes.
//! - [`NodePool`]: connection set, acquisition and reconnection.
//! - [`AcquireError`]: why no stream id could be handed out.
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::watch,
};

use crate::{
    config::DriverConfig,
    connection::{CloseReason, Connection, ConnectionError, ConnectionState, PendingRequest},
    error::ErrorKind,
    node::Node,
    policy::{ReconnectionPolicy, ReconnectionSchedule},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Byte stream a [`Connection`] can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to node addresses.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, address: SocketAddr) -> std::io::Result<BoxedTransport>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: SocketAddr) -> std::io::Result<BoxedTransport> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("node {0} is marked down")]
    NodeDown(SocketAddr),

    #[error("every stream id to {0} is in use")]
    Exhausted(SocketAddr),

    #[error("no ready connection to {0}")]
    NoConnection(SocketAddr),

    #[error("pool for {0} is shut down")]
    Shutdown(SocketAddr),
}

impl AcquireError {
    /// Classification recorded in the failure history of a request.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquireError::Exhausted(_) => ErrorKind::Overloaded,
            AcquireError::NodeDown(_)
            | AcquireError::NoConnection(_)
            | AcquireError::Shutdown(_) => ErrorKind::ConnectionClosed,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Connections being opened, reconnection loops included.
    pending: usize,
}

#[derive(Debug)]
pub struct NodePool {
    node: Arc<Node>,
    config: Arc<DriverConfig>,
    connector: Arc<dyn Connector>,
    reconnection: Arc<dyn ReconnectionPolicy>,
    state: Mutex<PoolState>,
    shutdown: watch::Sender<bool>,
}

impl NodePool {
    pub fn new(
        node: Arc<Node>,
        config: Arc<DriverConfig>,
        connector: Arc<dyn Connector>,
        reconnection: Arc<dyn ReconnectionPolicy>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node,
            config,
            connector,
            reconnection,
            state: Mutex::new(PoolState::default()),
            shutdown,
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Open connections currently in the pool.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state().connections.clone()
    }

    pub fn size(&self) -> usize {
        self.state().connections.len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Open connections up to the core size and wait for them. Connections that
    /// fail to open are handed to a reconnection loop. Returns the pool size.
    pub async fn fill(self: &Arc<Self>) -> usize {
        let missing = {
            let mut state = self.state();
            let missing = self
                .config
                .connections_per_node
                .saturating_sub(state.connections.len() + state.pending);
            state.pending += missing;
            missing
        };
        if missing == 0 {
            return self.size();
        }

        let opened = join_all((0..missing).map(|_| self.open())).await;
        for result in opened {
            match result {
                Ok(connection) => self.add(connection),
                Err(e) => {
                    warn!("failed to connect to {}: {e}", self.node);
                    self.spawn_reconnect();
                }
            }
        }
        self.size()
    }

    /// Reserve a stream id on the least busy ready connection.
    pub fn acquire(self: &Arc<Self>) -> Result<PendingRequest, AcquireError> {
        let address = self.node.address();
        if self.is_shut_down() {
            return Err(AcquireError::Shutdown(address));
        }
        if !self.node.is_up() {
            return Err(AcquireError::NodeDown(address));
        }

        let mut state = self.state();
        state
            .connections
            .retain(|connection| connection.state() != ConnectionState::Closed);

        let mut ready: Vec<&Arc<Connection>> = state
            .connections
            .iter()
            .filter(|connection| connection.is_ready())
            .collect();
        ready.sort_by_key(|connection| connection.in_flight());
        for connection in &ready {
            if let Some(pending) = connection.reserve() {
                return Ok(pending);
            }
        }

        let error = if ready.is_empty() {
            AcquireError::NoConnection(address)
        } else {
            AcquireError::Exhausted(address)
        };
        if state.connections.len() + state.pending < self.config.max_connections_per_node {
            state.pending += 1;
            drop(state);
            self.spawn_grow();
        }
        debug!("cannot acquire a stream: {error}");
        Err(error)
    }

    /// Resume connecting after the node came back up.
    pub fn on_node_up(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.fill().await;
        });
    }

    /// Stop reconnecting and drain every connection: outstanding requests finish,
    /// then the connections close.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let connections = std::mem::take(&mut self.state().connections);
        info!(
            "shutting down pool for {}, draining {} connection(s)",
            self.node,
            connections.len()
        );
        for connection in connections {
            connection.drain();
        }
    }

    fn on_connection_closed(self: &Arc<Self>, connection: &Arc<Connection>, reason: CloseReason) {
        let mut state = self.state();
        state
            .connections
            .retain(|other| !Arc::ptr_eq(other, connection));
        debug!(
            "connection {} to {} left the pool: {reason}",
            connection.id(),
            self.node
        );

        if self.is_shut_down() || !self.node.is_up() {
            return;
        }
        if state.connections.len() + state.pending < self.config.connections_per_node {
            state.pending += 1;
            drop(state);
            self.spawn_reconnect();
        }
    }

    async fn open(&self) -> Result<Arc<Connection>, ConnectionError> {
        let address = self.node.address();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.connect_timeout;
        let connecting = async {
            let transport = self.connector.connect(address).await?;
            Connection::open(id, address, transport, &self.config).await
        };
        tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(timeout))?
    }

    /// Take over one pending slot with a freshly opened connection.
    fn add(self: &Arc<Self>, connection: Arc<Connection>) {
        let mut state = self.state();
        state.pending = state.pending.saturating_sub(1);
        if self.is_shut_down() {
            connection.close(CloseReason::Requested);
            return;
        }
        state.connections.push(Arc::clone(&connection));
        drop(state);

        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = connection.closed().await;
            if let Some(pool) = pool.upgrade() {
                pool.on_connection_closed(&connection, reason);
            }
        });
    }

    fn release_pending(&self) {
        let mut state = self.state();
        state.pending = state.pending.saturating_sub(1);
    }

    fn should_reconnect(&self) -> bool {
        !self.is_shut_down() && self.node.is_up()
    }

    fn spawn_grow(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match pool.open().await {
                Ok(connection) => {
                    debug!("pool for {} grew to {}", pool.node, pool.size() + 1);
                    pool.add(connection);
                }
                Err(e) => {
                    warn!("failed to open extra connection to {}: {e}", pool.node);
                    pool.release_pending();
                }
            }
        });
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let schedule = self.reconnection.new_schedule();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(reconnect(Arc::downgrade(self), schedule, shutdown));
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for connection in state.connections.drain(..) {
            connection.close(CloseReason::Requested);
        }
    }
}

/// Reconnection loop owning one pending slot of the pool.
async fn reconnect(
    pool: Weak<NodePool>,
    mut schedule: Box<dyn ReconnectionSchedule>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delay = schedule.next_delay();
        match pool.upgrade() {
            Some(pool) if pool.should_reconnect() => {
                info!("reconnecting to {} in {delay:?}", pool.node);
            }
            Some(pool) => {
                debug!("stopped reconnecting to {}", pool.node);
                pool.release_pending();
                return;
            }
            None => return,
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if let Some(pool) = pool.upgrade() {
                    pool.release_pending();
                }
                return;
            }
        }

        let Some(pool) = pool.upgrade() else {
            return;
        };
        if !pool.should_reconnect() {
            pool.release_pending();
            return;
        }
        match pool.open().await {
            Ok(connection) => {
                info!("reconnected to {}", pool.node);
                pool.add(connection);
                return;
            }
            Err(e) => warn!("reconnection to {} failed: {e}", pool.node),
        }
    }
}
