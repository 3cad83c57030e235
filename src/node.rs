//! Cluster nodes as seen by the request engine.
//!
//! Discovery and gossip live outside this crate. Whatever tracks topology flips a
//! node's reachability flag with [`Node::mark_up`] / [`Node::mark_down`]; routing
//! policies read it when a query plan is consumed and pools read it to decide
//! whether reconnection should continue.
use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

#[derive(Debug)]
pub struct Node {
    address: SocketAddr,
    datacenter: Option<String>,
    up: AtomicBool,
}

impl Node {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            datacenter: None,
            up: AtomicBool::new(true),
        }
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn mark_up(&self) {
        self.up.store(true, Ordering::Release);
    }

    pub fn mark_down(&self) {
        self.up.store(false, Ordering::Release);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}
