//! In-memory cluster for driving sessions end to end.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rime::{
    DriverConfig, Session, SessionBuilder, Statement,
    node::Node,
    policy::{LoadBalancingPolicy, QueryPlan},
    pool::{BoxedTransport, Connector},
    protocol::{EchoResponder, Request, Responder, Response, ServerError, serve_connection},
};
use tokio::io::duplex;

/// A node that echoes like `rime_node`, after an optional delay, unless a
/// scripted error is queued.
#[derive(Debug, Default)]
pub struct ScriptedNode {
    echo: EchoResponder,
    delay: Mutex<Duration>,
    errors: Mutex<VecDeque<ServerError>>,
    queries: AtomicUsize,
    connections: AtomicUsize,
}

impl ScriptedNode {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// The next statement fails with `error`.
    pub fn fail_next(&self, error: ServerError) {
        self.errors.lock().unwrap().push_back(error);
    }

    /// Statements (QUERY, EXECUTE, BATCH) received so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Responder for ScriptedNode {
    async fn respond(&self, request: Request) -> Response {
        if matches!(
            request,
            Request::Query { .. } | Request::Execute { .. } | Request::Batch(_)
        ) {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = self.errors.lock().unwrap().pop_front() {
                return Response::Error(error);
            }
        }
        self.echo.respond(request).await
    }
}

/// Connects to [`ScriptedNode`]s over in-memory pipes.
#[derive(Debug, Clone)]
pub struct Cluster {
    nodes: Vec<(SocketAddr, Arc<ScriptedNode>)>,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        let nodes = (1..=size)
            .map(|i| {
                let address: SocketAddr = format!("10.0.0.{i}:9042").parse().unwrap();
                (address, Arc::new(ScriptedNode::default()))
            })
            .collect();
        Self { nodes }
    }

    pub fn address(&self, index: usize) -> SocketAddr {
        self.nodes[index].0
    }

    pub fn node(&self, index: usize) -> &Arc<ScriptedNode> {
        &self.nodes[index].1
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|(address, _)| *address).collect()
    }

    /// Builder over every node, tried in cluster order.
    pub fn builder(&self, config: DriverConfig) -> SessionBuilder {
        Session::builder()
            .config(config)
            .known_nodes(self.addresses())
            .connector(Arc::new(self.clone()))
            .load_balancing(Arc::new(InOrder))
    }

    pub async fn session(&self, config: DriverConfig) -> Session {
        self.builder(config).build().await.unwrap()
    }
}

#[async_trait]
impl Connector for Cluster {
    async fn connect(&self, address: SocketAddr) -> std::io::Result<BoxedTransport> {
        let node = self
            .nodes
            .iter()
            .find(|(candidate, _)| *candidate == address)
            .map(|(_, node)| Arc::clone(node))
            .ok_or(std::io::ErrorKind::ConnectionRefused)?;
        node.connections.fetch_add(1, Ordering::SeqCst);

        let (client, server) = duplex(256 * 1024);
        tokio::spawn(serve_connection(server, node, 1024 * 1024));
        Ok(Box::new(client))
    }
}

/// Query plans following the order nodes were given in.
#[derive(Debug)]
pub struct InOrder;

impl LoadBalancingPolicy for InOrder {
    fn new_query_plan<'a>(
        &'a self,
        _statement: &'a Statement,
        nodes: &'a [Arc<Node>],
    ) -> QueryPlan<'a> {
        Box::new(nodes.iter().filter(|node| node.is_up()).cloned())
    }
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
