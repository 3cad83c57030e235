//! Sessions: the application-facing entry point.
//!
//! A [`Session`] owns one connection pool per known node, the policies chosen at
//! build time and an immutable configuration snapshot. It is cheap to clone and
//! every clone shares the same pools.
//!
//! # Example
//! ```rust,no_run
//! use rime::{Session, Statement};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::builder()
//!     .known_node("127.0.0.1:9042".parse()?)
//!     .build()
//!     .await?;
//!
//! let result = session
//!     .execute(&Statement::new("SELECT * FROM ks.users").with_idempotent(true))
//!     .await?;
//! println!("answered by {} after {} attempt(s)", result.coordinator, result.attempts);
//! # Ok(())
//! # }
//! ```
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::join_all;
use log::info;

use crate::{
    config::{DriverConfig, IgnoredErrorAccounting, RetryPolicyKind},
    error::{ConfigError, ErrorKind, QueryError},
    execution::{Engine, QueryResult},
    node::Node,
    policy::{
        DefaultRetryPolicy, ExponentialReconnectionPolicy, FallthroughRetryPolicy,
        IgnoringRetryPolicy, LoadBalancingPolicy, ReconnectionPolicy, RetryPolicy,
        RoundRobinPolicy, SpeculativeExecutionPolicy, speculative,
    },
    pool::{Connector, NodePool, TcpConnector},
    protocol::{Request, ResultBody},
    statement::{PreparedStatement, Statement},
};

/// Request counters of a session.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    ignored: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    speculative_executions: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of [`SessionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub ignored: u64,
    pub errors: u64,
    pub retries: u64,
    pub speculative_executions: u64,
    pub timeouts: u64,
}

impl SessionMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            speculative_executions: self.speculative_executions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn request_started(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn speculative_execution(&self) {
        self.speculative_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(
        &self,
        result: &Result<QueryResult, QueryError>,
        accounting: IgnoredErrorAccounting,
    ) {
        let counter = match result {
            Ok(result) if result.is_degraded() => match accounting {
                IgnoredErrorAccounting::AsSuccess => &self.successes,
                IgnoredErrorAccounting::Separate => &self.ignored,
            },
            Ok(_) => &self.successes,
            Err(error) => {
                if error.kind == ErrorKind::RequestTimeout {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                &self.errors
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct SessionBuilder {
    config: DriverConfig,
    nodes: Vec<Node>,
    connector: Arc<dyn Connector>,
    load_balancing: Option<Arc<dyn LoadBalancingPolicy>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    speculative: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    reconnection: Option<Arc<dyn ReconnectionPolicy>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            config: DriverConfig::default(),
            nodes: Vec::new(),
            connector: Arc::new(TcpConnector),
            load_balancing: None,
            retry: None,
            speculative: None,
            reconnection: None,
        }
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn known_node(self, address: SocketAddr) -> Self {
        self.node(Node::new(address))
    }

    pub fn known_nodes(self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        addresses.into_iter().fold(self, Self::known_node)
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.load_balancing = Some(policy);
        self
    }

    /// Replaces the retry policy selected by the configuration.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn speculative_execution(mut self, policy: Arc<dyn SpeculativeExecutionPolicy>) -> Self {
        self.speculative = Some(policy);
        self
    }

    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.reconnection = Some(policy);
        self
    }

    /// Validate the configuration and open the core connections of every node.
    /// Nodes that cannot be reached keep reconnecting in the background.
    pub async fn build(self) -> Result<Session, ConfigError> {
        self.config.validate()?;
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        let config = Arc::new(self.config);
        let retry = self.retry.unwrap_or_else(|| retry_policy(&config));
        let speculative = self
            .speculative
            .unwrap_or_else(|| Arc::from(speculative::from_config(&config.speculative_execution)));
        let reconnection = self.reconnection.unwrap_or_else(|| {
            Arc::new(ExponentialReconnectionPolicy::from(&config.reconnection))
        });
        let load_balancing = self
            .load_balancing
            .unwrap_or_else(|| Arc::new(RoundRobinPolicy::new()));

        let nodes: Vec<Arc<Node>> = self.nodes.into_iter().map(Arc::new).collect();
        let pools: HashMap<SocketAddr, Arc<NodePool>> = nodes
            .iter()
            .map(|node| {
                let pool = NodePool::new(
                    Arc::clone(node),
                    Arc::clone(&config),
                    Arc::clone(&self.connector),
                    Arc::clone(&reconnection),
                );
                (node.address(), pool)
            })
            .collect();

        let sizes = join_all(pools.values().map(|pool| pool.fill())).await;
        info!(
            "session ready: {} connection(s) to {} node(s)",
            sizes.iter().sum::<usize>(),
            nodes.len()
        );

        Ok(Session {
            engine: Arc::new(Engine {
                config,
                nodes,
                pools,
                load_balancing,
                retry,
                speculative,
                metrics: SessionMetrics::default(),
            }),
        })
    }
}

fn retry_policy(config: &DriverConfig) -> Arc<dyn RetryPolicy> {
    let base: Arc<dyn RetryPolicy> = match config.retry_policy {
        RetryPolicyKind::Default => Arc::new(DefaultRetryPolicy),
        RetryPolicyKind::Fallthrough => Arc::new(FallthroughRetryPolicy),
    };
    if config.ignored_errors.is_empty() {
        return base;
    }
    Arc::new(IgnoringRetryPolicy::new(
        base,
        config.ignored_errors.iter().copied(),
    ))
}

#[derive(Debug, Clone)]
pub struct Session {
    engine: Arc<Engine>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Run one statement. Exactly one result or error comes back, however many
    /// frames it took.
    pub async fn execute(&self, statement: &Statement) -> Result<QueryResult, QueryError> {
        self.engine.execute(statement).await
    }

    pub async fn query(&self, query: impl Into<String>) -> Result<QueryResult, QueryError> {
        self.execute(&Statement::new(query)).await
    }

    /// Prepare `query` on the first node that answers.
    pub async fn prepare(&self, query: impl Into<String>) -> Result<PreparedStatement, QueryError> {
        let query = query.into();
        let statement = Statement::new(query.clone()).with_idempotent(true);
        let result = self
            .engine
            .execute_request(
                &statement,
                Request::Prepare {
                    query: query.clone(),
                },
            )
            .await?;

        match result.body {
            ResultBody::Prepared { id, .. } => Ok(PreparedStatement::new(id, query)),
            other => Err(QueryError::new(
                ErrorKind::ProtocolError,
                format!("PREPARE answered with {other:?}"),
            )
            .with_node(result.coordinator)),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics.snapshot()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.engine.config
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.engine.nodes
    }

    pub fn pool(&self, address: SocketAddr) -> Option<&Arc<NodePool>> {
        self.engine.pools.get(&address)
    }

    /// Stop routing to a node and stop reconnecting to it.
    pub fn mark_node_down(&self, address: SocketAddr) -> bool {
        match self.find(address) {
            Some(node) => {
                info!("node {address} marked down");
                node.mark_down();
                true
            }
            None => false,
        }
    }

    /// Route to a node again and reopen its connections.
    pub fn mark_node_up(&self, address: SocketAddr) -> bool {
        let Some(node) = self.find(address) else {
            return false;
        };
        info!("node {address} marked up");
        node.mark_up();
        if let Some(pool) = self.pool(address) {
            pool.on_node_up();
        }
        true
    }

    /// Drain every pool. Requests already sent complete; new ones fail.
    pub fn close(&self) {
        for pool in self.engine.pools.values() {
            pool.shutdown();
        }
    }

    fn find(&self, address: SocketAddr) -> Option<&Arc<Node>> {
        self.engine
            .nodes
            .iter()
            .find(|node| node.address() == address)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::protocol::ServerError;

    use super::*;

    fn success() -> Result<QueryResult, QueryError> {
        Ok(QueryResult {
            body: ResultBody::Void,
            coordinator: "127.0.0.1:9042".parse().unwrap(),
            attempts: 1,
            speculative_executions: 0,
            tracing_id: None,
            warnings: Vec::new(),
            ignored_error: None,
        })
    }

    fn ignored() -> Result<QueryResult, QueryError> {
        success().map(|mut result| {
            result.ignored_error = Some(QueryError::new(ErrorKind::FunctionError, "boom"));
            result
        })
    }

    #[test]
    fn ignored_requests_are_counted_separately_by_default() {
        let metrics = SessionMetrics::default();
        metrics.record(&success(), IgnoredErrorAccounting::default());
        metrics.record(&ignored(), IgnoredErrorAccounting::default());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.ignored, 1);
    }

    #[test]
    fn ignored_requests_can_count_as_successes() {
        let metrics = SessionMetrics::default();
        metrics.record(&ignored(), IgnoredErrorAccounting::AsSuccess);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.ignored, 0);
    }

    #[test]
    fn timeouts_are_errors_too() {
        let metrics = SessionMetrics::default();
        let timeout = QueryError::request_timeout(Duration::from_millis(5), None);
        metrics.record(&Err(timeout), IgnoredErrorAccounting::Separate);
        metrics.record(
            &Err(ServerError::new(0x1001, "busy").into()),
            IgnoredErrorAccounting::Separate,
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.timeouts, 1);
    }

    #[test]
    fn ignored_errors_wrap_the_configured_policy() {
        let config = DriverConfig::default()
            .with_retry_policy(RetryPolicyKind::Fallthrough)
            .with_ignored_errors([ErrorKind::WriteFailure]);

        let policy = retry_policy(&config);

        assert!(format!("{policy:?}").contains("IgnoringRetryPolicy"));
        assert!(format!("{policy:?}").contains("FallthroughRetryPolicy"));
    }

    #[tokio::test]
    async fn build_requires_nodes() {
        let error = Session::builder().build().await.unwrap_err();

        assert_eq!(error, ConfigError::NoNodes);
    }

    #[tokio::test]
    async fn build_validates_configuration() {
        let error = Session::builder()
            .known_node("127.0.0.1:9042".parse().unwrap())
            .config(DriverConfig::default().with_pool_size(0, 1))
            .build()
            .await
            .unwrap_err();

        assert_eq!(error, ConfigError::Zero("connections_per_node"));
    }
}
