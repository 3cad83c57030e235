//! Request execution.
//!
//! This module turns one statement into one [`QueryResult`] or one [`QueryError`],
//! however many frames that takes.
//!
//! # Overview
//!
//! A request builds its query plan once and shares it between executions. An
//! execution pulls a node from the plan, acquires a stream id from that node's
//! pool and sends the request. When the pool is saturated it moves on to the
//! next node straight away. Failures are classified and handed to the retry
//! policy, whose verdict decides between sending again on the same connection,
//! moving on to the next node, failing the request, or completing it degraded.
//!
//! Idempotent statements may run several executions in parallel. The speculative
//! execution schedule lists when each one may start, measured from the start of
//! the request; a slot is only used while the request is unresolved and the plan
//! still has a node to offer.
//!
//! The first execution to succeed completes the request. The remaining ones are
//! dropped, which abandons their streams: ids of unsent frames are released at
//! once, ids of sent frames when their answer arrives. The whole request runs under
//! one deadline; reaching it drops every execution the same way.
//!
//! # See Also
//!
//! - [`policy`](crate::policy): the decisions this module delegates.
//! - [`pool`](crate::pool): where stream ids come from.
mod result;

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use futures::{StreamExt, stream::FuturesUnordered};
use log::{debug, trace, warn};
use tokio::time::Instant;

use crate::{
    config::DriverConfig,
    connection::{Connection, PendingRequest},
    error::{ErrorKind, NodeFailure, QueryError},
    node::Node,
    policy::{
        LoadBalancingPolicy, QueryPlan, RetryContext, RetryDecision, RetryPolicy,
        SpeculativeExecutionPolicy,
    },
    pool::NodePool,
    protocol::{ErrorDetails, Request, Response, ResponseMessage, ResultBody},
    session::SessionMetrics,
    statement::Statement,
};

pub use result::QueryResult;

/// Everything a request needs from its session.
#[derive(Debug)]
pub(crate) struct Engine {
    pub(crate) config: Arc<DriverConfig>,
    pub(crate) nodes: Vec<Arc<Node>>,
    pub(crate) pools: HashMap<SocketAddr, Arc<NodePool>>,
    pub(crate) load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) speculative: Arc<dyn SpeculativeExecutionPolicy>,
    pub(crate) metrics: SessionMetrics,
}

impl Engine {
    pub(crate) async fn execute(&self, statement: &Statement) -> Result<QueryResult, QueryError> {
        let request = statement.to_request(self.config.default_consistency);
        self.execute_request(statement, request).await
    }

    /// Run `request` with the routing and execution metadata of `statement`.
    pub(crate) async fn execute_request(
        &self,
        statement: &Statement,
        request: Request,
    ) -> Result<QueryResult, QueryError> {
        self.metrics.request_started();
        let timeout = statement.timeout().unwrap_or(self.config.request_timeout);
        let handler = RequestHandler::new(self, statement, request);

        let result = match tokio::time::timeout(timeout, handler.run()).await {
            Ok(result) => result,
            Err(_) => {
                let error = QueryError::request_timeout(timeout, handler.last_node())
                    .with_node_errors(handler.take_history());
                debug!("{error}");
                Err(error)
            }
        };
        self.metrics
            .record(&result, self.config.ignored_error_accounting);
        result
    }
}

/// How one execution ended without a result.
#[derive(Debug)]
enum ExecutionError {
    /// Fails the whole request.
    Fatal(QueryError),
    /// No node left in the plan; carries the last retryable failure, if any.
    PlanExhausted(Option<QueryError>),
}

/// Coordinator of one request.
struct RequestHandler<'a> {
    engine: &'a Engine,
    statement: &'a Statement,
    request: Request,
    idempotent: bool,
    plan: Mutex<QueryPlan<'a>>,
    history: Mutex<Vec<NodeFailure>>,
    last_node: Mutex<Option<SocketAddr>>,
    attempts: AtomicUsize,
    speculative: AtomicUsize,
}

impl<'a> RequestHandler<'a> {
    fn new(engine: &'a Engine, statement: &'a Statement, request: Request) -> Self {
        let plan = engine
            .load_balancing
            .new_query_plan(statement, &engine.nodes);
        Self {
            engine,
            statement,
            request,
            idempotent: statement
                .is_idempotent()
                .unwrap_or(engine.config.default_idempotence),
            plan: Mutex::new(plan),
            history: Mutex::new(Vec::new()),
            last_node: Mutex::new(None),
            attempts: AtomicUsize::new(0),
            speculative: AtomicUsize::new(0),
        }
    }

    async fn run(&self) -> Result<QueryResult, QueryError> {
        let schedule = if self.idempotent {
            self.engine.speculative.new_schedule(self.statement)
        } else {
            Vec::new()
        };
        let start = Instant::now();
        // The first offset belongs to the initial execution.
        let mut launches = schedule.into_iter().skip(1).map(|offset| start + offset);
        let mut next_launch = launches.next();

        let mut executions = FuturesUnordered::new();
        executions.push(self.execution(None));
        let mut last_error = None;

        loop {
            let launch = async move {
                match next_launch {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                Some(outcome) = executions.next() => match outcome {
                    Ok(result) => return Ok(result),
                    Err(ExecutionError::Fatal(error)) => return Err(self.with_history(error)),
                    Err(ExecutionError::PlanExhausted(error)) => {
                        if error.is_some() {
                            last_error = error;
                        }
                        if executions.is_empty() {
                            return Err(QueryError::no_node_available(
                                last_error,
                                self.take_history(),
                            ));
                        }
                    }
                },
                _ = launch => {
                    next_launch = launches.next();
                    match self.next_node() {
                        Some(node) => {
                            let n = self.speculative.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!("starting speculative execution {n} on {node}");
                            self.engine.metrics.speculative_execution();
                            executions.push(self.execution(Some(node)));
                        }
                        None => next_launch = None,
                    }
                }
            }
        }
    }

    /// One chain of attempts walking the shared plan. `first` is a node already
    /// pulled from the plan for this execution.
    async fn execution(&self, mut first: Option<Arc<Node>>) -> Result<QueryResult, ExecutionError> {
        let mut retry_count = 0;
        let mut last_error = None;

        loop {
            let Some(node) = first.take().or_else(|| self.next_node()) else {
                return Err(ExecutionError::PlanExhausted(last_error));
            };
            let address = node.address();
            let mut pending = match self.acquire(&node) {
                Ok(pending) => pending,
                Err(error) => {
                    self.record(address, &error);
                    continue;
                }
            };

            loop {
                let connection = Arc::clone(pending.connection());
                let error = match self.attempt(pending).await {
                    Ok(result) => return Ok(result),
                    Err(error) => error,
                };
                if error.kind.is_fatal() {
                    return Err(ExecutionError::Fatal(error));
                }

                match self.decide(&error, retry_count) {
                    RetryDecision::Rethrow => return Err(ExecutionError::Fatal(error)),
                    RetryDecision::Ignore => return Ok(self.ignored(error, address)),
                    RetryDecision::RetrySameNode => {
                        retry_count += 1;
                        if let Some(next) = connection.reserve() {
                            pending = next;
                            continue;
                        }
                        debug!("connection to {address} is not ready, retrying on the next node");
                    }
                    RetryDecision::RetryNextNode => retry_count += 1,
                }
                self.record(address, &error);
                last_error = Some(error);
                break;
            }
        }
    }

    fn acquire(&self, node: &Arc<Node>) -> Result<PendingRequest, QueryError> {
        let address = node.address();
        let pool = self.engine.pools.get(&address).ok_or_else(|| {
            QueryError::new(ErrorKind::NoNodeAvailable, "node has no connection pool")
                .with_node(address)
        })?;
        pool.acquire()
            .map_err(|e| QueryError::new(e.kind(), e.to_string()).with_node(address))
    }

    /// Send the request once, re-preparing and sending again if the node lost
    /// track of a prepared statement.
    async fn attempt(&self, pending: PendingRequest) -> Result<QueryResult, QueryError> {
        let connection = Arc::clone(pending.connection());
        let address = connection.node();
        *lock(&self.last_node) = Some(address);

        let mut sent = self.send_request(pending).await;
        let unprepared = match &sent {
            Err(QueryError {
                kind: ErrorKind::Unprepared,
                details: ErrorDetails::Unprepared { id },
                ..
            }) => Some(id.clone()),
            _ => None,
        };
        if let Some(id) = unprepared {
            self.reprepare(&connection, &id)
                .await
                .map_err(|e| e.with_node(address))?;
            let pending = connection.reserve().ok_or_else(|| {
                QueryError::new(
                    ErrorKind::ConnectionClosed,
                    "connection lost after re-preparing",
                )
            });
            sent = match pending {
                Ok(pending) => self.send_request(pending).await,
                Err(error) => Err(error),
            };
        }

        let message = sent.map_err(|e| e.with_node(address))?;
        match message.response {
            Response::Result(body) => Ok(QueryResult {
                body,
                coordinator: address,
                attempts: self.attempts.load(Ordering::Relaxed),
                speculative_executions: self.speculative.load(Ordering::Relaxed),
                tracing_id: message.tracing_id,
                warnings: message.warnings,
                ignored_error: None,
            }),
            other => Err(QueryError::new(
                ErrorKind::ProtocolError,
                format!("unexpected {:?} response to {:?}", other.opcode(), self.request.opcode()),
            )
            .with_node(address)),
        }
    }

    async fn send_request(&self, pending: PendingRequest) -> Result<ResponseMessage, QueryError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        send(pending, &self.request, self.statement.tracing()).await
    }

    async fn reprepare(&self, connection: &Arc<Connection>, id: &Bytes) -> Result<(), QueryError> {
        let query = self
            .statement
            .prepared()
            .into_iter()
            .find(|prepared| prepared.id() == id)
            .map(|prepared| prepared.query().to_string())
            .ok_or_else(|| {
                QueryError::new(
                    ErrorKind::Unprepared,
                    "node does not know a prepared statement this request does not carry",
                )
            })?;

        debug!("re-preparing '{query}' on {}", connection.node());
        let pending = connection.reserve().ok_or_else(|| {
            QueryError::new(ErrorKind::ConnectionClosed, "no stream id to re-prepare on")
        })?;
        let message = send(pending, &Request::Prepare { query }, false).await?;
        match message.response {
            Response::Result(ResultBody::Prepared { .. }) => Ok(()),
            other => Err(QueryError::new(
                ErrorKind::ProtocolError,
                format!("unexpected {:?} response to PREPARE", other.opcode()),
            )),
        }
    }

    /// Ask the retry policy, then hold it to the ambiguous write rule.
    fn decide(&self, error: &QueryError, retry_count: usize) -> RetryDecision {
        let retry = &self.engine.retry;
        let decision = retry.on_error(&RetryContext {
            error,
            statement: self.statement,
            retry_count,
            is_idempotent: self.idempotent,
        });
        let retrying = matches!(
            decision,
            RetryDecision::RetrySameNode | RetryDecision::RetryNextNode
        );

        if retrying && error.kind.is_ambiguous_write() && !self.idempotent {
            if !retry.retries_ambiguous_writes() {
                debug!("not retrying non-idempotent statement after {error}");
                return RetryDecision::Rethrow;
            }
            warn!(
                "retrying non-idempotent statement after {}, the write may be applied twice",
                error.kind
            );
        }
        if retrying {
            self.engine.metrics.retry();
        }
        debug!("{error}: {decision:?} after {retry_count} retries");
        decision
    }

    fn ignored(&self, error: QueryError, coordinator: SocketAddr) -> QueryResult {
        debug!("ignoring {error}");
        QueryResult {
            body: ResultBody::Void,
            coordinator,
            attempts: self.attempts.load(Ordering::Relaxed),
            speculative_executions: self.speculative.load(Ordering::Relaxed),
            tracing_id: None,
            warnings: Vec::new(),
            ignored_error: Some(error),
        }
    }

    fn next_node(&self) -> Option<Arc<Node>> {
        lock(&self.plan).next()
    }

    fn record(&self, node: SocketAddr, error: &QueryError) {
        trace!("{node} failed: {error}");
        lock(&self.history).push(NodeFailure {
            node,
            kind: error.kind,
            message: error.message.clone(),
        });
    }

    fn with_history(&self, error: QueryError) -> QueryError {
        let history = self.take_history();
        if history.is_empty() {
            return error;
        }
        error.with_node_errors(history)
    }

    fn take_history(&self) -> Vec<NodeFailure> {
        std::mem::take(&mut *lock(&self.history))
    }

    fn last_node(&self) -> Option<SocketAddr> {
        *lock(&self.last_node)
    }
}

async fn send(
    pending: PendingRequest,
    request: &Request,
    tracing: bool,
) -> Result<ResponseMessage, QueryError> {
    trace!(
        "sending {:?} on stream {} to {}",
        request.opcode(),
        pending.stream(),
        pending.connection().node()
    );
    let message = pending.send(request, tracing)?.recv().await?;
    if let Response::Error(error) = &message.response {
        return Err(error.clone().into());
    }
    Ok(message)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
