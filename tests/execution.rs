mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rime::{
    Consistency, DriverConfig, ErrorKind, Statement,
    config::SpeculativeExecutionConfig,
    connection::{CloseReason, Connection},
    policy::{RetryContext, RetryDecision, RetryPolicy},
    protocol::{BatchKind, ErrorDetails, ServerError, WriteType, error_codes},
    statement::Batch,
};
use tokio::time::Instant;

use common::{Cluster, ms};

fn speculative(delay_ms: u64, max_executions: usize) -> DriverConfig {
    DriverConfig::default().with_speculative_execution(SpeculativeExecutionConfig::Constant {
        delay: ms(delay_ms),
        max_executions,
    })
}

fn idempotent(query: &str) -> Statement {
    Statement::new(query).with_idempotent(true)
}

fn unavailable() -> ServerError {
    ServerError::new(error_codes::UNAVAILABLE, "not enough replicas").with_details(
        ErrorDetails::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
        },
    )
}

fn write_timeout() -> ServerError {
    ServerError::new(error_codes::WRITE_TIMEOUT, "timed out").with_details(
        ErrorDetails::WriteTimeout {
            consistency: Consistency::Quorum,
            received: 1,
            block_for: 2,
            write_type: WriteType::Simple,
        },
    )
}

fn write_failure() -> ServerError {
    ServerError::new(error_codes::WRITE_FAILURE, "failed").with_details(
        ErrorDetails::WriteFailure {
            consistency: Consistency::Quorum,
            received: 1,
            block_for: 2,
            failures: 1,
            write_type: WriteType::Simple,
        },
    )
}

fn function_failure() -> ServerError {
    ServerError::new(error_codes::FUNCTION_FAILURE, "boom").with_details(
        ErrorDetails::FunctionFailure {
            keyspace: "ks".into(),
            function: "f".into(),
            arg_types: vec!["int".into()],
        },
    )
}

#[tokio::test(start_paused = true)]
async fn slow_execution_triggers_a_speculative_one() {
    let cluster = Cluster::new(2);
    cluster.node(0).set_delay(ms(100));
    let session = cluster.session(speculative(50, 2)).await;

    let started = Instant::now();
    let result = session.execute(&idempotent("select * from t")).await.unwrap();

    assert_eq!(result.coordinator, cluster.address(1));
    assert_eq!(result.speculative_executions, 1);
    assert_eq!(result.attempts, 2);
    assert!(started.elapsed() >= ms(50) && started.elapsed() < ms(100));
    assert_eq!(session.metrics().speculative_executions, 1);

    // The losing answer is dropped when it arrives and its stream id released.
    tokio::time::sleep(ms(100)).await;
    let slow = session.pool(cluster.address(0)).unwrap().connections();
    assert_eq!(slow[0].in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn fast_execution_leaves_the_speculative_slot_unused() {
    let cluster = Cluster::new(2);
    cluster.node(0).set_delay(ms(30));
    let session = cluster.session(speculative(50, 2)).await;

    let result = session.execute(&idempotent("select * from t")).await.unwrap();

    assert_eq!(result.coordinator, cluster.address(0));
    assert_eq!(result.speculative_executions, 0);
    tokio::time::sleep(ms(100)).await;
    assert_eq!(cluster.node(1).queries(), 0);
}

#[tokio::test(start_paused = true)]
async fn non_idempotent_statements_are_never_speculated() {
    let cluster = Cluster::new(2);
    cluster.node(0).set_delay(ms(100));
    let session = cluster.session(speculative(10, 3)).await;

    let result = session
        .execute(&Statement::new("insert into t (k) values (1)"))
        .await
        .unwrap();

    assert_eq!(result.coordinator, cluster.address(0));
    assert_eq!(cluster.node(1).queries(), 0);
}

#[tokio::test]
async fn empty_plan_fails_without_sending() {
    let cluster = Cluster::new(2);
    let session = cluster.session(DriverConfig::default()).await;
    for address in cluster.addresses() {
        session.mark_node_down(address);
    }

    let error = session.execute(&idempotent("select")).await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::NoNodeAvailable);
    assert!(error.node_errors.is_empty());
    assert_eq!(cluster.node(0).queries() + cluster.node(1).queries(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_node_is_skipped_silently() {
    let cluster = Cluster::new(2);
    cluster.node(0).set_delay(ms(200));
    let config = DriverConfig::default()
        .with_pool_size(1, 1)
        .with_max_requests_per_connection(1);
    let session = cluster.session(config).await;

    let busy = {
        let session = session.clone();
        tokio::spawn(async move { session.query("select 1").await })
    };
    let pool = session.pool(cluster.address(0)).unwrap();
    while pool.connections()[0].available_streams() > 0 {
        tokio::time::sleep(ms(1)).await;
    }

    let result = session.query("select 2").await.unwrap();
    assert_eq!(result.coordinator, cluster.address(1));
    assert!(!result.is_degraded());

    let first = busy.await.unwrap().unwrap();
    assert_eq!(first.coordinator, cluster.address(0));
}

#[tokio::test]
async fn unavailable_moves_to_the_next_node() {
    let cluster = Cluster::new(2);
    cluster.node(0).fail_next(unavailable());
    let session = cluster.session(DriverConfig::default()).await;

    let result = session.query("select").await.unwrap();

    assert_eq!(result.coordinator, cluster.address(1));
    assert_eq!(result.attempts, 2);
    assert_eq!(session.metrics().retries, 1);
}

#[tokio::test]
async fn overloaded_is_only_retried_when_idempotent() {
    let cluster = Cluster::new(2);
    let session = cluster.session(DriverConfig::default()).await;

    cluster
        .node(0)
        .fail_next(ServerError::new(error_codes::OVERLOADED, "busy"));
    let result = session.execute(&idempotent("select")).await.unwrap();
    assert_eq!(result.coordinator, cluster.address(1));

    cluster
        .node(0)
        .fail_next(ServerError::new(error_codes::OVERLOADED, "busy"));
    let error = session
        .execute(&Statement::new("update t set v = v + 1"))
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Overloaded);
    assert_eq!(error.node, Some(cluster.address(0)));
}

/// Retries everything on the next node.
#[derive(Debug)]
struct Relentless {
    ambiguous_writes: bool,
}

impl RetryPolicy for Relentless {
    fn on_error(&self, _context: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::RetryNextNode
    }

    fn retries_ambiguous_writes(&self) -> bool {
        self.ambiguous_writes
    }
}

#[tokio::test]
async fn ambiguous_writes_are_not_replayed_for_non_idempotent_statements() {
    let cluster = Cluster::new(2);
    cluster.node(0).fail_next(write_timeout());
    let session = cluster
        .builder(DriverConfig::default())
        .retry_policy(Arc::new(Relentless {
            ambiguous_writes: false,
        }))
        .build()
        .await
        .unwrap();

    let error = session
        .execute(&Statement::new("update t set v = v + 1"))
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::AmbiguousWrite);
    assert_eq!(error.node, Some(cluster.address(0)));
    assert_eq!(cluster.node(1).queries(), 0);
}

#[tokio::test]
async fn policies_may_take_the_ambiguous_write_risk() {
    let cluster = Cluster::new(2);
    cluster.node(0).fail_next(write_failure());
    let session = cluster
        .builder(DriverConfig::default())
        .retry_policy(Arc::new(Relentless {
            ambiguous_writes: true,
        }))
        .build()
        .await
        .unwrap();

    let result = session
        .execute(&Statement::new("update t set v = v + 1"))
        .await
        .unwrap();

    assert_eq!(result.coordinator, cluster.address(1));
}

/// Retries once on the node that failed, closing `doomed` connections first.
#[derive(Debug, Default)]
struct SameNodeOnce {
    doomed: Mutex<Vec<Arc<Connection>>>,
}

impl RetryPolicy for SameNodeOnce {
    fn on_error(&self, context: &RetryContext<'_>) -> RetryDecision {
        for connection in self.doomed.lock().unwrap().drain(..) {
            connection.close(CloseReason::PeerClosed);
        }
        if context.retry_count == 0 {
            RetryDecision::RetrySameNode
        } else {
            RetryDecision::Rethrow
        }
    }
}

#[tokio::test]
async fn same_node_retry_stays_on_the_node() {
    let cluster = Cluster::new(2);
    cluster.node(0).fail_next(unavailable());
    let session = cluster
        .builder(DriverConfig::default())
        .retry_policy(Arc::new(SameNodeOnce::default()))
        .build()
        .await
        .unwrap();

    let result = session.execute(&idempotent("select * from t")).await.unwrap();

    assert_eq!(result.coordinator, cluster.address(0));
    assert_eq!(result.attempts, 2);
    assert_eq!(cluster.node(0).queries(), 2);
    assert_eq!(cluster.node(1).queries(), 0);
    assert_eq!(session.metrics().retries, 1);
}

#[tokio::test]
async fn same_node_retry_moves_on_when_the_connection_is_gone() {
    let cluster = Cluster::new(2);
    cluster.node(0).fail_next(unavailable());
    let policy = Arc::new(SameNodeOnce::default());
    let session = cluster
        .builder(DriverConfig::default().with_pool_size(1, 1))
        .retry_policy(Arc::clone(&policy) as Arc<dyn RetryPolicy>)
        .build()
        .await
        .unwrap();
    *policy.doomed.lock().unwrap() = session.pool(cluster.address(0)).unwrap().connections();

    let result = session.execute(&idempotent("select * from t")).await.unwrap();

    assert_eq!(result.coordinator, cluster.address(1));
    assert_eq!(result.attempts, 2);
    assert_eq!(cluster.node(0).queries(), 1);
    assert_eq!(cluster.node(1).queries(), 1);
}

#[tokio::test]
async fn ignored_errors_complete_degraded() {
    let cluster = Cluster::new(2);
    cluster.node(0).fail_next(function_failure());
    let config = DriverConfig::default().with_ignored_errors([ErrorKind::FunctionError]);
    let session = cluster.session(config).await;

    let result = session.query("select f(v) from t").await.unwrap();

    assert!(result.is_degraded());
    assert_eq!(result.coordinator, cluster.address(0));
    assert_eq!(result.attempts, 1);
    let metrics = session.metrics();
    assert_eq!((metrics.ignored, metrics.successes), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_the_request() {
    let cluster = Cluster::new(1);
    cluster.node(0).set_delay(ms(5_000));
    let session = cluster
        .session(DriverConfig::default().with_request_timeout(ms(100)))
        .await;

    let error = session.query("select").await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::RequestTimeout);
    assert_eq!(error.node, Some(cluster.address(0)));
    assert_eq!(session.metrics().timeouts, 1);
}

#[tokio::test]
async fn invalid_requests_are_not_retried() {
    let cluster = Cluster::new(2);
    cluster
        .node(0)
        .fail_next(ServerError::new(error_codes::SYNTAX_ERROR, "line 1: no viable alternative"));
    let session = cluster.session(DriverConfig::default()).await;

    let error = session.execute(&idempotent("selec")).await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::Invalid);
    assert_eq!(error.node, Some(cluster.address(0)));
    assert_eq!(cluster.node(1).queries(), 0);
}

#[tokio::test]
async fn exhausted_plan_reports_every_failure() {
    let cluster = Cluster::new(2);
    for index in 0..2 {
        cluster
            .node(index)
            .fail_next(ServerError::new(error_codes::IS_BOOTSTRAPPING, "starting"));
    }
    let session = cluster.session(DriverConfig::default()).await;

    let error = session.query("select").await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::NoNodeAvailable);
    assert_eq!(error.node, Some(cluster.address(1)));
    let kinds: Vec<_> = error.node_errors.iter().map(|failure| failure.kind).collect();
    assert_eq!(kinds, [ErrorKind::Bootstrapping, ErrorKind::Bootstrapping]);
}

#[tokio::test]
async fn unprepared_statement_is_prepared_again() {
    let query = "select v from t where k = ?";
    let prepared = Cluster::new(1)
        .session(DriverConfig::default())
        .await
        .prepare(query)
        .await
        .unwrap();

    // A node that never saw the statement, as after a restart.
    let cluster = Cluster::new(1);
    let session = cluster.session(DriverConfig::default()).await;
    let result = session
        .execute(&prepared.bind(vec![Some(Bytes::from_static(b"\x00\x01"))]))
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(result.rows(), Some(query.as_bytes()));
    assert_eq!(session.metrics().retries, 0);
}

#[tokio::test]
async fn compressed_session_round_trips() {
    for name in ["lz4", "SNAPPY"] {
        let cluster = Cluster::new(1);
        let session = cluster
            .session(DriverConfig::default().with_compression(name))
            .await;

        let result = session.query("select * from compressed").await.unwrap();

        assert_eq!(result.rows(), Some(&b"select * from compressed"[..]));
        let connection = &session.pool(cluster.address(0)).unwrap().connections()[0];
        assert_eq!(
            connection.compression().name(),
            Some(name.to_lowercase().as_str())
        );
    }
}

#[tokio::test]
async fn batches_and_tracing() {
    let cluster = Cluster::new(1);
    let session = cluster.session(DriverConfig::default()).await;

    let mut batch = Batch::new(BatchKind::Unlogged);
    batch.add(Statement::new("insert into t (k) values (1)")).unwrap();
    batch.add(Statement::new("insert into t (k) values (2)")).unwrap();
    let result = session
        .execute(&Statement::batch(batch).with_tracing(true))
        .await
        .unwrap();

    assert!(result.rows().is_none());
    assert!(result.tracing_id.is_some());
    assert_eq!(cluster.node(0).queries(), 1);
}

#[tokio::test]
async fn down_nodes_are_routed_around() {
    let cluster = Cluster::new(2);
    let session = cluster.session(DriverConfig::default()).await;

    assert!(session.mark_node_down(cluster.address(0)));
    let result = session.query("select").await.unwrap();
    assert_eq!(result.coordinator, cluster.address(1));

    assert!(session.mark_node_up(cluster.address(0)));
    let result = session.query("select").await.unwrap();
    assert_eq!(result.coordinator, cluster.address(0));
}

#[tokio::test]
async fn closed_session_refuses_requests() {
    let cluster = Cluster::new(1);
    let session = cluster.session(DriverConfig::default()).await;
    session.close();

    let error = session.query("select").await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::NoNodeAvailable);
    assert_eq!(error.node_errors.len(), 1);
}
