use std::{fmt, sync::Arc};

use crate::{
    error::{ErrorKind, QueryError},
    protocol::{ErrorDetails, WriteType},
    statement::Statement,
};

/// What to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Fail the request with this error.
    Rethrow,
    /// Send again on the same connection, if it is still ready.
    RetrySameNode,
    /// Move on to the next node of the query plan.
    RetryNextNode,
    /// Complete the request with a degraded, empty result.
    Ignore,
}

/// Everything a retry policy gets to see about a failed attempt.
#[derive(Debug)]
pub struct RetryContext<'a> {
    pub error: &'a QueryError,
    pub statement: &'a Statement,
    /// Retries already granted to this execution.
    pub retry_count: usize,
    pub is_idempotent: bool,
}

impl RetryContext<'_> {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }
}

/// Decides whether and where a failed attempt is retried.
///
/// Policies are consulted synchronously on the request's path and must neither
/// block nor keep state about individual requests.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    fn on_error(&self, context: &RetryContext<'_>) -> RetryDecision;

    /// Whether this policy takes responsibility for replaying non-idempotent
    /// statements after an ambiguous write. Unless it does, retry decisions for
    /// such failures are turned into [`RetryDecision::Rethrow`].
    fn retries_ambiguous_writes(&self) -> bool {
        false
    }
}

/// Conservative policy: retries only where doing so cannot apply a write twice
/// and is likely to succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_error(&self, context: &RetryContext<'_>) -> RetryDecision {
        let first = context.retry_count == 0;
        match context.kind() {
            // Enough replicas answered but the one holding the data did not; asking
            // again usually works.
            ErrorKind::Timeout => match context.error.details {
                ErrorDetails::ReadTimeout {
                    received,
                    block_for,
                    data_present,
                    ..
                } if first && received >= block_for && !data_present => {
                    RetryDecision::RetrySameNode
                }
                _ => RetryDecision::Rethrow,
            },
            // Only the batch log write is safe to replay.
            ErrorKind::AmbiguousWrite => match &context.error.details {
                ErrorDetails::WriteTimeout {
                    write_type: WriteType::BatchLog,
                    ..
                } if first && context.is_idempotent => RetryDecision::RetrySameNode,
                _ => RetryDecision::Rethrow,
            },
            ErrorKind::Unavailable if first => RetryDecision::RetryNextNode,
            ErrorKind::Bootstrapping => RetryDecision::RetryNextNode,
            ErrorKind::ConnectionClosed | ErrorKind::Overloaded | ErrorKind::ServerError
                if context.is_idempotent =>
            {
                RetryDecision::RetryNextNode
            }
            _ => RetryDecision::Rethrow,
        }
    }
}

/// Never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_error(&self, _context: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Answers [`RetryDecision::Ignore`] for error kinds the application tolerates and
/// defers to another policy for the rest.
#[derive(Debug, Clone)]
pub struct IgnoringRetryPolicy {
    inner: Arc<dyn RetryPolicy>,
    ignored: Vec<ErrorKind>,
}

impl IgnoringRetryPolicy {
    pub fn new(inner: Arc<dyn RetryPolicy>, ignored: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            inner,
            ignored: ignored.into_iter().collect(),
        }
    }
}

impl RetryPolicy for IgnoringRetryPolicy {
    fn on_error(&self, context: &RetryContext<'_>) -> RetryDecision {
        if self.ignored.contains(&context.kind()) {
            return RetryDecision::Ignore;
        }
        self.inner.on_error(context)
    }

    fn retries_ambiguous_writes(&self) -> bool {
        self.inner.retries_ambiguous_writes()
    }
}

#[cfg(test)]
mod tests {
    use crate::statement::Consistency;

    use super::*;

    fn decide(error: &QueryError, retry_count: usize, is_idempotent: bool) -> RetryDecision {
        let statement = Statement::new("update t set v = 1 where k = 0");
        DefaultRetryPolicy.on_error(&RetryContext {
            error,
            statement: &statement,
            retry_count,
            is_idempotent,
        })
    }

    fn read_timeout(received: i32, block_for: i32, data_present: bool) -> QueryError {
        QueryError::new(ErrorKind::Timeout, "read timeout").with_details(
            ErrorDetails::ReadTimeout {
                consistency: Consistency::Quorum,
                received,
                block_for,
                data_present,
            },
        )
    }

    fn write_timeout(write_type: WriteType) -> QueryError {
        QueryError::new(ErrorKind::AmbiguousWrite, "write timeout").with_details(
            ErrorDetails::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 0,
                block_for: 2,
                write_type,
            },
        )
    }

    #[test]
    fn read_timeout_retries_once_when_only_data_is_missing() {
        assert_eq!(
            decide(&read_timeout(2, 2, false), 0, false),
            RetryDecision::RetrySameNode
        );
        assert_eq!(
            decide(&read_timeout(2, 2, false), 1, false),
            RetryDecision::Rethrow
        );
        assert_eq!(
            decide(&read_timeout(1, 2, false), 0, true),
            RetryDecision::Rethrow
        );
        assert_eq!(
            decide(&read_timeout(2, 2, true), 0, true),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn write_timeout_retries_only_idempotent_batch_log() {
        assert_eq!(
            decide(&write_timeout(WriteType::BatchLog), 0, true),
            RetryDecision::RetrySameNode
        );
        assert_eq!(
            decide(&write_timeout(WriteType::BatchLog), 0, false),
            RetryDecision::Rethrow
        );
        assert_eq!(
            decide(&write_timeout(WriteType::Simple), 0, true),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn unavailable_tries_next_node_once() {
        let error = QueryError::new(ErrorKind::Unavailable, "not enough replicas");

        assert_eq!(decide(&error, 0, false), RetryDecision::RetryNextNode);
        assert_eq!(decide(&error, 1, false), RetryDecision::Rethrow);
    }

    #[test]
    fn transient_node_errors_depend_on_idempotence() {
        for kind in [
            ErrorKind::Overloaded,
            ErrorKind::ConnectionClosed,
            ErrorKind::ServerError,
        ] {
            let error = QueryError::new(kind, "");
            assert_eq!(decide(&error, 3, true), RetryDecision::RetryNextNode);
            assert_eq!(decide(&error, 0, false), RetryDecision::Rethrow);
        }
        let bootstrapping = QueryError::new(ErrorKind::Bootstrapping, "");
        assert_eq!(decide(&bootstrapping, 5, false), RetryDecision::RetryNextNode);
    }

    #[test]
    fn failures_are_rethrown() {
        for kind in [
            ErrorKind::ReadFailure,
            ErrorKind::WriteFailure,
            ErrorKind::FunctionError,
        ] {
            assert_eq!(
                decide(&QueryError::new(kind, ""), 0, true),
                RetryDecision::Rethrow
            );
        }
    }

    #[test]
    fn ignoring_policy_wraps_another() {
        let policy =
            IgnoringRetryPolicy::new(Arc::new(DefaultRetryPolicy), [ErrorKind::FunctionError]);
        let statement = Statement::new("select f(v) from t");
        let context = |error| RetryContext {
            error,
            statement: &statement,
            retry_count: 0,
            is_idempotent: true,
        };

        let function = QueryError::new(ErrorKind::FunctionError, "");
        assert_eq!(policy.on_error(&context(&function)), RetryDecision::Ignore);
        let overloaded = QueryError::new(ErrorKind::Overloaded, "");
        assert_eq!(
            policy.on_error(&context(&overloaded)),
            RetryDecision::RetryNextNode
        );
        assert!(!policy.retries_ambiguous_writes());
    }

    #[test]
    fn fallthrough_never_retries() {
        let statement = Statement::new("select");
        let error = QueryError::new(ErrorKind::Unavailable, "");

        assert_eq!(
            FallthroughRetryPolicy.on_error(&RetryContext {
                error: &error,
                statement: &statement,
                retry_count: 0,
                is_idempotent: true,
            }),
            RetryDecision::Rethrow
        );
    }
}
