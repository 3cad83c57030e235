//! Error classification.
//!
//! Every failure an attempt can run into is classified into an [`ErrorKind`] before
//! the retry policy sees it. The kind is resolved once, when the failure is decoded
//! or observed, and never re-parsed afterwards. Applications receive exactly one
//! [`QueryError`] per failed request, carrying the kind, the node behind the last
//! decisive failure and, when the query plan ran dry, the history of every node
//! that was tried.
use std::{fmt, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::protocol::ErrorDetails;

/// Closed classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The coordinator did not hear back from enough replicas for a read.
    Timeout,
    /// The coordinator knows too few replicas are alive to reach the consistency level.
    Unavailable,
    Overloaded,
    Bootstrapping,
    ConnectionClosed,
    NoNodeAvailable,
    ProtocolError,
    FrameTooLarge,
    /// Replicas reported a failed write; it may have been partially applied.
    WriteFailure,
    /// A write timed out; it may or may not have been applied.
    AmbiguousWrite,
    ReadFailure,
    FunctionError,
    ServerError,
    /// The request itself was rejected (syntax, authorization, schema).
    Invalid,
    Unprepared,
    RequestTimeout,
    Configuration,
}

impl ErrorKind {
    /// Failures that never reach the retry policy.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::ProtocolError
                | ErrorKind::FrameTooLarge
                | ErrorKind::Configuration
                | ErrorKind::Invalid
        )
    }

    /// The write may have been applied, so replaying it is only safe when idempotent.
    pub fn is_ambiguous_write(self) -> bool {
        matches!(self, ErrorKind::WriteFailure | ErrorKind::AmbiguousWrite)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Bootstrapping => "bootstrapping",
            ErrorKind::ConnectionClosed => "connection_closed",
            ErrorKind::NoNodeAvailable => "no_node_available",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::FrameTooLarge => "frame_too_large",
            ErrorKind::WriteFailure => "write_failure",
            ErrorKind::AmbiguousWrite => "ambiguous_write",
            ErrorKind::ReadFailure => "read_failure",
            ErrorKind::FunctionError => "function_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Unprepared => "unprepared",
            ErrorKind::RequestTimeout => "request_timeout",
            ErrorKind::Configuration => "configuration",
        }
    }

    /// Case-insensitive lookup by [`name`](Self::name); dashes count as underscores.
    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [ErrorKind; 17] = [
            ErrorKind::Timeout,
            ErrorKind::Unavailable,
            ErrorKind::Overloaded,
            ErrorKind::Bootstrapping,
            ErrorKind::ConnectionClosed,
            ErrorKind::NoNodeAvailable,
            ErrorKind::ProtocolError,
            ErrorKind::FrameTooLarge,
            ErrorKind::WriteFailure,
            ErrorKind::AmbiguousWrite,
            ErrorKind::ReadFailure,
            ErrorKind::FunctionError,
            ErrorKind::ServerError,
            ErrorKind::Invalid,
            ErrorKind::Unprepared,
            ErrorKind::RequestTimeout,
            ErrorKind::Configuration,
        ];
        let name = name.trim().to_lowercase().replace('-', "_");
        ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One failed try recorded while walking a query plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node: SocketAddr,
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal error of a request.
#[derive(Debug, Clone, Error)]
#[error("[{kind}]{}: {message}", .node.as_ref().map(|n| format!("[{n}]")).unwrap_or_default())]
pub struct QueryError {
    pub kind: ErrorKind,
    /// Node that produced the last decisive failure, when one was reached.
    pub node: Option<SocketAddr>,
    pub message: String,
    pub details: ErrorDetails,
    /// Failures collected across the query plan, oldest first.
    pub node_errors: Vec<NodeFailure>,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            node: None,
            message: message.into(),
            details: ErrorDetails::None,
            node_errors: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: SocketAddr) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_node_errors(mut self, errors: Vec<NodeFailure>) -> Self {
        self.node_errors = errors;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn no_node_available(last: Option<QueryError>, history: Vec<NodeFailure>) -> Self {
        let message = match &last {
            None if history.is_empty() => "query plan is empty, no node to contact".to_string(),
            None => format!("all {} tried nodes failed", history.len()),
            Some(last) => format!(
                "query plan exhausted after {} failure(s), last: {last}",
                history.len()
            ),
        };
        let mut error = QueryError::new(ErrorKind::NoNodeAvailable, message);
        if let Some(last) = last {
            error.node = last.node;
            error.details = last.details;
        } else if let Some(failure) = history.last() {
            error.node = Some(failure.node);
        }
        error.with_node_errors(history)
    }

    pub(crate) fn request_timeout(timeout: Duration, node: Option<SocketAddr>) -> Self {
        let error = QueryError::new(
            ErrorKind::RequestTimeout,
            format!("request did not complete within {}ms", timeout.as_millis()),
        );
        match node {
            Some(node) => error.with_node(node),
            None => error,
        }
    }
}

impl From<ConfigError> for QueryError {
    fn from(value: ConfigError) -> Self {
        QueryError::new(ErrorKind::Configuration, value.to_string())
    }
}

/// Invalid configuration snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),

    #[error("max_connections_per_node ({max}) is lower than connections_per_node ({core})")]
    PoolBounds { core: usize, max: usize },

    #[error("max_requests_per_connection {0} exceeds the protocol limit")]
    TooManyStreams(usize),

    #[error("max_frame_size {0} is outside the protocol bounds")]
    FrameSize(usize),

    #[error("reconnection base delay {base:?} exceeds max delay {max:?}")]
    ReconnectionBounds { base: Duration, max: Duration },

    #[error("no nodes given to connect to")]
    NoNodes,
}
