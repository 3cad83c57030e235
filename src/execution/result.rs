use std::net::SocketAddr;

use crate::{error::QueryError, protocol::ResultBody};

/// Outcome of a successful request.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub body: ResultBody,
    /// Node whose answer completed the request.
    pub coordinator: SocketAddr,
    /// Frames sent on behalf of the request, across every execution.
    pub attempts: usize,
    /// Executions started in addition to the initial one.
    pub speculative_executions: usize,
    pub tracing_id: Option<[u8; 16]>,
    pub warnings: Vec<String>,
    /// Set when the retry policy chose to ignore this error; `body` is then empty.
    pub ignored_error: Option<QueryError>,
}

impl QueryResult {
    /// Completed through an ignored error rather than a real answer.
    pub fn is_degraded(&self) -> bool {
        self.ignored_error.is_some()
    }

    /// Raw rows payload, if the node returned rows.
    pub fn rows(&self) -> Option<&[u8]> {
        match &self.body {
            ResultBody::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}
