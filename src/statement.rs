//! Statements submitted to a session.
//!
//! A [`Statement`] is the unit of execution: a query text, a bound prepared
//! statement or a [`Batch`], plus the execution metadata the request engine acts
//! upon (consistency, idempotence, timeout, tracing). Values are carried as opaque,
//! already-serialized cells; mapping application types onto them is left to codec
//! layers above this crate.
use std::{fmt, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    cli::Command,
    protocol::{BatchEntry, BatchKind, BatchRequest, QueryParameters, Request},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    Serial,
    LocalSerial,
    #[default]
    LocalOne,
}

impl Consistency {
    pub fn code(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::Serial => 0x0008,
            Consistency::LocalSerial => 0x0009,
            Consistency::LocalOne => 0x000A,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        }
    }

    /// Case-insensitive lookup by protocol name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_uppercase();
        (0x0000..=0x000A)
            .filter_map(Consistency::from_code)
            .find(|c| c.name() == name)
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StatementError {
    #[error("empty statement")]
    EmptyStatement,

    #[error("batches cannot contain other batches")]
    NestedBatch,

    #[error("failed to convert into statement")]
    Conversion,
}

/// A statement prepared on the cluster, identified by the server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    id: Bytes,
    query: String,
}

impl PreparedStatement {
    pub fn new(id: Bytes, query: impl Into<String>) -> Self {
        Self {
            id,
            query: query.into(),
        }
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Bind serialized values, producing an executable statement.
    pub fn bind(&self, values: Vec<Option<Bytes>>) -> Statement {
        let mut statement = Statement::from_kind(StatementKind::Prepared(self.clone()));
        statement.values = values;
        statement
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchQuery {
    Text(String),
    Prepared(PreparedStatement),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchChild {
    query: BatchQuery,
    values: Vec<Option<Bytes>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    kind: BatchKind,
    children: Vec<BatchChild>,
}

impl Batch {
    pub fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    /// Append a simple or prepared statement. Only its query and values are kept;
    /// execution metadata comes from the statement wrapping the batch.
    pub fn add(&mut self, statement: Statement) -> Result<(), StatementError> {
        let query = match statement.kind {
            StatementKind::Simple(text) => BatchQuery::Text(text),
            StatementKind::Prepared(prepared) => BatchQuery::Prepared(prepared),
            StatementKind::Batch(_) => return Err(StatementError::NestedBatch),
        };
        self.children.push(BatchChild {
            query,
            values: statement.values,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Prepared statements in the batch, used to re-prepare after an `UNPREPARED` error.
    pub(crate) fn prepared(&self) -> impl Iterator<Item = &PreparedStatement> {
        self.children.iter().filter_map(|child| match &child.query {
            BatchQuery::Prepared(prepared) => Some(prepared),
            BatchQuery::Text(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Simple(String),
    Prepared(PreparedStatement),
    Batch(Batch),
}

/// One client-issued statement with its execution metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    kind: StatementKind,
    values: Vec<Option<Bytes>>,
    consistency: Option<Consistency>,
    serial_consistency: Option<Consistency>,
    idempotent: Option<bool>,
    timeout: Option<Duration>,
    tracing: bool,
    page_size: Option<i32>,
    timestamp: Option<i64>,
}

impl Statement {
    pub fn new(query: impl Into<String>) -> Self {
        Self::from_kind(StatementKind::Simple(query.into()))
    }

    pub fn batch(batch: Batch) -> Self {
        Self::from_kind(StatementKind::Batch(batch))
    }

    fn from_kind(kind: StatementKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
            consistency: None,
            serial_consistency: None,
            idempotent: None,
            timeout: None,
            tracing: false,
            page_size: None,
            timestamp: None,
        }
    }

    pub fn with_values(mut self, values: Vec<Option<Bytes>>) -> Self {
        self.values = values;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn with_serial_consistency(mut self, consistency: Consistency) -> Self {
        self.serial_consistency = Some(consistency);
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    pub fn consistency(&self) -> Option<Consistency> {
        self.consistency
    }

    pub fn is_idempotent(&self) -> Option<bool> {
        self.idempotent
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn tracing(&self) -> bool {
        self.tracing
    }

    /// Prepared statements the request depends on.
    pub(crate) fn prepared(&self) -> Vec<&PreparedStatement> {
        match &self.kind {
            StatementKind::Simple(_) => Vec::new(),
            StatementKind::Prepared(prepared) => vec![prepared],
            StatementKind::Batch(batch) => batch.prepared().collect(),
        }
    }

    /// Wire request for this statement, filling unset consistency with the default.
    pub(crate) fn to_request(&self, default_consistency: Consistency) -> Request {
        let consistency = self.consistency.unwrap_or(default_consistency);
        match &self.kind {
            StatementKind::Simple(query) => Request::Query {
                query: query.clone(),
                params: self.parameters(consistency),
            },
            StatementKind::Prepared(prepared) => Request::Execute {
                id: prepared.id.clone(),
                params: self.parameters(consistency),
            },
            StatementKind::Batch(batch) => Request::Batch(BatchRequest {
                kind: batch.kind,
                entries: batch
                    .children
                    .iter()
                    .map(|child| match &child.query {
                        BatchQuery::Text(query) => BatchEntry::Query {
                            query: query.clone(),
                            values: child.values.clone(),
                        },
                        BatchQuery::Prepared(prepared) => BatchEntry::Prepared {
                            id: prepared.id.clone(),
                            values: child.values.clone(),
                        },
                    })
                    .collect(),
                consistency,
                serial_consistency: self.serial_consistency,
                timestamp: self.timestamp,
            }),
        }
    }

    fn parameters(&self, consistency: Consistency) -> QueryParameters {
        QueryParameters {
            consistency,
            values: self.values.clone(),
            page_size: self.page_size,
            paging_state: None,
            serial_consistency: self.serial_consistency,
            timestamp: self.timestamp,
        }
    }
}

impl TryFrom<Command> for Statement {
    type Error = StatementError;

    fn try_from(value: Command) -> Result<Self, Self::Error> {
        match value {
            Command::Statement(s) => {
                let s = s.trim();
                let first = s.split(' ').next().unwrap_or_default().to_lowercase();

                match first.as_str() {
                    "" => Err(StatementError::EmptyStatement),
                    // Reads can always be replayed safely.
                    "select" => Ok(Statement::new(s).with_idempotent(true)),
                    _ => Ok(Statement::new(s)),
                }
            }
            _ => Err(StatementError::Conversion),
        }
    }
}
