pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod execution;
pub mod node;
pub mod policy;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod statement;

pub use cli::{Command, prompt};
pub use config::DriverConfig;
pub use error::{ErrorKind, QueryError};
pub use execution::QueryResult;
pub use session::{Session, SessionBuilder};
pub use statement::{Consistency, PreparedStatement, Statement};
