//! Driver configuration snapshot.
//!
//! A [`DriverConfig`] is built once, validated, and then shared read-only by every
//! pool, connection and request of a session. Loading configuration from files or
//! the environment is left to the application; the binaries map `clap` flags onto
//! this struct.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use rime::config::{DriverConfig, SpeculativeExecutionConfig};
//!
//! let config = DriverConfig::default()
//!     .with_compression("lz4")
//!     .with_request_timeout(Duration::from_millis(500))
//!     .with_speculative_execution(SpeculativeExecutionConfig::Constant {
//!         delay: Duration::from_millis(50),
//!         max_executions: 3,
//!     });
//!
//! assert!(config.validate().is_ok());
//! ```
use std::time::Duration;

use crate::{
    ErrorKind,
    connection::MAX_STREAM_IDS,
    error::ConfigError,
    protocol::{Compression, DEFAULT_MAX_FRAME_SIZE},
    statement::Consistency,
};

/// Which speculative execution schedule a session uses for idempotent statements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SpeculativeExecutionConfig {
    #[default]
    Disabled,
    /// One extra execution every `delay`, up to `max_executions` in total
    /// (the initial execution included).
    Constant {
        delay: Duration,
        max_executions: usize,
    },
}

/// Built-in retry policies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicyKind {
    #[default]
    Default,
    Fallthrough,
}

/// How a request completed through an `Ignore` retry verdict is accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnoredErrorAccounting {
    /// Counted with ordinary successes.
    AsSuccess,
    /// Counted on its own `ignored` counter.
    #[default]
    Separate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Connections opened eagerly and kept alive per node.
    pub connections_per_node: usize,
    /// Upper bound of connections per node, opened on demand when streams run out.
    pub max_connections_per_node: usize,
    /// Stream ids available on a single connection.
    pub max_requests_per_connection: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Compression algorithm name, resolved once through [`Compression::from_name`].
    pub compression: Option<String>,
    pub max_frame_size: usize,
    pub speculative_execution: SpeculativeExecutionConfig,
    pub retry_policy: RetryPolicyKind,
    /// Error kinds the application tolerates; they complete a request as degraded.
    pub ignored_errors: Vec<ErrorKind>,
    pub ignored_error_accounting: IgnoredErrorAccounting,
    pub reconnection: ReconnectionConfig,
    /// Idle time after which a connection sends an OPTIONS heartbeat.
    pub heartbeat_interval: Option<Duration>,
    pub default_consistency: Consistency,
    pub default_idempotence: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connections_per_node: 1,
            max_connections_per_node: 2,
            max_requests_per_connection: 1024,
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            compression: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            speculative_execution: SpeculativeExecutionConfig::default(),
            retry_policy: RetryPolicyKind::default(),
            ignored_errors: Vec::new(),
            ignored_error_accounting: IgnoredErrorAccounting::default(),
            reconnection: ReconnectionConfig::default(),
            heartbeat_interval: None,
            default_consistency: Consistency::LocalOne,
            default_idempotence: false,
        }
    }
}

impl DriverConfig {
    pub fn with_pool_size(mut self, core: usize, max: usize) -> Self {
        self.connections_per_node = core;
        self.max_connections_per_node = max;
        self
    }

    pub fn with_max_requests_per_connection(mut self, max: usize) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_compression(mut self, name: impl Into<String>) -> Self {
        self.compression = Some(name.into());
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_speculative_execution(mut self, speculative: SpeculativeExecutionConfig) -> Self {
        self.speculative_execution = speculative;
        self
    }

    pub fn with_retry_policy(mut self, kind: RetryPolicyKind) -> Self {
        self.retry_policy = kind;
        self
    }

    pub fn with_ignored_errors(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.ignored_errors = kinds.into_iter().collect();
        self
    }

    pub fn with_ignored_error_accounting(mut self, accounting: IgnoredErrorAccounting) -> Self {
        self.ignored_error_accounting = accounting;
        self
    }

    pub fn with_reconnection(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.reconnection = ReconnectionConfig {
            base_delay,
            max_delay,
        };
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_default_consistency(mut self, consistency: Consistency) -> Self {
        self.default_consistency = consistency;
        self
    }

    pub fn with_default_idempotence(mut self, idempotent: bool) -> Self {
        self.default_idempotence = idempotent;
        self
    }

    /// Compression resolved from the configured name. Unknown names fall back to none.
    pub fn compression(&self) -> Compression {
        Compression::from_name(self.compression.as_deref())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections_per_node == 0 {
            return Err(ConfigError::Zero("connections_per_node"));
        }
        if self.max_connections_per_node < self.connections_per_node {
            return Err(ConfigError::PoolBounds {
                core: self.connections_per_node,
                max: self.max_connections_per_node,
            });
        }
        if self.max_requests_per_connection == 0 {
            return Err(ConfigError::Zero("max_requests_per_connection"));
        }
        if self.max_requests_per_connection > MAX_STREAM_IDS {
            return Err(ConfigError::TooManyStreams(self.max_requests_per_connection));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request_timeout"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero("connect_timeout"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > DEFAULT_MAX_FRAME_SIZE {
            return Err(ConfigError::FrameSize(self.max_frame_size));
        }
        if self.reconnection.base_delay.is_zero() {
            return Err(ConfigError::Zero("reconnection.base_delay"));
        }
        if self.reconnection.base_delay > self.reconnection.max_delay {
            return Err(ConfigError::ReconnectionBounds {
                base: self.reconnection.base_delay,
                max: self.reconnection.max_delay,
            });
        }
        if let SpeculativeExecutionConfig::Constant { max_executions, .. } =
            self.speculative_execution
        {
            if max_executions == 0 {
                return Err(ConfigError::Zero("speculative_execution.max_executions"));
            }
        }
        if matches!(self.heartbeat_interval, Some(interval) if interval.is_zero()) {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(DriverConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_pool_ceiling_below_core() {
        let config = DriverConfig::default().with_pool_size(3, 2);

        assert_eq!(
            config.validate(),
            Err(ConfigError::PoolBounds { core: 3, max: 2 })
        );
    }

    #[test]
    fn rejects_more_streams_than_the_protocol_allows() {
        let config = DriverConfig::default().with_max_requests_per_connection(40_000);

        assert_eq!(config.validate(), Err(ConfigError::TooManyStreams(40_000)));
    }

    #[test]
    fn rejects_inverted_reconnection_bounds() {
        let config = DriverConfig::default()
            .with_reconnection(Duration::from_secs(10), Duration::from_secs(1));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReconnectionBounds { .. })
        ));
    }

    #[test]
    fn compression_name_resolves_once() {
        let config = DriverConfig::default().with_compression("SNAPPY");
        assert_eq!(config.compression(), Compression::Snappy);

        let config = DriverConfig::default().with_compression("zstd");
        assert_eq!(config.compression(), Compression::None);
    }
}
