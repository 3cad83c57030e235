//! Pluggable request policies.
//!
//! The request engine owns the contracts and delegates every judgement call to a
//! policy: which nodes to try and in what order, whether a failed attempt is worth
//! retrying, when to start a parallel execution, and how long to wait before
//! reconnecting to a node. All policy methods are synchronous and free of side
//! effects on the request, so they can be called from anywhere on the request path.
//!
//! # Key Components
//!
//! - [`LoadBalancingPolicy`] / [`RoundRobinPolicy`]: query plans.
//! - [`RetryPolicy`] / [`DefaultRetryPolicy`]: verdicts on failed attempts.
//! - [`SpeculativeExecutionPolicy`]: start offsets of parallel executions.
//! - [`ReconnectionPolicy`] / [`ExponentialReconnectionPolicy`]: backoff between
//!   reconnection attempts.
mod reconnection;
mod retry;
mod routing;
pub mod speculative;

pub use reconnection::{
    ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
    ReconnectionSchedule,
};
pub use retry::{
    DefaultRetryPolicy, FallthroughRetryPolicy, IgnoringRetryPolicy, RetryContext,
    RetryDecision, RetryPolicy,
};
pub use routing::{LoadBalancingPolicy, QueryPlan, RoundRobinPolicy};
pub use speculative::{
    ConstantSpeculativeExecution, FixedSchedule, NoSpeculativeExecution,
    SpeculativeExecutionPolicy,
};
