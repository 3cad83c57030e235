use std::{fmt, time::Duration};

use crate::{config::SpeculativeExecutionConfig, statement::Statement};

/// Decides when extra executions of an idempotent request may start.
pub trait SpeculativeExecutionPolicy: Send + Sync + fmt::Debug {
    /// Start offsets measured from the beginning of the request. The first entry is
    /// the initial execution, each later one permits one more parallel execution
    /// against the next node of the plan. Offsets are non-decreasing.
    fn new_schedule(&self, statement: &Statement) -> Vec<Duration>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoSpeculativeExecution;

impl SpeculativeExecutionPolicy for NoSpeculativeExecution {
    fn new_schedule(&self, _statement: &Statement) -> Vec<Duration> {
        vec![Duration::ZERO]
    }
}

/// `max_executions` executions in total, one every `delay`.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSpeculativeExecution {
    delay: Duration,
    max_executions: usize,
}

impl ConstantSpeculativeExecution {
    pub fn new(delay: Duration, max_executions: usize) -> Self {
        Self {
            delay,
            max_executions: max_executions.max(1),
        }
    }
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecution {
    fn new_schedule(&self, _statement: &Statement) -> Vec<Duration> {
        (0..self.max_executions)
            .map(|n| self.delay.saturating_mul(n as u32))
            .collect()
    }
}

/// An explicit list of offsets.
#[derive(Debug, Clone)]
pub struct FixedSchedule {
    offsets: Vec<Duration>,
}

impl FixedSchedule {
    /// Offsets are sorted; an initial execution at zero is added when missing.
    pub fn new(offsets: impl IntoIterator<Item = Duration>) -> Self {
        let mut offsets: Vec<Duration> = offsets.into_iter().collect();
        offsets.sort();
        if offsets.first() != Some(&Duration::ZERO) {
            offsets.insert(0, Duration::ZERO);
        }
        Self { offsets }
    }
}

impl SpeculativeExecutionPolicy for FixedSchedule {
    fn new_schedule(&self, _statement: &Statement) -> Vec<Duration> {
        self.offsets.clone()
    }
}

/// Policy matching a configuration entry.
pub fn from_config(config: &SpeculativeExecutionConfig) -> Box<dyn SpeculativeExecutionPolicy> {
    match *config {
        SpeculativeExecutionConfig::Disabled => Box::new(NoSpeculativeExecution),
        SpeculativeExecutionConfig::Constant {
            delay,
            max_executions,
        } => Box::new(ConstantSpeculativeExecution::new(delay, max_executions)),
    }
}
