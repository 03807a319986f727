//! Node construction parameters

use crate::error::{NodeError, Result};
use crate::executor::ExecutorOptions;
use crate::history::DEFAULT_MAX_RECORDS;
use std::time::Duration;

/// Static configuration of a node, fixed at construction
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_id: String,
    /// Total memory shared by all services' pools
    pub memory: u64,
    /// Interval between control ticks
    pub control_period: Duration,
    /// Smoothing factor of the allocation filters, in (0, 1]
    pub alpha: f64,
    /// Closed-loop control; when false the allocation hints are applied as is
    pub control_enabled: bool,
    /// History records retained per service between reads
    pub history_capacity: usize,
    pub executor: ExecutorOptions,
}

impl NodeSettings {
    pub fn new(
        node_id: impl Into<String>,
        memory: u64,
        control_period: Duration,
        alpha: f64,
        control_enabled: bool,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            memory,
            control_period,
            alpha,
            control_enabled,
            history_capacity: DEFAULT_MAX_RECORDS,
            executor: ExecutorOptions::default(),
        }
    }

    /// Bound every service queue instead of queueing without limit
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.executor.max_pending = Some(max_pending);
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(NodeError::InvalidAlpha(self.alpha));
        }
        if self.memory == 0 {
            return Err(NodeError::InvalidMemory);
        }
        if self.control_period.is_zero() {
            return Err(NodeError::InvalidControlPeriod);
        }
        Ok(())
    }
}
