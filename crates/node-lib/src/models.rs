//! Core data models for the elastic node

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Header line of the allocation log
pub const LOG_HEADER: &str = "nId,ts,sId,sla,rt,rq,al";

/// A hosted service with a response-time objective
///
/// Identity is the name: two services with the same name are the same
/// service regardless of their other attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Unique service name
    pub name: String,
    /// Memory consumed by one allocated unit (worker)
    pub memory: u64,
    /// Target (SLA) response time in milliseconds
    pub target_rt_ms: f64,
    /// Advisory allocation used for static pre-sizing and open-loop control
    #[serde(default)]
    pub target_allocation: f64,
}

impl Service {
    pub fn new(name: impl Into<String>, memory: u64, target_rt_ms: f64) -> Self {
        Self {
            name: name.into(),
            memory,
            target_rt_ms,
            target_allocation: 0.0,
        }
    }

    /// Set the target allocation hint
    pub fn with_target_allocation(mut self, allocation: f64) -> Self {
        self.target_allocation = allocation;
        self
    }

    /// Reject services that cannot be planned for
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| NodeError::InvalidService {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.name.contains(',') {
            return Err(invalid("name must not contain ','"));
        }
        if self.memory == 0 {
            return Err(invalid("memory footprint must be greater than zero"));
        }
        if !(self.target_rt_ms.is_finite() && self.target_rt_ms > 0.0) {
            return Err(invalid("target response time must be positive"));
        }
        if !(self.target_allocation.is_finite() && self.target_allocation >= 0.0) {
            return Err(invalid("target allocation must be a non-negative number"));
        }
        Ok(())
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A unit of work addressed to a service
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub service: String,
    /// Processing time the unit of work takes once a worker picks it up
    pub cost: Duration,
}

impl ServiceRequest {
    pub fn new(service: &Service, cost: Duration) -> Self {
        Self::for_service(service.name.clone(), cost)
    }

    pub fn for_service(service: impl Into<String>, cost: Duration) -> Self {
        Self {
            service: service.into(),
            cost,
        }
    }
}

/// Completed-request statistics of one service for one control period
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringData {
    /// Requests completed during the period
    pub requests: u64,
    /// Mean response time (queueing + processing) in milliseconds
    pub response_time_ms: f64,
    /// Mean processing time in milliseconds
    pub service_time_ms: f64,
}

impl MonitoringData {
    pub fn is_empty(&self) -> bool {
        self.requests == 0
    }
}

/// One control decision for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryData {
    /// Control tick that produced this record
    pub epoch: u64,
    pub timestamp_ms: i64,
    pub monitoring: MonitoringData,
    /// Allocation handed to the executor
    pub allocation: u32,
    /// Unconstrained recommendation of the smoothing filter
    pub optimal_allocation: f64,
    /// The estimator found no finite allocation meeting the target
    pub infeasible: bool,
}

/// One line of the allocation log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRecord {
    pub node_id: String,
    pub timestamp_ms: i64,
    pub service_id: String,
    pub target_rt_ms: f64,
    pub observed_rt_ms: f64,
    pub requests: u64,
    pub allocation: u32,
}

impl AllocationRecord {
    /// Render the record in `LOG_HEADER` field order
    pub fn csv_line(&self) -> String {
        format!(
            "{},{},{},{:?},{:?},{},{:?}",
            self.node_id,
            self.timestamp_ms,
            self.service_id,
            self.target_rt_ms,
            self.observed_rt_ms,
            self.requests,
            f64::from(self.allocation)
        )
    }
}
