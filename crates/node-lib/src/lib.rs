//! Elastic resource control for a single node
//!
//! This crate provides:
//! - Per-service worker pools fed by unbounded request queues
//! - Response-time monitoring per control period
//! - Queueing-model allocation estimates with smoothed feedback control
//! - A memory-budgeted control loop with per-tick history and allocation log
//! - Health checks and observability

pub mod controller;
pub mod error;
pub mod executor;
pub mod facade;
pub mod health;
pub mod history;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod planner;
pub mod settings;
pub mod sink;

pub use controller::{Allocation, PlannerController, MIN_VIABLE_ALLOCATION};
pub use error::{NodeError, Result};
pub use executor::{ExecuteOutcome, ExecutorOptions, ServiceExecutor};
pub use facade::{Diagnostics, NodeFacade, ServiceStatus, TickObserver, TickSummary};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use history::History;
pub use models::*;
pub use monitor::Monitor;
pub use observability::{NodeLogger, NodeMetrics};
pub use planner::Estimate;
pub use settings::NodeSettings;
pub use sink::{CsvFileSink, RecordSink, TracingSink};
