//! Error types for the node library

use thiserror::Error;

/// Errors raised by node construction and service registration
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("smoothing factor must be in (0, 1], got {0}")]
    InvalidAlpha(f64),

    #[error("node memory budget must be greater than zero")]
    InvalidMemory,

    #[error("control period must be greater than zero")]
    InvalidControlPeriod,

    #[error("invalid service '{name}': {reason}")]
    InvalidService { name: String, reason: String },

    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("control loop already started")]
    AlreadyStarted,

    #[error("log sink failure: {0}")]
    Sink(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
