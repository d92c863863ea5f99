//! Error taxonomy for the store and the tick loop

use shared::{EntityId, PayloadError};
use std::fmt;
use thiserror::Error;

/// Resource whose configured limit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Entities,
    Components,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Entities => write!(f, "entities"),
            ResourceKind::Components => write!(f, "component types"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} does not exist")]
    EntityNotFound { entity: EntityId },

    #[error("capacity exceeded: at most {limit} {kind}")]
    CapacityExceeded { kind: ResourceKind, limit: usize },

    #[error("parameter mismatch: expected {expected} values, got {actual}")]
    ParameterMismatch { expected: usize, actual: usize },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure raised while validating or executing a command or system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("unknown command `{name}`")]
    UnknownCommand { name: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("unknown component `{name}`")]
    UnknownComponent { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),
}
