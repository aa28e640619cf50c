use thiserror::Error;

use crate::alarm::machine::AlarmState;
use crate::alarm::model::AlarmId;

/// Errors produced by the JSON alarm store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON at line {line}, column {column}: {0}", line = .0.line(), column = .0.column())]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Format(String),
}

/// Errors surfaced to callers of the engine. All of them are recoverable.
#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("alarm {0} not found")]
    NotFound(AlarmId),
    #[error("alarm {id} cannot handle {event} while {state}")]
    InvalidTransition {
        id: AlarmId,
        state: AlarmState,
        event: &'static str,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("alarm service is not running")]
    ServiceStopped,
}
