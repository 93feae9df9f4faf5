//! Top level error module for the crate

use std::time::Duration;

use crate::primitives::{RunState, ScanCursor};

/// Errors returned by a scan service call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The call could not be delivered or its response could not be read
    #[error("Transport error. {0}")]
    Transport(String),
    /// The service executed the call and reported an error
    #[error("Remote error {code}. {message}")]
    Remote {
        /// Service defined error code
        code: i64,
        /// Service supplied description
        message: String,
    },
    /// No response within the configured per-call limit
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
    /// The response did not have the expected shape
    #[error("Invalid response. {0}")]
    InvalidResponse(String),
    /// The call could not be built from the given parameters
    #[error("Invalid request. {0}")]
    InvalidRequest(String),
}

/// Reasons the inputs of a run were rejected before it started
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    /// Seed phrase rejected
    #[error("Invalid seed")]
    InvalidSeed,
    /// Destination address rejected
    #[error("Invalid address")]
    InvalidAddress,
    /// The validator itself could not be reached
    #[error("Validation unavailable. {0}")]
    Unavailable(#[from] ServiceError),
}

/// Terminal failures of a recovery run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// Inputs were rejected, nothing was sent to the scan service
    #[error("Validation failed. {0}")]
    Validation(#[from] ValidationFailure),
    /// Session init failed
    #[error("Init failed. {0}")]
    InitFailed(#[source] ServiceError),
    /// A scan step failed mid-loop
    #[error("Scan step failed, last end height {}. {source}", describe_height(.end_height))]
    ScanStepFailed {
        /// Cursor reached before the failing step
        end_height: Option<ScanCursor>,
        /// Underlying service error
        #[source]
        source: ServiceError,
    },
    /// Scanning converged but the sweep failed
    #[error("Sweep failed at end height {end_height}. {source}")]
    SweepFailed {
        /// Converged cursor the sweep was issued with
        end_height: ScanCursor,
        /// Underlying service error
        #[source]
        source: ServiceError,
    },
    /// The scan service moved the cursor backwards and regressions are treated as fatal
    #[error("Scan cursor regressed from {previous} to {current}")]
    CursorRegressed {
        /// Cursor of the previous scan step
        previous: ScanCursor,
        /// Cursor of the latest scan step
        current: ScanCursor,
    },
    /// The run was interrupted before its next remote call
    #[error("Interrupted, last end height {}", describe_height(.end_height))]
    Interrupted {
        /// Cursor reached before the interrupt
        end_height: Option<ScanCursor>,
    },
    /// The orchestrator already ran a session
    #[error("Orchestrator is {0}, a new run needs a new orchestrator")]
    SessionReused(RunState),
}

impl RunError {
    /// Scan progress reached before the failure, if any scan step completed.
    pub fn end_height(&self) -> Option<ScanCursor> {
        match self {
            RunError::ScanStepFailed { end_height, .. } | RunError::Interrupted { end_height } => {
                *end_height
            }
            RunError::SweepFailed { end_height, .. } => Some(*end_height),
            RunError::CursorRegressed { current, .. } => Some(*current),
            RunError::Validation(_) | RunError::InitFailed(_) | RunError::SessionReused(_) => {
                None
            }
        }
    }
}

fn describe_height(end_height: &Option<ScanCursor>) -> String {
    match end_height {
        Some(cursor) => cursor.to_string(),
        None => "none".to_string(),
    }
}
