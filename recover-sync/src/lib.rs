#![forbid(unsafe_code)]
#![warn(missing_docs)]
//! Scan-and-sweep recovery engine
//!
//! Drives a remote scan service through session init, a self-paced sequence of bounded scan
//! steps and a final sweep once the scan cursor stops moving.
//!
//! Entrypoint: [`crate::orchestrator::ScanOrchestrator::start`]

pub mod convergence;
pub mod error;
pub mod interface;
pub mod orchestrator;
pub mod pacing;
pub mod primitives;
pub mod validation;

pub use orchestrator::{OrchestratorSettings, RegressionPolicy, ScanOrchestrator};
