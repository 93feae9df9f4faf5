//! Module for primitive structs associated with the recovery engine

use std::fmt;
use std::time::Duration;

use getset::{CopyGetters, Getters};
use secrecy::SecretString;

/// Block height reached by scanning, as reported by the scan service after each scan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ScanCursor(u32);

impl ScanCursor {
    /// Creates a cursor at the given block height
    pub const fn from_u32(height: u32) -> Self {
        ScanCursor(height)
    }

    /// Block height of this cursor
    pub const fn height(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ScanCursor {
    fn from(height: u32) -> Self {
        ScanCursor(height)
    }
}

impl From<ScanCursor> for u32 {
    fn from(cursor: ScanCursor) -> Self {
        cursor.0
    }
}

impl fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum number of blocks requested from a single scan step.
///
/// Always at least one block: every constructor floors the value at [`BatchSize::MIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchSize(u32);

impl BatchSize {
    /// Smallest batch the engine will ever request
    pub const MIN: BatchSize = BatchSize(1);
    /// Batch size of the first scan step of a run
    pub const DEFAULT: BatchSize = BatchSize(1_000);

    /// Creates a batch size, clamping zero up to [`BatchSize::MIN`]
    pub const fn new(blocks: u32) -> Self {
        if blocks == 0 {
            Self::MIN
        } else {
            BatchSize(blocks)
        }
    }

    /// Number of blocks in this batch
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for BatchSize {
    fn from(blocks: u32) -> Self {
        BatchSize::new(blocks)
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inputs of a single recovery run.
///
/// Everything except `end_height` is fixed at creation. `end_height` tracks the last cursor
/// returned by the scan service and is only written by the orchestrator that owns the run.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct ScanParameters {
    /// Recovery phrase of the wallet being swept
    #[getset(get = "pub")]
    seed: SecretString,
    /// Address receiving the swept funds
    #[getset(get = "pub")]
    destination: String,
    /// Number of transparent addresses to derive
    #[getset(get_copy = "pub")]
    ntaddrs: u32,
    /// Number of shielded (sapling) accounts to derive
    #[getset(get_copy = "pub")]
    nzaddrs: u32,
    /// First block height to scan
    #[getset(get_copy = "pub")]
    birth_height: u32,
    /// Lightwalletd server the scan service syncs from
    #[getset(get = "pub")]
    lwd_url: String,
    /// Last observed scan cursor, `None` before the first scan step
    #[getset(get_copy = "pub")]
    end_height: Option<ScanCursor>,
}

impl ScanParameters {
    /// Creates parameters for a new run
    pub fn new(
        seed: SecretString,
        destination: String,
        ntaddrs: u32,
        nzaddrs: u32,
        birth_height: u32,
        lwd_url: String,
    ) -> Self {
        ScanParameters {
            seed,
            destination,
            ntaddrs,
            nzaddrs,
            birth_height,
            lwd_url,
            end_height: None,
        }
    }

    pub(crate) fn set_end_height(&mut self, cursor: ScanCursor) {
        self.end_height = Some(cursor);
    }
}

/// Lifecycle of a recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    /// Not started
    #[default]
    Idle,
    /// Waiting on session init
    Initializing,
    /// Inside the scan loop
    Scanning,
    /// Waiting on the sweep
    Sweeping,
    /// Sweep completed
    Done,
    /// A remote call failed or the run was interrupted
    Failed,
}

impl RunState {
    /// Returns `true` for [`RunState::Done`] and [`RunState::Failed`]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Initializing => "initializing",
            RunState::Scanning => "scanning",
            RunState::Sweeping => "sweeping",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Summary of a run that reached [`RunState::Done`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct RunOutcome {
    /// Converged cursor passed to the sweep
    end_height: ScanCursor,
    /// Number of scan steps issued
    iterations: u32,
    /// Batch size the pacing controller would have requested next
    final_batch_size: BatchSize,
    /// Wall-clock duration of the whole run
    elapsed: Duration,
}

impl RunOutcome {
    pub(crate) fn from_parts(
        end_height: ScanCursor,
        iterations: u32,
        final_batch_size: BatchSize,
        elapsed: Duration,
    ) -> Self {
        RunOutcome {
            end_height,
            iterations,
            final_batch_size,
            elapsed,
        }
    }
}

/// Observations published by the orchestrator while a run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// The run entered a new state
    StateChanged(RunState),
    /// A scan step returned
    Progress {
        /// Cursor returned by the scan step
        cursor: ScanCursor,
        /// Batch size requested by the scan step
        batch_size: BatchSize,
        /// Wall-clock duration of the scan step
        elapsed: Duration,
    },
    /// The pacing controller changed the batch size for the next scan step
    BatchResized {
        /// Batch size of the previous scan step
        from: BatchSize,
        /// Batch size of the next scan step
        to: BatchSize,
    },
    /// The scan service returned a cursor lower than the previous one
    CursorRegressed {
        /// Cursor of the previous scan step
        previous: ScanCursor,
        /// Cursor of the latest scan step
        current: ScanCursor,
    },
}
