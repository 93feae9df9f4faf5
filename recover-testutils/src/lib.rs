//! In-memory scan service and fixtures for exercising the recovery engine without a backend.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use secrecy::SecretString;

use recover_sync::error::ServiceError;
use recover_sync::interface::{InputValidator, ScanService};
use recover_sync::primitives::{BatchSize, ScanCursor, ScanParameters};

/// Recovery phrase accepted by the mock validators
pub const ABANDON_ART_SEED: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon art";
/// Destination address used by fixtures
pub const DESTINATION: &str = "u1c2v7ugwccldxzawuzgmt05nt258kkh76hc9rzpahyy3admqd4el30en4pka5zmjkxrte37qszwch4w9kyux393unsu6ftrpz0cvxxlm4";
/// Birth height used by fixtures
pub const BIRTH_HEIGHT: u32 = 2_757_209;
/// Lightwalletd server used by fixtures
pub const LWD_URL: &str = "https://zec.rocks";

/// Parameters of a run with fixture values
pub fn scan_parameters() -> ScanParameters {
    ScanParameters::new(
        SecretString::new(ABANDON_ART_SEED.to_string()),
        DESTINATION.to_string(),
        5,
        3,
        BIRTH_HEIGHT,
        LWD_URL.to_string(),
    )
}

/// A call received by [`MockScanService`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    /// [`ScanService::init`]
    Init {
        /// Birth height of the session
        birth_height: u32,
    },
    /// [`ScanService::scan_step`]
    ScanStep {
        /// Requested batch size
        batch_size: BatchSize,
        /// `end_height` carried by the parameters
        end_height: Option<ScanCursor>,
    },
    /// [`ScanService::sweep`]
    Sweep {
        /// `end_height` carried by the parameters
        end_height: Option<ScanCursor>,
    },
    /// [`InputValidator::validate_seed`]
    ValidateSeed,
    /// [`InputValidator::validate_address`]
    ValidateAddress,
}

/// One scripted scan step response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedStep {
    /// Return this height
    Cursor(u32),
    /// Fail with this error
    Fail(ServiceError),
}

/// Chain model that answers scan steps the way a lightwalletd backed service does:
/// `min(tip, synced + batch_size)`, taking `per_block` of wall-clock time per block scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedChain {
    /// Height the scan starts from
    pub synced: u32,
    /// Chain tip
    pub tip: u32,
    /// Simulated scan cost per block
    pub per_block: Duration,
}

enum Responder {
    Script(VecDeque<ScriptedStep>),
    Chain(SimulatedChain),
}

struct MockState {
    responder: Mutex<Responder>,
    step_latency: Duration,
    init_error: Option<ServiceError>,
    sweep_error: Option<ServiceError>,
    seed_valid: bool,
    address_valid: bool,
    calls: Mutex<Vec<ServiceCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Scan service double recording every call it receives.
///
/// Clones share state, so a test can keep one handle while the orchestrator owns another.
#[derive(Clone)]
pub struct MockScanService {
    state: Arc<MockState>,
}

impl MockScanService {
    /// Starts a builder with every call succeeding and an empty scan script
    pub fn builder() -> MockScanServiceBuilder {
        MockScanServiceBuilder::default()
    }

    /// Service returning `cursors` from successive scan steps
    pub fn scripted(cursors: &[u32]) -> Self {
        Self::builder().cursors(cursors).build()
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<ServiceCall> {
        lock(&self.state.calls).clone()
    }

    /// Batch sizes of every scan step received so far
    pub fn batch_sizes(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ServiceCall::ScanStep { batch_size, .. } => Some(batch_size.get()),
                _ => None,
            })
            .collect()
    }

    /// Number of sweeps received so far
    pub fn sweep_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ServiceCall::Sweep { .. }))
            .count()
    }

    /// Highest number of session calls that were ever in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::Acquire)
    }

    fn record(&self, call: ServiceCall) {
        lock(&self.state.calls).push(call);
    }

    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::AcqRel);
        InFlightGuard {
            in_flight: &self.state.in_flight,
        }
    }

    fn respond(&self, batch_size: BatchSize) -> (Result<ScanCursor, ServiceError>, Duration) {
        let mut responder = lock(&self.state.responder);
        match &mut *responder {
            Responder::Script(script) => {
                let response = match script.pop_front() {
                    Some(ScriptedStep::Cursor(height)) => Ok(ScanCursor::from_u32(height)),
                    Some(ScriptedStep::Fail(error)) => Err(error),
                    None => Err(ServiceError::Remote {
                        code: -32603,
                        message: "scan script exhausted".to_string(),
                    }),
                };
                (response, self.state.step_latency)
            }
            Responder::Chain(chain) => {
                let target = chain.tip.min(chain.synced.saturating_add(batch_size.get()));
                let scanned = target.saturating_sub(chain.synced);
                chain.synced = target;
                let latency = self.state.step_latency + chain.per_block * scanned;
                (Ok(ScanCursor::from_u32(target)), latency)
            }
        }
    }
}

impl InputValidator for MockScanService {
    async fn validate_seed(&self, _seed: &str) -> Result<bool, ServiceError> {
        self.record(ServiceCall::ValidateSeed);
        Ok(self.state.seed_valid)
    }

    async fn validate_address(&self, _address: &str) -> Result<bool, ServiceError> {
        self.record(ServiceCall::ValidateAddress);
        Ok(self.state.address_valid)
    }
}

impl ScanService for MockScanService {
    async fn init(&self, params: &ScanParameters) -> Result<(), ServiceError> {
        let _guard = self.enter();
        self.record(ServiceCall::Init {
            birth_height: params.birth_height(),
        });
        match &self.state.init_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn scan_step(
        &self,
        params: &ScanParameters,
        batch_size: BatchSize,
    ) -> Result<ScanCursor, ServiceError> {
        let _guard = self.enter();
        self.record(ServiceCall::ScanStep {
            batch_size,
            end_height: params.end_height(),
        });
        let (response, latency) = self.respond(batch_size);
        tokio::time::sleep(latency).await;
        tracing::debug!("Mock scan step of {} blocks -> {:?}", batch_size, response);

        response
    }

    async fn sweep(&self, params: &ScanParameters) -> Result<(), ServiceError> {
        let _guard = self.enter();
        self.record(ServiceCall::Sweep {
            end_height: params.end_height(),
        });
        match &self.state.sweep_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

macro_rules! build_method {
    ($name:ident, $localtype:ty) => {
        #[doc = concat!("Set the `", stringify!($name), "` of the mock.")]
        pub fn $name(mut self, $name: $localtype) -> Self {
            self.$name = $name;
            self
        }
    };
}

/// Builder for [`MockScanService`]
pub struct MockScanServiceBuilder {
    script: Vec<ScriptedStep>,
    chain: Option<SimulatedChain>,
    step_latency: Duration,
    init_error: Option<ServiceError>,
    sweep_error: Option<ServiceError>,
    seed_valid: bool,
    address_valid: bool,
}

impl Default for MockScanServiceBuilder {
    fn default() -> Self {
        MockScanServiceBuilder {
            script: Vec::new(),
            chain: None,
            step_latency: Duration::ZERO,
            init_error: None,
            sweep_error: None,
            seed_valid: true,
            address_valid: true,
        }
    }
}

impl MockScanServiceBuilder {
    build_method!(step_latency, Duration);
    build_method!(seed_valid, bool);
    build_method!(address_valid, bool);

    /// Appends successful scan steps returning `cursors`
    pub fn cursors(mut self, cursors: &[u32]) -> Self {
        self.script
            .extend(cursors.iter().copied().map(ScriptedStep::Cursor));
        self
    }

    /// Appends a failing scan step
    pub fn failing_step(mut self, error: ServiceError) -> Self {
        self.script.push(ScriptedStep::Fail(error));
        self
    }

    /// Answers scan steps from a chain model instead of the script
    pub fn chain(mut self, chain: SimulatedChain) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Makes init fail
    pub fn init_error(mut self, error: ServiceError) -> Self {
        self.init_error = Some(error);
        self
    }

    /// Makes the sweep fail
    pub fn sweep_error(mut self, error: ServiceError) -> Self {
        self.sweep_error = Some(error);
        self
    }

    /// Finishes the mock
    pub fn build(self) -> MockScanService {
        let responder = match self.chain {
            Some(chain) => Responder::Chain(chain),
            None => Responder::Script(self.script.into()),
        };
        MockScanService {
            state: Arc::new(MockState {
                responder: Mutex::new(responder),
                step_latency: self.step_latency,
                init_error: self.init_error,
                sweep_error: self.sweep_error,
                seed_valid: self.seed_valid,
                address_valid: self.address_valid,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }
}
