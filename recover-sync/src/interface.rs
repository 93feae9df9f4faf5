//! Traits for interfacing the recovery engine with a scan service

use std::future::Future;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{ServiceError, ValidationFailure};
use crate::primitives::{BatchSize, ScanCursor, ScanParameters};

/// Side-effect free predicate checks on user input.
///
/// Calls may run concurrently with each other and with a run in progress.
pub trait InputValidator {
    /// Returns whether `seed` is an acceptable recovery phrase
    fn validate_seed(&self, seed: &str) -> impl Future<Output = Result<bool, ServiceError>> + Send;

    /// Returns whether `address` is an acceptable destination address
    fn validate_address(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<bool, ServiceError>> + Send;
}

/// Stateful remote scan service.
///
/// The service keeps session scoped scan state keyed by the parameters given to
/// [`ScanService::init`], so calls for one session must never overlap.
pub trait ScanService: InputValidator {
    /// Creates the scan session: wallet accounts, derived addresses and a chain checkpoint at the
    /// birth height. Must precede any scan step.
    fn init(&self, params: &ScanParameters)
        -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Scans at most `batch_size` blocks past the session's synced height and returns the height
    /// reached, `min(chain_tip, synced_height + batch_size)`. A caught up session returns the
    /// same height again.
    fn scan_step(
        &self,
        params: &ScanParameters,
        batch_size: BatchSize,
    ) -> impl Future<Output = Result<ScanCursor, ServiceError>> + Send;

    /// Builds, signs and broadcasts transactions moving every discovered balance to
    /// `params.destination()`, anchored at `params.end_height()`.
    fn sweep(&self, params: &ScanParameters)
        -> impl Future<Output = Result<(), ServiceError>> + Send;
}

impl<T: InputValidator> InputValidator for &T {
    fn validate_seed(&self, seed: &str) -> impl Future<Output = Result<bool, ServiceError>> + Send {
        (**self).validate_seed(seed)
    }

    fn validate_address(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<bool, ServiceError>> + Send {
        (**self).validate_address(address)
    }
}

impl<T: ScanService> ScanService for &T {
    fn init(
        &self,
        params: &ScanParameters,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send {
        (**self).init(params)
    }

    fn scan_step(
        &self,
        params: &ScanParameters,
        batch_size: BatchSize,
    ) -> impl Future<Output = Result<ScanCursor, ServiceError>> + Send {
        (**self).scan_step(params, batch_size)
    }

    fn sweep(
        &self,
        params: &ScanParameters,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send {
        (**self).sweep(params)
    }
}

/// Checks the seed and destination of a run, both queries in flight at once.
///
/// A run must not start unless this returns `Ok`.
pub async fn validate_inputs<V: InputValidator>(
    validator: &V,
    seed: &SecretString,
    destination: &str,
) -> Result<(), ValidationFailure> {
    let (seed_valid, address_valid) = futures::join!(
        validator.validate_seed(seed.expose_secret()),
        validator.validate_address(destination)
    );

    if !seed_valid? {
        return Err(ValidationFailure::InvalidSeed);
    }
    if !address_valid? {
        return Err(ValidationFailure::InvalidAddress);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedValidator {
        seed: Result<bool, ServiceError>,
        address: Result<bool, ServiceError>,
    }

    impl InputValidator for FixedValidator {
        async fn validate_seed(&self, _seed: &str) -> Result<bool, ServiceError> {
            self.seed.clone()
        }

        async fn validate_address(&self, _address: &str) -> Result<bool, ServiceError> {
            self.address.clone()
        }
    }

    fn seed() -> SecretString {
        SecretString::new("abandon ability able".to_string())
    }

    #[tokio::test]
    async fn accepts_valid_inputs() {
        let validator = FixedValidator {
            seed: Ok(true),
            address: Ok(true),
        };
        assert_eq!(validate_inputs(&validator, &seed(), "u1dest").await, Ok(()));
    }

    #[tokio::test]
    async fn seed_is_reported_before_address() {
        let validator = FixedValidator {
            seed: Ok(false),
            address: Ok(false),
        };
        assert_eq!(
            validate_inputs(&validator, &seed(), "u1dest").await,
            Err(ValidationFailure::InvalidSeed)
        );
    }

    #[tokio::test]
    async fn rejects_bad_address() {
        let validator = FixedValidator {
            seed: Ok(true),
            address: Ok(false),
        };
        assert_eq!(
            validate_inputs(&&validator, &seed(), "t1nope").await,
            Err(ValidationFailure::InvalidAddress)
        );
    }

    #[tokio::test]
    async fn unreachable_validator_blocks_the_run() {
        let validator = FixedValidator {
            seed: Err(ServiceError::Transport("connection refused".to_string())),
            address: Ok(true),
        };
        assert_eq!(
            validate_inputs(&validator, &seed(), "u1dest").await,
            Err(ValidationFailure::Unavailable(ServiceError::Transport(
                "connection refused".to_string()
            )))
        );
    }
}
