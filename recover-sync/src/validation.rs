//! Offline input checks, used when the scan service is not consulted for validation.

use bip0039::{English, Mnemonic};
use zcash_address::ZcashAddress;

use crate::error::ServiceError;
use crate::interface::InputValidator;

/// Accepts BIP-39 English recovery phrases with a valid checksum
pub fn is_valid_seed(seed: &str) -> bool {
    Mnemonic::<English>::from_phrase(seed.to_string()).is_ok()
}

/// Accepts any address the zcash address encoding can parse
pub fn is_valid_address(address: &str) -> bool {
    ZcashAddress::try_from_encoded(address).is_ok()
}

/// [`InputValidator`] answering locally instead of calling the scan service
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalValidator;

impl InputValidator for LocalValidator {
    async fn validate_seed(&self, seed: &str) -> Result<bool, ServiceError> {
        Ok(is_valid_seed(seed))
    }

    async fn validate_address(&self, address: &str) -> Result<bool, ServiceError> {
        Ok(is_valid_address(address))
    }
}
