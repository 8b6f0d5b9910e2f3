//! Postal address value object.

use serde::{Deserialize, Serialize};

use crate::error::{DomainResult, require_non_blank};
use crate::value_object::ValueObject;

/// A shipping or billing address, snapshotted onto the order that uses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub recipient: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
    pub phone: Option<String>,
}

impl ValueObject for Address {}

impl Address {
    pub fn validate(&self) -> DomainResult<()> {
        require_non_blank(&self.recipient, "address recipient")?;
        require_non_blank(&self.line1, "address line1")?;
        require_non_blank(&self.city, "address city")?;
        require_non_blank(&self.postal_code, "address postal_code")?;
        let country = self.country.trim();
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(crate::DomainError::validation(
                "address country must be a two-letter code",
            ));
        }
        Ok(())
    }
}
