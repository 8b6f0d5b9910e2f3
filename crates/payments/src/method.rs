use serde::{Deserialize, Serialize};

use retail_core::{DomainError, DomainResult, ValueObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    BankTransfer,
    Wallet,
    CashOnDelivery,
}

/// What the customer paid with. Never holds a full card number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub kind: PaymentMethodKind,
    /// Gateway or wallet provider ("stripe", "paypal", ...).
    pub provider: Option<String>,
    pub brand: Option<String>,
    pub last4: Option<String>,
}

impl ValueObject for PaymentMethod {}

impl PaymentMethod {
    pub fn card(brand: impl Into<String>, last4: impl Into<String>) -> Self {
        Self {
            kind: PaymentMethodKind::Card,
            provider: None,
            brand: Some(brand.into()),
            last4: Some(last4.into()),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let Some(last4) = &self.last4 {
            if last4.len() != 4 || !last4.chars().all(|c| c.is_ascii_digit()) {
                return Err(DomainError::validation("last4 must be exactly four digits"));
            }
        }
        if self.kind != PaymentMethodKind::Card && self.last4.is_some() {
            return Err(DomainError::validation("last4 only applies to cards"));
        }
        Ok(())
    }
}
