//! Line items and the derived pricing snapshot.

use serde::{Deserialize, Serialize};

use retail_core::{Currency, DomainError, DomainResult, Entity, Money, ProductId};

/// Sales tax applied to the subtotal, in basis points (8%).
pub const TAX_RATE_BPS: u32 = 800;

/// Order line. Name and SKU are snapshotted when the line is added and are
/// never re-resolved against the live catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_no: u32,
    pub product_id: ProductId,
    pub name: String,
    pub sku: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub weight_grams: Option<u32>,
}

impl Entity for LineItem {
    type Id = u32;

    fn id(&self) -> &Self::Id {
        &self.line_no
    }
}

impl LineItem {
    pub fn total(&self) -> DomainResult<Money> {
        self.unit_price.multiply_quantity(self.quantity)
    }
}

/// `total = subtotal + tax + shipping − discount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub subtotal: Money,
    pub tax: Money,
    pub shipping: Money,
    pub discount: Money,
    pub total: Money,
}

impl PricingSnapshot {
    pub fn zero(currency: Currency) -> Self {
        let zero = Money::zero(currency);
        Self {
            subtotal: zero,
            tax: zero,
            shipping: zero,
            discount: zero,
            total: zero,
        }
    }

    /// Recompute from scratch for the given items, keeping shipping and discount as passed.
    pub fn compute(
        currency: Currency,
        items: &[LineItem],
        shipping: Money,
        discount: Money,
    ) -> DomainResult<Self> {
        let mut subtotal = Money::zero(currency);
        for item in items {
            subtotal = subtotal.checked_add(item.total()?)?;
        }
        let tax = subtotal.percentage_bps(TAX_RATE_BPS);
        let total = subtotal
            .checked_add(tax)?
            .checked_add(shipping)?
            .checked_sub(discount)?;
        if total.is_negative() {
            return Err(DomainError::validation(format!(
                "discount {discount} exceeds the order gross of {}",
                total.checked_add(discount)?
            )));
        }

        Ok(Self {
            subtotal,
            tax,
            shipping,
            discount,
            total,
        })
    }

    /// Recompute after an item change; shipping and discount carry over.
    pub fn reprice(&self, items: &[LineItem]) -> DomainResult<Self> {
        Self::compute(self.subtotal.currency(), items, self.shipping, self.discount)
    }

    pub fn with_shipping(&self, items: &[LineItem], shipping: Money) -> DomainResult<Self> {
        Self::compute(self.subtotal.currency(), items, shipping, self.discount)
    }

    pub fn with_discount(&self, items: &[LineItem], discount: Money) -> DomainResult<Self> {
        Self::compute(self.subtotal.currency(), items, self.shipping, discount)
    }

    /// Whether the stored total still matches its components.
    pub fn is_consistent(&self) -> bool {
        self.subtotal
            .checked_add(self.tax)
            .and_then(|m| m.checked_add(self.shipping))
            .and_then(|m| m.checked_sub(self.discount))
            .map(|expected| expected == self.total)
            .unwrap_or(false)
    }
}
