use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ProductId, VariantId};

/// A sellable unit (SKU) of a product.
///
/// Carries no quantity: stock for a variant only exists per warehouse, derived
/// from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub product_id: ProductId,
    pub sku: String,
    /// Current list price in the smallest currency unit. Orders snapshot it.
    pub price: u64,
    pub active: bool,
}

impl Variant {
    pub fn new(product_id: ProductId, sku: impl Into<String>, price: u64) -> DomainResult<Self> {
        let sku = sku.into().trim().to_string();
        if sku.is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        Ok(Self {
            id: VariantId::new(),
            product_id,
            sku,
            price,
            active: true,
        })
    }
}
