//! Stock movement rules: which ledger entry a movement produces and whether
//! the current on-hand quantity allows it.
//!
//! Reservation and sale share one stock pool: a reserve takes units out of
//! on-hand exactly like a sale does, and a release puts them back.

use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, Quantity};

use crate::ledger::{LedgerEntryType, NewLedgerEntry, Reference, StockKey};

/// A requested change to one stock row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "quantity", rename_all = "snake_case")]
pub enum StockMovement {
    Receive(Quantity),
    Sell(Quantity),
    Reserve(Quantity),
    Release(Quantity),
    Return(Quantity),
    /// Signed manual correction (stock count reconciliation).
    Adjust(i64),
}

impl StockMovement {
    pub fn entry_type(&self) -> LedgerEntryType {
        match self {
            StockMovement::Receive(_) => LedgerEntryType::PurchaseIn,
            StockMovement::Sell(_) => LedgerEntryType::SaleOut,
            StockMovement::Reserve(_) => LedgerEntryType::Reserve,
            StockMovement::Release(_) => LedgerEntryType::Release,
            StockMovement::Return(_) => LedgerEntryType::Return,
            StockMovement::Adjust(_) => LedgerEntryType::Adjust,
        }
    }

    /// Signed on-hand delta this movement records.
    pub fn delta(&self) -> i64 {
        match *self {
            StockMovement::Receive(q) | StockMovement::Release(q) | StockMovement::Return(q) => {
                q.get()
            }
            StockMovement::Sell(q) | StockMovement::Reserve(q) => -q.get(),
            StockMovement::Adjust(delta) => delta,
        }
    }

    /// Decide the new on-hand quantity given the locked current one.
    ///
    /// Outbound movements (sell, reserve, negative adjust) may never take
    /// on-hand below zero.
    pub fn decide(&self, on_hand: i64) -> DomainResult<i64> {
        if let StockMovement::Adjust(0) = self {
            return Err(DomainError::validation("adjustment cannot be zero"));
        }

        let delta = self.delta();
        let next = on_hand
            .checked_add(delta)
            .ok_or_else(|| DomainError::invariant("stock quantity overflow"))?;

        if delta < 0 && next < 0 {
            return Err(DomainError::insufficient_stock(on_hand, -delta));
        }
        Ok(next)
    }

    /// Combine two movements of the same kind into one; `None` if the kinds
    /// differ or the sum overflows.
    pub fn merge(self, other: StockMovement) -> Option<StockMovement> {
        use StockMovement::*;

        let sum = |a: Quantity, b: Quantity| {
            a.get()
                .checked_add(b.get())
                .and_then(|n| Quantity::new(n).ok())
        };
        match (self, other) {
            (Receive(a), Receive(b)) => sum(a, b).map(Receive),
            (Sell(a), Sell(b)) => sum(a, b).map(Sell),
            (Reserve(a), Reserve(b)) => sum(a, b).map(Reserve),
            (Release(a), Release(b)) => sum(a, b).map(Release),
            (Return(a), Return(b)) => sum(a, b).map(Return),
            (Adjust(a), Adjust(b)) => a.checked_add(b).map(Adjust),
            _ => None,
        }
    }

    /// Build the ledger entry this movement appends for `key`.
    pub fn to_entry(&self, key: StockKey, reference: Reference) -> NewLedgerEntry {
        NewLedgerEntry {
            key,
            qty_change: self.delta(),
            entry_type: self.entry_type(),
            reference,
        }
    }
}
