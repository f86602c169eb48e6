//! Ledger entries: the append-only source of truth for stock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{VariantId, WarehouseId};

/// Stock row key: one projection row and one ledger stream per pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub warehouse_id: WarehouseId,
    pub variant_id: VariantId,
}

impl StockKey {
    pub fn new(warehouse_id: WarehouseId, variant_id: VariantId) -> Self {
        Self {
            warehouse_id,
            variant_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.warehouse_id, self.variant_id)
    }
}

/// Reason code of a ledger entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryType {
    PurchaseIn,
    SaleOut,
    Adjust,
    Reserve,
    Release,
    Return,
}

impl LedgerEntryType {
    pub const ALL: [LedgerEntryType; 6] = [
        LedgerEntryType::PurchaseIn,
        LedgerEntryType::SaleOut,
        LedgerEntryType::Adjust,
        LedgerEntryType::Reserve,
        LedgerEntryType::Release,
        LedgerEntryType::Return,
    ];

    /// Stable name, as stored in the `type` column.
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerEntryType::PurchaseIn => "PURCHASE_IN",
            LedgerEntryType::SaleOut => "SALE_OUT",
            LedgerEntryType::Adjust => "ADJUST",
            LedgerEntryType::Reserve => "RESERVE",
            LedgerEntryType::Release => "RELEASE",
            LedgerEntryType::Return => "RETURN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl core::fmt::Display for LedgerEntryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The business event that caused a ledger entry (e.g. `ORDER_SHIP` / order id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub reference_type: String,
    pub reference_id: String,
}

impl Reference {
    pub fn new(reference_type: impl Into<String>, reference_id: impl ToString) -> Self {
        Self {
            reference_type: reference_type.into(),
            reference_id: reference_id.to_string(),
        }
    }
}

/// Store-assigned ledger entry id. Strictly increasing in append order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A ledger entry ready to be appended (not yet assigned an id or timestamp).
///
/// Two entries with the same key, delta, type and reference describe the same
/// effect; the store refuses the second one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub key: StockKey,
    pub qty_change: i64,
    pub entry_type: LedgerEntryType,
    pub reference: Reference,
}

/// An immutable, persisted ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub key: StockKey,
    pub qty_change: i64,
    #[serde(rename = "type")]
    pub entry_type: LedgerEntryType,
    pub reference: Reference,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_new(id: EntryId, entry: NewLedgerEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            key: entry.key,
            qty_change: entry.qty_change,
            entry_type: entry.entry_type,
            reference: entry.reference,
            created_at,
        }
    }
}

/// Sum of `qty_change` over entries: the on-hand quantity they imply.
pub fn net_change<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> i64 {
    entries.into_iter().map(|e| e.qty_change).sum()
}
