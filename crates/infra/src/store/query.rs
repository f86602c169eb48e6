//! Read-side shapes: ledger pages and projection rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_inventory::{EntryId, LedgerEntry, StockKey};

use crate::config::MAX_LEDGER_PAGE_SIZE;

/// Keyset pagination over a ledger stream, newest first.
///
/// `before` is exclusive: a page holds entries with ids strictly below it.
/// Entries appended while a scan is running have higher ids, so they never
/// shift the pages still to come.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub before: Option<EntryId>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            before: None,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, before: Option<EntryId>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, MAX_LEDGER_PAGE_SIZE),
            before,
        }
    }

    pub fn first(limit: u32) -> Self {
        Self::new(Some(limit), None)
    }
}

/// One page of a ledger stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPage {
    /// Newest first.
    pub entries: Vec<LedgerEntry>,
    /// Cursor for the next page; `None` once the oldest entry has been returned.
    pub next: Option<EntryId>,
}

impl LedgerPage {
    /// Build a page from up to `limit + 1` entries fetched newest first.
    pub(crate) fn from_overfetch(mut entries: Vec<LedgerEntry>, limit: u32) -> Self {
        let limit = limit as usize;
        let has_more = entries.len() > limit;
        entries.truncate(limit);
        let next = if has_more {
            entries.last().map(|e| e.id)
        } else {
            None
        };
        Self { entries, next }
    }
}

/// One projection row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub key: StockKey,
    pub quantity: i64,
    pub updated_at: DateTime<Utc>,
}
