//! Lazy, restartable walk over one stock key's ledger stream.

use stockledger_inventory::{EntryId, LedgerEntry, StockKey};

use crate::error::StoreError;
use crate::store::{InventoryStore, Pagination};

/// Pages through a ledger stream newest first.
///
/// Each [`LedgerScan::next_page`] call fetches one page from the store; the
/// scan ends after the oldest entry. Paging is keyed on entry ids, so entries
/// committed after the first page are not included until [`LedgerScan::restart`].
pub struct LedgerScan<'a, S: InventoryStore> {
    store: &'a S,
    key: StockKey,
    page_size: u32,
    cursor: Option<EntryId>,
    finished: bool,
}

impl<'a, S: InventoryStore> LedgerScan<'a, S> {
    pub(crate) fn new(store: &'a S, key: StockKey, page_size: u32) -> Self {
        Self {
            store,
            key,
            page_size,
            cursor: None,
            finished: false,
        }
    }

    pub fn key(&self) -> StockKey {
        self.key
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next page, or `None` once the stream is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<LedgerEntry>>, StoreError> {
        if self.finished {
            return Ok(None);
        }

        let page = self
            .store
            .ledger_page(self.key, Pagination::new(Some(self.page_size), self.cursor))
            .await?;

        match page.next {
            Some(next) => self.cursor = Some(next),
            None => self.finished = true,
        }

        if page.entries.is_empty() {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(page.entries))
    }

    /// Start again from the newest entry.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.finished = false;
    }

    /// Drain the remaining pages into one vector.
    pub async fn collect_remaining(&mut self) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryInventoryStore, StockTransaction};
    use stockledger_core::{VariantId, WarehouseId};
    use stockledger_inventory::{LedgerEntryType, NewLedgerEntry, Reference};

    async fn receive(store: &InMemoryInventoryStore, key: StockKey, n: i64) {
        let mut tx = store.begin().await.unwrap();
        tx.lock_stock(key).await.unwrap();
        tx.append(NewLedgerEntry {
            key,
            qty_change: n,
            entry_type: LedgerEntryType::PurchaseIn,
            reference: Reference::new("PO", n),
        })
        .await
        .unwrap();
        tx.apply_delta(key, n).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn scan_is_finite_and_restartable() {
        let store = InMemoryInventoryStore::new();
        let key = StockKey::new(WarehouseId::new(), VariantId::new());
        for n in 1..=5 {
            receive(&store, key, n).await;
        }

        let mut scan = LedgerScan::new(&store, key, 2);
        let mut sizes = Vec::new();
        while let Some(page) = scan.next_page().await.unwrap() {
            sizes.push(page.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(scan.is_finished());
        assert!(scan.next_page().await.unwrap().is_none());

        scan.restart();
        let all = scan.collect_remaining().await.unwrap();
        let quantities: Vec<i64> = all.iter().map(|e| e.qty_change).collect();
        assert_eq!(quantities, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn entries_appended_mid_scan_wait_for_restart() {
        let store = InMemoryInventoryStore::new();
        let key = StockKey::new(WarehouseId::new(), VariantId::new());
        for n in 1..=3 {
            receive(&store, key, n).await;
        }

        let mut scan = LedgerScan::new(&store, key, 2);
        let first = scan.next_page().await.unwrap().unwrap();
        assert_eq!(first[0].qty_change, 3);

        receive(&store, key, 10).await;
        let rest = scan.collect_remaining().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].qty_change, 1);

        scan.restart();
        let fresh = scan.next_page().await.unwrap().unwrap();
        assert_eq!(fresh[0].qty_change, 10);
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let store = InMemoryInventoryStore::new();
        let key = StockKey::new(WarehouseId::new(), VariantId::new());
        let mut scan = LedgerScan::new(&store, key, 10);
        assert!(scan.next_page().await.unwrap().is_none());
        assert!(scan.is_finished());
    }
}
