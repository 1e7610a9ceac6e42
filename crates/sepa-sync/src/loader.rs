use std::sync::Arc;

use futures::future::BoxFuture;
use sepa_storage::BackoffPolicy;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{Catalog, CatalogError, UpsertCounts};
use crate::reconcile::CanonicalBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Stores,
    Products,
    Prices,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Stores => "stores",
            Table::Products => "products",
            Table::Prices => "prices",
        }
    }
}

/// The batch that exhausted its retries and stopped the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBatch {
    pub table: Table,
    pub batch_index: usize,
    pub rows: usize,
    pub attempts: usize,
    pub error: String,
    /// Rows never committed: the failed batch plus everything after it.
    pub rows_unattempted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub stores: UpsertCounts,
    pub products: UpsertCounts,
    pub prices: UpsertCounts,
    /// Rows dropped upstream by validation.
    pub rejected: usize,
    pub batches_committed: usize,
    pub retries: usize,
    pub failed: Option<FailedBatch>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }

    pub fn upserted(&self) -> usize {
        self.stores.total() + self.products.total() + self.prices.total()
    }
}

/// Applies a canonical batch in bounded transactions: stores, then products,
/// then prices. Committed batches stay committed when a later one fails.
pub struct Loader {
    catalog: Arc<dyn Catalog>,
    batch_size: usize,
    backoff: BackoffPolicy,
}

impl Loader {
    pub fn new(catalog: Arc<dyn Catalog>, batch_size: usize, backoff: BackoffPolicy) -> Self {
        Self {
            catalog,
            batch_size: batch_size.max(1),
            backoff,
        }
    }

    pub async fn load(&self, batch: &CanonicalBatch) -> LoadReport {
        let mut progress = Progress {
            total: batch.stores.len() + batch.products.len() + batch.prices.len(),
            ..Default::default()
        };
        let mut report = LoadReport {
            stores: self
                .apply(
                    Table::Stores,
                    batch.stores.values(),
                    |c, rows| c.upsert_stores(rows),
                    &mut progress,
                )
                .await,
            ..Default::default()
        };
        if progress.failed.is_none() {
            report.products = self
                .apply(
                    Table::Products,
                    batch.products.values(),
                    |c, rows| c.upsert_products(rows),
                    &mut progress,
                )
                .await;
        }
        if progress.failed.is_none() {
            report.prices = self
                .apply(
                    Table::Prices,
                    batch.prices.values(),
                    |c, rows| c.upsert_prices(rows),
                    &mut progress,
                )
                .await;
        }

        report.batches_committed = progress.batches_committed;
        report.retries = progress.retries;
        report.failed = progress.failed;
        if report.is_complete() {
            info!(
                batches = report.batches_committed,
                retries = report.retries,
                upserted = report.upserted(),
                "canonical batch loaded"
            );
        }
        report
    }

    /// Upsert `rows` batch by batch; stops at the first batch that exhausts its retries.
    /// Only the batch in flight is copied out of the canonical maps.
    async fn apply<'r, T: Clone + 'r>(
        &self,
        table: Table,
        mut rows: impl Iterator<Item = &'r T>,
        upsert: Upsert<T>,
        progress: &mut Progress,
    ) -> UpsertCounts {
        let mut counts = UpsertCounts::default();
        let mut chunk: Vec<T> = Vec::with_capacity(self.batch_size);
        for batch_index in 0.. {
            chunk.clear();
            chunk.extend(rows.by_ref().take(self.batch_size).cloned());
            if chunk.is_empty() {
                break;
            }
            let mut attempt = 0usize;
            loop {
                match upsert(self.catalog.as_ref(), &chunk).await {
                    Ok(committed) => {
                        counts += committed;
                        progress.retries += attempt;
                        progress.batches_committed += 1;
                        progress.done += chunk.len();
                        break;
                    }
                    Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            table = table.as_str(),
                            batch_index,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying batch"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        progress.retries += attempt;
                        let failed = FailedBatch {
                            table,
                            batch_index,
                            rows: chunk.len(),
                            attempts: attempt + 1,
                            error: err.to_string(),
                            rows_unattempted: progress.total - progress.done,
                        };
                        warn!(
                            table = table.as_str(),
                            batch_index,
                            attempts = failed.attempts,
                            rows_unattempted = failed.rows_unattempted,
                            error = %err,
                            "load stopped on a failed batch"
                        );
                        progress.failed = Some(failed);
                        return counts;
                    }
                }
            }
        }
        counts
    }
}

type Upsert<T> =
    for<'c> fn(&'c dyn Catalog, &'c [T]) -> BoxFuture<'c, Result<UpsertCounts, CatalogError>>;

#[derive(Debug, Default)]
struct Progress {
    total: usize,
    done: usize,
    batches_committed: usize,
    retries: usize,
    failed: Option<FailedBatch>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{LockLease, MemoryCatalog};
    use crate::reconcile::Reconciler;
    use async_trait::async_trait;
    use chrono::Utc;
    use sepa_core::{NormalizedRow, Price, PriceFact, Product, RawRecord, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn quick_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn batch(stores: usize, products_per_store: usize) -> CanonicalBatch {
        let mut reconciler = Reconciler::new(Utc::now());
        for s in 0..stores {
            for p in 0..products_per_store {
                reconciler.push(NormalizedRow::Price(RawRecord {
                    store_id: format!("{s}"),
                    chain_id: format!("{s}"),
                    store_name: None,
                    barcode: format!("{:08}", 10_000_000 + p),
                    product_name: None,
                    brand: None,
                    price_text: "1".into(),
                    price: Price::from_cents(100).unwrap(),
                }));
            }
        }
        reconciler.finish()
    }

    /// Fails price upserts `failures` times before delegating.
    struct FlakyPrices {
        inner: MemoryCatalog,
        failures: AtomicUsize,
        transient: bool,
    }

    #[async_trait]
    impl Catalog for FlakyPrices {
        async fn try_acquire_lock(
            &self,
            lock_name: &str,
            holder: Uuid,
            ttl: Duration,
        ) -> Result<Option<LockLease>, CatalogError> {
            self.inner.try_acquire_lock(lock_name, holder, ttl).await
        }

        async fn renew_lock(
            &self,
            lease: &LockLease,
            ttl: Duration,
        ) -> Result<LockLease, CatalogError> {
            self.inner.renew_lock(lease, ttl).await
        }

        async fn release_lock(&self, lease: &LockLease) -> Result<(), CatalogError> {
            self.inner.release_lock(lease).await
        }

        async fn upsert_stores(&self, stores: &[Store]) -> Result<UpsertCounts, CatalogError> {
            self.inner.upsert_stores(stores).await
        }

        async fn upsert_products(
            &self,
            products: &[Product],
        ) -> Result<UpsertCounts, CatalogError> {
            self.inner.upsert_products(products).await
        }

        async fn upsert_prices(&self, prices: &[PriceFact]) -> Result<UpsertCounts, CatalogError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(if self.transient {
                    CatalogError::Unavailable("connection reset".into())
                } else {
                    CatalogError::Integrity("check constraint".into())
                });
            }
            self.inner.upsert_prices(prices).await
        }
    }

    #[tokio::test]
    async fn loads_in_batches_and_counts_inserts() {
        let catalog = Arc::new(MemoryCatalog::new());
        let loader = Loader::new(catalog.clone(), 2, quick_backoff(0));

        let report = loader.load(&batch(2, 3)).await;

        assert!(report.is_complete());
        assert_eq!(report.stores, UpsertCounts { inserted: 2, updated: 0 });
        assert_eq!(report.products, UpsertCounts { inserted: 3, updated: 0 });
        assert_eq!(report.prices, UpsertCounts { inserted: 6, updated: 0 });
        assert_eq!(report.batches_committed, 1 + 2 + 3);
        assert_eq!(catalog.prices().await.len(), 6);

        let again = loader.load(&batch(2, 3)).await;
        assert_eq!(again.prices, UpsertCounts { inserted: 0, updated: 6 });
    }

    #[tokio::test]
    async fn ragged_tail_is_its_own_batch_and_empty_tables_issue_none() {
        let catalog = Arc::new(MemoryCatalog::new());
        let loader = Loader::new(catalog.clone(), 2, quick_backoff(0));

        let report = loader.load(&batch(1, 5)).await;
        assert!(report.is_complete());
        assert_eq!(report.batches_committed, 1 + 3 + 3);
        assert_eq!(catalog.prices().await.len(), 5);

        let empty = loader.load(&Reconciler::new(Utc::now()).finish()).await;
        assert!(empty.is_complete());
        assert_eq!(empty.batches_committed, 0);
        assert_eq!(empty.upserted(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let catalog = Arc::new(FlakyPrices {
            inner: MemoryCatalog::new(),
            failures: AtomicUsize::new(2),
            transient: true,
        });
        let loader = Loader::new(catalog.clone(), 10, quick_backoff(3));

        let report = loader.load(&batch(1, 2)).await;

        assert!(report.is_complete());
        assert_eq!(report.retries, 2);
        assert_eq!(catalog.inner.prices().await.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_batch_stops_the_load_and_keeps_committed_work() {
        let catalog = Arc::new(FlakyPrices {
            inner: MemoryCatalog::new(),
            failures: AtomicUsize::new(usize::MAX),
            transient: true,
        });
        let loader = Loader::new(catalog.clone(), 2, quick_backoff(1));

        let report = loader.load(&batch(1, 4)).await;

        let failed = report.failed.clone().expect("failed batch");
        assert_eq!(failed.table, Table::Prices);
        assert_eq!(failed.batch_index, 0);
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.rows_unattempted, 4);
        assert_eq!(report.stores.inserted, 1);
        assert_eq!(report.products.inserted, 4);
        assert_eq!(catalog.inner.products().await.len(), 4);
        assert!(catalog.inner.prices().await.is_empty());
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let catalog = Arc::new(FlakyPrices {
            inner: MemoryCatalog::new(),
            failures: AtomicUsize::new(1),
            transient: false,
        });
        let loader = Loader::new(catalog, 10, quick_backoff(5));

        let report = loader.load(&batch(1, 1)).await;

        assert_eq!(report.failed.map(|f| f.attempts), Some(1));
        assert_eq!(report.retries, 0);
    }
}
