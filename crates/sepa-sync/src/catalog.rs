//! Persistent catalog contract shared by the loader and the lookup service.

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sepa_core::{PriceFact, Product, ProductListing, Store, StoreOffer};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const INGEST_LOCK: &str = "sepa-ingest";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("lock {lock_name} is no longer held by {holder}")]
    LockLost { lock_name: String, holder: Uuid },
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl CatalogError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_) => true,
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    Some("40001") | Some("40P01") | Some("57P01") | Some("53300")
                ),
                _ => false,
            },
            CatalogError::LockLost { .. } | CatalogError::Integrity(_) => false,
            CatalogError::Unavailable(_) => true,
        }
    }
}

/// Holder + expiry of the run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockLease {
    pub lock_name: String,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

impl AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

/// Write side used by the loader. Each upsert call is one transaction.
///
/// Absent text (`None`) never replaces a stored value.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// `Ok(None)` when another holder has an unexpired lease.
    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Option<LockLease>, CatalogError>;

    async fn renew_lock(&self, lease: &LockLease, ttl: Duration)
        -> Result<LockLease, CatalogError>;

    async fn release_lock(&self, lease: &LockLease) -> Result<(), CatalogError>;

    async fn upsert_stores(&self, stores: &[Store]) -> Result<UpsertCounts, CatalogError>;

    async fn upsert_products(&self, products: &[Product]) -> Result<UpsertCounts, CatalogError>;

    async fn upsert_prices(&self, prices: &[PriceFact]) -> Result<UpsertCounts, CatalogError>;
}

#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// Product attributes plus every store price on file; `None` without prices.
    async fn lookup_barcode(&self, barcode: &str) -> Result<Option<ProductListing>, CatalogError>;
}

fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[derive(Debug, Default)]
struct MemoryState {
    stores: BTreeMap<String, Store>,
    products: BTreeMap<String, Product>,
    prices: BTreeMap<(String, String), PriceFact>,
    locks: BTreeMap<String, LockLease>,
}

/// In-process catalog for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stores(&self) -> Vec<Store> {
        self.state.lock().await.stores.values().cloned().collect()
    }

    pub async fn products(&self) -> Vec<Product> {
        self.state.lock().await.products.values().cloned().collect()
    }

    pub async fn prices(&self) -> Vec<PriceFact> {
        self.state.lock().await.prices.values().cloned().collect()
    }

    pub async fn lease(&self, lock_name: &str) -> Option<LockLease> {
        self.state.lock().await.locks.get(lock_name).cloned()
    }
}

fn merge_text(slot: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        slot.clone_from(value);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Option<LockLease>, CatalogError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(current) = state.locks.get(lock_name) {
            if current.holder != holder && current.expires_at > now {
                return Ok(None);
            }
        }
        let lease = LockLease {
            lock_name: lock_name.to_string(),
            holder,
            acquired_at: now,
            expires_at: now + ttl_delta(ttl),
        };
        state.locks.insert(lock_name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew_lock(
        &self,
        lease: &LockLease,
        ttl: Duration,
    ) -> Result<LockLease, CatalogError> {
        let mut state = self.state.lock().await;
        match state.locks.get_mut(&lease.lock_name) {
            Some(current) if current.holder == lease.holder => {
                current.expires_at = Utc::now() + ttl_delta(ttl);
                Ok(current.clone())
            }
            _ => Err(CatalogError::LockLost {
                lock_name: lease.lock_name.clone(),
                holder: lease.holder,
            }),
        }
    }

    async fn release_lock(&self, lease: &LockLease) -> Result<(), CatalogError> {
        let mut state = self.state.lock().await;
        if state
            .locks
            .get(&lease.lock_name)
            .is_some_and(|current| current.holder == lease.holder)
        {
            state.locks.remove(&lease.lock_name);
        }
        Ok(())
    }

    async fn upsert_stores(&self, stores: &[Store]) -> Result<UpsertCounts, CatalogError> {
        let mut state = self.state.lock().await;
        let mut counts = UpsertCounts::default();
        for store in stores {
            match state.stores.get_mut(&store.store_id) {
                Some(existing) => {
                    existing.chain_id.clone_from(&store.chain_id);
                    merge_text(&mut existing.name, &store.name);
                    counts.updated += 1;
                }
                None => {
                    state.stores.insert(store.store_id.clone(), store.clone());
                    counts.inserted += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn upsert_products(&self, products: &[Product]) -> Result<UpsertCounts, CatalogError> {
        let mut state = self.state.lock().await;
        let mut counts = UpsertCounts::default();
        for product in products {
            match state.products.get_mut(&product.barcode) {
                Some(existing) => {
                    merge_text(&mut existing.name, &product.name);
                    merge_text(&mut existing.brand, &product.brand);
                    counts.updated += 1;
                }
                None => {
                    state
                        .products
                        .insert(product.barcode.clone(), product.clone());
                    counts.inserted += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn upsert_prices(&self, prices: &[PriceFact]) -> Result<UpsertCounts, CatalogError> {
        let mut state = self.state.lock().await;
        for fact in prices {
            if !state.stores.contains_key(&fact.store_id)
                || !state.products.contains_key(&fact.barcode)
            {
                return Err(CatalogError::Integrity(format!(
                    "price ({}, {}) violates a foreign key",
                    fact.store_id, fact.barcode
                )));
            }
        }
        let mut counts = UpsertCounts::default();
        for fact in prices {
            let key = (fact.store_id.clone(), fact.barcode.clone());
            match state.prices.insert(key, fact.clone()) {
                Some(_) => counts.updated += 1,
                None => counts.inserted += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl CatalogReader for MemoryCatalog {
    async fn lookup_barcode(&self, barcode: &str) -> Result<Option<ProductListing>, CatalogError> {
        let state = self.state.lock().await;
        let Some(product) = state.products.get(barcode) else {
            return Ok(None);
        };
        let mut stores: Vec<StoreOffer> = state
            .prices
            .values()
            .filter(|fact| fact.barcode == barcode)
            .filter_map(|fact| {
                let store = state.stores.get(&fact.store_id)?;
                Some(StoreOffer {
                    store_id: store.store_id.clone(),
                    chain_id: store.chain_id.clone(),
                    store_name: store.name.clone(),
                    price: fact.price,
                    observed_at: fact.observed_at,
                })
            })
            .collect();
        if stores.is_empty() {
            return Ok(None);
        }
        sort_offers(&mut stores);
        Ok(Some(ProductListing {
            barcode: product.barcode.clone(),
            name: product.name.clone(),
            brand: product.brand.clone(),
            stores,
        }))
    }
}

/// Cheapest first; store id breaks ties.
pub fn sort_offers(offers: &mut [StoreOffer]) {
    offers.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.store_id.cmp(&b.store_id)));
}
