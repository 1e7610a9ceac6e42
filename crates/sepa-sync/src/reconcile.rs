use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sepa_core::{NormalizedRow, PriceFact, Product, RawRecord, Store, StoreRecord};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("price for ({store_id}, {barcode}) references a missing {missing}")]
    DanglingPrice {
        store_id: String,
        barcode: String,
        missing: &'static str,
    },
}

/// Deduplicated upserts for one run, keyed and ordered by natural key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalBatch {
    pub stores: BTreeMap<String, Store>,
    pub products: BTreeMap<String, Product>,
    pub prices: BTreeMap<(String, String), PriceFact>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub stores: usize,
    pub products: usize,
    pub prices: usize,
}

impl CanonicalBatch {
    pub fn counts(&self) -> BatchCounts {
        BatchCounts {
            stores: self.stores.len(),
            products: self.products.len(),
            prices: self.prices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty() && self.products.is_empty() && self.prices.is_empty()
    }

    /// Every price must have its store and product in the same batch.
    pub fn check_consistency(&self) -> Result<(), ReconcileError> {
        for (store_id, barcode) in self.prices.keys() {
            let missing = if !self.stores.contains_key(store_id) {
                Some("store")
            } else if !self.products.contains_key(barcode) {
                Some("product")
            } else {
                None
            };
            if let Some(missing) = missing {
                return Err(ReconcileError::DanglingPrice {
                    store_id: store_id.clone(),
                    barcode: barcode.clone(),
                    missing,
                });
            }
        }
        Ok(())
    }
}

/// Folds normalized rows, in source order, into a [`CanonicalBatch`].
///
/// The last row seen for a key wins. Text that a row leaves out never erases
/// a value an earlier row supplied.
#[derive(Debug)]
pub struct Reconciler {
    observed_at: DateTime<Utc>,
    batch: CanonicalBatch,
    rows_merged: usize,
}

impl Reconciler {
    pub fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            observed_at,
            batch: CanonicalBatch::default(),
            rows_merged: 0,
        }
    }

    pub fn rows_merged(&self) -> usize {
        self.rows_merged
    }

    /// Distinct keys held so far.
    pub fn counts(&self) -> BatchCounts {
        self.batch.counts()
    }

    /// Merge a reconciler that folded later rows of the same run. The result
    /// is the same as pushing those rows here one by one.
    pub fn absorb(&mut self, later: Reconciler) {
        self.rows_merged += later.rows_merged;
        let CanonicalBatch {
            stores,
            products,
            prices,
        } = later.batch;

        for store in stores.into_values() {
            self.merge_store(store.store_id, store.chain_id, store.name);
        }
        for product in products.into_values() {
            match self.batch.products.entry(product.barcode.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(product);
                }
                Entry::Occupied(mut slot) => {
                    let current = slot.get_mut();
                    overwrite_if_present(&mut current.name, product.name);
                    overwrite_if_present(&mut current.brand, product.brand);
                }
            }
        }
        for (key, mut fact) in prices {
            fact.observed_at = self.observed_at;
            self.batch.prices.insert(key, fact);
        }
    }

    pub fn push(&mut self, row: NormalizedRow) {
        match row {
            NormalizedRow::Price(record) => self.push_price(record),
            NormalizedRow::Store(record) => self.push_store(record),
        }
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = NormalizedRow>) {
        for row in rows {
            self.push(row);
        }
    }

    pub fn push_store(&mut self, record: StoreRecord) {
        self.rows_merged += 1;
        self.merge_store(record.store_id, record.chain_id, record.name);
    }

    pub fn push_price(&mut self, record: RawRecord) {
        self.rows_merged += 1;
        let RawRecord {
            store_id,
            chain_id,
            store_name,
            barcode,
            product_name,
            brand,
            price,
            ..
        } = record;

        self.merge_store(store_id.clone(), chain_id, store_name);

        let product = self
            .batch
            .products
            .entry(barcode.clone())
            .or_insert_with(|| Product {
                barcode: barcode.clone(),
                name: None,
                brand: None,
            });
        overwrite_if_present(&mut product.name, product_name);
        overwrite_if_present(&mut product.brand, brand);

        self.batch.prices.insert(
            (store_id.clone(), barcode.clone()),
            PriceFact {
                store_id,
                barcode,
                price,
                observed_at: self.observed_at,
            },
        );
    }

    fn merge_store(&mut self, store_id: String, chain_id: String, name: Option<String>) {
        let store = self
            .batch
            .stores
            .entry(store_id.clone())
            .or_insert_with(|| Store {
                store_id,
                chain_id: chain_id.clone(),
                name: None,
            });
        store.chain_id = chain_id;
        overwrite_if_present(&mut store.name, name);
    }

    pub fn finish(self) -> CanonicalBatch {
        self.batch
    }
}

fn overwrite_if_present(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sepa_core::Price;

    fn observed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 14, 12, 0, 0).unwrap()
    }

    fn price_row(store: &str, barcode: &str, text: &str, name: Option<&str>) -> NormalizedRow {
        NormalizedRow::Price(RawRecord {
            store_id: store.to_string(),
            chain_id: store.to_string(),
            store_name: None,
            barcode: barcode.to_string(),
            product_name: name.map(str::to_string),
            brand: None,
            price_text: text.to_string(),
            price: Price::parse(text).unwrap(),
        })
    }

    #[test]
    fn same_barcode_in_two_retailers_gives_one_product_two_prices() {
        let mut reconciler = Reconciler::new(observed());
        reconciler.push(price_row("9", "7795735000328", "$1200", Some("Yerba")));
        reconciler.push(price_row("12", "7795735000328", "$1250", None));
        let batch = reconciler.finish();

        assert_eq!(batch.counts(), BatchCounts { stores: 2, products: 1, prices: 2 });
        let key = |s: &str| (s.to_string(), "7795735000328".to_string());
        assert_eq!(batch.prices[&key("9")].price.cents(), 120_000);
        assert_eq!(batch.prices[&key("12")].price.cents(), 125_000);
        assert_eq!(batch.products["7795735000328"].name.as_deref(), Some("Yerba"));
        assert!(batch.check_consistency().is_ok());
    }

    #[test]
    fn last_observed_record_wins_ties() {
        let run = || {
            let mut reconciler = Reconciler::new(observed());
            reconciler.extend([
                price_row("9", "7795735000328", "100", Some("first")),
                price_row("9", "7795735000328", "200", Some("second")),
            ]);
            reconciler.finish()
        };
        let batch = run();
        let fact = &batch.prices[&("9".to_string(), "7795735000328".to_string())];
        assert_eq!(fact.price.cents(), 20_000);
        assert_eq!(batch.products["7795735000328"].name.as_deref(), Some("second"));
        assert_eq!(batch, run());
    }

    #[test]
    fn directory_rows_name_stores_without_erasure() {
        let mut reconciler = Reconciler::new(observed());
        reconciler.push(NormalizedRow::Store(StoreRecord {
            store_id: "10-3".into(),
            chain_id: "10".into(),
            name: Some("Carrefour Express".into()),
        }));
        reconciler.push(NormalizedRow::Price(RawRecord {
            store_id: "10-3".into(),
            chain_id: "10".into(),
            store_name: None,
            barcode: "7790895000997".into(),
            product_name: None,
            brand: Some("COLA".into()),
            price_text: "1".into(),
            price: Price::from_cents(100).unwrap(),
        }));
        assert_eq!(reconciler.rows_merged(), 2);
        let batch = reconciler.finish();
        assert_eq!(batch.stores["10-3"].name.as_deref(), Some("Carrefour Express"));
        assert_eq!(batch.products["7790895000997"].brand.as_deref(), Some("COLA"));
    }

    #[test]
    fn absorbing_per_file_partials_matches_sequential_pushes() {
        let file_a = [
            price_row("9", "7795735000328", "100", Some("Yerba")),
            price_row("12", "7795735000328", "150", None),
        ];
        let file_b = [
            price_row("9", "7795735000328", "120", None),
            price_row("9", "12345678", "5", Some("Fideos")),
        ];

        let mut sequential = Reconciler::new(observed());
        sequential.extend(file_a.clone());
        sequential.extend(file_b.clone());

        let mut merged = Reconciler::new(observed());
        for rows in [file_a, file_b] {
            let mut partial = Reconciler::new(observed());
            partial.extend(rows);
            merged.absorb(partial);
        }

        assert_eq!(merged.rows_merged(), sequential.rows_merged());
        let merged = merged.finish();
        assert_eq!(merged, sequential.finish());
        assert_eq!(merged.products["7795735000328"].name.as_deref(), Some("Yerba"));
    }

    #[test]
    fn repeated_keys_are_held_once() {
        let mut reconciler = Reconciler::new(observed());
        for i in 0..5000 {
            reconciler.push(price_row("9", "7795735000328", &format!("{}", 100 + i % 7), None));
        }
        assert_eq!(reconciler.rows_merged(), 5000);
        assert_eq!(
            reconciler.counts(),
            BatchCounts { stores: 1, products: 1, prices: 1 }
        );
    }

    #[test]
    fn dangling_prices_are_reported() {
        let mut batch = CanonicalBatch::default();
        batch.prices.insert(
            ("1".into(), "12345678".into()),
            PriceFact {
                store_id: "1".into(),
                barcode: "12345678".into(),
                price: Price::from_cents(1).unwrap(),
                observed_at: observed(),
            },
        );
        assert_eq!(
            batch.check_consistency(),
            Err(ReconcileError::DanglingPrice {
                store_id: "1".into(),
                barcode: "12345678".into(),
                missing: "store",
            })
        );
    }
}
