use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sepa_core::{Price, PriceFact, Product, ProductListing, Store, StoreOffer};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogError, CatalogReader, LockLease, UpsertCounts};

pub static MIGRATOR: Migrator = sqlx::migrate!();

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

// never put the DSN in a span, it may carry credentials
#[instrument(skip(database_url))]
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
        .context("connecting to postgres")?;
    info!("connected to db");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("applying migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "schema up to date");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn lease_from_row(row: &PgRow) -> Result<LockLease, sqlx::Error> {
    Ok(LockLease {
        lock_name: row.try_get("lock_name")?,
        holder: row.try_get("holder")?,
        acquired_at: row.try_get("acquired_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn tally(rows: &[PgRow], counts: &mut UpsertCounts) -> Result<(), sqlx::Error> {
    for row in rows {
        if row.try_get::<bool, _>("inserted")? {
            counts.inserted += 1;
        } else {
            counts.updated += 1;
        }
    }
    Ok(())
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Option<LockLease>, CatalogError> {
        let row = sqlx::query(
            "INSERT INTO ingest_lock (lock_name, holder, acquired_at, expires_at)
             VALUES ($1, $2, now(), now() + make_interval(secs => $3))
             ON CONFLICT (lock_name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
              WHERE ingest_lock.expires_at <= now() OR ingest_lock.holder = EXCLUDED.holder
             RETURNING lock_name, holder, acquired_at, expires_at",
        )
        .bind(lock_name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(lease_from_row).transpose()?)
    }

    async fn renew_lock(
        &self,
        lease: &LockLease,
        ttl: Duration,
    ) -> Result<LockLease, CatalogError> {
        let row = sqlx::query(
            "UPDATE ingest_lock
                SET expires_at = now() + make_interval(secs => $3)
              WHERE lock_name = $1 AND holder = $2
             RETURNING lock_name, holder, acquired_at, expires_at",
        )
        .bind(&lease.lock_name)
        .bind(lease.holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(lease_from_row(&row)?),
            None => Err(CatalogError::LockLost {
                lock_name: lease.lock_name.clone(),
                holder: lease.holder,
            }),
        }
    }

    async fn release_lock(&self, lease: &LockLease) -> Result<(), CatalogError> {
        sqlx::query("DELETE FROM ingest_lock WHERE lock_name = $1 AND holder = $2")
            .bind(&lease.lock_name)
            .bind(lease.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_stores(&self, stores: &[Store]) -> Result<UpsertCounts, CatalogError> {
        let mut counts = UpsertCounts::default();
        if stores.is_empty() {
            return Ok(counts);
        }
        let mut tx = self.pool.begin().await?;
        for chunk in stores.chunks(MAX_BIND_PARAMS / 3) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("INSERT INTO stores (store_id, chain_id, name) ");
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(&s.store_id)
                    .push_bind(&s.chain_id)
                    .push_bind(&s.name);
            });
            qb.push(
                " ON CONFLICT (store_id) DO UPDATE
                    SET chain_id = EXCLUDED.chain_id,
                        name = COALESCE(EXCLUDED.name, stores.name)
                  RETURNING (xmax = 0) AS inserted",
            );
            let rows = qb.build().fetch_all(&mut *tx).await?;
            tally(&rows, &mut counts)?;
        }
        tx.commit().await?;
        Ok(counts)
    }

    async fn upsert_products(&self, products: &[Product]) -> Result<UpsertCounts, CatalogError> {
        let mut counts = UpsertCounts::default();
        if products.is_empty() {
            return Ok(counts);
        }
        let mut tx = self.pool.begin().await?;
        for chunk in products.chunks(MAX_BIND_PARAMS / 3) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("INSERT INTO products (barcode, name, brand) ");
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(&p.barcode)
                    .push_bind(&p.name)
                    .push_bind(&p.brand);
            });
            qb.push(
                " ON CONFLICT (barcode) DO UPDATE
                    SET name = COALESCE(EXCLUDED.name, products.name),
                        brand = COALESCE(EXCLUDED.brand, products.brand)
                  RETURNING (xmax = 0) AS inserted",
            );
            let rows = qb.build().fetch_all(&mut *tx).await?;
            tally(&rows, &mut counts)?;
        }
        tx.commit().await?;
        Ok(counts)
    }

    async fn upsert_prices(&self, prices: &[PriceFact]) -> Result<UpsertCounts, CatalogError> {
        let mut counts = UpsertCounts::default();
        if prices.is_empty() {
            return Ok(counts);
        }
        let mut tx = self.pool.begin().await?;
        for chunk in prices.chunks(MAX_BIND_PARAMS / 4) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO prices (store_id, barcode, price_cents, observed_at) ",
            );
            qb.push_values(chunk, |mut b, p| {
                b.push_bind(&p.store_id)
                    .push_bind(&p.barcode)
                    .push_bind(p.price.cents())
                    .push_bind(p.observed_at);
            });
            qb.push(
                " ON CONFLICT (store_id, barcode) DO UPDATE
                    SET price_cents = EXCLUDED.price_cents,
                        observed_at = EXCLUDED.observed_at
                  RETURNING (xmax = 0) AS inserted",
            );
            let rows = qb.build().fetch_all(&mut *tx).await?;
            tally(&rows, &mut counts)?;
        }
        tx.commit().await?;
        Ok(counts)
    }
}

#[async_trait]
impl CatalogReader for PgCatalog {
    async fn lookup_barcode(&self, barcode: &str) -> Result<Option<ProductListing>, CatalogError> {
        let rows = sqlx::query(
            "SELECT p.barcode, p.name AS product_name, p.brand,
                    s.store_id, s.chain_id, s.name AS store_name,
                    pr.price_cents, pr.observed_at
               FROM prices pr
               JOIN products p ON p.barcode = pr.barcode
               JOIN stores s ON s.store_id = pr.store_id
              WHERE pr.barcode = $1
              ORDER BY pr.price_cents ASC, s.store_id ASC",
        )
        .bind(barcode)
        .fetch_all(&self.pool)
        .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let mut listing = ProductListing {
            barcode: first.try_get("barcode")?,
            name: first.try_get("product_name")?,
            brand: first.try_get("brand")?,
            stores: Vec::with_capacity(rows.len()),
        };
        for row in &rows {
            let cents: i64 = row.try_get("price_cents")?;
            let price = Price::from_cents(cents).ok_or_else(|| {
                CatalogError::Integrity(format!("negative price_cents {cents} for {barcode}"))
            })?;
            listing.stores.push(StoreOffer {
                store_id: row.try_get("store_id")?,
                chain_id: row.try_get("chain_id")?,
                store_name: row.try_get("store_name")?,
                price,
                observed_at: row.try_get("observed_at")?,
            });
        }
        Ok(Some(listing))
    }
}
