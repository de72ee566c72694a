//! Tier Catalog
//!
//! Maps a SKU to the tier it grants. The engine only ever reads it.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use super::models::ResolvedTier;
use crate::db::db_error;

/// SKU → tier lookup.
pub trait TierCatalog: Send + Sync {
    /// Resolve a SKU, or `None` if the catalog has no entry for it.
    fn resolve(&self, sku_id: Uuid) -> Option<ResolvedTier>;
}

/// Immutable in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: HashMap<Uuid, ResolvedTier>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sku(mut self, sku_id: Uuid, priority: i32, label: impl Into<String>) -> Self {
        self.entries
            .insert(sku_id, ResolvedTier::new(priority, label));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(Uuid, ResolvedTier)> for StaticCatalog {
    fn from_iter<I: IntoIterator<Item = (Uuid, ResolvedTier)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl TierCatalog for StaticCatalog {
    fn resolve(&self, sku_id: Uuid) -> Option<ResolvedTier> {
        self.entries.get(&sku_id).cloned()
    }
}

#[derive(Debug, FromRow)]
struct SkuRow {
    id: Uuid,
    label: String,
    priority: i32,
}

/// Catalog backed by the `skus` table, cached in memory.
///
/// Lookups never touch the database; call [`SkuCatalog::refresh`] to pick up
/// catalog changes.
#[derive(Debug, Default)]
pub struct SkuCatalog {
    entries: DashMap<Uuid, ResolvedTier>,
}

impl SkuCatalog {
    /// Load the full catalog from the `skus` table.
    pub async fn load(pool: &PgPool) -> sqlx::Result<Self> {
        let catalog = Self::default();
        catalog.refresh(pool).await?;
        Ok(catalog)
    }

    /// Replace cached entries with the current contents of the `skus` table.
    pub async fn refresh(&self, pool: &PgPool) -> sqlx::Result<usize> {
        let rows = sqlx::query_as::<_, SkuRow>("SELECT id, label, priority FROM skus")
            .fetch_all(pool)
            .await
            .map_err(db_error!("load_sku_catalog"))?;

        let live: HashSet<Uuid> = rows.iter().map(|row| row.id).collect();
        self.entries.retain(|id, _| live.contains(id));
        for row in rows {
            self.entries
                .insert(row.id, ResolvedTier::new(row.priority, row.label));
        }

        let count = self.entries.len();
        info!(skus = count, "SKU catalog loaded");
        Ok(count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TierCatalog for SkuCatalog {
    fn resolve(&self, sku_id: Uuid) -> Option<ResolvedTier> {
        self.entries.get(&sku_id).map(|entry| entry.value().clone())
    }
}

/// Insert or update a catalog entry in the `skus` table.
pub async fn upsert_sku(
    pool: &PgPool,
    sku_id: Uuid,
    label: &str,
    priority: i32,
) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO skus (id, label, priority)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET label = EXCLUDED.label, priority = EXCLUDED.priority
        ",
    )
    .bind(sku_id)
    .bind(label)
    .bind(priority)
    .execute(pool)
    .await
    .map_err(db_error!("upsert_sku", sku_id = %sku_id))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_catalog_resolves_known_skus() {
        let premium = Uuid::now_v7();
        let whitelabel = Uuid::now_v7();
        let catalog = StaticCatalog::new()
            .with_sku(premium, 10, "premium")
            .with_sku(whitelabel, 50, "whitelabel");

        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.resolve(whitelabel),
            Some(ResolvedTier::new(50, "whitelabel"))
        );
        assert_eq!(catalog.resolve(Uuid::now_v7()), None);
    }

    #[test]
    fn test_static_catalog_from_iterator() {
        let sku = Uuid::now_v7();
        let catalog: StaticCatalog = [(sku, ResolvedTier::new(5, "basic"))].into_iter().collect();
        assert_eq!(catalog.resolve(sku).map(|t| t.priority), Some(5));
    }

    #[sqlx::test]
    async fn test_sku_catalog_refresh_tracks_table(pool: PgPool) {
        let premium = Uuid::now_v7();
        let whitelabel = Uuid::now_v7();
        upsert_sku(&pool, premium, "premium", 10).await.unwrap();
        upsert_sku(&pool, whitelabel, "whitelabel", 50).await.unwrap();

        let catalog = SkuCatalog::load(&pool).await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.resolve(premium), Some(ResolvedTier::new(10, "premium")));

        upsert_sku(&pool, premium, "premium", 20).await.unwrap();
        sqlx::query("DELETE FROM skus WHERE id = $1")
            .bind(whitelabel)
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(catalog.refresh(&pool).await.unwrap(), 1);
        assert_eq!(catalog.resolve(premium).map(|t| t.priority), Some(20));
        assert_eq!(catalog.resolve(whitelabel), None);
    }
}
