//! Tier Resolver
//!
//! Computes the active tiers of a guild: its own grants plus the
//! account-level grants of its owner, filtered, resolved through the catalog
//! and ranked by priority.

use std::cmp::Ordering;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;
use tracing::warn;

use super::catalog::TierCatalog;
use super::error::EntitlementError;
use super::expiry::active_cutoff;
use super::models::{
    Entitlement, EntitlementRow, EntitlementSource, ResolvedTier, SubscriptionEntry,
};
use super::Entitlements;
use crate::db::{db_error, to_db_id};

impl Entitlements {
    /// Active tiers of a guild, highest priority first.
    #[tracing::instrument(skip(self))]
    pub async fn get_guild_tiers(
        &self,
        guild_id: u64,
        owner_id: u64,
        grace_period: TimeDelta,
        include_voting: bool,
    ) -> Result<Vec<ResolvedTier>, EntitlementError> {
        let now = self.clock.now();
        let candidates =
            fetch_guild_candidates(&self.pool, guild_id, owner_id, now, grace_period).await?;

        Ok(rank_active(
            candidates,
            self.catalog.as_ref(),
            now,
            grace_period,
            include_voting,
        )
        .into_iter()
        .map(|entry| entry.tier)
        .collect())
    }

    /// Highest active tier of a guild, if any.
    pub async fn get_guild_max_tier(
        &self,
        guild_id: u64,
        owner_id: u64,
        grace_period: TimeDelta,
        include_voting: bool,
    ) -> Result<Option<ResolvedTier>, EntitlementError> {
        let tiers = self
            .get_guild_tiers(guild_id, owner_id, grace_period, include_voting)
            .await?;

        // tiers are in priority desc order
        Ok(tiers.into_iter().next())
    }
}

/// Grants applying to a guild that are still active at `now`: the guild's
/// own grants and the owner's account-level grants.
pub(super) async fn fetch_guild_candidates(
    pool: &PgPool,
    guild_id: u64,
    owner_id: u64,
    now: DateTime<Utc>,
    grace_period: TimeDelta,
) -> Result<Vec<Entitlement>, EntitlementError> {
    let rows = sqlx::query_as::<_, EntitlementRow>(
        r"
        SELECT id, guild_id, user_id, sku_id, source, expires_at
        FROM entitlements
        WHERE (guild_id = $1 OR (guild_id IS NULL AND user_id = $2))
          AND (expires_at IS NULL OR expires_at > $3)
        ",
    )
    .bind(to_db_id(guild_id))
    .bind(to_db_id(owner_id))
    .bind(active_cutoff(now, grace_period))
    .fetch_all(pool)
    .await
    .map_err(db_error!(
        "fetch_guild_entitlements",
        guild_id = guild_id,
        owner_id = owner_id
    ))?;

    Ok(rows.into_iter().map(Entitlement::from).collect())
}

/// Filter candidates to active ones, resolve their tiers and rank them.
///
/// Voting rewards are dropped unless `include_voting` is set. SKUs missing
/// from the catalog are skipped with a warning. Ordering is priority
/// descending, then the longest lasting grant (perpetual first), then the
/// newest grant.
pub fn rank_active(
    candidates: Vec<Entitlement>,
    catalog: &dyn TierCatalog,
    now: DateTime<Utc>,
    grace_period: TimeDelta,
    include_voting: bool,
) -> Vec<SubscriptionEntry> {
    let mut entries: Vec<SubscriptionEntry> = candidates
        .into_iter()
        .filter(|e| e.is_active_at(now, grace_period))
        .filter(|e| include_voting || e.source != EntitlementSource::Voting)
        .filter_map(|e| match catalog.resolve(e.sku_id) {
            Some(tier) => Some(SubscriptionEntry::new(e, tier)),
            None => {
                warn!(
                    entitlement_id = %e.id,
                    sku_id = %e.sku_id,
                    "Entitlement references a SKU missing from the tier catalog, skipping"
                );
                None
            }
        })
        .collect();

    entries.sort_by(compare_rank);
    entries
}

fn compare_rank(a: &SubscriptionEntry, b: &SubscriptionEntry) -> Ordering {
    b.tier
        .priority
        .cmp(&a.tier.priority)
        .then_with(|| compare_expiry(b.expires_at, a.expires_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// Orders expiries by how long they last; perpetual is greatest.
fn compare_expiry(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::StaticCatalog;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn grant(
        sku_id: Uuid,
        source: EntitlementSource,
        expires_at: Option<DateTime<Utc>>,
    ) -> Entitlement {
        Entitlement {
            id: Uuid::now_v7(),
            guild_id: Some(1),
            user_id: None,
            sku_id,
            source,
            expires_at,
        }
    }

    #[test]
    fn test_ranks_by_priority_descending() {
        let (low, high, mid) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        let catalog = StaticCatalog::new()
            .with_sku(low, 10, "basic")
            .with_sku(high, 50, "whitelabel")
            .with_sku(mid, 30, "premium");

        let candidates = vec![
            grant(low, EntitlementSource::Purchase, None),
            grant(high, EntitlementSource::Purchase, None),
            grant(mid, EntitlementSource::Purchase, None),
        ];

        let ranked = rank_active(candidates, &catalog, now(), TimeDelta::zero(), true);
        let priorities: Vec<i32> = ranked.iter().map(|e| e.tier.priority).collect();
        assert_eq!(priorities, vec![50, 30, 10]);
        assert_eq!(ranked[0].tier.label, "whitelabel");
    }

    #[test]
    fn test_voting_filter() {
        let sku = Uuid::now_v7();
        let catalog = StaticCatalog::new().with_sku(sku, 10, "premium");
        let candidates = vec![grant(sku, EntitlementSource::Voting, None)];

        assert!(
            rank_active(candidates.clone(), &catalog, now(), TimeDelta::zero(), false).is_empty()
        );
        assert_eq!(
            rank_active(candidates, &catalog, now(), TimeDelta::zero(), true).len(),
            1
        );
    }

    #[test]
    fn test_inactive_candidates_are_dropped() {
        let sku = Uuid::now_v7();
        let catalog = StaticCatalog::new().with_sku(sku, 10, "premium");
        let grace = TimeDelta::hours(1);

        let candidates = vec![
            grant(sku, EntitlementSource::Purchase, Some(now() - grace)),
            grant(sku, EntitlementSource::Purchase, Some(now() - TimeDelta::minutes(30))),
        ];

        let ranked = rank_active(candidates, &catalog, now(), grace, true);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].expires_at, Some(now() - TimeDelta::minutes(30)));
    }

    #[test]
    fn test_catalog_miss_is_skipped() {
        let known = Uuid::now_v7();
        let catalog = StaticCatalog::new().with_sku(known, 10, "premium");
        let candidates = vec![
            grant(Uuid::now_v7(), EntitlementSource::Purchase, None),
            grant(known, EntitlementSource::Purchase, None),
        ];

        let ranked = rank_active(candidates, &catalog, now(), TimeDelta::zero(), true);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].sku_id, known);
    }

    #[test]
    fn test_equal_priority_prefers_longest_lasting_then_newest() {
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let catalog = StaticCatalog::new()
            .with_sku(a, 10, "premium")
            .with_sku(b, 10, "premium-yearly");

        let soon = grant(a, EntitlementSource::Purchase, Some(now() + TimeDelta::days(1)));
        let later = grant(a, EntitlementSource::Gift, Some(now() + TimeDelta::days(30)));
        let perpetual_old = grant(b, EntitlementSource::Admin, None);
        let perpetual_new = grant(b, EntitlementSource::Legacy, None);

        let ranked = rank_active(
            vec![soon.clone(), perpetual_old.clone(), later.clone(), perpetual_new.clone()],
            &catalog,
            now(),
            TimeDelta::zero(),
            true,
        );

        let ids: Vec<Uuid> = ranked.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![perpetual_new.id, perpetual_old.id, later.id, soon.id]);
    }

    #[test]
    fn test_empty_candidates_rank_to_empty() {
        let catalog = StaticCatalog::new();
        assert!(rank_active(Vec::new(), &catalog, now(), TimeDelta::days(3), true).is_empty());
    }
}
