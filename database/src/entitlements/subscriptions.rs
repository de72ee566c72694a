//! Subscription Lister
//!
//! Display and audit views of active entitlements with their resolved tiers.
//! Voting rewards are always listed.

use chrono::TimeDelta;

use super::error::EntitlementError;
use super::expiry::active_cutoff;
use super::models::{Entitlement, EntitlementRow, SubscriptionEntry};
use super::resolver::{fetch_guild_candidates, rank_active};
use super::Entitlements;
use crate::db::{db_error, to_db_id};

impl Entitlements {
    /// Every active grant contributing to a guild's tier, ranked.
    #[tracing::instrument(skip(self))]
    pub async fn list_guild_subscriptions(
        &self,
        guild_id: u64,
        owner_id: u64,
        grace_period: TimeDelta,
    ) -> Result<Vec<SubscriptionEntry>, EntitlementError> {
        let now = self.clock.now();
        let candidates =
            fetch_guild_candidates(&self.pool, guild_id, owner_id, now, grace_period).await?;

        Ok(rank_active(
            candidates,
            self.catalog.as_ref(),
            now,
            grace_period,
            true,
        ))
    }

    /// Active account-level grants of one user, ranked.
    #[tracing::instrument(skip(self))]
    pub async fn list_user_subscriptions(
        &self,
        user_id: u64,
        grace_period: TimeDelta,
    ) -> Result<Vec<SubscriptionEntry>, EntitlementError> {
        let now = self.clock.now();
        let rows = sqlx::query_as::<_, EntitlementRow>(
            r"
            SELECT id, guild_id, user_id, sku_id, source, expires_at
            FROM entitlements
            WHERE user_id = $1
              AND guild_id IS NULL
              AND (expires_at IS NULL OR expires_at > $2)
            ",
        )
        .bind(to_db_id(user_id))
        .bind(active_cutoff(now, grace_period))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error!("list_user_subscriptions", user_id = user_id))?;

        Ok(rank_active(
            rows.into_iter().map(Entitlement::from).collect(),
            self.catalog.as_ref(),
            now,
            grace_period,
            true,
        ))
    }

    /// Active account-level grants of every user, ranked.
    ///
    /// Unpaginated: the whole result set is held in memory, which bounds how
    /// far this scales with the number of subscribers.
    #[tracing::instrument(skip(self))]
    pub async fn list_all_user_subscriptions(
        &self,
        grace_period: TimeDelta,
    ) -> Result<Vec<SubscriptionEntry>, EntitlementError> {
        let now = self.clock.now();
        let rows = sqlx::query_as::<_, EntitlementRow>(
            r"
            SELECT id, guild_id, user_id, sku_id, source, expires_at
            FROM entitlements
            WHERE user_id IS NOT NULL
              AND guild_id IS NULL
              AND (expires_at IS NULL OR expires_at > $1)
            ",
        )
        .bind(active_cutoff(now, grace_period))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error!("list_all_user_subscriptions"))?;

        Ok(rank_active(
            rows.into_iter().map(Entitlement::from).collect(),
            self.catalog.as_ref(),
            now,
            grace_period,
            true,
        ))
    }
}
