//! Legacy Premium Guilds
//!
//! Single-benefit premium flag predating the entitlement ledger: one expiry
//! per guild, extended with the same accumulation rules as entitlements.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::db::{db_error, to_db_id, PREMIUM_GUILD_EXTEND_LOCK_SEED};
use crate::entitlements::{accumulate, Clock, EntitlementError, SystemClock};

#[derive(Clone)]
pub struct PremiumGuilds {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PremiumGuilds {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Premium expiry of a guild, if it ever had premium.
    pub async fn get_expiry(&self, guild_id: u64) -> sqlx::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT expiry FROM premium_guilds WHERE guild_id = $1",
        )
        .bind(to_db_id(guild_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error!("get_premium_expiry", guild_id = guild_id))
    }

    pub async fn is_premium(&self, guild_id: u64) -> sqlx::Result<bool> {
        let expiry = self.get_expiry(guild_id).await?;
        Ok(expiry.is_some_and(|expiry| expiry > self.clock.now()))
    }

    /// Add `duration` of premium to a guild inside the caller's transaction
    /// and return the new expiry.
    ///
    /// Fails with [`EntitlementError::ExpiryOutOfRange`] without writing when
    /// the new expiry cannot be stored.
    #[tracing::instrument(skip(self, conn))]
    pub async fn add(
        &self,
        conn: &mut PgConnection,
        guild_id: u64,
        duration: TimeDelta,
    ) -> Result<DateTime<Utc>, EntitlementError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, $2))")
            .bind(guild_id.to_string())
            .bind(PREMIUM_GUILD_EXTEND_LOCK_SEED)
            .execute(&mut *conn)
            .await
            .map_err(db_error!("lock_premium_guild_extend", guild_id = guild_id))?;

        let now = self.clock.now();

        let prior = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT expiry FROM premium_guilds WHERE guild_id = $1 FOR UPDATE",
        )
        .bind(to_db_id(guild_id))
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error!("get_premium_expiry_for_update", guild_id = guild_id))?;

        let expiry = accumulate(prior, now, duration)?;

        sqlx::query(
            r"
            INSERT INTO premium_guilds (guild_id, expiry)
            VALUES ($1, $2)
            ON CONFLICT (guild_id) DO UPDATE SET expiry = EXCLUDED.expiry
            ",
        )
        .bind(to_db_id(guild_id))
        .bind(expiry)
        .execute(&mut *conn)
        .await
        .map_err(db_error!("upsert_premium_guild", guild_id = guild_id))?;

        debug!(guild_id, prior = ?prior, expiry = %expiry, "Premium extended");
        Ok(expiry)
    }
}
