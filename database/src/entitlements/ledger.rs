//! Entitlement Ledger
//!
//! Create, read, delete and extend entitlement rows inside the caller's
//! transaction.

use chrono::{DateTime, TimeDelta, Utc};
use futures::TryStreamExt;
use sqlx::{Connection, PgConnection};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::EntitlementError;
use super::expiry::accumulate;
use super::models::{Entitlement, EntitlementRow, EntitlementSource};
use super::Entitlements;
use crate::db::{db_error, to_db_id, ENTITLEMENT_EXTEND_LOCK_SEED};

/// Attempts at generating a non-colliding id before giving up.
///
/// Retries are immediate. After the last attempt the storage error is
/// returned as-is.
pub const MAX_ID_ATTEMPTS: u32 = 5;

impl Entitlements {
    /// Record a new grant.
    ///
    /// Fails with [`EntitlementError::ScopeViolation`] before touching the
    /// store when neither `guild_id` nor `user_id` is given.
    #[tracing::instrument(skip(self, conn))]
    pub async fn create(
        &self,
        conn: &mut PgConnection,
        guild_id: Option<u64>,
        user_id: Option<u64>,
        sku_id: Uuid,
        source: EntitlementSource,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Entitlement, EntitlementError> {
        Entitlement::check_scope(guild_id, user_id)?;
        let new_entitlement = NewEntitlement {
            guild_id,
            user_id,
            sku_id,
            source,
            expires_at,
        };
        insert_entitlement(conn, &new_entitlement, Uuid::now_v7).await
    }

    /// Find an entitlement by id.
    pub async fn get_by_id(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<Option<Entitlement>, EntitlementError> {
        let row = sqlx::query_as::<_, EntitlementRow>(
            r"
            SELECT id, guild_id, user_id, sku_id, source, expires_at
            FROM entitlements
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(db_error!("get_entitlement_by_id", entitlement_id = %id))?;

        Ok(row.map(Entitlement::from))
    }

    /// Hard delete an entitlement (refunds, revocations).
    #[tracing::instrument(skip(self, conn))]
    pub async fn delete_by_id(
        &self,
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<(), EntitlementError> {
        let result = sqlx::query("DELETE FROM entitlements WHERE id = $1")
            .bind(id)
            .execute(conn)
            .await
            .map_err(db_error!("delete_entitlement_by_id", entitlement_id = %id))?;

        debug!(
            entitlement_id = %id,
            deleted = result.rows_affected(),
            "Entitlement deleted"
        );
        Ok(())
    }

    /// Every entitlement from one source, lapsed or not. For reconciliation.
    pub async fn list_from_source(
        &self,
        source: EntitlementSource,
    ) -> Result<Vec<Entitlement>, EntitlementError> {
        let entitlements: Vec<Entitlement> = sqlx::query_as::<_, EntitlementRow>(
            r"
            SELECT id, guild_id, user_id, sku_id, source, expires_at
            FROM entitlements
            WHERE source = $1
            ORDER BY id
            ",
        )
        .bind(source)
        .fetch(&self.pool)
        .map_ok(Entitlement::from)
        .try_collect()
        .await
        .map_err(db_error!("list_entitlements_from_source", source = %source))?;

        Ok(entitlements)
    }

    /// Add `duration` to the entitlement matching the scope, SKU and source.
    ///
    /// A live grant keeps its remaining time; a lapsed one restarts from now.
    /// With no matching row a new grant expiring at `now + duration` is
    /// created. Extensions of the same key are serialized on an advisory
    /// lock held until the caller's transaction ends.
    #[tracing::instrument(skip(self, conn))]
    pub async fn increase_expiry(
        &self,
        conn: &mut PgConnection,
        guild_id: Option<u64>,
        user_id: Option<u64>,
        sku_id: Uuid,
        source: EntitlementSource,
        duration: TimeDelta,
    ) -> Result<(), EntitlementError> {
        Entitlement::check_scope(guild_id, user_id)?;

        let lock_key = extend_lock_key(guild_id, user_id, sku_id, source);
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, $2))")
            .bind(&lock_key)
            .bind(ENTITLEMENT_EXTEND_LOCK_SEED)
            .execute(&mut *conn)
            .await
            .map_err(db_error!("lock_entitlement_extend", key = %lock_key))?;

        let now = self.clock.now();

        let current: Option<(Uuid, Option<DateTime<Utc>>)> = sqlx::query_as(
            r"
            SELECT id, expires_at
            FROM entitlements
            WHERE guild_id IS NOT DISTINCT FROM $1
              AND user_id IS NOT DISTINCT FROM $2
              AND sku_id = $3
              AND source = $4
            ORDER BY id DESC
            LIMIT 1
            FOR UPDATE
            ",
        )
        .bind(guild_id.map(to_db_id))
        .bind(user_id.map(to_db_id))
        .bind(sku_id)
        .bind(source)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error!("find_entitlement_for_extend", key = %lock_key))?;

        match current {
            Some((id, prior)) => {
                let expires_at = accumulate(prior, now, duration)?;
                sqlx::query("UPDATE entitlements SET expires_at = $1 WHERE id = $2")
                    .bind(expires_at)
                    .bind(id)
                    .execute(&mut *conn)
                    .await
                    .map_err(db_error!("increase_entitlement_expiry", entitlement_id = %id))?;

                debug!(
                    entitlement_id = %id,
                    prior = ?prior,
                    expires_at = %expires_at,
                    "Entitlement expiry extended"
                );
            }
            None => {
                let expires_at = accumulate(None, now, duration)?;
                let new_entitlement = NewEntitlement {
                    guild_id,
                    user_id,
                    sku_id,
                    source,
                    expires_at: Some(expires_at),
                };
                let entitlement = insert_entitlement(conn, &new_entitlement, Uuid::now_v7).await?;

                debug!(
                    entitlement_id = %entitlement.id,
                    expires_at = %expires_at,
                    "Entitlement created by extension"
                );
            }
        }

        Ok(())
    }
}

/// Field values of a grant that has no id yet.
#[derive(Debug, Clone, Copy)]
pub(super) struct NewEntitlement {
    pub guild_id: Option<u64>,
    pub user_id: Option<u64>,
    pub sku_id: Uuid,
    pub source: EntitlementSource,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Insert a row under an id drawn from `next_id`, drawing again on id
/// collisions up to [`MAX_ID_ATTEMPTS`] times.
///
/// Each attempt runs in a savepoint so a rejected insert leaves the caller's
/// transaction usable.
pub(super) async fn insert_entitlement(
    conn: &mut PgConnection,
    grant: &NewEntitlement,
    mut next_id: impl FnMut() -> Uuid,
) -> Result<Entitlement, EntitlementError> {
    let mut attempt = 1;
    loop {
        let entitlement = Entitlement {
            id: next_id(),
            guild_id: grant.guild_id,
            user_id: grant.user_id,
            sku_id: grant.sku_id,
            source: grant.source,
            expires_at: grant.expires_at,
        };

        let mut savepoint = conn.begin().await?;
        match insert_row(&mut *savepoint, &entitlement).await {
            Ok(()) => {
                savepoint.commit().await?;
                debug!(entitlement_id = %entitlement.id, "Entitlement created");
                return Ok(entitlement);
            }
            Err(e) if e.is_unique_violation() && attempt < MAX_ID_ATTEMPTS => {
                savepoint.rollback().await?;
                warn!(
                    entitlement_id = %entitlement.id,
                    attempt,
                    "Entitlement id collision, retrying"
                );
                attempt += 1;
            }
            Err(e) => {
                // Keep the insert error; a failed rollback is only logged
                if let Err(rollback) = savepoint.rollback().await {
                    error!(
                        entitlement_id = %entitlement.id,
                        error = %rollback,
                        "Failed to roll back entitlement insert savepoint"
                    );
                }
                return Err(e);
            }
        }
    }
}

async fn insert_row(
    conn: &mut PgConnection,
    entitlement: &Entitlement,
) -> Result<(), EntitlementError> {
    sqlx::query(
        r"
        INSERT INTO entitlements (id, guild_id, user_id, sku_id, source, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ",
    )
    .bind(entitlement.id)
    .bind(entitlement.guild_id.map(to_db_id))
    .bind(entitlement.user_id.map(to_db_id))
    .bind(entitlement.sku_id)
    .bind(entitlement.source)
    .bind(entitlement.expires_at)
    .execute(conn)
    .await
    .map_err(db_error!("insert_entitlement", entitlement_id = %entitlement.id))?;

    Ok(())
}

/// Advisory lock key for the (guild, user, sku, source) tuple.
fn extend_lock_key(
    guild_id: Option<u64>,
    user_id: Option<u64>,
    sku_id: Uuid,
    source: EntitlementSource,
) -> String {
    let scope = |id: Option<u64>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
    format!("{}:{}:{sku_id}:{source}", scope(guild_id), scope(user_id))
}
