//! Database Layer
//!
//! `PostgreSQL` connection pool and migrations.
//!
//! Advisory Lock Seed Registry
//! - 61 = `entitlement_extend` (keyed by guild/user/sku/source tuple)
//!   - Called from: database/src/entitlements/ledger.rs
//! - 63 = `premium_guild_extend` (keyed by guild id)
//!   - Called from: database/src/premium/mod.rs

use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Advisory lock seed serializing entitlement expiry extension.
pub const ENTITLEMENT_EXTEND_LOCK_SEED: i64 = 61;

/// Advisory lock seed serializing legacy premium flag extension.
pub const PREMIUM_GUILD_EXTEND_LOCK_SEED: i64 = 63;

/// Snowflake to `BIGINT`. Ids above `i64::MAX` are stored negative and come
/// back unchanged through [`from_db_id`].
pub(crate) const fn to_db_id(id: u64) -> i64 {
    id as i64
}

/// `BIGINT` back to a snowflake.
pub(crate) const fn from_db_id(id: i64) -> u64 {
    id as u64
}

/// Log and return a database error with context.
///
/// All query failures are logged with the query name and the ids involved
/// before being propagated unchanged.
macro_rules! db_error {
    ($query:expr, $($field:tt)*) => {
        |e| {
            tracing::error!(query = $query, $($field)*, error = %e, "Database query failed");
            e
        }
    };
    ($query:expr) => {
        |e| {
            tracing::error!(query = $query, error = %e, "Database query failed");
            e
        }
    };
}

pub(crate) use db_error;

/// Pool sizing for [`create_pool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 20,
        }
    }
}

/// Create `PostgreSQL` connection pool with health configuration.
pub async fn create_pool(database_url: &str, settings: PoolSettings) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        // Keep minimum connections warm to prevent cold-start latency
        .min_connections(settings.min_connections)
        .max_connections(settings.max_connections)
        // Prevent hanging requests on pool exhaustion
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    info!(
        min_connections = settings.min_connections,
        max_connections = settings.max_connections,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}
