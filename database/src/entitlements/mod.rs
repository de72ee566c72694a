//! Entitlement Engine
//!
//! Records time-bound grants of paid or earned benefits to guilds and users,
//! resolves the active tier of a guild and lists active subscriptions.
//!
//! Mutating operations take the caller's connection (normally `&mut *tx`) and
//! never open or commit a transaction of their own, so a grant commits
//! atomically with whatever event justified it. Reads run against the pool as
//! single statements.

mod catalog;
mod error;
mod expiry;
mod ledger;
mod models;
mod resolver;
mod subscriptions;


use std::sync::Arc;

use sqlx::PgPool;

pub use catalog::{upsert_sku, SkuCatalog, StaticCatalog, TierCatalog};
pub use error::EntitlementError;
pub use expiry::{accumulate, active_cutoff, is_active, Clock, SystemClock};
#[cfg(any(test, feature = "test-util"))]
pub use expiry::FixedClock;
pub use ledger::MAX_ID_ATTEMPTS;
pub use models::{Entitlement, EntitlementSource, ResolvedTier, SubscriptionEntry};
pub use resolver::rank_active;

/// Entry point to the entitlement ledger, tier resolver and subscription
/// lister.
#[derive(Clone)]
pub struct Entitlements {
    pool: PgPool,
    catalog: Arc<dyn TierCatalog>,
    clock: Arc<dyn Clock>,
}

impl Entitlements {
    /// Create an engine reading the wall clock.
    pub fn new(pool: PgPool, catalog: Arc<dyn TierCatalog>) -> Self {
        Self {
            pool,
            catalog,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub fn catalog(&self) -> &dyn TierCatalog {
        self.catalog.as_ref()
    }
}
