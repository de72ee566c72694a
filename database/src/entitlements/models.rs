//! Entitlement Models

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::error::EntitlementError;
use super::expiry;
use crate::db::from_db_id;

/// Origin of an entitlement. Used for filtering and auditing, never ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "entitlement_source", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntitlementSource {
    Purchase,
    Gift,
    /// Reward for voting on a bot listing site.
    Voting,
    Admin,
    /// Imported from the premium system that predates the ledger.
    Legacy,
}

impl EntitlementSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Gift => "gift",
            Self::Voting => "voting",
            Self::Admin => "admin",
            Self::Legacy => "legacy",
        }
    }
}

impl std::fmt::Display for EntitlementSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-bound or perpetual grant of a SKU to a guild and/or user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub guild_id: Option<u64>,
    /// Set without `guild_id`, the grant applies to every guild the user owns.
    pub user_id: Option<u64>,
    pub sku_id: Uuid,
    pub source: EntitlementSource,
    /// `None` means the grant never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    /// Reject grants that are scoped to neither a guild nor a user.
    pub fn check_scope(
        guild_id: Option<u64>,
        user_id: Option<u64>,
    ) -> Result<(), EntitlementError> {
        if guild_id.is_none() && user_id.is_none() {
            return Err(EntitlementError::ScopeViolation);
        }
        Ok(())
    }

    /// Whether this is an account-level grant (user scope only).
    #[must_use]
    pub const fn is_account_level(&self) -> bool {
        self.guild_id.is_none() && self.user_id.is_some()
    }

    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>, grace_period: TimeDelta) -> bool {
        expiry::is_active(self.expires_at, now, grace_period)
    }
}

/// Row shape of the `entitlements` table.
///
/// Snowflakes are stored as `BIGINT` and converted back here.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct EntitlementRow {
    pub id: Uuid,
    pub guild_id: Option<i64>,
    pub user_id: Option<i64>,
    pub sku_id: Uuid,
    pub source: EntitlementSource,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<EntitlementRow> for Entitlement {
    fn from(row: EntitlementRow) -> Self {
        Self {
            id: row.id,
            guild_id: row.guild_id.map(from_db_id),
            user_id: row.user_id.map(from_db_id),
            sku_id: row.sku_id,
            source: row.source,
            expires_at: row.expires_at,
        }
    }
}

/// A tier resolved from a SKU through the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedTier {
    pub priority: i32,
    pub label: String,
}

impl ResolvedTier {
    pub fn new(priority: i32, label: impl Into<String>) -> Self {
        Self {
            priority,
            label: label.into(),
        }
    }
}

/// An active entitlement together with the tier it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub id: Uuid,
    pub guild_id: Option<u64>,
    pub user_id: Option<u64>,
    pub sku_id: Uuid,
    pub source: EntitlementSource,
    pub expires_at: Option<DateTime<Utc>>,
    pub tier: ResolvedTier,
}

impl SubscriptionEntry {
    pub(crate) fn new(entitlement: Entitlement, tier: ResolvedTier) -> Self {
        Self {
            id: entitlement.id,
            guild_id: entitlement.guild_id,
            user_id: entitlement.user_id,
            sku_id: entitlement.sku_id,
            source: entitlement.source,
            expires_at: entitlement.expires_at,
            tier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::to_db_id;

    #[test]
    fn test_check_scope_requires_guild_or_user() {
        assert!(matches!(
            Entitlement::check_scope(None, None),
            Err(EntitlementError::ScopeViolation)
        ));
        assert!(Entitlement::check_scope(Some(1), None).is_ok());
        assert!(Entitlement::check_scope(None, Some(2)).is_ok());
        assert!(Entitlement::check_scope(Some(1), Some(2)).is_ok());
    }

    #[test]
    fn test_row_conversion_preserves_large_snowflakes() {
        let snowflake: u64 = 1_234_567_890_123_456_789;
        let row = EntitlementRow {
            id: Uuid::now_v7(),
            guild_id: Some(to_db_id(snowflake)),
            user_id: None,
            sku_id: Uuid::now_v7(),
            source: EntitlementSource::Purchase,
            expires_at: None,
        };

        let entitlement = Entitlement::from(row);
        assert_eq!(entitlement.guild_id, Some(snowflake));
        assert!(!entitlement.is_account_level());
    }

    #[test]
    fn test_source_serializes_lowercase() {
        let json = serde_json::to_string(&EntitlementSource::Voting).unwrap();
        assert_eq!(json, "\"voting\"");
        assert_eq!(EntitlementSource::Admin.to_string(), "admin");
    }
}
