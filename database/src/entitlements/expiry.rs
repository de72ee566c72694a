//! Expiry Accumulation
//!
//! How an expiry timestamp evolves when duration is added, and when a grant
//! counts as active. Shared by the entitlement ledger and the legacy premium
//! flag.

#[cfg(any(test, feature = "test-util"))]
use std::sync::RwLock;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

use super::error::EntitlementError;

/// Earliest instant a `TIMESTAMPTZ` column accepts (4714-11-24 BC), in Unix
/// seconds. chrono's upper bound lies below the store's, so only the lower
/// end needs a guard.
const STORE_MIN_TIMESTAMP_SECS: i64 = -210_866_803_200;

fn store_min() -> DateTime<Utc> {
    DateTime::from_timestamp(STORE_MIN_TIMESTAMP_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Wall clock source. Every operation reads it exactly once.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock, truncated to the store's microsecond precision so that
/// values computed here compare equal to what is read back.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// A manually driven clock.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

#[cfg(any(test, feature = "test-util"))]
impl FixedClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now.trunc_subsecs(6)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self
            .now
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = now.trunc_subsecs(6);
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut guard = self
            .now
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += delta;
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .now
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// New expiry after adding `duration` to a grant whose current expiry is
/// `prior`.
///
/// Remaining time stacks while the grant is live. Once it has lapsed (or if
/// there is no prior expiry) the new expiry is floored at `now`, so a lapsed
/// grant can never be backfilled.
///
/// Fails with [`EntitlementError::ExpiryOutOfRange`] when the result cannot
/// be represented or stored.
pub fn accumulate(
    prior: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    duration: TimeDelta,
) -> Result<DateTime<Utc>, EntitlementError> {
    let base = match prior {
        Some(expiry) if expiry > now => expiry,
        Some(_) | None => now,
    };

    base.checked_add_signed(duration)
        .filter(|expiry| *expiry >= store_min())
        .ok_or(EntitlementError::ExpiryOutOfRange { base, duration })
}

/// Whether a grant expiring at `expires_at` is active at `now`.
///
/// Perpetual grants are always active; otherwise `expires_at + grace > now`.
#[must_use]
pub fn is_active(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace_period: TimeDelta,
) -> bool {
    expires_at.is_none_or(|expiry| expiry > active_cutoff(now, grace_period))
}

/// Earliest expiry still considered active; `expires_at > cutoff` is the
/// store-side form of `expires_at + grace > now`.
///
/// Saturates at the earliest storable instant, so a grace period reaching
/// past it keeps every timed grant active.
#[must_use]
pub fn active_cutoff(now: DateTime<Utc>, grace_period: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(grace_period)
        .map_or_else(store_min, |cutoff| cutoff.max(store_min()))
}
