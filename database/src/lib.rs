//! Tickets Database
//!
//! Persistence layer for the support-ticketing platform. The entitlement
//! engine records grants of paid or earned benefits to guilds and users and
//! resolves the subscription tier each guild is entitled to.

pub mod config;
pub mod db;
pub mod entitlements;
pub mod premium;
