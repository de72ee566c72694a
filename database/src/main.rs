//! Tickets Database - Entry Point
//!
//! Applies migrations, loads the SKU catalog and logs a reconciliation
//! summary of active account subscriptions.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use tickets_database::entitlements::{EntitlementSource, Entitlements, SkuCatalog};
use tickets_database::{config, db};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickets_database=debug,sqlx=warn".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting tickets database maintenance"
    );

    let pool = db::create_pool(&config.database_url, config.pool_settings())
        .await
        .context("Failed to connect to PostgreSQL")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let catalog = SkuCatalog::load(&pool)
        .await
        .context("Failed to load SKU catalog")?;
    let engine = Entitlements::new(pool.clone(), Arc::new(catalog));

    let subscriptions = engine
        .list_all_user_subscriptions(config.grace_period)
        .await
        .context("Failed to list user subscriptions")?;

    // Voting rewards only count towards tiers when enabled
    let counted: Vec<_> = subscriptions
        .iter()
        .filter(|entry| config.include_voting || entry.source != EntitlementSource::Voting)
        .collect();

    let mut per_tier: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in &counted {
        *per_tier.entry(entry.tier.label.as_str()).or_default() += 1;
    }
    for (tier, count) in &per_tier {
        info!(tier = %tier, count, "Active account subscriptions");
    }

    info!(
        total = subscriptions.len(),
        counted = counted.len(),
        grace_period_secs = config.grace_period.num_seconds(),
        include_voting = config.include_voting,
        "Reconciliation complete"
    );

    pool.close().await;
    Ok(())
}
