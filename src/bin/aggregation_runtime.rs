//! Aggregation Runtime
//!
//! Periodically brings the daily and rolling validator dashboard tables up to
//! date with the per-epoch source table.
//!
//! Usage:
//!   cargo run --release --bin aggregation_runtime
//!
//! Environment variables:
//!   EPOCHFLOW_DB_PATH - SQLite database path (default: data/epochflow.db)
//!   AGGREGATION_INTERVAL_MS - Pass interval (default: 12000, one epoch is 384s)
//!   AGGREGATION_PARALLELISM - Concurrent aggregation tasks (default: 10)
//!   GENESIS_TIMESTAMP - Chain genesis in unix seconds (default: mainnet)

use dotenv::dotenv;
use epochflow::aggregation::{
    AggregationBudget, AggregationConfig, AggregationOrchestrator, SqliteStore,
};
use log::{error, info, warn};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    info!("🚀 Aggregation Runtime");

    let config = AggregationConfig::from_env();
    let family = config.day_family()?;

    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Source table: {}", family.source_table);
    info!("   ├─ Fixed table: {}", family.fixed_table);
    info!(
        "   ├─ Bucket: {} epochs (genesis offset {})",
        family.clock.units_per_bucket(),
        family.clock.genesis_offset()
    );
    info!("   ├─ Parallelism: {}", config.parallelism);
    info!("   └─ Interval: {}ms", config.interval_ms);

    let budget = AggregationBudget::new(config.parallelism);
    let store = SqliteStore::new(&config.db_path);
    let orchestrator = AggregationOrchestrator::from_family(store, &family, budget)?;

    let mut timer = interval(Duration::from_millis(config.interval_ms));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = orchestrator.run_aggregation(true).await {
                    error!("❌ Aggregation pass failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("⚠️  Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    info!("✅ Aggregation runtime stopped");
    Ok(())
}
