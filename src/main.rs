//! Play Ledger
//!
//! Demo binary: records the numbers given on the command line (if any) and
//! prints the validated history.
//!
//! ```text
//! play-ledger 3 11 19 27 35 43
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use play_ledger::{
    FileStore, LedgerConfig, LedgerError, LedgerService, PlayMode, SystemClock, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "play_ledger=debug,info";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = LedgerConfig::from_env();
    info!("Play Ledger v{}", VERSION);
    info!("Data dir: {}", config.data_dir.display());

    let store = FileStore::open(&config.data_dir)
        .with_context(|| format!("opening store at {}", config.data_dir.display()))?;
    let ledger = LedgerService::open(config, Arc::new(store), Arc::new(SystemClock))?;
    info!("Signer fingerprint: {}", ledger.fingerprint());

    let numbers = std::env::args()
        .skip(1)
        .map(|arg| arg.parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .context("numbers must be integers")?;

    if !numbers.is_empty() {
        match ledger.record_play(&numbers, PlayMode::Standard).await {
            Ok(entry) => info!("Recorded play {} (block {})", entry.id, entry.block_hash),
            Err(LedgerError::Validation(e)) => warn!("Rejected: {}", e),
            Err(LedgerError::RateLimited { retry_after_secs }) => {
                warn!("Rate limited, retry in {}s", retry_after_secs)
            }
            Err(e) => return Err(e.into()),
        }
    }

    let plays = ledger.list_plays().await?;
    info!("=== History ({} plays) ===", plays.len());
    for play in &plays {
        info!(
            "#{} {} {:?} [{}]",
            play.index,
            play.created_at,
            play.numbers,
            play.mode
        );
    }

    let export = ledger.export_audit_data().await?;
    println!("{}", serde_json::to_string_pretty(&export)?);

    Ok(())
}
