use anyhow::{bail, Context, Result};
use log::{info, warn};

use pow_ledger::blockchain::{Blockchain, BlockchainError, UtxoSet};
use pow_ledger::config::LedgerConfig;

/// Environment variable naming the config file
const CONFIG_ENV: &str = "LEDGER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "ledger.toml";

// Opens the configured ledger, audits every block and rebuilds the UTXO index
fn main() -> Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = LedgerConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path))?;

    let blockchain = match Blockchain::open(&config) {
        Ok(blockchain) => blockchain,
        Err(BlockchainError::NotInitialized(path)) => {
            warn!("No blockchain found at {}, nothing to audit", path);
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to open blockchain"),
    };

    let mut height = 0usize;
    let mut transactions = 0usize;
    for block in blockchain.iter() {
        let block = block.context("failed to read block")?;
        height += 1;
        transactions += block.transactions.len();
    }
    info!("Chain has {} blocks and {} transactions", height, transactions);

    if !blockchain.validate_chain().context("chain audit failed")? {
        bail!("chain at {} failed validation", config.data_dir.display());
    }
    info!("All blocks pass proof of work at difficulty {}", blockchain.difficulty_bits());

    let utxo = UtxoSet::new(&blockchain);
    utxo.reindex().context("failed to rebuild UTXO index")?;
    info!(
        "UTXO index holds outputs of {} transactions",
        utxo.count_transactions()?
    );

    Ok(())
}
