use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use payjoin::bitcoin::secp256k1::rand;
use payjoin::bitcoin::{Address, Amount};
use payjoin::receive::{ChainPaymentMethod, DerivationScheme, PayjoinEndpoint, StaleRebroadcaster};
use payjoin_server::bitcoind::BitcoindExplorer;
use payjoin_server::cli::{Cli, Command};
use payjoin_server::config::Config;
use payjoin_server::db::Database;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::new(&cli).with_context(|| "Failed to parse config")?;
    let db = Database::create(&config.db_path, &config.crypto_code)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;

    match cli.command {
        Command::Serve => serve(config, db).await,
        Command::AddInvoice { address, amount_sat, no_payjoin, wallet, script_type, id } => {
            let invoice_id = id.unwrap_or_else(|| format!("{:016x}", rand::random::<u64>()));
            let derivation = DerivationScheme { wallet_id: wallet, script_type };
            let method = invoice_method(&config, &address, amount_sat, !no_payjoin, derivation)?;
            db.add_invoice(&invoice_id, &method).with_context(|| "Failed to store the invoice")?;
            tracing::info!("Invoice {invoice_id} of {} to {address}", method.due);
            println!("{invoice_id}");
            Ok(())
        }
    }
}

async fn serve(config: Config, db: Database) -> Result<()> {
    if config.master_key.is_none() {
        tracing::warn!("No master key configured, every payjoin falls back to the original");
    }
    let explorer =
        Arc::new(BitcoindExplorer::new(config.bitcoind.clone(), config.network, config.master_key));
    let endpoint = Arc::new(PayjoinEndpoint::new(config.endpoint_config(), explorer, Arc::new(db)));

    let rebroadcaster =
        StaleRebroadcaster::new(endpoint.explorer(), endpoint.states(), endpoint.locks())
            .with_interval(config.rebroadcast_interval)
            .with_timeout(config.stale_timeout);
    let shutdown = CancellationToken::new();
    let rebroadcasting = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { rebroadcaster.run(shutdown).await })
    };

    let served = payjoin_server::listen_tcp(&config.listen_addr, endpoint, config.timeout).await;
    shutdown.cancel();
    rebroadcasting.await?;
    served.map_err(|e| anyhow!("Payjoin receiver stopped: {e}"))
}

fn invoice_method(
    config: &Config,
    address: &str,
    amount_sat: u64,
    payjoin_enabled: bool,
    derivation: DerivationScheme,
) -> Result<ChainPaymentMethod> {
    let address = Address::from_str(address)
        .with_context(|| format!("Invalid address {address}"))?
        .require_network(config.network)
        .with_context(|| format!("Address is not for {}", config.network))?;
    Ok(ChainPaymentMethod {
        deposit_script: address.script_pubkey(),
        payjoin_enabled,
        derivation,
        due: Amount::from_sat(amount_sat),
        has_payments: false,
    })
}

fn init_logging() {
    let env_filter =
        EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();

    tracing_subscriber::fmt().with_target(true).with_level(true).with_env_filter(env_filter).init();
}
