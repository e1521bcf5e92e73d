use std::path::PathBuf;

use clap::{Parser, Subcommand};
use payjoin::receive::ScriptType;

#[derive(Debug, Parser)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = "Payjoin receiver for invoice payments",
    long_about = None,
)]
pub struct Cli {
    #[arg(long, short = 'p', env = "PJ_PORT", help = "The port to bind [default: 8080]")]
    pub port: Option<u16>,

    #[arg(
        long,
        env = "PJ_TIMEOUT_SECS",
        help = "The time a sender may wait for a proposal [default: 30]"
    )]
    pub timeout: Option<u64>,

    #[arg(long = "db-path", short = 'd', env = "PJ_DB_PATH", help = "The sqlite invoice database")]
    pub db_path: Option<PathBuf>,

    #[arg(long = "rpc-host", short = 'r', env = "PJ_RPC_HOST", help = "The url of the bitcoin node")]
    pub rpc_host: Option<String>,

    #[arg(
        long = "cookie-file",
        short = 'c',
        env = "PJ_RPC_COOKIE",
        help = "Path to the cookie file of the bitcoin node"
    )]
    pub cookie_file: Option<PathBuf>,

    #[arg(long = "rpc-user", env = "PJ_RPC_USER", help = "The username for the bitcoin node")]
    pub rpc_user: Option<String>,

    #[arg(
        long = "rpc-password",
        env = "PJ_RPC_PASSWORD",
        hide_env_values = true,
        help = "The password for the bitcoin node"
    )]
    pub rpc_password: Option<String>,

    #[arg(long, short = 'n', env = "PJ_NETWORK", help = "The bitcoin network [default: bitcoin]")]
    pub network: Option<String>,

    #[arg(long = "crypto-code", env = "PJ_CRYPTO_CODE", help = "The served crypto code [default: BTC]")]
    pub crypto_code: Option<String>,

    #[arg(
        long = "master-key",
        env = "PJ_MASTER_KEY",
        hide_env_values = true,
        help = "The hot wallet master xprv. Without it every payjoin falls back to the original"
    )]
    pub master_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve payjoin requests and rebroadcast abandoned originals
    Serve,
    /// Register an invoice the server accepts payjoins for
    AddInvoice {
        /// The deposit address of the invoice
        address: String,
        /// The amount due in satoshis
        amount_sat: u64,
        #[arg(long, help = "Accept only plain payments for this invoice")]
        no_payjoin: bool,
        #[arg(long, short = 'w', default_value = "default", help = "The bitcoind wallet receiving")]
        wallet: String,
        #[arg(long, default_value = "segwit", help = "segwit, segwit-p2sh or legacy")]
        script_type: ScriptType,
        #[arg(long, help = "The invoice id [default: random]")]
        id: Option<String>,
    },
}
