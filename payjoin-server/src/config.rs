use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigError, File, FileFormat};
use payjoin::bitcoin::bip32::Xpriv;
use payjoin::bitcoin::{FeeRate, Network, NetworkKind};
use payjoin::receive::{
    EndpointConfig, DEFAULT_BROADCAST_DELAY, DEFAULT_REBROADCAST_INTERVAL, DEFAULT_STALE_TIMEOUT,
};
use serde::Deserialize;

use crate::cli::Cli;
use crate::{DEFAULT_DB_PATH, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS};

type Builder = config::builder::ConfigBuilder<DefaultState>;

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoindConfig {
    pub rpc_host: String,
    pub cookie: Option<PathBuf>,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub timeout: Duration,
    pub db_path: PathBuf,
    pub bitcoind: BitcoindConfig,
    pub network: Network,
    pub crypto_code: String,
    pub broadcast_delay: Duration,
    pub stale_timeout: Duration,
    pub rebroadcast_interval: Duration,
    pub min_relay_fee_rate: FeeRate,
    pub master_key: Option<Xpriv>,
}

impl Config {
    pub fn new(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = config::Config::builder();
        config = add_defaults(config)?;
        config = config.add_source(File::new("config.toml", FileFormat::Toml).required(false));
        config = add_overrides(config, cli)?;

        let built_config = config.build()?;

        let network: String = built_config.get("network")?;
        let network = Network::from_str(&network)
            .map_err(|e| ConfigError::Message(format!("invalid network {network}: {e}")))?;
        let master_key = match built_config.get_string("master_key") {
            Ok(key) => Some(
                Xpriv::from_str(&key)
                    .map_err(|e| ConfigError::Message(format!("invalid master key: {e}")))?,
            ),
            Err(ConfigError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if master_key.is_some_and(|key| key.network != NetworkKind::from(network)) {
            return Err(ConfigError::Message(format!("the master key is not for {network}")));
        }
        let min_relay_fee_rate = FeeRate::from_sat_per_vb(built_config.get("min_relay_fee_rate")?)
            .ok_or_else(|| ConfigError::Message("min_relay_fee_rate overflows".to_owned()))?;

        Ok(Config {
            listen_addr: built_config.get("listen_addr")?,
            timeout: Duration::from_secs(built_config.get("timeout")?),
            db_path: built_config.get("db_path")?,
            bitcoind: built_config.get("bitcoind")?,
            network,
            crypto_code: built_config.get::<String>("crypto_code")?.to_uppercase(),
            broadcast_delay: Duration::from_secs(built_config.get("broadcast_delay")?),
            stale_timeout: Duration::from_secs(built_config.get("stale_timeout")?),
            rebroadcast_interval: Duration::from_secs(built_config.get("rebroadcast_interval")?),
            min_relay_fee_rate,
            master_key,
        })
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            broadcast_delay: self.broadcast_delay,
            min_relay_fee_rate: self.min_relay_fee_rate,
            ..EndpointConfig::new(self.crypto_code.clone(), self.network)
        }
    }
}

fn add_defaults(config: Builder) -> Result<Builder, ConfigError> {
    config
        .set_default("listen_addr", format!("[::]:{DEFAULT_PORT}"))?
        .set_default("timeout", DEFAULT_TIMEOUT_SECS)?
        .set_default("db_path", DEFAULT_DB_PATH)?
        .set_default("bitcoind.rpc_host", "http://localhost:8332")?
        .set_default("network", "bitcoin")?
        .set_default("crypto_code", "BTC")?
        .set_default("broadcast_delay", DEFAULT_BROADCAST_DELAY.as_secs())?
        .set_default("stale_timeout", DEFAULT_STALE_TIMEOUT.as_secs())?
        .set_default("rebroadcast_interval", DEFAULT_REBROADCAST_INTERVAL.as_secs())?
        .set_default("min_relay_fee_rate", 1u64)
}

fn add_overrides(config: Builder, cli: &Cli) -> Result<Builder, ConfigError> {
    config
        .set_override_option("listen_addr", cli.port.map(|port| format!("[::]:{port}")))?
        .set_override_option("timeout", cli.timeout)?
        .set_override_option(
            "db_path",
            cli.db_path.as_ref().map(|path| path.to_string_lossy().into_owned()),
        )?
        .set_override_option("bitcoind.rpc_host", cli.rpc_host.clone())?
        .set_override_option(
            "bitcoind.cookie",
            cli.cookie_file.as_ref().map(|path| path.to_string_lossy().into_owned()),
        )?
        .set_override_option("bitcoind.rpc_user", cli.rpc_user.clone())?
        .set_override_option("bitcoind.rpc_password", cli.rpc_password.clone())?
        .set_override_option("network", cli.network.clone())?
        .set_override_option("crypto_code", cli.crypto_code.clone())?
        .set_override_option("master_key", cli.master_key.clone())
}
