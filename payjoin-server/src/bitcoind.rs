//! [`Explorer`] backed by a bitcoind node and its wallets.

use async_trait::async_trait;
use bitcoincore_rpc::json::AddressType;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use payjoin::bitcoin::bip32::Xpriv;
use payjoin::bitcoin::{Address, Network, OutPoint, Script, ScriptBuf, Transaction, TxOut};
use payjoin::receive::{BroadcastResult, DerivationScheme, Explorer, ReceivedCoin, ScriptType};
use payjoin::ImplementationError;
use tokio::task::spawn_blocking;

use crate::config::BitcoindConfig;

/// Talks to bitcoind over RPC. Each receiver wallet is a bitcoind wallet named
/// after its `wallet_id`, and keys derive from `master_key` at the `hdkeypath`
/// bitcoind reports.
#[derive(Debug, Clone)]
pub struct BitcoindExplorer {
    config: BitcoindConfig,
    network: Network,
    master_key: Option<Xpriv>,
}

impl BitcoindExplorer {
    pub fn new(config: BitcoindConfig, network: Network, master_key: Option<Xpriv>) -> Self {
        Self { config, network, master_key }
    }

    fn client(&self, wallet: Option<&str>) -> Result<Client, bitcoincore_rpc::Error> {
        let url = match wallet {
            Some(wallet) =>
                format!("{}/wallet/{wallet}", self.config.rpc_host.trim_end_matches('/')),
            None => self.config.rpc_host.clone(),
        };
        let auth = match (&self.config.cookie, &self.config.rpc_user, &self.config.rpc_password) {
            (Some(cookie), _, _) => Auth::CookieFile(cookie.clone()),
            (None, Some(user), Some(password)) => Auth::UserPass(user.clone(), password.clone()),
            _ => Auth::None,
        };
        Client::new(&url, auth)
    }

    /// Runs the blocking RPC `call` off the async runtime.
    async fn rpc<T, F>(&self, wallet: Option<&str>, call: F) -> Result<T, ImplementationError>
    where
        T: Send + 'static,
        F: FnOnce(&Client) -> Result<T, bitcoincore_rpc::Error> + Send + 'static,
    {
        let client = self.client(wallet)?;
        Ok(spawn_blocking(move || call(&client)).await??)
    }
}

fn address_type(script_type: ScriptType) -> AddressType {
    match script_type {
        ScriptType::Segwit => AddressType::Bech32,
        ScriptType::SegwitP2sh => AddressType::P2shSegwit,
        ScriptType::Legacy => AddressType::Legacy,
    }
}

fn is_script_type(script: &Script, script_type: ScriptType) -> bool {
    match script_type {
        ScriptType::Segwit => script.is_p2wpkh(),
        ScriptType::SegwitP2sh => script.is_p2sh(),
        ScriptType::Legacy => script.is_p2pkh(),
    }
}

/// The reason bitcoind gave for refusing a transaction, if that is what `error` is.
fn rejection_reason(error: &bitcoincore_rpc::Error) -> Option<String> {
    match error {
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(e)) =>
            Some(e.message.clone()),
        _ => None,
    }
}

#[async_trait]
impl Explorer for BitcoindExplorer {
    async fn fetch_previous_outputs(
        &self,
        tx: &Transaction,
    ) -> Result<Vec<Option<TxOut>>, ImplementationError> {
        let outpoints: Vec<OutPoint> = tx.input.iter().map(|txin| txin.previous_output).collect();
        self.rpc(None, move |client| {
            outpoints
                .iter()
                .map(|outpoint| -> Result<Option<TxOut>, bitcoincore_rpc::Error> {
                    let out = client.get_tx_out(&outpoint.txid, outpoint.vout, Some(true))?;
                    Ok(out.map(|out| TxOut {
                        value: out.value,
                        script_pubkey: ScriptBuf::from(out.script_pub_key.hex),
                    }))
                })
                .collect()
        })
        .await
    }

    async fn broadcast(
        &self,
        tx: &Transaction,
        test_only: bool,
    ) -> Result<BroadcastResult, ImplementationError> {
        let tx = tx.clone();
        self.rpc(None, move |client| {
            if test_only {
                let results = client.test_mempool_accept(&[&tx])?;
                return Ok(match results.into_iter().next() {
                    Some(result) if result.allowed => BroadcastResult::accepted(),
                    Some(result) => BroadcastResult::rejected(
                        result.reject_reason.unwrap_or_else(|| "rejected".to_owned()),
                    ),
                    None => BroadcastResult::rejected("no mempool acceptance result"),
                });
            }
            match client.send_raw_transaction(&tx) {
                Ok(txid) => {
                    tracing::debug!("Relayed {txid}");
                    Ok(BroadcastResult::accepted())
                }
                Err(e) => match rejection_reason(&e) {
                    Some(reason) => Ok(BroadcastResult::rejected(reason)),
                    None => Err(e),
                },
            }
        })
        .await
    }

    async fn list_unspent(
        &self,
        scheme: &DerivationScheme,
    ) -> Result<Vec<ReceivedCoin>, ImplementationError> {
        let network = self.network;
        let script_type = scheme.script_type;
        self.rpc(Some(&scheme.wallet_id), move |client| {
            let mut coins = Vec::new();
            for utxo in client.list_unspent(Some(1), None, None, Some(false), None)? {
                if !utxo.spendable || !is_script_type(&utxo.script_pub_key, script_type) {
                    continue;
                }
                let Ok(address) = Address::from_script(&utxo.script_pub_key, network) else {
                    continue;
                };
                let Some(key_path) = client.get_address_info(&address)?.hd_key_path else {
                    tracing::trace!("No key path for {address}");
                    continue;
                };
                coins.push(ReceivedCoin {
                    outpoint: OutPoint { txid: utxo.txid, vout: utxo.vout },
                    txout: TxOut { value: utxo.amount, script_pubkey: utxo.script_pub_key },
                    key_path,
                });
            }
            Ok(coins)
        })
        .await
    }

    async fn unused_change_script(
        &self,
        scheme: &DerivationScheme,
    ) -> Result<ScriptBuf, ImplementationError> {
        let address_type = address_type(scheme.script_type);
        let address = self
            .rpc(Some(&scheme.wallet_id), move |client| {
                client.get_raw_change_address(Some(address_type))
            })
            .await?;
        Ok(address.require_network(self.network)?.script_pubkey())
    }

    async fn signing_key(
        &self,
        _scheme: &DerivationScheme,
    ) -> Result<Option<Xpriv>, ImplementationError> {
        Ok(self.master_key)
    }

    async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool, ImplementationError> {
        let outpoint = *outpoint;
        let unspent = self
            .rpc(None, move |client| client.get_tx_out(&outpoint.txid, outpoint.vout, Some(true)))
            .await?;
        Ok(unspent.is_none())
    }
}
