use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Transaction, Txid};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::lock::UtxoLocks;
use super::state::{PayjoinStateProvider, RecordedItem};
use super::wallet::Explorer;

pub const DEFAULT_BROADCAST_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_REBROADCAST_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Broadcasts an original after a delay, in case the sender never relays the payjoin.
#[derive(Clone)]
pub struct DelayedBroadcaster {
    explorer: Arc<dyn Explorer>,
}

impl DelayedBroadcaster {
    pub fn new(explorer: Arc<dyn Explorer>) -> Self { DelayedBroadcaster { explorer } }

    /// Runs detached from the caller; dropping the handle does not cancel it.
    pub fn schedule(&self, tx: Transaction, delay: Duration) -> JoinHandle<()> {
        let explorer = self.explorer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let txid = tx.compute_txid();
            match explorer.broadcast(&tx, false).await {
                Ok(result) if result.accepted => log::info!("Broadcast original {txid}"),
                Ok(result) => log::debug!(
                    "Original {txid} not relayed: {}",
                    result.reject_reason.unwrap_or_default()
                ),
                Err(e) => log::warn!("Failed to broadcast original {txid}: {e}"),
            }
        })
    }
}

/// Periodically settles in-flight payjoins.
///
/// Records whose original inputs got spent are dropped. Records older than
/// the stale timeout have their original broadcast and their coins unlocked.
pub struct StaleRebroadcaster {
    explorer: Arc<dyn Explorer>,
    states: Arc<PayjoinStateProvider>,
    locks: Arc<UtxoLocks>,
    interval: Duration,
    timeout: Duration,
}

impl StaleRebroadcaster {
    pub fn new(
        explorer: Arc<dyn Explorer>,
        states: Arc<PayjoinStateProvider>,
        locks: Arc<UtxoLocks>,
    ) -> Self {
        StaleRebroadcaster {
            explorer,
            states,
            locks,
            interval: DEFAULT_REBROADCAST_INTERVAL,
            timeout: DEFAULT_STALE_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Stale rebroadcaster stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Returns the txids of the originals broadcast by this sweep.
    pub async fn sweep(&self) -> Vec<Txid> {
        let mut broadcast = Vec::new();
        for (wallet_id, state) in self.states.wallets() {
            let mut settled = HashSet::new();
            for record in state.records_snapshot() {
                if self.inputs_spent(&record).await {
                    settled.insert(record.original_txid());
                }
            }
            for record in state.prune(|record| settled.contains(&record.original_txid())) {
                log::debug!("Payjoin for original {} settled", record.original_txid());
                self.release(&record);
            }

            for record in state.take_stale(Instant::now(), self.timeout) {
                let txid = record.original_txid();
                match self.explorer.broadcast(&record.original_tx, false).await {
                    Ok(result) if result.accepted => log::info!("Rebroadcast stale original {txid}"),
                    Ok(result) => log::debug!(
                        "Stale original {txid} not relayed: {}",
                        result.reject_reason.clone().unwrap_or_default()
                    ),
                    Err(e) => log::warn!("Failed to rebroadcast stale original {txid}: {e}"),
                }
                self.release(&record);
                broadcast.push(txid);
            }
            if state.is_empty() {
                log::trace!("No payjoin in flight for wallet {wallet_id}");
            }
        }
        broadcast
    }

    async fn inputs_spent(&self, record: &RecordedItem) -> bool {
        for txin in &record.original_tx.input {
            match self.explorer.is_spent(&txin.previous_output).await {
                Ok(true) => return true,
                Ok(false) => (),
                Err(e) => log::warn!("Failed to check {}: {e}", txin.previous_output),
            }
        }
        false
    }

    fn release(&self, record: &RecordedItem) {
        let inputs: Vec<_> = record.original_tx.input.iter().map(|txin| txin.previous_output).collect();
        self.locks.unlock_inputs(&inputs);
        self.locks.unlock(&record.contributed_coins);
    }
}
