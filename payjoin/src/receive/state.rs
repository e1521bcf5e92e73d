use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bitcoin::{OutPoint, Transaction, Txid};
use tokio::time::Instant;

/// An original transaction for which a proposal was handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedItem {
    pub original_tx: Transaction,
    pub proposed_txid: Txid,
    pub contributed_coins: Vec<OutPoint>,
    pub timestamp: Instant,
}

impl RecordedItem {
    pub fn original_txid(&self) -> Txid { self.original_tx.compute_txid() }

    fn spends(&self, outpoint: &OutPoint) -> bool {
        self.original_tx.input.iter().any(|txin| &txin.previous_output == outpoint)
    }
}

/// Why an original cannot be coordinated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginalConflict {
    /// The exact original was already coordinated.
    Replay,
    /// Another in-flight original spends one of the same inputs.
    Conflict(OutPoint),
}

/// In-flight payjoins of one wallet.
#[derive(Debug, Default)]
pub struct PayjoinState {
    records: Mutex<HashMap<Txid, RecordedItem>>,
}

impl PayjoinState {
    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<Txid, RecordedItem>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `item` unless its original is already recorded.
    pub fn try_record(&self, item: RecordedItem) -> bool {
        let mut records = self.records();
        let txid = item.original_txid();
        if records.contains_key(&txid) {
            return false;
        }
        records.insert(txid, item);
        true
    }

    pub fn check_original(&self, tx: &Transaction) -> Result<(), OriginalConflict> {
        let records = self.records();
        if records.contains_key(&tx.compute_txid()) {
            return Err(OriginalConflict::Replay);
        }
        for txin in &tx.input {
            if records.values().any(|record| record.spends(&txin.previous_output)) {
                return Err(OriginalConflict::Conflict(txin.previous_output));
            }
        }
        Ok(())
    }

    /// Receiver coins already revealed to some sender.
    pub fn exposed_coins(&self) -> HashSet<OutPoint> {
        self.records()
            .values()
            .flat_map(|record| record.contributed_coins.iter().copied())
            .collect()
    }

    /// Removes and returns the records older than `timeout`.
    pub fn take_stale(&self, now: Instant, timeout: Duration) -> Vec<RecordedItem> {
        let mut records = self.records();
        let stale: Vec<Txid> = records
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.timestamp) >= timeout)
            .map(|(txid, _)| *txid)
            .collect();
        stale.iter().filter_map(|txid| records.remove(txid)).collect()
    }

    /// Removes and returns the records `is_settled` holds for.
    pub fn prune(&self, is_settled: impl Fn(&RecordedItem) -> bool) -> Vec<RecordedItem> {
        let mut records = self.records();
        let settled: Vec<Txid> =
            records.iter().filter(|(_, record)| is_settled(record)).map(|(txid, _)| *txid).collect();
        settled.iter().filter_map(|txid| records.remove(txid)).collect()
    }

    /// A snapshot of every record.
    pub fn records_snapshot(&self) -> Vec<RecordedItem> { self.records().values().cloned().collect() }

    pub fn remove(&self, original_txid: &Txid) -> Option<RecordedItem> {
        self.records().remove(original_txid)
    }

    pub fn len(&self) -> usize { self.records().len() }

    pub fn is_empty(&self) -> bool { self.records().is_empty() }
}

/// Owns the [`PayjoinState`] of every wallet served by this process.
#[derive(Debug, Default)]
pub struct PayjoinStateProvider {
    states: Mutex<HashMap<String, Arc<PayjoinState>>>,
}

impl PayjoinStateProvider {
    pub fn new() -> Self { Self::default() }

    pub fn get_or_add(&self, wallet_id: &str) -> Arc<PayjoinState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(wallet_id.to_owned())
            .or_default()
            .clone()
    }

    pub fn remove(&self, wallet_id: &str) -> Option<Arc<PayjoinState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).remove(wallet_id)
    }

    pub fn wallets(&self) -> Vec<(String, Arc<PayjoinState>)> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, TxIn, TxOut};

    use super::*;

    fn tx_spending(vouts: &[u32], value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vouts
                .iter()
                .map(|vout| TxIn {
                    previous_output: OutPoint { txid: Txid::all_zeros(), vout: *vout },
                    ..Default::default()
                })
                .collect(),
            output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: ScriptBuf::new() }],
        }
    }

    fn record(tx: Transaction, coin: u32, timestamp: Instant) -> RecordedItem {
        RecordedItem {
            proposed_txid: Txid::all_zeros(),
            contributed_coins: vec![OutPoint { txid: Txid::all_zeros(), vout: 100 + coin }],
            original_tx: tx,
            timestamp,
        }
    }

    #[test]
    fn detects_replays_and_conflicts() {
        let state = PayjoinState::default();
        let original = tx_spending(&[0, 1], 1000);
        assert!(state.try_record(record(original.clone(), 0, Instant::now())));
        assert!(!state.try_record(record(original.clone(), 0, Instant::now())));

        assert_eq!(state.check_original(&original), Err(OriginalConflict::Replay));
        let double_spend = tx_spending(&[1, 2], 900);
        assert!(matches!(state.check_original(&double_spend), Err(OriginalConflict::Conflict(_))));
        assert_eq!(state.check_original(&tx_spending(&[5], 900)), Ok(()));
    }

    #[test]
    fn exposed_coins_cover_every_record() {
        let state = PayjoinState::default();
        state.try_record(record(tx_spending(&[0], 1), 0, Instant::now()));
        state.try_record(record(tx_spending(&[1], 1), 1, Instant::now()));
        assert_eq!(state.exposed_coins().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_records_are_taken_once() {
        let state = PayjoinState::default();
        let old = Instant::now();
        state.try_record(record(tx_spending(&[0], 1), 0, old));
        tokio::time::advance(Duration::from_secs(240)).await;
        state.try_record(record(tx_spending(&[1], 1), 1, Instant::now()));
        tokio::time::advance(Duration::from_secs(60)).await;

        let stale = state.take_stale(Instant::now(), Duration::from_secs(300));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].timestamp, old);
        assert!(state.take_stale(Instant::now(), Duration::from_secs(300)).is_empty());
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn provider_hands_out_one_state_per_wallet() {
        let provider = PayjoinStateProvider::new();
        let a = provider.get_or_add("wallet-a");
        a.try_record(record(tx_spending(&[0], 1), 0, Instant::now()));
        assert_eq!(provider.get_or_add("wallet-a").len(), 1);
        assert!(provider.get_or_add("wallet-b").is_empty());
        assert_eq!(provider.wallets().len(), 2);
        assert!(provider.remove("wallet-a").is_some());
        assert!(provider.get_or_add("wallet-a").is_empty());
    }

    #[test]
    fn prune_removes_settled_records() {
        let state = PayjoinState::default();
        let original = tx_spending(&[3], 1);
        let txid = original.compute_txid();
        state.try_record(record(original, 0, Instant::now()));
        state.try_record(record(tx_spending(&[4], 1), 1, Instant::now()));
        let pruned = state.prune(|record| record.original_txid() == txid);
        assert_eq!(pruned.len(), 1);
        assert!(state.remove(&txid).is_none());
        assert_eq!(state.records_snapshot().len(), 1);
    }
}
