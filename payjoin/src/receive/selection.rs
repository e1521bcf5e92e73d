use std::cmp::Ordering;
use std::collections::HashSet;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::rand::{self, Rng};
use bitcoin::{Amount, OutPoint};

use super::lock::UtxoLocks;
use super::wallet::ReceivedCoin;

/// Upper bound on lock attempts for one selection.
pub(crate) const MAX_SELECTION_ATTEMPTS: usize = 30;

/// Orders coins by their txid blinded with a value drawn once per process.
///
/// The order is stable for the lifetime of the value but unpredictable to
/// anyone watching the chain.
#[derive(Debug, Clone)]
pub struct UtxoOrdering {
    blind: [u8; 32],
}

impl UtxoOrdering {
    pub fn new() -> Self { Self::with_blind(rand::thread_rng().gen()) }

    pub fn with_blind(blind: [u8; 32]) -> Self { UtxoOrdering { blind } }

    fn blinded(&self, outpoint: &OutPoint) -> [u8; 32] {
        let mut bytes = outpoint.txid.to_byte_array();
        bytes.iter_mut().zip(self.blind).for_each(|(byte, blind)| *byte ^= blind);
        bytes
    }

    /// Larger blinded txids first, then by output index.
    pub fn compare(&self, a: &OutPoint, b: &OutPoint) -> Ordering {
        self.blinded(b).cmp(&self.blinded(a)).then(a.vout.cmp(&b.vout))
    }

    pub fn sort(&self, coins: &mut [ReceivedCoin]) {
        coins.sort_by(|a, b| self.compare(&a.outpoint, &b.outpoint));
    }
}

impl Default for UtxoOrdering {
    fn default() -> Self { Self::new() }
}

/// Picks one coin from `candidates`, in order, and locks it.
///
/// Coins that would make the payment output obvious through the unnecessary
/// input heuristic are tried only once every other coin was tried.
pub(crate) fn select_utxo(
    candidates: &[ReceivedCoin],
    locks: &UtxoLocks,
    payment: Amount,
    other_outputs: &[Amount],
) -> Option<ReceivedCoin> {
    let others_total: Amount = other_outputs.iter().copied().sum();
    let reveals_payment = |coin: &ReceivedCoin| {
        let value = coin.txout.value;
        other_outputs.iter().any(|other| value > *other) || value > payment + others_total
    };

    let mut attempts = 0;
    let mut failed: HashSet<OutPoint> = HashSet::new();
    for coin in candidates.iter().filter(|coin| !reveals_payment(coin)) {
        if attempts >= MAX_SELECTION_ATTEMPTS {
            return None;
        }
        attempts += 1;
        if locks.try_lock(coin.outpoint) {
            log::trace!("selected {} avoiding the unnecessary input heuristic", coin.outpoint);
            return Some(coin.clone());
        }
        failed.insert(coin.outpoint);
    }
    for coin in candidates.iter().filter(|coin| !failed.contains(&coin.outpoint)) {
        if attempts >= MAX_SELECTION_ATTEMPTS {
            return None;
        }
        attempts += 1;
        if locks.try_lock(coin.outpoint) {
            log::trace!("selected {}", coin.outpoint);
            return Some(coin.clone());
        }
    }
    None
}
