use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use bitcoin::OutPoint;

/// Process-wide soft locks on outpoints taking part in an in-flight payjoin.
///
/// Receiver coins and sender inputs are tracked in separate sets. No lock is
/// ever held across an await point.
#[derive(Debug, Default)]
pub struct UtxoLocks {
    coins: Mutex<HashSet<OutPoint>>,
    inputs: Mutex<HashSet<OutPoint>>,
}

impl UtxoLocks {
    pub fn new() -> Self { Self::default() }

    /// Locks one receiver coin. False if another request holds it.
    pub fn try_lock(&self, outpoint: OutPoint) -> bool {
        self.coins.lock().unwrap_or_else(PoisonError::into_inner).insert(outpoint)
    }

    pub fn unlock(&self, outpoints: &[OutPoint]) {
        let mut coins = self.coins.lock().unwrap_or_else(PoisonError::into_inner);
        for outpoint in outpoints {
            coins.remove(outpoint);
        }
    }

    /// Locks all sender inputs or none of them.
    pub fn try_lock_inputs(&self, outpoints: &[OutPoint]) -> bool {
        let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        if outpoints.iter().any(|outpoint| inputs.contains(outpoint)) {
            return false;
        }
        let unique: HashSet<_> = outpoints.iter().collect();
        if unique.len() != outpoints.len() {
            return false;
        }
        inputs.extend(outpoints.iter().copied());
        true
    }

    pub fn unlock_inputs(&self, outpoints: &[OutPoint]) {
        let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        for outpoint in outpoints {
            inputs.remove(outpoint);
        }
    }

    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        self.coins.lock().unwrap_or_else(PoisonError::into_inner).contains(outpoint)
    }
}
