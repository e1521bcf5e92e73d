//! Utilities to make work with PSBTs easier

use std::collections::HashSet;
use std::fmt;

use bitcoin::address::FromScriptError;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::InputWeightPrediction;
use bitcoin::{psbt, Address, AddressType, Amount, Network, Script, TxIn, TxOut};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InconsistentPsbt {
    UnequalInputCounts { tx_ins: usize, psbt_ins: usize },
    UnequalOutputCounts { tx_outs: usize, psbt_outs: usize },
    DuplicateInput(bitcoin::OutPoint),
    NegativeFee { inputs: Amount, outputs: Amount },
    ValueOutOfRange,
    NoOutputs,
}

impl fmt::Display for InconsistentPsbt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InconsistentPsbt::UnequalInputCounts { tx_ins, psbt_ins, } => write!(f, "The number of PSBT inputs ({psbt_ins}) doesn't equal to the number of unsigned transaction inputs ({tx_ins})"),
            InconsistentPsbt::UnequalOutputCounts { tx_outs, psbt_outs, } => write!(f, "The number of PSBT outputs ({psbt_outs}) doesn't equal to the number of unsigned transaction outputs ({tx_outs})"),
            InconsistentPsbt::DuplicateInput(outpoint) => write!(f, "{outpoint} is spent twice"),
            InconsistentPsbt::NegativeFee { inputs, outputs } => write!(f, "outputs ({outputs}) exceed inputs ({inputs})"),
            InconsistentPsbt::ValueOutOfRange => write!(f, "the amounts exceed the money supply"),
            InconsistentPsbt::NoOutputs => write!(f, "the transaction has no outputs"),
        }
    }
}

impl std::error::Error for InconsistentPsbt {}

/// Our Psbt type for validation and utilities
pub(crate) trait PsbtExt: Sized {
    fn input_pairs(&self) -> Box<dyn Iterator<Item = InternalInputPair<'_>> + '_>;
    // guarantees that length of psbt input matches that of unsigned_tx inputs and same
    /// thing for outputs.
    fn validate(self) -> Result<Self, InconsistentPsbt>;
    fn validate_input_utxos(&self) -> Result<(), PsbtInputsError>;
    /// Structural checks beyond input/output counts. Inputs without UTXO
    /// data are skipped by the value check. Input and output totals must each
    /// stay within [`Amount::MAX_MONEY`].
    fn check_sanity(&self) -> Result<(), InconsistentPsbt>;
    /// True when every input carries a final scriptSig or witness.
    fn is_all_finalized(&self) -> bool;
    /// True when global xpubs or any key origin would be revealed to the receiver.
    fn has_leaking_data(&self) -> bool;
}

impl PsbtExt for Psbt {
    fn input_pairs(&self) -> Box<dyn Iterator<Item = InternalInputPair<'_>> + '_> {
        Box::new(
            self.unsigned_tx
                .input
                .iter()
                .zip(&self.inputs)
                .map(|(txin, psbtin)| InternalInputPair { txin, psbtin }),
        )
    }

    fn validate(self) -> Result<Self, InconsistentPsbt> {
        let tx_ins = self.unsigned_tx.input.len();
        let psbt_ins = self.inputs.len();
        let tx_outs = self.unsigned_tx.output.len();
        let psbt_outs = self.outputs.len();

        if psbt_ins != tx_ins {
            Err(InconsistentPsbt::UnequalInputCounts { tx_ins, psbt_ins })
        } else if psbt_outs != tx_outs {
            Err(InconsistentPsbt::UnequalOutputCounts { tx_outs, psbt_outs })
        } else {
            Ok(self)
        }
    }

    fn validate_input_utxos(&self) -> Result<(), PsbtInputsError> {
        self.input_pairs().enumerate().try_for_each(|(index, input)| {
            input.validate_utxo().map_err(|error| PsbtInputsError { index, error })
        })
    }

    fn check_sanity(&self) -> Result<(), InconsistentPsbt> {
        if self.unsigned_tx.output.is_empty() {
            return Err(InconsistentPsbt::NoOutputs);
        }
        let mut seen = HashSet::new();
        for txin in &self.unsigned_tx.input {
            if !seen.insert(txin.previous_output) {
                return Err(InconsistentPsbt::DuplicateInput(txin.previous_output));
            }
        }
        let mut all_known = true;
        let mut inputs = Amount::ZERO;
        for input in self.input_pairs() {
            match input.previous_txout() {
                Ok(txo) => inputs = add_money(inputs, txo.value)?,
                Err(_) => all_known = false,
            }
        }
        let outputs = self
            .unsigned_tx
            .output
            .iter()
            .try_fold(Amount::ZERO, |sum, txo| add_money(sum, txo.value))?;
        if all_known && outputs > inputs {
            return Err(InconsistentPsbt::NegativeFee { inputs, outputs });
        }
        Ok(())
    }

    fn is_all_finalized(&self) -> bool {
        self.inputs.iter().all(|input| {
            input.final_script_sig.as_ref().is_some_and(|s| !s.is_empty())
                || input.final_script_witness.as_ref().is_some_and(|w| !w.is_empty())
        })
    }

    fn has_leaking_data(&self) -> bool {
        !self.xpub.is_empty()
            || self
                .inputs
                .iter()
                .any(|i| !i.bip32_derivation.is_empty() || !i.tap_key_origins.is_empty())
            || self
                .outputs
                .iter()
                .any(|o| !o.bip32_derivation.is_empty() || !o.tap_key_origins.is_empty())
    }
}

fn add_money(sum: Amount, value: Amount) -> Result<Amount, InconsistentPsbt> {
    sum.checked_add(value)
        .filter(|total| *total <= Amount::MAX_MONEY)
        .ok_or(InconsistentPsbt::ValueOutOfRange)
}

// input script: 0x160014{20-byte-key-hash} = 23 bytes
// witness: <signature> <pubkey> = 72, 33 bytes
// https://github.com/bitcoin/bips/blob/master/bip-0141.mediawiki#p2wpkh-nested-in-bip16-p2sh
pub(crate) const NESTED_P2WPKH_MAX: InputWeightPrediction =
    InputWeightPrediction::from_slice(23, &[72, 33]);

#[derive(Clone, Debug)]
pub(crate) struct InternalInputPair<'a> {
    pub txin: &'a TxIn,
    pub psbtin: &'a psbt::Input,
}

impl InternalInputPair<'_> {
    /// Returns the [`TxOut`] associated with the input.
    pub fn previous_txout(&self) -> Result<&TxOut, PrevTxOutError> {
        match (&self.psbtin.non_witness_utxo, &self.psbtin.witness_utxo) {
            (None, None) => Err(PrevTxOutError::MissingUtxoInformation),
            (_, Some(txout)) => Ok(txout),
            (Some(tx), None) => tx
                .output
                .get::<usize>(self.txin.previous_output.vout.try_into().map_err(|_| {
                    PrevTxOutError::IndexOutOfBounds {
                        output_count: tx.output.len(),
                        index: self.txin.previous_output.vout,
                    }
                })?)
                .ok_or(PrevTxOutError::IndexOutOfBounds {
                    output_count: tx.output.len(),
                    index: self.txin.previous_output.vout,
                }),
        }
    }

    /// Validates that [`TxIn`] and the applicable UTXO field(s) of the [`psbt::Input`] refer to the same UTXO.
    pub fn validate_utxo(&self) -> Result<(), InternalPsbtInputError> {
        match (&self.psbtin.non_witness_utxo, &self.psbtin.witness_utxo) {
            (None, None) =>
                Err(InternalPsbtInputError::PrevTxOut(PrevTxOutError::MissingUtxoInformation)),
            (Some(tx), _) if tx.compute_txid() != self.txin.previous_output.txid =>
                Err(InternalPsbtInputError::UnequalTxid),
            (Some(_), None) => self.previous_txout().map(drop).map_err(Into::into),
            (None, Some(_)) => Ok(()),
            (Some(tx), Some(witness_txout)) => {
                let non_witness_txout = tx
                    .output
                    .get(self.txin.previous_output.vout as usize)
                    .ok_or(PrevTxOutError::IndexOutOfBounds {
                        output_count: tx.output.len(),
                        index: self.txin.previous_output.vout,
                    })?;
                if witness_txout == non_witness_txout {
                    Ok(())
                } else {
                    Err(InternalPsbtInputError::SegWitTxOutMismatch)
                }
            }
        }
    }

    /// Returns the scriptPubKey address type of the UTXO this input is pointing to.
    pub fn address_type(&self) -> Result<AddressType, AddressTypeError> {
        let txo = self.previous_txout()?;
        // HACK: Network doesn't matter for our use case of only getting the address type
        // but is required in the `from_script` interface. Hardcoded to mainnet.
        Address::from_script(&txo.script_pubkey, Network::Bitcoin)?
            .address_type()
            .ok_or(AddressTypeError::UnknownAddressType)
    }

    /// The redeem script of a P2SH input, from its final scriptSig or the PSBT field.
    pub fn redeem_script(&self) -> Option<&Script> {
        if let Some(ref script_sig) = self.psbtin.final_script_sig {
            script_sig.redeem_script()
        } else {
            self.psbtin.redeem_script.as_deref()
        }
    }

    /// Predicts the weight of the input from the finalized data it already carries.
    pub fn finalized_weight_prediction(&self) -> InputWeightPrediction {
        let script_sig_len = self
            .psbtin
            .final_script_sig
            .as_ref()
            .map(|s| s.len())
            .unwrap_or_else(|| self.txin.script_sig.len());
        let witness = self
            .psbtin
            .final_script_witness
            .as_ref()
            .filter(|w| !w.is_empty())
            .unwrap_or(&self.txin.witness);
        InputWeightPrediction::new(
            script_sig_len,
            witness.iter().map(|el| el.len()).collect::<Vec<_>>(),
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PrevTxOutError {
    MissingUtxoInformation,
    IndexOutOfBounds { output_count: usize, index: u32 },
}

impl fmt::Display for PrevTxOutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PrevTxOutError::MissingUtxoInformation => write!(f, "missing UTXO information"),
            PrevTxOutError::IndexOutOfBounds { output_count, index } => {
                write!(f, "index {index} out of bounds (number of outputs: {output_count})")
            }
        }
    }
}

impl std::error::Error for PrevTxOutError {}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InternalPsbtInputError {
    PrevTxOut(PrevTxOutError),
    UnequalTxid,
    /// TxOut provided in `segwit_utxo` doesn't match the one in `non_segwit_utxo`
    SegWitTxOutMismatch,
}

impl fmt::Display for InternalPsbtInputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PrevTxOut(_) => write!(f, "invalid previous transaction output"),
            Self::UnequalTxid => write!(f, "transaction ID of previous transaction doesn't match one specified in input spending it"),
            Self::SegWitTxOutMismatch => write!(f, "transaction output provided in SegWit UTXO field doesn't match the one in non-SegWit UTXO field"),
        }
    }
}

impl std::error::Error for InternalPsbtInputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PrevTxOut(error) => Some(error),
            Self::UnequalTxid => None,
            Self::SegWitTxOutMismatch => None,
        }
    }
}

impl From<PrevTxOutError> for InternalPsbtInputError {
    fn from(value: PrevTxOutError) -> Self { InternalPsbtInputError::PrevTxOut(value) }
}

#[derive(Debug, PartialEq)]
pub struct PsbtInputsError {
    index: usize,
    error: InternalPsbtInputError,
}

impl fmt::Display for PsbtInputsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid PSBT input #{}: {}", self.index, self.error)
    }
}

impl std::error::Error for PsbtInputsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { Some(&self.error) }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AddressTypeError {
    PrevTxOut(PrevTxOutError),
    InvalidScript(FromScriptError),
    UnknownAddressType,
}

impl fmt::Display for AddressTypeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PrevTxOut(_) => write!(f, "invalid previous transaction output"),
            Self::InvalidScript(_) => write!(f, "invalid script"),
            Self::UnknownAddressType => write!(f, "unknown address type"),
        }
    }
}

impl std::error::Error for AddressTypeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PrevTxOut(error) => Some(error),
            Self::InvalidScript(error) => Some(error),
            Self::UnknownAddressType => None,
        }
    }
}

impl From<PrevTxOutError> for AddressTypeError {
    fn from(value: PrevTxOutError) -> Self { Self::PrevTxOut(value) }
}

impl From<FromScriptError> for AddressTypeError {
    fn from(value: FromScriptError) -> Self { Self::InvalidScript(value) }
}

#[cfg(test)]
mod test {
    use bitcoin::bip32::{DerivationPath, Fingerprint};
    use bitcoin::{Amount, Psbt, Transaction};
    use payjoin_test_utils::{sender_psbt, SenderFixture};

    use crate::psbt::{InconsistentPsbt, InternalInputPair, InternalPsbtInputError, PsbtExt};

    fn original() -> Psbt { sender_psbt(&SenderFixture::default()) }

    #[test]
    fn validate_input_utxos() {
        let psbt = original();
        assert!(psbt.validate_input_utxos().is_ok());
        assert!(psbt.is_all_finalized());
        assert!(!psbt.has_leaking_data());
        assert!(psbt.check_sanity().is_ok());
    }

    #[test]
    fn input_pairs_unequal_txid() {
        let psbt = original();
        let txin = &psbt.unsigned_tx.input[0];
        let mut psbtin = psbt.inputs[0].clone();
        // any transaction other than the funding one
        let unrelated: Transaction = psbt.unsigned_tx.clone();
        psbtin.non_witness_utxo = Some(unrelated);

        let pair = InternalInputPair { txin, psbtin: &psbtin };
        assert_eq!(pair.validate_utxo().unwrap_err(), InternalPsbtInputError::UnequalTxid);
    }

    #[test]
    fn fee_requires_utxo_information() {
        let fixture = SenderFixture::default();
        let mut psbt = sender_psbt(&fixture);
        assert_eq!(psbt.fee().unwrap(), fixture.fee);

        psbt.inputs[0].witness_utxo = None;
        assert!(matches!(psbt.fee().unwrap_err(), bitcoin::psbt::Error::MissingUtxo));
    }

    #[test]
    fn rejects_values_beyond_the_money_supply() {
        let mut psbt = original();
        let mut second = psbt.unsigned_tx.input[0].clone();
        second.previous_output.vout += 1;
        psbt.unsigned_tx.input.push(second);
        psbt.inputs.push(psbt.inputs[0].clone());
        for input in &mut psbt.inputs {
            input.witness_utxo.as_mut().unwrap().value = Amount::from_sat(u64::MAX / 2 + 1);
        }
        assert_eq!(psbt.check_sanity().unwrap_err(), InconsistentPsbt::ValueOutOfRange);

        let mut one_huge = original();
        one_huge.inputs[0].witness_utxo.as_mut().unwrap().value =
            Amount::MAX_MONEY + Amount::from_sat(1);
        assert_eq!(one_huge.check_sanity().unwrap_err(), InconsistentPsbt::ValueOutOfRange);
    }

    #[test]
    fn detects_key_origins() {
        let mut psbt = original();
        let (_, pubkey) = payjoin_test_utils::keypair(7);
        psbt.outputs[0]
            .bip32_derivation
            .insert(pubkey.0, (Fingerprint::default(), DerivationPath::master()));
        assert!(psbt.has_leaking_data());
    }

    #[test]
    fn finalized_weight_matches_the_signed_input() {
        let psbt = original();
        let pair = psbt.input_pairs().next().unwrap();
        let predicted = pair.finalized_weight_prediction();
        let tx = psbt.clone().extract_tx_unchecked_fee_rate();
        let actual = bitcoin::transaction::predict_weight(
            [predicted],
            tx.output.iter().map(|o| o.script_pubkey.len()),
        );
        assert_eq!(actual, tx.weight());
    }

    #[test]
    fn rejects_duplicate_inputs() {
        let mut psbt = original();
        let dup = psbt.unsigned_tx.input[0].clone();
        psbt.unsigned_tx.input.push(dup);
        psbt.inputs.push(psbt.inputs[0].clone());
        assert!(psbt.check_sanity().is_err());
    }
}
