//! Turns the sender's original into a payjoin proposal.

use std::fmt;

use bitcoin::psbt::{self, Psbt};
use bitcoin::secp256k1::rand::seq::SliceRandom;
use bitcoin::secp256k1::rand::Rng;
use bitcoin::transaction::{predict_weight, InputWeightPrediction};
use bitcoin::{Amount, FeeRate, ScriptBuf, SignedAmount, TxIn, TxOut, Weight, Witness};

use super::optional_parameters::Params;
use super::wallet::{ReceivedCoin, ScriptType};
use crate::psbt::PsbtExt;

/// Decoy change is only ever rounded to multiples of at most this.
const MIN_ROUNDING_MULTIPLE: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputRole {
    Payment,
    DecoyChange,
    /// Output of the sender, by its index in the original.
    Sender(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputRole {
    Sender,
    Receiver,
}

/// An unsigned proposal along with where everything ended up after shuffling.
#[derive(Debug, Clone)]
pub(crate) struct ProposalDraft {
    pub psbt: Psbt,
    pub output_roles: Vec<OutputRole>,
    /// Receiver coins with their input index in `psbt`.
    pub contributed: Vec<(usize, ReceivedCoin)>,
    input_weights: Vec<InputWeightPrediction>,
    // sender inputs lose their UTXO data in the proposal, so the fee is tracked
    fee: Amount,
}

impl ProposalDraft {
    pub fn predicted_weight(&self) -> Weight {
        predict_weight(
            self.input_weights.iter().copied(),
            self.psbt.unsigned_tx.output.iter().map(|txo| txo.script_pubkey.len()),
        )
    }
}

/// Adds `coins` to a copy of `original` and rebalances the outputs.
///
/// The payment output grows by the contributed amount. A lone payment output
/// gets a decoy change output paying `decoy_change_script` out of the payment.
pub(crate) fn contribute_inputs<R: Rng>(
    original: &Psbt,
    payment_index: usize,
    coins: &[ReceivedCoin],
    receiver_type: ScriptType,
    decoy_change_script: Option<ScriptBuf>,
    rng: &mut R,
) -> Result<ProposalDraft, ProposalError> {
    let original_fee = original.fee().map_err(|_| ProposalError::MissingUtxoInformation)?;
    let sequence = original
        .unsigned_tx
        .input
        .choose(rng)
        .map(|txin| txin.sequence)
        .ok_or(ProposalError::NoSenderInputs)?;
    let contributed: Amount = coins.iter().map(|coin| coin.txout.value).sum();

    let mut inputs: Vec<(InputRole, InputWeightPrediction, TxIn, Option<ReceivedCoin>)> =
        original
            .input_pairs()
            .map(|input| {
                (InputRole::Sender, input.finalized_weight_prediction(), input.txin.clone(), None)
            })
            .collect();
    for coin in coins {
        let txin = TxIn {
            previous_output: coin.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        };
        let weight = receiver_type.weight_prediction();
        inputs.push((InputRole::Receiver, weight, txin, Some(coin.clone())));
    }

    let mut outputs: Vec<(OutputRole, TxOut)> = original
        .unsigned_tx
        .output
        .iter()
        .enumerate()
        .map(|(index, txo)| {
            let role = if index == payment_index {
                OutputRole::Payment
            } else {
                OutputRole::Sender(index)
            };
            (role, txo.clone())
        })
        .collect();
    let payment = outputs.get_mut(payment_index).ok_or(ProposalError::MissingPayment)?;
    payment.1.value += contributed;

    if outputs.len() == 1 {
        if let Some(script) = decoy_change_script {
            let decoy = decoy_change_value(contributed, &script, rng);
            if decoy < contributed {
                log::trace!("adding a decoy change output of {decoy}");
                outputs[0].1.value -= decoy;
                let decoy = TxOut { value: decoy, script_pubkey: script };
                outputs.push((OutputRole::DecoyChange, decoy));
            }
        }
    }

    inputs.shuffle(rng);
    outputs.shuffle(rng);

    let mut tx = original.unsigned_tx.clone();
    tx.input = inputs
        .iter()
        .map(|(_, _, txin, _)| TxIn {
            script_sig: ScriptBuf::new(),
            witness: Witness::default(),
            ..txin.clone()
        })
        .collect();
    tx.output = outputs.iter().map(|(_, txo)| txo.clone()).collect();

    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(ProposalError::Psbt)?;
    let mut contributed_coins = Vec::with_capacity(coins.len());
    for (index, (role, _, _, coin)) in inputs.iter().enumerate() {
        if let (InputRole::Receiver, Some(coin)) = (role, coin) {
            psbt.inputs[index] =
                psbt::Input { witness_utxo: Some(coin.txout.clone()), ..Default::default() };
            contributed_coins.push((index, coin.clone()));
        }
    }

    Ok(ProposalDraft {
        psbt,
        output_roles: outputs.iter().map(|(role, _)| *role).collect(),
        contributed: contributed_coins,
        input_weights: inputs.iter().map(|(_, weight, _, _)| *weight).collect(),
        fee: original_fee,
    })
}

/// A random fraction of `contributed`, coarsely rounded so it looks like change.
fn decoy_change_value<R: Rng>(contributed: Amount, script: &ScriptBuf, rng: &mut R) -> Amount {
    let mut value = match contributed.to_sat() {
        0 => 0,
        sats => rng.gen::<u64>() % sats,
    };
    if value > 0 {
        let mut multiple = 10u64.pow(value.ilog10());
        while multiple > MIN_ROUNDING_MULTIPLE {
            if rng.gen_bool(0.5) {
                multiple /= 10;
            } else {
                value = value / multiple * multiple;
                break;
            }
        }
    }
    let dust = script.minimal_non_dust();
    Amount::from_sat(value).max(dust)
}

/// Fee split after preserving the original fee rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FeeContribution {
    pub receiver: Amount,
    pub sender: Amount,
    pub fee_rate: FeeRate,
}

/// Lowers outputs so the proposal pays at least `original_fee_rate`.
///
/// Receiver outputs pay while the invoice is overpaid, then the sender's
/// outputs pay. Neither goes below dust. With output substitution disabled the
/// receiver outputs are left alone. A remaining shortfall is accepted only
/// while the fee rate stays at or above the sender's `minfeerate`, or
/// `min_relay_fee_rate` when the sender gave none.
pub(crate) fn preserve_fee_rate(
    draft: &mut ProposalDraft,
    original_fee_rate: FeeRate,
    due: SignedAmount,
    params: &Params,
    min_relay_fee_rate: FeeRate,
) -> Result<FeeContribution, ProposalError> {
    let weight = draft.predicted_weight();
    let expected_fee = fee_for(original_fee_rate, weight);
    let actual_fee = draft.fee;
    let mut additional = expected_fee.checked_sub(actual_fee).unwrap_or(Amount::ZERO);
    log::trace!(
        "original fee rate {original_fee_rate:#}, expected fee {expected_fee}, actual fee {actual_fee}"
    );

    let mut contribution =
        FeeContribution { receiver: Amount::ZERO, sender: Amount::ZERO, fee_rate: FeeRate::ZERO };
    let mut overpaid = if due < SignedAmount::ZERO && !params.disable_output_substitution {
        (-due).to_unsigned().unwrap_or(Amount::ZERO)
    } else {
        Amount::ZERO
    };
    for (index, role) in draft.output_roles.iter().enumerate() {
        if additional == Amount::ZERO || overpaid == Amount::ZERO {
            break;
        }
        if matches!(role, OutputRole::Payment | OutputRole::DecoyChange) {
            let output = &mut draft.psbt.unsigned_tx.output[index];
            let take = take_above_dust(output, additional.min(overpaid));
            additional -= take;
            overpaid -= take;
            contribution.receiver += take;
        }
    }

    let sender_outputs: Vec<(usize, Amount)> = match params.additional_fee_contribution {
        Some((max, original_index)) => draft
            .output_roles
            .iter()
            .position(|role| *role == OutputRole::Sender(original_index))
            .map(|index| vec![(index, max)])
            .unwrap_or_default(),
        None => draft
            .output_roles
            .iter()
            .enumerate()
            .filter(|(_, role)| matches!(role, OutputRole::Sender(_)))
            .map(|(index, _)| (index, Amount::MAX))
            .collect(),
    };
    for (index, cap) in sender_outputs {
        if additional == Amount::ZERO {
            break;
        }
        let output = &mut draft.psbt.unsigned_tx.output[index];
        let take = take_above_dust(output, additional.min(cap));
        additional -= take;
        contribution.sender += take;
    }

    let fee = actual_fee + contribution.receiver + contribution.sender;
    contribution.fee_rate = fee_rate_of(fee, weight);
    if additional > Amount::ZERO {
        let floor = params.min_fee_rate.unwrap_or(min_relay_fee_rate);
        log::trace!(
            "fee shortfall of {additional}, fee rate {:#} vs floor {floor:#}",
            contribution.fee_rate
        );
        if contribution.fee_rate < floor {
            return Err(ProposalError::NotEnoughMoney { fee_rate: contribution.fee_rate, floor });
        }
    }
    draft.fee = fee;
    Ok(contribution)
}

fn take_above_dust(output: &mut TxOut, wanted: Amount) -> Amount {
    let spendable =
        output.value.checked_sub(output.script_pubkey.minimal_non_dust()).unwrap_or(Amount::ZERO);
    let take = wanted.min(spendable);
    output.value -= take;
    take
}

/// The fee `fee_rate` asks for `weight`, rounded up.
pub(crate) fn fee_for(fee_rate: FeeRate, weight: Weight) -> Amount {
    let sats = (fee_rate.to_sat_per_kwu() * weight.to_wu()).div_ceil(1000);
    Amount::from_sat(sats)
}

/// The fee rate `fee` pays for `weight`, rounded down.
pub(crate) fn fee_rate_of(fee: Amount, weight: Weight) -> FeeRate {
    match weight.to_wu() {
        0 => FeeRate::ZERO,
        wu => FeeRate::from_sat_per_kwu(fee.to_sat().saturating_mul(1000) / wu),
    }
}

#[derive(Debug)]
pub(crate) enum ProposalError {
    MissingUtxoInformation,
    NoSenderInputs,
    MissingPayment,
    Psbt(psbt::Error),
    NotEnoughMoney { fee_rate: FeeRate, floor: FeeRate },
}

impl fmt::Display for ProposalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingUtxoInformation => write!(f, "the original is missing UTXO information"),
            Self::NoSenderInputs => write!(f, "the original has no inputs"),
            Self::MissingPayment => write!(f, "the payment output does not exist"),
            Self::Psbt(e) => write!(f, "could not build the proposal: {e}"),
            Self::NotEnoughMoney { fee_rate, floor } => write!(
                f,
                "the proposal fee rate {fee_rate:#} would fall below {floor:#}"
            ),
        }
    }
}

impl std::error::Error for ProposalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Psbt(e) => Some(e),
            _ => None,
        }
    }
}
