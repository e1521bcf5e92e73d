use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::psbt::{self, Psbt};
use bitcoin::secp256k1::{rand, Secp256k1};
use bitcoin::{Amount, FeeRate, Network, OutPoint, Transaction, Txid};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::broadcast::{DelayedBroadcaster, DEFAULT_BROADCAST_DELAY};
use super::error::{Cancelled, Error};
use super::lock::UtxoLocks;
use super::proposal::{contribute_inputs, fee_rate_of, preserve_fee_rate, ProposalError};
use super::request::{Headers, OriginalPayload, OriginalRequest};
use super::selection::{select_utxo, UtxoOrdering};
use super::sign::{sender_uses_low_r, sign_receiver_inputs};
use super::state::{OriginalConflict, PayjoinStateProvider, RecordedItem};
use super::wallet::{
    remaining_due, tracking_key, ChainPaymentMethod, Explorer, InvoiceRepository,
    PayjoinInformation, PaymentRecord, ScriptType, PAYJOIN_CONFIRMATION_SENTINEL,
};
use crate::error_codes::ErrorCode;
use crate::psbt::PsbtExt;

/// Settings of one payjoin endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub crypto_code: String,
    pub network: Network,
    pub broadcast_delay: Duration,
    pub min_relay_fee_rate: FeeRate,
}

impl EndpointConfig {
    pub fn new(crypto_code: impl Into<String>, network: Network) -> Self {
        EndpointConfig {
            crypto_code: crypto_code.into().to_uppercase(),
            network,
            broadcast_delay: DEFAULT_BROADCAST_DELAY,
            min_relay_fee_rate: FeeRate::BROADCAST_MIN,
        }
    }
}

/// The proposal handed back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayjoinProposal {
    body: String,
    txid: Txid,
    invoice_id: String,
}

impl PayjoinProposal {
    /// The proposal in the encoding the original came in.
    pub fn body(&self) -> &str { &self.body }

    pub fn txid(&self) -> Txid { self.txid }

    pub fn invoice_id(&self) -> &str { &self.invoice_id }
}

/// What one request holds and must give back if it fails.
#[derive(Debug, Default)]
struct SubmitContext {
    locked_inputs: Vec<OutPoint>,
    locked_coins: Vec<OutPoint>,
    /// Set once the original passed the mempool check.
    original_tx: Option<Transaction>,
}

/// The BIP78 receiver endpoint of a merchant.
///
/// One instance serves every request of the process. UTXO locks and
/// in-flight state are shared through it.
pub struct PayjoinEndpoint {
    config: EndpointConfig,
    explorer: Arc<dyn Explorer>,
    invoices: Arc<dyn InvoiceRepository>,
    locks: Arc<UtxoLocks>,
    states: Arc<PayjoinStateProvider>,
    ordering: UtxoOrdering,
    broadcaster: DelayedBroadcaster,
}

impl PayjoinEndpoint {
    pub fn new(
        config: EndpointConfig,
        explorer: Arc<dyn Explorer>,
        invoices: Arc<dyn InvoiceRepository>,
    ) -> Self {
        PayjoinEndpoint {
            config,
            broadcaster: DelayedBroadcaster::new(explorer.clone()),
            explorer,
            invoices,
            locks: Arc::new(UtxoLocks::new()),
            states: Arc::new(PayjoinStateProvider::new()),
            ordering: UtxoOrdering::new(),
        }
    }

    pub fn with_ordering(mut self, ordering: UtxoOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn locks(&self) -> Arc<UtxoLocks> { self.locks.clone() }

    pub fn states(&self) -> Arc<PayjoinStateProvider> { self.states.clone() }

    pub fn explorer(&self) -> Arc<dyn Explorer> { self.explorer.clone() }

    /// Handles `POST /{crypto_code}/bip78`.
    ///
    /// Whatever happens after the original passed the mempool check, either a
    /// proposal is returned or the original is broadcast.
    pub async fn submit(
        &self,
        crypto_code: &str,
        body: impl Read,
        query: &str,
        headers: impl Headers,
        cancel: CancellationToken,
    ) -> Result<PayjoinProposal, Error> {
        let request = OriginalRequest::from_request(body, query, headers).map_err(|e| {
            log::debug!("Rejected request: {e}");
            Error::from(e)
        })?;

        let mut ctx = SubmitContext::default();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Implementation(Box::new(Cancelled))),
            result = self.process(crypto_code, request, &mut ctx) => result,
        };
        match result {
            Ok(proposal) => {
                log::info!("Payjoin proposal {} for invoice {}", proposal.txid, proposal.invoice_id);
                Ok(proposal)
            }
            Err(e) => {
                log::debug!("Payjoin failed: {e}");
                self.cleanup(ctx).await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        crypto_code: &str,
        request: OriginalRequest,
        ctx: &mut SubmitContext,
    ) -> Result<PayjoinProposal, Error> {
        if !crypto_code.eq_ignore_ascii_case(&self.config.crypto_code) {
            return Err(Error::rejected(
                ErrorCode::InvalidNetwork,
                format!("This endpoint only serves {}", self.config.crypto_code),
            ));
        }

        let OriginalRequest { payload, format, params } = request;
        let psbt = match payload {
            OriginalPayload::Psbt(psbt) => {
                if !psbt.is_all_finalized() {
                    return Err(Error::rejected(
                        ErrorCode::PsbtNotFinalized,
                        "The PSBT should be finalized",
                    ));
                }
                psbt
            }
            OriginalPayload::Transaction(tx) => self.psbt_from_transaction(tx).await?,
        };

        let sender_type = check_original(&psbt)?;
        let original_tx = psbt.clone().extract_tx_unchecked_fee_rate();
        let original_fee = psbt.fee().map_err(|_| {
            Error::rejected(ErrorCode::NeedUtxoInformation, "Cannot compute the fee")
        })?;
        let original_fee_rate = fee_rate_of(original_fee, original_tx.weight());

        let mempool_check =
            self.explorer.broadcast(&original_tx, true).await.map_err(Error::Implementation)?;
        if !mempool_check.accepted {
            return Err(Error::rejected(
                ErrorCode::InvalidTransaction,
                mempool_check.reject_reason.unwrap_or_else(|| "Rejected by the mempool".to_owned()),
            ));
        }
        ctx.original_tx = Some(original_tx.clone());

        let (invoice_id, payment_index, method) =
            self.find_payment(&original_tx, sender_type).await?;
        let payment_output = &original_tx.output[payment_index];
        let due = remaining_due(method.due, payment_output.value);
        if due > bitcoin::SignedAmount::ZERO {
            return Err(Error::rejected(
                ErrorCode::InvoiceNotFullyPaid,
                "The transaction must pay the whole invoice",
            ));
        }

        let sender_inputs: Vec<OutPoint> =
            original_tx.input.iter().map(|txin| txin.previous_output).collect();
        if !self.locks.try_lock_inputs(&sender_inputs) {
            return Err(Error::rejected(
                ErrorCode::InputsAlreadyUsed,
                "Some of those inputs have already been used to make another payjoin transaction",
            ));
        }
        ctx.locked_inputs = sender_inputs.clone();

        let state = self.states.get_or_add(&method.derivation.wallet_id);
        if let Err(conflict) = state.check_original(&original_tx) {
            let message = match conflict {
                OriginalConflict::Replay => "This transaction was already coordinated".to_owned(),
                OriginalConflict::Conflict(outpoint) =>
                    format!("{outpoint} is already used by another payjoin"),
            };
            return Err(Error::rejected(ErrorCode::InputsAlreadyUsed, message));
        }

        let exposed = state.exposed_coins();
        let mut candidates: Vec<_> = self
            .explorer
            .list_unspent(&method.derivation)
            .await
            .map_err(Error::Implementation)?
            .into_iter()
            .filter(|coin| {
                !sender_inputs.contains(&coin.outpoint) && !exposed.contains(&coin.outpoint)
            })
            .collect();
        self.ordering.sort(&mut candidates);
        let other_outputs: Vec<Amount> = original_tx
            .output
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != payment_index)
            .map(|(_, txo)| txo.value)
            .collect();
        let coin = select_utxo(&candidates, &self.locks, payment_output.value, &other_outputs)
            .ok_or_else(|| {
                Error::rejected(
                    ErrorCode::OutOfUtxos,
                    "We do not have any UTXO available for making a payjoin for now",
                )
            })?;
        ctx.locked_coins.push(coin.outpoint);

        let decoy_change_script = if original_tx.output.len() == 1 {
            Some(
                self.explorer
                    .unused_change_script(&method.derivation)
                    .await
                    .map_err(Error::Implementation)?,
            )
        } else {
            None
        };

        let mut draft = contribute_inputs(
            &psbt,
            payment_index,
            std::slice::from_ref(&coin),
            method.derivation.script_type,
            decoy_change_script,
            &mut rand::thread_rng(),
        )
        .map_err(proposal_rejection)?;
        let contribution = preserve_fee_rate(
            &mut draft,
            original_fee_rate,
            due,
            &params,
            self.config.min_relay_fee_rate,
        )
        .map_err(proposal_rejection)?;
        log::debug!(
            "Fee rate {:#} preserved with {} from the receiver and {} from the sender",
            contribution.fee_rate,
            contribution.receiver,
            contribution.sender
        );

        let account_key = self
            .explorer
            .signing_key(&method.derivation)
            .await
            .map_err(Error::Implementation)?
            .ok_or_else(|| {
                Error::rejected(ErrorCode::Unavailable, "The merchant wallet cannot sign payjoins")
            })?;
        let secp = Secp256k1::signing_only();
        sign_receiver_inputs(
            &secp,
            &mut draft.psbt,
            &draft.contributed,
            &account_key,
            method.derivation.script_type,
            sender_uses_low_r(&psbt),
        )
        .map_err(|e| Error::Implementation(Box::new(e)))?;

        let proposal_tx = draft.psbt.clone().extract_tx_unchecked_fee_rate();
        let proposed_txid = proposal_tx.compute_txid();
        let contributed_outpoints: Vec<OutPoint> =
            draft.contributed.iter().map(|(_, coin)| coin.outpoint).collect();
        let payment = PaymentRecord {
            outpoint: OutPoint { txid: original_tx.compute_txid(), vout: payment_index as u32 },
            output: payment_output.clone(),
            confirmation_count: PAYJOIN_CONFIRMATION_SENTINEL,
            payjoin: Some(PayjoinInformation {
                proposed_txid,
                coinjoin_value: payment_output
                    .value
                    .checked_sub(contribution.receiver)
                    .unwrap_or(Amount::ZERO),
                contributed_outpoints: contributed_outpoints.clone(),
            }),
        };
        let recorded =
            self.invoices.add_payment(&invoice_id, payment).await.map_err(Error::Implementation)?;
        if recorded.is_none() {
            return Err(Error::rejected(ErrorCode::AlreadyPaid, "The invoice is already paid"));
        }

        self.broadcaster.schedule(original_tx.clone(), self.config.broadcast_delay);
        state.try_record(RecordedItem {
            original_tx,
            proposed_txid,
            contributed_coins: contributed_outpoints,
            timestamp: Instant::now(),
        });

        // the delayed broadcast owns the fallback from here, and the locks stay
        ctx.original_tx = None;
        ctx.locked_inputs.clear();
        ctx.locked_coins.clear();

        let response = finalize_sender_inputs(draft.psbt);
        Ok(PayjoinProposal { body: format.encode(&response), txid: proposed_txid, invoice_id })
    }

    async fn psbt_from_transaction(&self, tx: Transaction) -> Result<Psbt, Error> {
        let previous =
            self.explorer.fetch_previous_outputs(&tx).await.map_err(Error::Implementation)?;
        let mut unsigned = tx.clone();
        for txin in &mut unsigned.input {
            txin.script_sig = bitcoin::ScriptBuf::new();
            txin.witness = bitcoin::Witness::default();
        }
        let mut psbt = Psbt::from_unsigned_tx(unsigned).map_err(|e| {
            Error::rejected(ErrorCode::InvalidFormat, format!("Invalid transaction: {e}"))
        })?;
        for ((input, txin), txout) in psbt.inputs.iter_mut().zip(&tx.input).zip(previous) {
            input.witness_utxo = txout;
            if !txin.script_sig.is_empty() {
                input.final_script_sig = Some(txin.script_sig.clone());
            }
            if !txin.witness.is_empty() {
                input.final_script_witness = Some(txin.witness.clone());
            }
        }
        Ok(psbt)
    }

    /// Finds the first output paying a payjoin enabled invoice.
    async fn find_payment(
        &self,
        original_tx: &Transaction,
        sender_type: ScriptType,
    ) -> Result<(String, usize, ChainPaymentMethod), Error> {
        for (index, output) in original_tx.output.iter().enumerate() {
            let key = tracking_key(&output.script_pubkey, &self.config.crypto_code);
            let invoice_ids =
                self.invoices.find_invoices(&key).await.map_err(Error::Implementation)?;
            for invoice_id in invoice_ids {
                let Some(method) = self
                    .invoices
                    .payment_method(&invoice_id, &self.config.crypto_code)
                    .await
                    .map_err(Error::Implementation)?
                else {
                    continue;
                };
                if !method.payjoin_enabled || method.deposit_script != output.script_pubkey {
                    continue;
                }
                if method.derivation.script_type != sender_type {
                    return Err(Error::rejected(
                        ErrorCode::OutOfUtxos,
                        "We do not have any UTXO available for making a payjoin with the sender's inputs type",
                    ));
                }
                if method.has_payments {
                    return Err(Error::rejected(
                        ErrorCode::AlreadyPaid,
                        "The invoice this PSBT is paying has already been partially or completely paid",
                    ));
                }
                return Ok((invoice_id, index, method));
            }
        }
        Err(Error::rejected(
            ErrorCode::InvoiceNotFound,
            "This transaction does not pay any invoice with payjoin",
        ))
    }

    /// Releases what `ctx` holds and falls back to the original. Never fails.
    async fn cleanup(&self, ctx: SubmitContext) {
        self.locks.unlock_inputs(&ctx.locked_inputs);
        self.locks.unlock(&ctx.locked_coins);
        if let Some(original_tx) = ctx.original_tx {
            let txid = original_tx.compute_txid();
            match self.explorer.broadcast(&original_tx, false).await {
                Ok(result) if result.accepted => log::debug!("Broadcast original {txid}"),
                Ok(result) => log::warn!(
                    "Original {txid} not relayed: {}",
                    result.reject_reason.unwrap_or_default()
                ),
                Err(e) => log::error!("Failed to broadcast original {txid}: {e}"),
            }
        }
    }
}

/// Structural checks on the original. Returns the sender's input type.
fn check_original(psbt: &Psbt) -> Result<ScriptType, Error> {
    let mut types = psbt.input_pairs().map(|input| ScriptType::of_input(&input));
    let sender_type = match types.next() {
        Some(Some(first)) if types.all(|kind| kind == Some(first)) => first,
        _ =>
            return Err(Error::rejected(
                ErrorCode::UnsupportedInputs,
                "Payjoin only supports P2WPKH, P2SH-P2WPKH and P2PKH inputs of a single type",
            )),
    };
    let psbt = psbt.clone().validate().map_err(|e| Error::rejected(ErrorCode::InsanePsbt, e))?;
    psbt.check_sanity().map_err(|e| Error::rejected(ErrorCode::InsanePsbt, e))?;
    psbt.validate_input_utxos()
        .map_err(|e| Error::rejected(ErrorCode::NeedUtxoInformation, e))?;
    psbt.fee().map_err(|e| Error::rejected(ErrorCode::NeedUtxoInformation, e))?;
    if psbt.has_leaking_data() {
        return Err(Error::rejected(
            ErrorCode::LeakingData,
            "Keypath information should not be included in the original PSBT",
        ));
    }
    if !psbt.is_all_finalized() {
        return Err(Error::rejected(ErrorCode::PsbtNotFinalized, "The PSBT should be finalized"));
    }
    Ok(sender_type)
}

/// The sender signs their inputs again, so they get a blank slate.
fn finalize_sender_inputs(mut proposal: Psbt) -> Psbt {
    for input in &mut proposal.inputs {
        if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
            *input = psbt::Input::default();
        }
    }
    proposal
}

fn proposal_rejection(e: ProposalError) -> Error {
    match e {
        ProposalError::NotEnoughMoney { .. } => Error::rejected(
            ErrorCode::NotEnoughMoney,
            "Not enough money is sent to pay for the additional payjoin inputs",
        ),
        ProposalError::MissingUtxoInformation =>
            Error::rejected(ErrorCode::NeedUtxoInformation, e),
        e => Error::Implementation(Box::new(e)),
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::bip32::{DerivationPath, Fingerprint};
    use payjoin_test_utils::{keypair, sender_psbt, SenderFixture};

    use super::*;

    #[test]
    fn accepts_a_plain_original() {
        let psbt = sender_psbt(&SenderFixture::default());
        assert_eq!(check_original(&psbt).unwrap(), ScriptType::Segwit);
    }

    fn rejection(psbt: &Psbt) -> ErrorCode { check_original(psbt).unwrap_err().reply().error_code() }

    #[test]
    fn rejects_structural_problems_in_order() {
        let original = sender_psbt(&SenderFixture::default());

        let mut missing_utxo = original.clone();
        missing_utxo.inputs[0].witness_utxo = None;
        assert_eq!(rejection(&missing_utxo), ErrorCode::UnsupportedInputs);

        let mut leaking = original.clone();
        let (_, pubkey) = keypair(3);
        leaking.inputs[0]
            .bip32_derivation
            .insert(pubkey.0, (Fingerprint::default(), DerivationPath::master()));
        assert_eq!(rejection(&leaking), ErrorCode::LeakingData);

        let mut not_final = original.clone();
        not_final.inputs[0].final_script_witness = None;
        assert_eq!(rejection(&not_final), ErrorCode::PsbtNotFinalized);

        let mut insane = original.clone();
        insane.outputs.push(Default::default());
        assert_eq!(rejection(&insane), ErrorCode::InsanePsbt);
    }

    #[test]
    fn amounts_beyond_the_money_supply_are_rejected() {
        let mut psbt = sender_psbt(&SenderFixture::default());
        let mut second = psbt.unsigned_tx.input[0].clone();
        second.previous_output.vout += 1;
        psbt.unsigned_tx.input.push(second);
        psbt.inputs.push(psbt.inputs[0].clone());
        for input in &mut psbt.inputs {
            input.witness_utxo.as_mut().unwrap().value = Amount::from_sat(u64::MAX / 2 + 1);
        }

        let reply = check_original(&psbt).unwrap_err().reply();
        assert_eq!(reply.error_code(), ErrorCode::InsanePsbt);
        assert_eq!(reply.status_code(), 400);
    }

    #[test]
    fn sender_inputs_are_cleared() {
        let mut psbt = sender_psbt(&SenderFixture::default());
        psbt.inputs[0].final_script_witness = None;
        let cleared = finalize_sender_inputs(psbt);
        assert_eq!(cleared.inputs[0], psbt::Input::default());
    }
}
