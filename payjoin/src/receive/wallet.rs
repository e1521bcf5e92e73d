//! Seams to the receiver's wallet, the chain and the invoice store.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::transaction::InputWeightPrediction;
use bitcoin::{AddressType, Amount, OutPoint, Script, ScriptBuf, SignedAmount, Transaction, TxOut, Txid};

use crate::psbt::{InternalInputPair, NESTED_P2WPKH_MAX};
use crate::ImplementationError;

/// Input script kinds a payjoin can be coordinated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    /// P2WPKH
    Segwit,
    /// P2WPKH nested in P2SH
    SegwitP2sh,
    /// P2PKH
    Legacy,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Segwit => "segwit",
            ScriptType::SegwitP2sh => "segwit-p2sh",
            ScriptType::Legacy => "legacy",
        }
    }

    /// Worst case size of a signed input of this kind.
    pub fn weight_prediction(&self) -> InputWeightPrediction {
        match self {
            ScriptType::Segwit => InputWeightPrediction::P2WPKH_MAX,
            ScriptType::SegwitP2sh => NESTED_P2WPKH_MAX,
            ScriptType::Legacy => InputWeightPrediction::P2PKH_COMPRESSED_MAX,
        }
    }

    pub(crate) fn of_input(input: &InternalInputPair) -> Option<ScriptType> {
        match input.address_type().ok()? {
            AddressType::P2wpkh => Some(ScriptType::Segwit),
            AddressType::P2pkh => Some(ScriptType::Legacy),
            AddressType::P2sh => input
                .redeem_script()
                .filter(|script| script.is_p2wpkh())
                .map(|_| ScriptType::SegwitP2sh),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ScriptType {
    type Err = UnknownScriptType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "segwit" => Ok(ScriptType::Segwit),
            "segwit-p2sh" => Ok(ScriptType::SegwitP2sh),
            "legacy" => Ok(ScriptType::Legacy),
            other => Err(UnknownScriptType(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownScriptType(String);

impl fmt::Display for UnknownScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown script type: {}", self.0)
    }
}

impl std::error::Error for UnknownScriptType {}

/// Identifies the receiver wallet an invoice pays into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationScheme {
    pub wallet_id: String,
    pub script_type: ScriptType,
}

/// A spendable coin of the receiver wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCoin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    /// Path from the wallet's account key to the key controlling this coin.
    pub key_path: DerivationPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

impl BroadcastResult {
    pub fn accepted() -> Self { BroadcastResult { accepted: true, reject_reason: None } }

    pub fn rejected(reason: impl Into<String>) -> Self {
        BroadcastResult { accepted: false, reject_reason: Some(reason.into()) }
    }
}

/// The on-chain payment method of an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPaymentMethod {
    pub deposit_script: ScriptBuf,
    pub payjoin_enabled: bool,
    pub derivation: DerivationScheme,
    /// Total amount still due on the invoice.
    pub due: Amount,
    /// True once any payment was recorded against the invoice.
    pub has_payments: bool,
}

/// Links a payment to the payjoin proposal that superseded its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayjoinInformation {
    pub proposed_txid: Txid,
    /// Value of the payment net of the receiver's fee contribution.
    pub coinjoin_value: Amount,
    pub contributed_outpoints: Vec<OutPoint>,
}

/// A payment seen for an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub outpoint: OutPoint,
    pub output: TxOut,
    /// `-1` until the payment confirms on its own.
    pub confirmation_count: i32,
    pub payjoin: Option<PayjoinInformation>,
}

/// The confirmation count of a payment received through a payjoin proposal.
pub const PAYJOIN_CONFIRMATION_SENTINEL: i32 = -1;

/// Wallet and chain access of the receiver.
#[async_trait]
pub trait Explorer: Send + Sync {
    /// The outputs spent by each input of `tx`, in input order.
    async fn fetch_previous_outputs(
        &self,
        tx: &Transaction,
    ) -> Result<Vec<Option<TxOut>>, ImplementationError>;

    /// Relays `tx`, or only checks mempool acceptance when `test_only` is set.
    async fn broadcast(
        &self,
        tx: &Transaction,
        test_only: bool,
    ) -> Result<BroadcastResult, ImplementationError>;

    async fn list_unspent(
        &self,
        scheme: &DerivationScheme,
    ) -> Result<Vec<ReceivedCoin>, ImplementationError>;

    async fn unused_change_script(
        &self,
        scheme: &DerivationScheme,
    ) -> Result<ScriptBuf, ImplementationError>;

    /// The account key of a hot wallet. `None` when keys are not held by the server.
    async fn signing_key(
        &self,
        scheme: &DerivationScheme,
    ) -> Result<Option<Xpriv>, ImplementationError>;

    async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool, ImplementationError>;
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Ids of the invoices tracking `key`, see [`tracking_key`].
    async fn find_invoices(&self, key: &str) -> Result<Vec<String>, ImplementationError>;

    async fn payment_method(
        &self,
        invoice_id: &str,
        crypto_code: &str,
    ) -> Result<Option<ChainPaymentMethod>, ImplementationError>;

    /// Records a payment. Returns `None` if the outpoint was already recorded.
    async fn add_payment(
        &self,
        invoice_id: &str,
        payment: PaymentRecord,
    ) -> Result<Option<PaymentRecord>, ImplementationError>;
}

/// The key an invoice tracks a deposit script under: `{scriptHash}#{CRYPTOCODE}`.
pub fn tracking_key(script_pubkey: &Script, crypto_code: &str) -> String {
    let hash = hash160::Hash::hash(script_pubkey.as_bytes());
    format!("{hash}#{}", crypto_code.to_uppercase())
}

/// Due amount left after `paid`; negative when the invoice is overpaid.
pub(crate) fn remaining_due(due: Amount, paid: Amount) -> SignedAmount {
    due.to_signed().unwrap_or(SignedAmount::MAX) - paid.to_signed().unwrap_or(SignedAmount::MAX)
}
