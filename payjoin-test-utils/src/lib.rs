use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    ecdsa, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, Psbt, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use once_cell::sync::OnceCell;
use payjoin::receive::{
    tracking_key, BroadcastResult, ChainPaymentMethod, DerivationScheme, Explorer,
    InvoiceRepository, PaymentRecord, ReceivedCoin, ScriptType,
};
use payjoin::ImplementationError;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

static INIT_TRACING: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    INIT_TRACING.get_or_init(|| {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        // also forwards `log` records of the library crates
        if let Err(e) = subscriber.try_init() {
            tracing::debug!("keeping the installed subscriber: {e}");
        }
    });
}

/// A deterministic key pair. `seed` must not be zero.
pub fn keypair(seed: u8) -> (PrivateKey, CompressedPublicKey) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).expect("valid secret key");
    let private = PrivateKey::new(secret, Network::Regtest);
    let public = CompressedPublicKey::from_private_key(&secp, &private).expect("compressed key");
    (private, public)
}

pub fn p2wpkh_script(seed: u8) -> ScriptBuf {
    let (_, public) = keypair(seed);
    ScriptBuf::new_p2wpkh(&public.wpubkey_hash())
}

/// The account key of the receiver's hot wallet.
pub fn receiver_xpriv() -> Xpriv {
    Xpriv::new_master(Network::Regtest, &[42; 32]).expect("valid seed")
}

/// A receiver coin of `script_type` controlled by [`receiver_xpriv`] at `m/0/{index}`.
pub fn receiver_coin(index: u32, value: Amount, script_type: ScriptType) -> ReceivedCoin {
    let secp = Secp256k1::new();
    let key_path: DerivationPath = format!("m/0/{index}").parse().expect("valid path");
    let key = receiver_xpriv().derive_priv(&secp, &key_path).expect("derivable path");
    let public = CompressedPublicKey::from_private_key(&secp, &key.to_priv()).expect("compressed");
    let wpkh = ScriptBuf::new_p2wpkh(&public.wpubkey_hash());
    let script_pubkey = match script_type {
        ScriptType::Segwit => wpkh,
        ScriptType::SegwitP2sh => ScriptBuf::new_p2sh(&wpkh.script_hash()),
        ScriptType::Legacy => ScriptBuf::new_p2pkh(&public.pubkey_hash()),
    };
    let mut txid = [0xc0; 32];
    txid[..4].copy_from_slice(&index.to_be_bytes());
    ReceivedCoin {
        outpoint: OutPoint { txid: Txid::from_byte_array(txid), vout: index },
        txout: TxOut { value, script_pubkey },
        key_path,
    }
}

/// Shape of a signed single input P2WPKH payment from the sender.
#[derive(Debug, Clone)]
pub struct SenderFixture {
    pub sender_seed: u8,
    pub payment_script: ScriptBuf,
    pub payment_value: Amount,
    pub change_value: Option<Amount>,
    pub fee: Amount,
}

impl Default for SenderFixture {
    fn default() -> Self {
        SenderFixture {
            sender_seed: 1,
            payment_script: p2wpkh_script(100),
            payment_value: Amount::from_sat(5_000_000),
            change_value: None,
            fee: Amount::from_sat(2_000),
        }
    }
}

impl SenderFixture {
    pub fn payment_index(&self) -> usize { 0 }

    pub fn change_index(&self) -> usize { 1 }

    pub fn funding_outpoint(&self) -> OutPoint {
        OutPoint { txid: Txid::from_byte_array([self.sender_seed; 32]), vout: 0 }
    }

    pub fn funding_txout(&self) -> TxOut {
        let value = self.payment_value + self.change_value.unwrap_or(Amount::ZERO) + self.fee;
        TxOut { value, script_pubkey: p2wpkh_script(self.sender_seed) }
    }
}

/// The original transaction described by `fixture`, signed with low R.
pub fn sender_tx(fixture: &SenderFixture) -> Transaction {
    let secp = Secp256k1::new();
    let (private, public) = keypair(fixture.sender_seed);
    let mut output =
        vec![TxOut { value: fixture.payment_value, script_pubkey: fixture.payment_script.clone() }];
    if let Some(change) = fixture.change_value {
        output.push(TxOut { value: change, script_pubkey: p2wpkh_script(fixture.sender_seed) });
    }
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: fixture.funding_outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::default(),
        }],
        output,
    };
    let funding = fixture.funding_txout();
    let sighash = SighashCache::new(&tx)
        .p2wpkh_signature_hash(0, &funding.script_pubkey, funding.value, EcdsaSighashType::All)
        .expect("valid sighash");
    let message = Message::from_digest(sighash.to_byte_array());
    let signature = ecdsa::Signature {
        signature: secp.sign_ecdsa_low_r(&message, &private.inner),
        sighash_type: EcdsaSighashType::All,
    };
    tx.input[0].witness = Witness::p2wpkh(&signature, &public.0);
    tx
}

/// [`sender_tx`] as a finalized PSBT carrying its witness UTXO.
pub fn sender_psbt(fixture: &SenderFixture) -> Psbt {
    let tx = sender_tx(fixture);
    let mut unsigned = tx.clone();
    unsigned.input[0].witness = Witness::default();
    let mut psbt = Psbt::from_unsigned_tx(unsigned).expect("unsigned transaction");
    psbt.inputs[0].witness_utxo = Some(fixture.funding_txout());
    psbt.inputs[0].final_script_witness = Some(tx.input[0].witness.clone());
    psbt
}

#[derive(Debug, Default)]
struct ExplorerState {
    unspent: HashMap<String, Vec<ReceivedCoin>>,
    previous_outputs: HashMap<OutPoint, TxOut>,
    spent: HashSet<OutPoint>,
    broadcasts: Vec<(Transaction, bool)>,
    reject_reason: Option<String>,
    signing_key: Option<Xpriv>,
}

/// An [`Explorer`] that answers from memory and records every broadcast.
#[derive(Debug, Default)]
pub struct MockExplorer {
    state: Mutex<ExplorerState>,
}

impl MockExplorer {
    /// A hot wallet explorer signing with [`receiver_xpriv`].
    pub fn new() -> Self {
        let explorer = MockExplorer::default();
        explorer.state().signing_key = Some(receiver_xpriv());
        explorer
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ExplorerState> {
        self.state.lock().expect("explorer state")
    }

    pub fn add_unspent(&self, wallet_id: &str, coin: ReceivedCoin) {
        self.state().unspent.entry(wallet_id.to_owned()).or_default().push(coin);
    }

    pub fn add_previous_output(&self, outpoint: OutPoint, txout: TxOut) {
        self.state().previous_outputs.insert(outpoint, txout);
    }

    pub fn mark_spent(&self, outpoint: OutPoint) { self.state().spent.insert(outpoint); }

    /// Every later broadcast, test or not, is refused with `reason`.
    pub fn reject_broadcasts(&self, reason: &str) {
        self.state().reject_reason = Some(reason.to_owned());
    }

    pub fn remove_signing_key(&self) { self.state().signing_key = None; }

    /// Transactions relayed for real, in order.
    pub fn relayed(&self) -> Vec<Transaction> {
        self.state().broadcasts.iter().filter(|(_, test)| !test).map(|(tx, _)| tx.clone()).collect()
    }

    pub fn mempool_checks(&self) -> usize {
        self.state().broadcasts.iter().filter(|(_, test)| *test).count()
    }
}

#[async_trait]
impl Explorer for MockExplorer {
    async fn fetch_previous_outputs(
        &self,
        tx: &Transaction,
    ) -> Result<Vec<Option<TxOut>>, ImplementationError> {
        let state = self.state();
        Ok(tx.input.iter().map(|txin| state.previous_outputs.get(&txin.previous_output).cloned()).collect())
    }

    async fn broadcast(
        &self,
        tx: &Transaction,
        test_only: bool,
    ) -> Result<BroadcastResult, ImplementationError> {
        let mut state = self.state();
        state.broadcasts.push((tx.clone(), test_only));
        Ok(match &state.reject_reason {
            Some(reason) => BroadcastResult::rejected(reason.clone()),
            None => BroadcastResult::accepted(),
        })
    }

    async fn list_unspent(
        &self,
        scheme: &DerivationScheme,
    ) -> Result<Vec<ReceivedCoin>, ImplementationError> {
        Ok(self.state().unspent.get(&scheme.wallet_id).cloned().unwrap_or_default())
    }

    async fn unused_change_script(
        &self,
        _scheme: &DerivationScheme,
    ) -> Result<ScriptBuf, ImplementationError> {
        Ok(p2wpkh_script(200))
    }

    async fn signing_key(
        &self,
        _scheme: &DerivationScheme,
    ) -> Result<Option<Xpriv>, ImplementationError> {
        Ok(self.state().signing_key)
    }

    async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool, ImplementationError> {
        Ok(self.state().spent.contains(outpoint))
    }
}

#[derive(Debug, Default)]
struct Invoices {
    methods: HashMap<String, ChainPaymentMethod>,
    tracked: HashMap<String, Vec<String>>,
    payments: HashMap<String, Vec<PaymentRecord>>,
}

/// An [`InvoiceRepository`] holding one on-chain payment method per invoice.
#[derive(Debug, Default)]
pub struct InMemoryInvoiceRepository {
    crypto_code: String,
    invoices: Mutex<Invoices>,
}

impl InMemoryInvoiceRepository {
    pub fn new(crypto_code: &str) -> Self {
        InMemoryInvoiceRepository { crypto_code: crypto_code.to_uppercase(), ..Default::default() }
    }

    fn invoices(&self) -> std::sync::MutexGuard<'_, Invoices> {
        self.invoices.lock().expect("invoice state")
    }

    pub fn add_invoice(&self, invoice_id: &str, method: ChainPaymentMethod) {
        let key = tracking_key(&method.deposit_script, &self.crypto_code);
        let mut invoices = self.invoices();
        invoices.tracked.entry(key).or_default().push(invoice_id.to_owned());
        invoices.methods.insert(invoice_id.to_owned(), method);
    }

    pub fn payments(&self, invoice_id: &str) -> Vec<PaymentRecord> {
        self.invoices().payments.get(invoice_id).cloned().unwrap_or_default()
    }
}

/// A payjoin enabled segwit invoice of `due` paid to `deposit_script`.
pub fn invoice_method(deposit_script: ScriptBuf, due: Amount, wallet_id: &str) -> ChainPaymentMethod {
    ChainPaymentMethod {
        deposit_script,
        payjoin_enabled: true,
        derivation: DerivationScheme {
            wallet_id: wallet_id.to_owned(),
            script_type: ScriptType::Segwit,
        },
        due,
        has_payments: false,
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn find_invoices(&self, key: &str) -> Result<Vec<String>, ImplementationError> {
        Ok(self.invoices().tracked.get(key).cloned().unwrap_or_default())
    }

    async fn payment_method(
        &self,
        invoice_id: &str,
        crypto_code: &str,
    ) -> Result<Option<ChainPaymentMethod>, ImplementationError> {
        if !crypto_code.eq_ignore_ascii_case(&self.crypto_code) {
            return Ok(None);
        }
        let invoices = self.invoices();
        Ok(invoices.methods.get(invoice_id).map(|method| ChainPaymentMethod {
            has_payments: invoices.payments.get(invoice_id).is_some_and(|p| !p.is_empty()),
            ..method.clone()
        }))
    }

    async fn add_payment(
        &self,
        invoice_id: &str,
        payment: PaymentRecord,
    ) -> Result<Option<PaymentRecord>, ImplementationError> {
        let mut invoices = self.invoices();
        let already = invoices
            .payments
            .values()
            .flatten()
            .any(|existing| existing.outpoint == payment.outpoint);
        if already {
            return Ok(None);
        }
        invoices.payments.entry(invoice_id.to_owned()).or_default().push(payment.clone());
        Ok(Some(payment))
    }
}
