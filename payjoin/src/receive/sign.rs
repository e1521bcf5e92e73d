use std::fmt;

use bitcoin::bip32::Xpriv;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{self, Message, Secp256k1, Signing};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{CompressedPublicKey, ScriptBuf, Witness};

use super::wallet::{ReceivedCoin, ScriptType};
use crate::psbt::PsbtExt;

/// True when every sender signature in `original` has a low R value.
///
/// Mixing high and low R signatures would fingerprint the receiver's inputs.
pub(crate) fn sender_uses_low_r(original: &Psbt) -> bool {
    original.input_pairs().all(|input| {
        let witness_sig = input
            .psbtin
            .final_script_witness
            .as_ref()
            .filter(|witness| !witness.is_empty())
            .and_then(|witness| witness.nth(0).map(|sig| sig.to_vec()));
        let script_sig = || {
            input
                .psbtin
                .final_script_sig
                .as_ref()
                .and_then(|script| script.instructions().next())
                .and_then(|instruction| instruction.ok())
                .and_then(|instruction| instruction.push_bytes().map(|bytes| bytes.as_bytes().to_vec()))
        };
        match witness_sig.or_else(script_sig) {
            Some(der) => is_low_r(&der),
            None => false,
        }
    })
}

// DER: 0x30 <len> 0x02 <r_len> <r> ...
fn is_low_r(der: &[u8]) -> bool { der.len() > 4 && der[0] == 0x30 && der[2] == 0x02 && der[3] <= 32 }

/// Signs and finalizes the receiver's `coins` in `psbt`.
///
/// `coins` pairs every receiver coin with its input index. Keys are derived
/// from `account_key` at each coin's key path and must control the coin.
pub(crate) fn sign_receiver_inputs<C: Signing>(
    secp: &Secp256k1<C>,
    psbt: &mut Psbt,
    coins: &[(usize, ReceivedCoin)],
    account_key: &Xpriv,
    script_type: ScriptType,
    low_r: bool,
) -> Result<(), SignError> {
    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);
    for (index, coin) in coins {
        let index = *index;
        let key = account_key.derive_priv(secp, &coin.key_path).map_err(SignError::Derivation)?;
        let secret = key.private_key;
        let pubkey = CompressedPublicKey(secp256k1::PublicKey::from_secret_key(secp, &secret));
        let wpkh_script = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());

        let expected = match script_type {
            ScriptType::Segwit => wpkh_script.clone(),
            ScriptType::SegwitP2sh => ScriptBuf::new_p2sh(&wpkh_script.script_hash()),
            ScriptType::Legacy => ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
        };
        if expected != coin.txout.script_pubkey {
            return Err(SignError::KeyMismatch(coin.outpoint));
        }

        let sighash_type = EcdsaSighashType::All;
        let message = match script_type {
            ScriptType::Segwit | ScriptType::SegwitP2sh => {
                let sighash = cache
                    .p2wpkh_signature_hash(index, &wpkh_script, coin.txout.value, sighash_type)
                    .map_err(|e| SignError::Sighash(e.to_string()))?;
                Message::from_digest(sighash.to_byte_array())
            }
            ScriptType::Legacy => {
                let sighash = cache
                    .legacy_signature_hash(index, &coin.txout.script_pubkey, sighash_type.to_u32())
                    .map_err(|e| SignError::Sighash(e.to_string()))?;
                Message::from_digest(sighash.to_byte_array())
            }
        };
        let signature = if low_r {
            secp.sign_ecdsa_low_r(&message, &secret)
        } else {
            secp.sign_ecdsa(&message, &secret)
        };
        let signature = ecdsa::Signature { signature, sighash_type };

        let input = &mut psbt.inputs[index];
        match script_type {
            ScriptType::Segwit => {
                input.final_script_witness = Some(Witness::p2wpkh(&signature, &pubkey.0));
            }
            ScriptType::SegwitP2sh => {
                let redeem = PushBytesBuf::try_from(wpkh_script.to_bytes())
                    .map_err(|_| SignError::Sighash("redeem script too large".to_owned()))?;
                input.final_script_sig = Some(ScriptBuf::builder().push_slice(redeem).into_script());
                input.final_script_witness = Some(Witness::p2wpkh(&signature, &pubkey.0));
                input.redeem_script = None;
            }
            ScriptType::Legacy => {
                input.final_script_sig = Some(
                    ScriptBuf::builder()
                        .push_slice(signature.serialize())
                        .push_key(&bitcoin::PublicKey::new(pubkey.0))
                        .into_script(),
                );
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) enum SignError {
    Derivation(bitcoin::bip32::Error),
    KeyMismatch(bitcoin::OutPoint),
    Sighash(String),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Derivation(e) => write!(f, "key derivation failed: {e}"),
            Self::KeyMismatch(outpoint) =>
                write!(f, "the wallet key does not control {outpoint}"),
            Self::Sighash(e) => write!(f, "could not compute the sighash: {e}"),
        }
    }
}

impl std::error::Error for SignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Derivation(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::bip32::DerivationPath;
    use bitcoin::secp256k1::rand::rngs::StdRng;
    use bitcoin::secp256k1::rand::SeedableRng;
    use bitcoin::{Amount, OutPoint, TxOut, Txid};
    use payjoin_test_utils::{receiver_xpriv, sender_psbt, SenderFixture};

    use super::*;
    use crate::receive::proposal::contribute_inputs;

    fn coin_for(script_type: ScriptType) -> ReceivedCoin {
        let secp = Secp256k1::new();
        let key_path: DerivationPath = "m/0/3".parse().unwrap();
        let key = receiver_xpriv().derive_priv(&secp, &key_path).unwrap();
        let pubkey = CompressedPublicKey::from_private_key(&secp, &key.to_priv()).unwrap();
        let wpkh = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
        let script_pubkey = match script_type {
            ScriptType::Segwit => wpkh,
            ScriptType::SegwitP2sh => ScriptBuf::new_p2sh(&wpkh.script_hash()),
            ScriptType::Legacy => ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()),
        };
        ReceivedCoin {
            outpoint: OutPoint { txid: Txid::from_byte_array([5; 32]), vout: 0 },
            txout: TxOut { value: Amount::from_sat(100_000), script_pubkey },
            key_path,
        }
    }

    #[test]
    fn detects_low_r_senders() {
        assert!(is_low_r(&[0x30, 0x44, 0x02, 0x20, 0x01]));
        assert!(!is_low_r(&[0x30, 0x45, 0x02, 0x21, 0x00]));
        // the fixture signs with low R
        assert!(sender_uses_low_r(&sender_psbt(&SenderFixture::default())));
    }

    #[test]
    fn signs_every_supported_script_type() {
        let secp = Secp256k1::new();
        let original = sender_psbt(&SenderFixture::default());
        for script_type in [ScriptType::Segwit, ScriptType::SegwitP2sh, ScriptType::Legacy] {
            let coin = coin_for(script_type);
            let mut rng = StdRng::seed_from_u64(11);
            let mut draft =
                contribute_inputs(&original, 0, &[coin], script_type, None, &mut rng).unwrap();
            sign_receiver_inputs(
                &secp,
                &mut draft.psbt,
                &draft.contributed,
                &receiver_xpriv(),
                script_type,
                true,
            )
            .unwrap();

            let (index, _) = draft.contributed[0];
            let input = &draft.psbt.inputs[index];
            match script_type {
                ScriptType::Segwit => {
                    assert!(input.final_script_sig.is_none());
                    assert_eq!(input.final_script_witness.as_ref().unwrap().len(), 2);
                }
                ScriptType::SegwitP2sh => {
                    assert!(input.final_script_sig.as_ref().unwrap().redeem_script().is_some());
                    assert_eq!(input.final_script_witness.as_ref().unwrap().len(), 2);
                }
                ScriptType::Legacy => {
                    assert!(input.final_script_witness.is_none());
                    assert!(input.final_script_sig.is_some());
                }
            }
        }
    }

    #[test]
    fn refuses_coins_of_another_key() {
        let secp = Secp256k1::new();
        let original = sender_psbt(&SenderFixture::default());
        let mut coin = coin_for(ScriptType::Segwit);
        coin.key_path = "m/0/4".parse().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut draft =
            contribute_inputs(&original, 0, &[coin], ScriptType::Segwit, None, &mut rng).unwrap();
        let error = sign_receiver_inputs(
            &secp,
            &mut draft.psbt,
            &draft.contributed,
            &receiver_xpriv(),
            ScriptType::Segwit,
            false,
        )
        .unwrap_err();
        assert!(matches!(error, SignError::KeyMismatch(_)));
    }
}
