//! Input verification for the standard spend templates.

use bn_primitives::hash::{hash160, sha256};
use bn_primitives::transaction::Transaction;
use secp256k1::{ecdsa::Signature, Message, PublicKey};

use crate::secp::secp256k1_verify;
use crate::sighash::{
    signature_hash_legacy, signature_hash_witness_v0, SighashError, SighashType,
};
use crate::standard::{classify_script_pubkey, ScriptType, OP_16};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_WITNESS: ScriptFlags = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    EvalFalse,
    SigEncoding,
    PubkeyEncoding,
    SigCheck,
    WitnessMalformed,
    WitnessUnexpected,
    WitnessDisabled,
    RedeemScriptMismatch,
    Sighash(SighashError),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::PubkeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::WitnessMalformed => write!(f, "malformed witness"),
            ScriptError::WitnessUnexpected => write!(f, "witness on non-witness input"),
            ScriptError::WitnessDisabled => write!(f, "witness program before activation"),
            ScriptError::RedeemScriptMismatch => write!(f, "redeem script hash mismatch"),
            ScriptError::Sighash(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<SighashError> for ScriptError {
    fn from(err: SighashError) -> Self {
        ScriptError::Sighash(err)
    }
}

/// Verify one input of `tx` against the previous output it spends.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &[u8],
    amount: i64,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    let input = &tx.vin[input_index];
    match classify_script_pubkey(script_pubkey) {
        ScriptType::P2Pkh => {
            if !input.witness.is_empty() {
                return Err(ScriptError::WitnessUnexpected);
            }
            let (signature, pubkey) = parse_sig_and_key(&input.script_sig)?;
            if hash160(&pubkey) != script_pubkey[3..23] {
                return Err(ScriptError::EvalFalse);
            }
            check_signature_legacy(tx, input_index, script_pubkey, &signature, &pubkey)
        }
        ScriptType::P2Pk => {
            if !input.witness.is_empty() {
                return Err(ScriptError::WitnessUnexpected);
            }
            let signature = parse_single_push(&input.script_sig)?;
            let key_len = script_pubkey[0] as usize;
            let pubkey = script_pubkey[1..1 + key_len].to_vec();
            check_signature_legacy(tx, input_index, script_pubkey, &signature, &pubkey)
        }
        ScriptType::P2Sh if (flags & SCRIPT_VERIFY_P2SH) != 0 => {
            let redeem_script = parse_last_push(&input.script_sig)?;
            if hash160(&redeem_script) != script_pubkey[2..22] {
                return Err(ScriptError::RedeemScriptMismatch);
            }
            // Segwit-in-P2SH: the redeem script is the witness program.
            if classify_script_pubkey(&redeem_script) == ScriptType::P2Wpkh {
                if (flags & SCRIPT_VERIFY_WITNESS) == 0 {
                    return Err(ScriptError::WitnessDisabled);
                }
                return verify_p2wpkh(tx, input_index, &redeem_script, amount);
            }
            // Other redeem scripts pass under the template rule.
            Ok(())
        }
        ScriptType::P2Wpkh if (flags & SCRIPT_VERIFY_WITNESS) != 0 => {
            if !input.script_sig.is_empty() {
                return Err(ScriptError::WitnessMalformed);
            }
            verify_p2wpkh(tx, input_index, script_pubkey, amount)
        }
        ScriptType::P2Wpkh | ScriptType::P2Wsh => {
            // Before activation witness programs are anyone-can-spend.
            Ok(())
        }
        _ => Ok(()),
    }
}

fn verify_p2wpkh(
    tx: &Transaction,
    input_index: usize,
    program: &[u8],
    amount: i64,
) -> Result<(), ScriptError> {
    let witness = &tx.vin[input_index].witness;
    if witness.stack.len() != 2 {
        return Err(ScriptError::WitnessMalformed);
    }
    let signature = witness.stack[0].clone();
    let pubkey = witness.stack[1].clone();
    if hash160(&pubkey) != program[2..22] {
        return Err(ScriptError::EvalFalse);
    }

    // BIP143 script code is the implied P2PKH script.
    let mut script_code = vec![0x76, 0xa9, 0x14];
    script_code.extend_from_slice(&program[2..22]);
    script_code.extend_from_slice(&[0x88, 0xac]);

    let (der, sighash_type) = split_signature(&signature)?;
    let digest = signature_hash_witness_v0(tx, input_index, &script_code, amount, sighash_type)?;
    check_ecdsa(&digest, der, &pubkey)
}

fn check_signature_legacy(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    signature: &[u8],
    pubkey: &[u8],
) -> Result<(), ScriptError> {
    let (der, sighash_type) = split_signature(signature)?;
    let digest = signature_hash_legacy(tx, input_index, script_code, sighash_type)?;
    check_ecdsa(&digest, der, pubkey)
}

fn check_ecdsa(digest: &[u8; 32], der: &[u8], pubkey: &[u8]) -> Result<(), ScriptError> {
    let message = Message::from_digest(*digest);
    let signature = Signature::from_der(der).map_err(|_| ScriptError::SigEncoding)?;
    let pubkey = PublicKey::from_slice(pubkey).map_err(|_| ScriptError::PubkeyEncoding)?;
    secp256k1_verify()
        .verify_ecdsa(&message, &signature, &pubkey)
        .map_err(|_| ScriptError::SigCheck)
}

fn split_signature(signature: &[u8]) -> Result<(&[u8], SighashType), ScriptError> {
    let (sighash_byte, der) = signature.split_last().ok_or(ScriptError::SigEncoding)?;
    Ok((der, SighashType(u32::from(*sighash_byte))))
}

/// Script sig of the form `<sig> <pubkey>`.
fn parse_sig_and_key(script_sig: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ScriptError> {
    let mut pushes = parse_pushes(script_sig)?;
    if pushes.len() != 2 {
        return Err(ScriptError::EvalFalse);
    }
    let pubkey = pushes.pop().expect("length checked");
    let signature = pushes.pop().expect("length checked");
    Ok((signature, pubkey))
}

fn parse_single_push(script_sig: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let mut pushes = parse_pushes(script_sig)?;
    if pushes.len() != 1 {
        return Err(ScriptError::EvalFalse);
    }
    Ok(pushes.pop().expect("length checked"))
}

fn parse_last_push(script_sig: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let mut pushes = parse_pushes(script_sig)?;
    pushes.pop().ok_or(ScriptError::EvalFalse)
}

/// Decompose a push-only script into its pushed items.
fn parse_pushes(script: &[u8]) -> Result<Vec<Vec<u8>>, ScriptError> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            0x00 => out.push(Vec::new()),
            0x01..=0x4b => {
                let len = opcode as usize;
                let item = script
                    .get(cursor..cursor + len)
                    .ok_or(ScriptError::EvalFalse)?;
                out.push(item.to_vec());
                cursor += len;
            }
            0x4c => {
                let len = *script.get(cursor).ok_or(ScriptError::EvalFalse)? as usize;
                cursor += 1;
                let item = script
                    .get(cursor..cursor + len)
                    .ok_or(ScriptError::EvalFalse)?;
                out.push(item.to_vec());
                cursor += len;
            }
            0x51..=OP_16 => out.push(vec![opcode - 0x50]),
            _ => return Err(ScriptError::EvalFalse),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bn_primitives::outpoint::OutPoint;
    use bn_primitives::transaction::{TxIn, TxOut, Witness, SEQUENCE_FINAL};
    use secp256k1::{Secp256k1, SecretKey};

    fn spend_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [0x42; 32],
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
                witness: Witness::default(),
            }],
            vout: vec![TxOut {
                value: 4_999_000_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn keypair() -> (SecretKey, Vec<u8>) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x5a; 32]).expect("secret key");
        let pubkey = secret.public_key(&secp).serialize().to_vec();
        (secret, pubkey)
    }

    fn p2pkh_script(pubkey: &[u8]) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&hash160(pubkey));
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn sign_legacy(tx: &Transaction, script_code: &[u8], secret: &SecretKey) -> Vec<u8> {
        let secp = Secp256k1::new();
        let digest = signature_hash_legacy(
            tx,
            0,
            script_code,
            SighashType(crate::sighash::SIGHASH_ALL),
        )
        .expect("sighash");
        let message = Message::from_digest(digest);
        let mut signature = secp.sign_ecdsa(&message, secret).serialize_der().to_vec();
        signature.push(crate::sighash::SIGHASH_ALL as u8);
        signature
    }

    #[test]
    fn p2pkh_spend_verifies() {
        let (secret, pubkey) = keypair();
        let script_pubkey = p2pkh_script(&pubkey);
        let mut tx = spend_tx();
        let signature = sign_legacy(&tx, &script_pubkey, &secret);

        let mut script_sig = vec![signature.len() as u8];
        script_sig.extend_from_slice(&signature);
        script_sig.push(pubkey.len() as u8);
        script_sig.extend_from_slice(&pubkey);
        tx.vin[0].script_sig = script_sig;

        verify_input(&tx, 0, &script_pubkey, 5_000_000_000, SCRIPT_VERIFY_P2SH)
            .expect("valid spend");
    }

    #[test]
    fn p2pkh_wrong_key_fails() {
        let (secret, pubkey) = keypair();
        let script_pubkey = p2pkh_script(&pubkey);
        let mut tx = spend_tx();
        let signature = sign_legacy(&tx, &script_pubkey, &secret);

        let other_key = {
            let secp = Secp256k1::new();
            SecretKey::from_slice(&[0x77; 32])
                .expect("secret key")
                .public_key(&secp)
                .serialize()
                .to_vec()
        };
        let mut script_sig = vec![signature.len() as u8];
        script_sig.extend_from_slice(&signature);
        script_sig.push(other_key.len() as u8);
        script_sig.extend_from_slice(&other_key);
        tx.vin[0].script_sig = script_sig;

        assert_eq!(
            verify_input(&tx, 0, &script_pubkey, 0, SCRIPT_VERIFY_P2SH),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn p2pkh_tampered_output_fails() {
        let (secret, pubkey) = keypair();
        let script_pubkey = p2pkh_script(&pubkey);
        let mut tx = spend_tx();
        let signature = sign_legacy(&tx, &script_pubkey, &secret);

        let mut script_sig = vec![signature.len() as u8];
        script_sig.extend_from_slice(&signature);
        script_sig.push(pubkey.len() as u8);
        script_sig.extend_from_slice(&pubkey);
        tx.vin[0].script_sig = script_sig;
        tx.vout[0].value -= 1;

        assert_eq!(
            verify_input(&tx, 0, &script_pubkey, 0, SCRIPT_VERIFY_P2SH),
            Err(ScriptError::SigCheck)
        );
    }

    #[test]
    fn p2wpkh_spend_verifies() {
        let (secret, pubkey) = keypair();
        let mut program = vec![0x00, 0x14];
        program.extend_from_slice(&hash160(&pubkey));

        let mut tx = spend_tx();
        let amount = 5_000_000_000i64;
        let mut script_code = vec![0x76, 0xa9, 0x14];
        script_code.extend_from_slice(&hash160(&pubkey));
        script_code.extend_from_slice(&[0x88, 0xac]);
        let digest = signature_hash_witness_v0(
            &tx,
            0,
            &script_code,
            amount,
            SighashType(crate::sighash::SIGHASH_ALL),
        )
        .expect("sighash");
        let secp = Secp256k1::new();
        let message = Message::from_digest(digest);
        let mut signature = secp.sign_ecdsa(&message, &secret).serialize_der().to_vec();
        signature.push(crate::sighash::SIGHASH_ALL as u8);
        tx.vin[0].witness = Witness {
            stack: vec![signature, pubkey],
        };

        verify_input(
            &tx,
            0,
            &program,
            amount,
            SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_WITNESS,
        )
        .expect("valid witness spend");
    }

    #[test]
    fn witness_program_inert_before_activation() {
        let mut program = vec![0x00, 0x14];
        program.extend_from_slice(&[0u8; 20]);
        let tx = spend_tx();
        verify_input(&tx, 0, &program, 0, SCRIPT_VERIFY_P2SH).expect("anyone can spend");
    }
}
