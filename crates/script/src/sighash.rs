//! Signature hashing for transparent inputs.

use bn_consensus::Hash256;
use bn_primitives::encoding::{Encodable, Encoder};
use bn_primitives::hash::sha256d;
use bn_primitives::transaction::{Transaction, SEQUENCE_FINAL};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Legacy (pre-segwit) signature hash.
pub fn signature_hash_legacy(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    // Historical quirk: SIGHASH_SINGLE with no matching output hashes to one.
    if sighash_type.base_type() == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return Ok(one);
    }

    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    if anyone_can_pay {
        encoder.write_varint(1);
        serialize_input(&mut encoder, tx, input_index, input_index, script_code, sighash_type);
    } else {
        encoder.write_varint(tx.vin.len() as u64);
        for index in 0..tx.vin.len() {
            serialize_input(&mut encoder, tx, index, input_index, script_code, sighash_type);
        }
    }

    match sighash_type.base_type() {
        SIGHASH_NONE => encoder.write_varint(0),
        SIGHASH_SINGLE => {
            encoder.write_varint(input_index as u64 + 1);
            // Outputs preceding the signed one are blanked.
            for _ in 0..input_index {
                encoder.write_i64_le(-1);
                encoder.write_varint(0);
            }
            tx.vout[input_index].consensus_encode(&mut encoder);
        }
        _ => {
            encoder.write_varint(tx.vout.len() as u64);
            for output in &tx.vout {
                output.consensus_encode(&mut encoder);
            }
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    Ok(sha256d(&encoder.into_inner()))
}

fn serialize_input(
    encoder: &mut Encoder,
    tx: &Transaction,
    index: usize,
    signed_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) {
    let input = &tx.vin[index];
    input.prevout.consensus_encode(encoder);
    if index == signed_index {
        encoder.write_var_bytes(script_code);
    } else {
        encoder.write_varint(0);
    }
    let blank_sequence = index != signed_index
        && matches!(sighash_type.base_type(), SIGHASH_NONE | SIGHASH_SINGLE);
    encoder.write_u32_le(if blank_sequence { 0 } else { input.sequence });
}

/// BIP143 signature hash for witness v0 programs.
pub fn signature_hash_witness_v0(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let base = sighash_type.base_type();

    let hash_prevouts = if anyone_can_pay {
        [0u8; 32]
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            input.prevout.consensus_encode(&mut encoder);
        }
        sha256d(&encoder.into_inner())
    };

    let hash_sequence = if anyone_can_pay || base == SIGHASH_NONE || base == SIGHASH_SINGLE {
        [0u8; 32]
    } else {
        let mut encoder = Encoder::new();
        for input in &tx.vin {
            encoder.write_u32_le(input.sequence);
        }
        sha256d(&encoder.into_inner())
    };

    let hash_outputs = if base != SIGHASH_NONE && base != SIGHASH_SINGLE {
        let mut encoder = Encoder::new();
        for output in &tx.vout {
            output.consensus_encode(&mut encoder);
        }
        sha256d(&encoder.into_inner())
    } else if base == SIGHASH_SINGLE && input_index < tx.vout.len() {
        let mut encoder = Encoder::new();
        tx.vout[input_index].consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    } else {
        [0u8; 32]
    };

    let input = &tx.vin[input_index];
    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_hash_le(&hash_prevouts);
    encoder.write_hash_le(&hash_sequence);
    input.prevout.consensus_encode(&mut encoder);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(amount);
    encoder.write_u32_le(input.sequence);
    encoder.write_hash_le(&hash_outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    Ok(sha256d(&encoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bn_primitives::outpoint::OutPoint;
    use bn_primitives::transaction::{TxIn, TxOut, Witness};

    fn two_in_two_out() -> Transaction {
        let input = |tag: u8| TxIn {
            prevout: OutPoint {
                hash: [tag; 32],
                index: tag as u32,
            },
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
            witness: Witness::default(),
        };
        let output = |value: i64| TxOut {
            value,
            script_pubkey: vec![0x51],
        };
        Transaction {
            version: 2,
            vin: vec![input(1), input(2)],
            vout: vec![output(10), output(20)],
            lock_time: 0,
        }
    }

    #[test]
    fn legacy_all_differs_per_input() {
        let tx = two_in_two_out();
        let code = vec![0x76, 0xa9];
        let a = signature_hash_legacy(&tx, 0, &code, SighashType(SIGHASH_ALL)).expect("hash");
        let b = signature_hash_legacy(&tx, 1, &code, SighashType(SIGHASH_ALL)).expect("hash");
        assert_ne!(a, b);
    }

    #[test]
    fn legacy_single_out_of_range_is_one() {
        let mut tx = two_in_two_out();
        tx.vout.truncate(1);
        let hash =
            signature_hash_legacy(&tx, 1, &[], SighashType(SIGHASH_SINGLE)).expect("hash");
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(hash, one);
    }

    #[test]
    fn legacy_rejects_bad_index() {
        let tx = two_in_two_out();
        assert_eq!(
            signature_hash_legacy(&tx, 5, &[], SighashType(SIGHASH_ALL)),
            Err(SighashError::InputIndexOutOfRange)
        );
    }

    #[test]
    fn witness_hash_commits_to_amount() {
        let tx = two_in_two_out();
        let code = vec![0x76, 0xa9];
        let a = signature_hash_witness_v0(&tx, 0, &code, 100, SighashType(SIGHASH_ALL))
            .expect("hash");
        let b = signature_hash_witness_v0(&tx, 0, &code, 200, SighashType(SIGHASH_ALL))
            .expect("hash");
        assert_ne!(a, b);
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let tx = two_in_two_out();
        let mut altered = tx.clone();
        altered.vin[1].prevout.index = 99;
        let flags = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        let a = signature_hash_legacy(&tx, 0, &[], flags).expect("hash");
        let b = signature_hash_legacy(&altered, 0, &[], flags).expect("hash");
        assert_eq!(a, b);
    }
}
