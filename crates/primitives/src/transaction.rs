//! Transaction types and serialization.

use bn_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Sequence value that disables lock-time enforcement for an input.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

/// Lock times below this threshold are block heights, above are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Witness {
    pub stack: Vec<Vec<u8>>,
}

impl Witness {
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Witness,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Witness::default(),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    pub fn value_out(&self) -> i64 {
        self.vout
            .iter()
            .fold(0i64, |sum, output| sum.saturating_add(output.value))
    }

    /// Final either by sequence numbers or by lock time relative to the
    /// provided height and median time.
    pub fn is_final(&self, height: u32, time: u32) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if self.lock_time < LOCKTIME_THRESHOLD {
            height
        } else {
            time
        };
        if self.lock_time < cutoff {
            return true;
        }
        self.vin
            .iter()
            .all(|input| input.sequence == SEQUENCE_FINAL)
    }

    /// Serialization with witness data (BIP144) when any input carries it.
    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode_with_witness(self.has_witness())
    }

    /// Serialization without witness data; input to the txid.
    pub fn consensus_encode_base(&self) -> Vec<u8> {
        self.encode_with_witness(false)
    }

    fn encode_with_witness(&self, witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        if witness {
            encoder.write_u8(SEGWIT_MARKER);
            encoder.write_u8(SEGWIT_FLAG);
        }
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(&mut encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(&mut encoder);
        }
        if witness {
            for input in &self.vin {
                encoder.write_varint(input.witness.stack.len() as u64);
                for item in &input.witness.stack {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode_base())
    }

    pub fn wtxid(&self) -> Hash256 {
        if self.is_coinbase() {
            return [0u8; 32];
        }
        sha256d(&self.consensus_encode())
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;

        let mut count = decoder.read_varint()?;
        let mut segwit = false;
        if count == 0 {
            // BIP144: zero marker then flag byte, then the real input count.
            let flag = decoder.read_u8()?;
            if flag != SEGWIT_FLAG {
                return Err(DecodeError::InvalidData("invalid segwit flag"));
            }
            segwit = true;
            count = decoder.read_varint()?;
        }

        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vin = Vec::with_capacity(count);
        for _ in 0..count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }

        let out_count = decoder.read_varint()?;
        let out_count = usize::try_from(out_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vout = Vec::with_capacity(out_count);
        for _ in 0..out_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }

        if segwit {
            let mut any = false;
            for input in &mut vin {
                let items = decoder.read_varint()?;
                let items = usize::try_from(items).map_err(|_| DecodeError::SizeTooLarge)?;
                let mut stack = Vec::with_capacity(items);
                for _ in 0..items {
                    stack.push(decoder.read_var_bytes()?);
                }
                any |= !stack.is_empty();
                input.witness = Witness { stack };
            }
            if !any {
                return Err(DecodeError::InvalidData("segwit flag without witness"));
            }
        }

        let lock_time = decoder.read_u32_le()?;

        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [0x11; 32],
                    index: 0,
                },
                script_sig: vec![0x51],
                sequence: SEQUENCE_FINAL,
                witness: Witness::default(),
            }],
            vout: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn legacy_round_trip() {
        let tx = simple_tx();
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn witness_round_trip() {
        let mut tx = simple_tx();
        tx.vin[0].witness = Witness {
            stack: vec![vec![0xaa; 71], vec![0xbb; 33]],
        };
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        // Witness does not perturb the txid.
        let mut stripped = tx.clone();
        stripped.vin[0].witness = Witness::default();
        assert_eq!(decoded.txid(), stripped.txid());
        assert_ne!(decoded.wtxid(), decoded.txid());
    }

    #[test]
    fn segwit_flag_without_witness_rejected() {
        let mut tx = simple_tx();
        tx.vin[0].witness = Witness { stack: vec![] };
        // Marker+flag encoding with all-empty stacks must not decode.
        let bytes = tx.encode_with_witness(true);
        assert!(Transaction::consensus_decode(&bytes).is_err());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = simple_tx();
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
        assert_eq!(tx.wtxid(), [0u8; 32]);
    }

    #[test]
    fn finality_rules() {
        let mut tx = simple_tx();
        assert!(tx.is_final(0, 0));

        tx.lock_time = 100;
        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));

        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final(100, 0));
    }
}
