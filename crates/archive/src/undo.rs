//! Confirmed UTXO entries and per-block undo records.

use bn_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use bn_primitives::outpoint::OutPoint;

/// An unspent output as held in the confirmed set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub coinbase: bool,
}

impl Encodable for UtxoEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(self.coinbase as u8);
    }
}

impl Decodable for UtxoEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let coinbase = decoder.read_u8()? != 0;
        Ok(Self {
            value,
            script_pubkey,
            height,
            coinbase,
        })
    }
}

/// Key bytes for a UTXO table entry.
pub fn outpoint_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(&outpoint.hash);
    key[32..].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

/// Outputs consumed by a confirmed block, retained to reverse the push.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, UtxoEntry)>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.spent.len() as u64);
        for (outpoint, entry) in &self.spent {
            outpoint.consensus_encode(&mut encoder);
            entry.consensus_encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut spent = Vec::with_capacity(count);
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let entry = UtxoEntry::consensus_decode(&mut decoder)?;
            spent.push((outpoint, entry));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_round_trip() {
        let undo = BlockUndo {
            spent: vec![
                (
                    OutPoint {
                        hash: [1u8; 32],
                        index: 0,
                    },
                    UtxoEntry {
                        value: 50,
                        script_pubkey: vec![0x51],
                        height: 10,
                        coinbase: true,
                    },
                ),
                (
                    OutPoint {
                        hash: [2u8; 32],
                        index: 3,
                    },
                    UtxoEntry {
                        value: 25,
                        script_pubkey: vec![0x76, 0xa9],
                        height: 11,
                        coinbase: false,
                    },
                ),
            ],
        };
        assert_eq!(BlockUndo::decode(&undo.encode()).expect("decode"), undo);
    }

    #[test]
    fn outpoint_keys_are_unique_per_index() {
        let base = OutPoint {
            hash: [9u8; 32],
            index: 0,
        };
        let other = OutPoint {
            hash: [9u8; 32],
            index: 1,
        };
        assert_ne!(outpoint_key(&base), outpoint_key(&other));
    }
}
