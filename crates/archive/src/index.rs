//! Header links and the interned header index.

use bn_consensus::Hash256;
use bn_primitives::encoding::{DecodeError, Decoder, Encoder};
use primitive_types::U256;

/// Stable handle assigned to a header on first insertion.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HeaderLink(pub u32);

impl HeaderLink {
    pub const TERMINAL: HeaderLink = HeaderLink(u32::MAX);

    pub fn is_terminal(self) -> bool {
        self.0 == u32::MAX
    }

    pub fn key(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_key(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = bytes.try_into().ok()?;
        Some(Self(u32::from_be_bytes(bytes)))
    }
}

impl std::fmt::Display for HeaderLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_terminal() {
            write!(f, "terminal")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

/// Interned header with its chain placement and cumulative work.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderEntry {
    pub hash: Hash256,
    pub parent: HeaderLink,
    pub height: u32,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub work: [u8; 32],
}

impl HeaderEntry {
    pub fn work_value(&self) -> U256 {
        U256::from_big_endian(&self.work)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(116);
        encoder.write_hash_le(&self.hash);
        encoder.write_u32_le(self.parent.0);
        encoder.write_u32_le(self.height);
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_bytes(&self.work);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let hash = decoder.read_hash_le()?;
        let parent = HeaderLink(decoder.read_u32_le()?);
        let height = decoder.read_u32_le()?;
        let version = decoder.read_i32_le()?;
        let merkle_root = decoder.read_hash_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let work = decoder.read_fixed::<32>()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            parent,
            height,
            version,
            merkle_root,
            time,
            bits,
            nonce,
            work,
        })
    }

    pub fn to_header(&self, prev_hash: Hash256) -> bn_primitives::block::BlockHeader {
        bn_primitives::block::BlockHeader {
            version: self.version,
            prev_block: prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let entry = HeaderEntry {
            hash: [0xab; 32],
            parent: HeaderLink(7),
            height: 8,
            version: 4,
            merkle_root: [0xcd; 32],
            time: 1_300_000_000,
            bits: 0x207f_ffff,
            nonce: 99,
            work: [0x01; 32],
        };
        let decoded = HeaderEntry::decode(&entry.encode()).expect("decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn link_keys_sort_by_value() {
        assert!(HeaderLink(1).key() < HeaderLink(2).key());
        assert!(HeaderLink(255).key() < HeaderLink(256).key());
    }

    #[test]
    fn terminal_link() {
        assert!(HeaderLink::TERMINAL.is_terminal());
        assert!(!HeaderLink(0).is_terminal());
    }
}
