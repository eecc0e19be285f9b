use bn_consensus::ConsensusParams;
use bn_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Context-free proof-of-work check: the header hash must meet its own
/// claimed target, and the target must lie within the network limit.
pub fn validate_pow_header(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash_bytes = header.hash();
    let hash_value = U256::from_little_endian(&hash_bytes);
    if hash_value > target {
        return Err(PowError::HashMismatch);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::target_to_compact;
    use bn_consensus::{chain_params, Network};

    fn header(bits: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_296_688_602,
            bits,
            nonce,
        }
    }

    #[test]
    fn regtest_limit_accepts_most_nonces() {
        let params = chain_params(Network::Regtest).consensus;
        let bits = target_to_compact(&params.pow_limit);
        let mut accepted = 0;
        for nonce in 0..8 {
            if validate_pow_header(&header(bits, nonce), &params).is_ok() {
                accepted += 1;
            }
        }
        assert!(accepted > 0);
    }

    #[test]
    fn target_above_limit_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        // Regtest-grade target is far above the mainnet limit.
        let result = validate_pow_header(&header(0x207f_ffff, 0), &params);
        assert_eq!(result, Err(PowError::InvalidBits("pow target above limit")));
    }

    #[test]
    fn mainnet_target_not_met_by_trivial_header() {
        let params = chain_params(Network::Mainnet).consensus;
        let result = validate_pow_header(&header(0x1d00_ffff, 0), &params);
        assert_eq!(result, Err(PowError::HashMismatch));
    }
}
