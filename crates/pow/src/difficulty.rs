//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use bn_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// Height, time and bits of a header, as needed by retargeting.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: u32,
    pub time: u32,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Work contributed by a header with the given compact target.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Required bits for the block following `chain.last()`.
///
/// `chain` must hold the retarget-relevant suffix of the branch being
/// extended, contiguous by height and ending at the parent. At retarget
/// boundaries the first entry must reach back to the start of the 2016-block
/// window; between boundaries only the parent is consulted.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let parent = match chain.last() {
        Some(parent) => *parent,
        None => return Ok(pow_limit_bits),
    };
    ensure_contiguous(chain)?;

    if params.pow_no_retargeting {
        return Ok(parent.bits);
    }

    let interval = params.retarget_interval();
    let next_height = parent.height + 1;

    if next_height % interval != 0 {
        // Testnet: a block arriving more than twice the spacing after its
        // parent may use minimum difficulty.
        if params.pow_allow_min_difficulty {
            if let Some(time) = next_block_time {
                if time > i64::from(parent.time) + 2 * params.pow_target_spacing {
                    return Ok(pow_limit_bits);
                }
            }
        }
        return Ok(parent.bits);
    }

    // First header of the closing window.
    let window_start_height = next_height - interval;
    let window_start = chain
        .iter()
        .find(|info| info.height == window_start_height)
        .copied()
        .ok_or(DifficultyError::EmptyChain)?;

    let mut actual_timespan = i64::from(parent.time) - i64::from(window_start.time);
    let target_timespan = params.pow_target_timespan;
    if actual_timespan < target_timespan / 4 {
        actual_timespan = target_timespan / 4;
    }
    if actual_timespan > target_timespan * 4 {
        actual_timespan = target_timespan * 4;
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let mut new_target = compact_to_u256(parent.bits)?;
    new_target *= U256::from(actual_timespan as u64);
    new_target /= U256::from(target_timespan as u64);
    if new_target > pow_limit {
        new_target = pow_limit;
    }

    Ok(u256_to_compact(new_target))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    for pair in chain.windows(2) {
        if pair[1].height != pair[0].height + 1 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bn_consensus::{chain_params, Network};

    #[test]
    fn compact_round_trip() {
        for bits in [0x1d00_ffffu32, 0x1b04_864c, 0x1709_7bbc, 0x207f_ffff] {
            let value = compact_to_u256(bits).expect("compact");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn compact_rejects_negative() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn compact_rejects_overflow() {
        assert_eq!(compact_to_u256(0x2300_ffff), Err(CompactError::Overflow));
    }

    #[test]
    fn proof_is_monotone_in_difficulty() {
        let easy = block_proof(0x207f_ffff).expect("proof");
        let hard = block_proof(0x1d00_ffff).expect("proof");
        assert!(hard > easy);
    }

    #[test]
    fn no_retarget_mid_window() {
        let params = chain_params(Network::Mainnet).consensus;
        let chain = [HeaderInfo {
            height: 100,
            time: 1_300_000_000,
            bits: 0x1b04_864c,
        }];
        assert_eq!(
            get_next_work_required(&chain, None, &params).expect("bits"),
            0x1b04_864c
        );
    }

    #[test]
    fn retarget_clamps_to_quarter_timespan() {
        let params = chain_params(Network::Mainnet).consensus;
        let interval = params.retarget_interval();
        let bits = 0x1c05_a3f4u32;
        // Window closed instantly: difficulty quadruples at most.
        let chain: Vec<HeaderInfo> = (0..interval)
            .map(|i| HeaderInfo {
                height: i,
                time: 1_300_000_000,
                bits,
            })
            .collect();
        let next = get_next_work_required(&chain, None, &params).expect("bits");
        let old = compact_to_u256(bits).expect("compact");
        let new = compact_to_u256(next).expect("compact");
        assert_eq!(new, old / 4);
    }

    #[test]
    fn regtest_never_retargets() {
        let params = chain_params(Network::Regtest).consensus;
        let bits = target_to_compact(&params.pow_limit);
        let chain: Vec<HeaderInfo> = (0..4096u32)
            .map(|i| HeaderInfo {
                height: i,
                time: 1_300_000_000 + i,
                bits,
            })
            .collect();
        assert_eq!(get_next_work_required(&chain, None, &params).expect("bits"), bits);
    }
}
