//! Block subsidy schedule.

use crate::money::Amount;
use crate::params::ConsensusParams;

/// Subsidy for a block at `height`: the initial subsidy halved once per
/// interval, truncating to zero after 64 halvings.
pub fn block_subsidy(height: u32, params: &ConsensusParams) -> Amount {
    let halvings = height / params.subsidy_interval_blocks;
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::COIN;
    use crate::params::{chain_params, Network};

    #[test]
    fn mainnet_halving_schedule() {
        let params = chain_params(Network::Mainnet).consensus;
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 12 * COIN + 50 * COIN / 100);
        assert_eq!(block_subsidy(64 * 210_000, &params), 0);
    }

    #[test]
    fn total_supply_is_bounded() {
        let params = chain_params(Network::Mainnet).consensus;
        let mut total: i64 = 0;
        for halving in 0..64u32 {
            let height = halving * params.subsidy_interval_blocks;
            total += block_subsidy(height, &params) * params.subsidy_interval_blocks as i64;
        }
        assert!(total <= crate::money::MAX_MONEY);
    }
}
