//! Consensus deployment schedule.
//!
//! Each deployment activates at a fixed height per network. The height table
//! replaces the historical supermajority-signalling window with its settled
//! outcome, which is equivalent for any chain past the activation point.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Deployment {
    /// Pay-to-script-hash evaluation (BIP16).
    Bip16 = 0,
    /// Coinbase must commit the block height (BIP34).
    Bip34 = 1,
    /// Strict DER signatures (BIP66).
    Bip66 = 2,
    /// OP_CHECKLOCKTIMEVERIFY (BIP65).
    Bip65 = 3,
    /// Relative lock times and median-time-past lock evaluation (BIP68/112/113).
    Csv = 4,
    /// Segregated witness (BIP141/143).
    Segwit = 5,
}

pub const MAX_DEPLOYMENTS: usize = 6;

pub const ALL_DEPLOYMENTS: [Deployment; MAX_DEPLOYMENTS] = [
    Deployment::Bip16,
    Deployment::Bip34,
    Deployment::Bip66,
    Deployment::Bip65,
    Deployment::Csv,
    Deployment::Segwit,
];

impl Deployment {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Deployment::Bip16 => "bip16",
            Deployment::Bip34 => "bip34",
            Deployment::Bip66 => "bip66",
            Deployment::Bip65 => "bip65",
            Deployment::Csv => "csv",
            Deployment::Segwit => "segwit",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeploymentSchedule {
    pub activation_height: u32,
    pub hash_activation_block: Option<Hash256>,
}

impl DeploymentSchedule {
    pub const ALWAYS_ACTIVE: u32 = 0;
    pub const NEVER: u32 = u32::MAX;
}

/// Bit set of active deployments at some height, carried in block context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Forks(u32);

impl Forks {
    pub fn from_height(
        height: u32,
        schedule: &[DeploymentSchedule; MAX_DEPLOYMENTS],
    ) -> Self {
        let mut bits = 0u32;
        for deployment in ALL_DEPLOYMENTS {
            if height >= schedule[deployment.as_usize()].activation_height {
                bits |= 1 << deployment.as_usize();
            }
        }
        Self(bits)
    }

    pub fn active(self, deployment: Deployment) -> bool {
        (self.0 & (1 << deployment.as_usize())) != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Minimum acceptable block version at a height (BIP34/66/65 version gates).
pub fn minimum_block_version(
    height: u32,
    schedule: &[DeploymentSchedule; MAX_DEPLOYMENTS],
) -> i32 {
    let forks = Forks::from_height(height, schedule);
    if forks.active(Deployment::Bip65) {
        4
    } else if forks.active(Deployment::Bip66) {
        3
    } else if forks.active(Deployment::Bip34) {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{chain_params, Network};

    #[test]
    fn mainnet_activation_edges() {
        let params = chain_params(Network::Mainnet);
        let schedule = &params.consensus.deployments;

        assert!(!Forks::from_height(227_930, schedule).active(Deployment::Bip34));
        assert!(Forks::from_height(227_931, schedule).active(Deployment::Bip34));

        assert!(!Forks::from_height(481_823, schedule).active(Deployment::Segwit));
        assert!(Forks::from_height(481_824, schedule).active(Deployment::Segwit));
    }

    #[test]
    fn version_gate_tracks_deployments() {
        let params = chain_params(Network::Mainnet);
        let schedule = &params.consensus.deployments;

        assert_eq!(minimum_block_version(0, schedule), 1);
        assert_eq!(minimum_block_version(227_931, schedule), 2);
        assert_eq!(minimum_block_version(363_725, schedule), 3);
        assert_eq!(minimum_block_version(388_381, schedule), 4);
    }

    #[test]
    fn regtest_gates() {
        let params = chain_params(Network::Regtest);
        let forks = Forks::from_height(1, &params.consensus.deployments);
        assert!(forks.active(Deployment::Bip16));
        assert!(forks.active(Deployment::Segwit));
        assert!(!forks.active(Deployment::Bip34));
        assert_eq!(minimum_block_version(1, &params.consensus.deployments), 1);
    }
}
