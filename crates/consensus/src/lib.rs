//! Consensus constants, chain parameters, and deployment schedule.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod subsidy;

pub use params::{
    chain_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint, ConsensusParams,
    HexError, Network,
};
pub use subsidy::block_subsidy;

pub type Hash256 = [u8; 32];
