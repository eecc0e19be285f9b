//! Chain parameter definitions.

use crate::deployments::{DeploymentSchedule, MAX_DEPLOYMENTS};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub genesis_version: i32,
    pub genesis_merkle_root: Hash256,
    pub subsidy_interval_blocks: u32,
    pub initial_subsidy: Amount,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty: bool,
    pub pow_no_retargeting: bool,
    pub deployments: [DeploymentSchedule; MAX_DEPLOYMENTS],
    pub checkpoints: Vec<Checkpoint>,
    pub minimum_chain_work: Hash256,
}

impl ConsensusParams {
    pub fn retarget_interval(&self) -> u32 {
        (self.pow_target_timespan / self.pow_target_spacing) as u32
    }

    /// Highest configured checkpoint height, or zero if none.
    pub fn top_checkpoint(&self) -> u32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub message_start: [u8; 4],
    pub default_port: u16,
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }

    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();

    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn deployment_heights(
    heights: [u32; MAX_DEPLOYMENTS],
) -> [DeploymentSchedule; MAX_DEPLOYMENTS] {
    heights.map(|activation_height| DeploymentSchedule {
        activation_height,
        hash_activation_block: None,
    })
}

fn mainnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("genesis hash literal"),
        genesis_time: 1_231_006_505,
        genesis_bits: 0x1d00_ffff,
        genesis_nonce: 2_083_236_893,
        genesis_version: 1,
        genesis_merkle_root: hash256_from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("genesis merkle literal"),
        subsidy_interval_blocks: 210_000,
        initial_subsidy: 50 * COIN,
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("pow limit literal"),
        pow_target_spacing: 600,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty: false,
        pow_no_retargeting: false,
        deployments: deployment_heights([
            173_805, // bip16
            227_931, // bip34
            363_725, // bip66
            388_381, // bip65
            419_328, // csv
            481_824, // segwit
        ]),
        checkpoints: vec![
            Checkpoint {
                height: 11_111,
                hash: hash256_from_hex(
                    "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
                )
                .expect("checkpoint literal"),
            },
            Checkpoint {
                height: 33_333,
                hash: hash256_from_hex(
                    "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
                )
                .expect("checkpoint literal"),
            },
            Checkpoint {
                height: 74_000,
                hash: hash256_from_hex(
                    "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
                )
                .expect("checkpoint literal"),
            },
            Checkpoint {
                height: 105_000,
                hash: hash256_from_hex(
                    "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
                )
                .expect("checkpoint literal"),
            },
            Checkpoint {
                height: 134_444,
                hash: hash256_from_hex(
                    "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
                )
                .expect("checkpoint literal"),
            },
            Checkpoint {
                height: 168_000,
                hash: hash256_from_hex(
                    "000000000000099e61ea72015e79632f216fe2cb33d7899acb35b75c8303b763",
                )
                .expect("checkpoint literal"),
            },
            Checkpoint {
                height: 230_000,
                hash: hash256_from_hex(
                    "000000000000013489c0d0aaa3bdb4c17b9c38b60022b2964f220c01bf3f31c6",
                )
                .expect("checkpoint literal"),
            },
            Checkpoint {
                height: 295_000,
                hash: hash256_from_hex(
                    "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983",
                )
                .expect("checkpoint literal"),
            },
        ],
        minimum_chain_work: hash256_from_hex("00").expect("zero work literal"),
    }
}

fn testnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash256_from_hex(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        )
        .expect("genesis hash literal"),
        genesis_time: 1_296_688_602,
        genesis_bits: 0x1d00_ffff,
        genesis_nonce: 414_098_458,
        genesis_version: 1,
        genesis_merkle_root: hash256_from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("genesis merkle literal"),
        subsidy_interval_blocks: 210_000,
        initial_subsidy: 50 * COIN,
        pow_limit: hash256_from_hex(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("pow limit literal"),
        pow_target_spacing: 600,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty: true,
        pow_no_retargeting: false,
        deployments: deployment_heights([
            514, // bip16
            21_111, // bip34
            330_776, // bip66
            581_885, // bip65
            770_112, // csv
            834_624, // segwit
        ]),
        checkpoints: vec![Checkpoint {
            height: 546,
            hash: hash256_from_hex(
                "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
            )
            .expect("checkpoint literal"),
        }],
        minimum_chain_work: hash256_from_hex("00").expect("zero work literal"),
    }
}

fn regtest_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        // Computed from the regtest genesis header below on first use; the
        // placeholder is overwritten by `initchain`-style test setup.
        hash_genesis_block: hash256_from_hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )
        .expect("genesis hash literal"),
        genesis_time: 1_296_688_602,
        genesis_bits: 0x207f_ffff,
        genesis_nonce: 2,
        genesis_version: 1,
        genesis_merkle_root: hash256_from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("genesis merkle literal"),
        subsidy_interval_blocks: 150,
        initial_subsidy: 50 * COIN,
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("pow limit literal"),
        pow_target_spacing: 600,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty: true,
        pow_no_retargeting: true,
        deployments: deployment_heights([
            DeploymentSchedule::ALWAYS_ACTIVE, // bip16
            500,                               // bip34
            1251,                              // bip66
            1351,                              // bip65
            432,                               // csv
            DeploymentSchedule::ALWAYS_ACTIVE, // segwit
        ]),
        checkpoints: Vec::new(),
        minimum_chain_work: hash256_from_hex("00").expect("zero work literal"),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: mainnet_params(),
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            default_port: 8333,
        },
        Network::Testnet => ChainParams {
            network,
            consensus: testnet_params(),
            message_start: [0x0b, 0x11, 0x09, 0x07],
            default_port: 18333,
        },
        Network::Regtest => ChainParams {
            network,
            consensus: regtest_params(),
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18444,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash256_from_hex(hex).expect("parse");
        assert_eq!(hash256_to_hex(&hash), hex);
    }

    #[test]
    fn short_hex_is_left_padded() {
        let hash = hash256_from_hex("ff").expect("parse");
        assert_eq!(hash[0], 0xff);
        assert!(hash[1..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn retarget_interval_is_2016_on_mainnet() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.consensus.retarget_interval(), 2016);
    }

    #[test]
    fn checkpoint_lookup() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.consensus.top_checkpoint(), 295_000);
        assert!(params.consensus.checkpoint_at(33_333).is_some());
        assert!(params.consensus.checkpoint_at(33_334).is_none());
    }

    #[test]
    fn deployment_gate() {
        use crate::deployments::Deployment;
        let params = chain_params(Network::Mainnet);
        let schedule = &params.consensus.deployments;
        assert_eq!(
            schedule[Deployment::Segwit.as_usize()].activation_height,
            481_824
        );
    }
}
