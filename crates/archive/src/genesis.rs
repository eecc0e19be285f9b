//! Genesis block construction.

use bn_consensus::ConsensusParams;
use bn_primitives::block::{Block, BlockHeader};
use bn_primitives::outpoint::OutPoint;
use bn_primitives::transaction::{Transaction, TxIn, TxOut, Witness, SEQUENCE_FINAL};

const GENESIS_MESSAGE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_PUBKEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

/// The network's genesis block, reconstructed from its parameters.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let mut script_sig = Vec::with_capacity(4 + 2 + 1 + GENESIS_MESSAGE.len());
    // Pushes of the launch difficulty target and the extra nonce.
    script_sig.extend_from_slice(&[0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04]);
    script_sig.push(GENESIS_MESSAGE.len() as u8);
    script_sig.extend_from_slice(GENESIS_MESSAGE);

    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(65);
    script_pubkey.extend_from_slice(&GENESIS_PUBKEY);
    script_pubkey.push(0xac);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
            witness: Witness::default(),
        }],
        vout: vec![TxOut {
            value: params.initial_subsidy,
            script_pubkey,
        }],
        lock_time: 0,
    };

    Block {
        header: BlockHeader {
            version: params.genesis_version,
            prev_block: [0u8; 32],
            merkle_root: params.genesis_merkle_root,
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        },
        transactions: vec![coinbase],
    }
}
