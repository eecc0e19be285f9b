use std::sync::Arc;

use bn_archive::{Archive, BlockState, HeaderLink};
use bn_consensus::params::{chain_params, Network};
use bn_pow::difficulty::target_to_compact;
use bn_primitives::block::{Block, BlockHeader};
use bn_primitives::outpoint::OutPoint;
use bn_primitives::transaction::{Transaction, TxIn, TxOut, Witness, SEQUENCE_FINAL};
use bn_storage::memory::MemoryStore;

fn coinbase(height: u32, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: SEQUENCE_FINAL,
            witness: Witness::default(),
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn make_block(prev_block: [u8; 32], time: u32, bits: u32, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block,
            merkle_root: [0u8; 32],
            time,
            bits,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.merkle_root();
    block
}

struct Chain {
    archive: Archive<MemoryStore>,
    genesis: Block,
    bits: u32,
}

fn setup() -> Chain {
    let mut params = chain_params(Network::Regtest).consensus;
    let bits = target_to_compact(&params.pow_limit);
    let genesis = make_block([0u8; 32], 1_600_000_000, bits, vec![coinbase(0, 0)]);
    params.hash_genesis_block = genesis.hash();

    let store = Arc::new(MemoryStore::new());
    let archive = Archive::new(store, params, true);
    archive.initialize(&genesis).expect("initialize");
    Chain {
        archive,
        genesis,
        bits,
    }
}

/// Extend the candidate chain with an empty block at each height.
fn extend(chain: &Chain, prev: [u8; 32], heights: std::ops::RangeInclusive<u32>) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut prev_hash = prev;
    for height in heights {
        let block = make_block(
            prev_hash,
            1_600_000_000 + height * 600,
            chain.bits,
            vec![coinbase(height, 0)],
        );
        prev_hash = block.hash();
        let link = chain.archive.put_header(&block.header).expect("put header");
        chain.archive.push_candidate(link).expect("push candidate");
        blocks.push(block);
    }
    blocks
}

#[test]
fn initialize_seeds_both_chains() {
    let chain = setup();
    assert_eq!(chain.archive.get_top_candidate().expect("top"), 0);
    assert_eq!(chain.archive.get_top_confirmed().expect("top"), 0);
    assert_eq!(chain.archive.get_fork().expect("fork"), 0);
    let genesis_link = chain
        .archive
        .to_link(&chain.genesis.hash())
        .expect("link")
        .expect("genesis interned");
    assert_eq!(genesis_link, HeaderLink(0));
    assert_eq!(
        chain.archive.get_block_state(genesis_link).expect("state"),
        BlockState::BlockConfirmable
    );
}

#[test]
fn header_round_trip_preserves_bytes() {
    let chain = setup();
    let blocks = extend(&chain, chain.genesis.hash(), 1..=3);
    for block in &blocks {
        let link = chain
            .archive
            .to_link(&block.hash())
            .expect("link")
            .expect("interned");
        let header = chain.archive.get_block_header(link).expect("header");
        assert_eq!(header.consensus_encode(), block.header.consensus_encode());
    }
}

#[test]
fn candidate_fork_lists_headers_above_fork_point() {
    let chain = setup();
    let blocks = extend(&chain, chain.genesis.hash(), 1..=5);
    let fork = chain.archive.get_candidate_fork(5).expect("fork");
    assert_eq!(fork.len(), 5);
    for (index, link) in fork.iter().enumerate() {
        let entry = chain.archive.get_header(*link).expect("entry");
        assert_eq!(entry.height, index as u32 + 1);
        assert_eq!(entry.hash, blocks[index].hash());
    }
    // Beyond the candidate top there is no fork.
    assert!(chain.archive.get_candidate_fork(6).expect("fork").is_empty());
}

#[test]
fn association_advances_watermark_contiguously() {
    let chain = setup();
    let blocks = extend(&chain, chain.genesis.hash(), 1..=3);
    let links: Vec<HeaderLink> = blocks
        .iter()
        .map(|block| {
            chain
                .archive
                .to_link(&block.hash())
                .expect("link")
                .expect("interned")
        })
        .collect();

    // Deliver out of order: 3 first leaves the watermark at 0.
    chain.archive.associate(links[2], &blocks[2]).expect("associate");
    assert_eq!(chain.archive.get_top_associated().expect("top"), 0);
    assert_eq!(
        chain.archive.get_block_state(links[2]).expect("state"),
        BlockState::Unvalidated
    );

    chain.archive.associate(links[0], &blocks[0]).expect("associate");
    assert_eq!(chain.archive.get_top_associated().expect("top"), 1);

    // Delivering 2 closes the gap through 3.
    chain.archive.associate(links[1], &blocks[1]).expect("associate");
    assert_eq!(chain.archive.get_top_associated().expect("top"), 3);

    assert_eq!(
        chain
            .archive
            .get_unassociated_above(0, 16)
            .expect("unassociated")
            .len(),
        0
    );
}

#[test]
fn push_and_pop_confirmed_reverse_utxo_effects() {
    let chain = setup();

    // Block 1 funds an output; block 2 spends it.
    let fund = coinbase(1, 50);
    let fund_txid = fund.txid();
    let block1 = make_block(chain.genesis.hash(), 1_600_000_600, chain.bits, vec![fund]);

    let spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: fund_txid,
                index: 0,
            },
            script_sig: vec![0x01],
            sequence: SEQUENCE_FINAL,
            witness: Witness::default(),
        }],
        vout: vec![TxOut {
            value: 50,
            script_pubkey: vec![0x52],
        }],
        lock_time: 0,
    };
    let block2 = make_block(block1.hash(), 1_600_001_200, chain.bits, vec![
        coinbase(2, 0),
        spend,
    ]);

    let link1 = chain.archive.put_header(&block1.header).expect("header 1");
    chain.archive.push_candidate(link1).expect("candidate 1");
    chain.archive.associate(link1, &block1).expect("associate 1");
    let link2 = chain.archive.put_header(&block2.header).expect("header 2");
    chain.archive.push_candidate(link2).expect("candidate 2");
    chain.archive.associate(link2, &block2).expect("associate 2");

    chain.archive.block_confirmable(link1).expect("confirmable 1");
    chain.archive.push_confirmed(link1, true).expect("push 1");
    chain.archive.block_confirmable(link2).expect("confirmable 2");
    chain.archive.push_confirmed(link2, true).expect("push 2");
    assert_eq!(chain.archive.get_top_confirmed().expect("top"), 2);

    // The funding output is spent, the spend's output exists.
    assert!(matches!(
        chain.archive.block_confirmable(link2),
        Err(bn_archive::ArchiveError::Validation(_))
    ));

    let popped = chain.archive.pop_confirmed().expect("pop 2");
    assert_eq!(popped, link2);
    assert_eq!(chain.archive.get_top_confirmed().expect("top"), 1);

    // After the pop the funding output is unspent again, so block 2 is
    // confirmable once more, and the spend's own txid no longer shadows.
    chain.archive.block_confirmable(link2).expect("confirmable again");
}

#[test]
fn confirmable_rejects_double_spend_and_missing_prevout() {
    let chain = setup();

    let fund = coinbase(1, 50);
    let fund_txid = fund.txid();
    let block1 = make_block(chain.genesis.hash(), 1_600_000_600, chain.bits, vec![fund]);
    let link1 = chain.archive.put_header(&block1.header).expect("header 1");
    chain.archive.push_candidate(link1).expect("candidate 1");
    chain.archive.associate(link1, &block1).expect("associate 1");
    chain.archive.push_confirmed(link1, true).expect("push 1");

    // A block spending an outpoint that does not exist.
    let bogus_spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: [0xee; 32],
                index: 7,
            },
            script_sig: vec![0x01],
            sequence: SEQUENCE_FINAL,
            witness: Witness::default(),
        }],
        vout: vec![TxOut {
            value: 1,
            script_pubkey: vec![0x53],
        }],
        lock_time: 0,
    };
    let block2 = make_block(block1.hash(), 1_600_001_200, chain.bits, vec![
        coinbase(2, 0),
        bogus_spend,
    ]);
    let link2 = chain.archive.put_header(&block2.header).expect("header 2");
    chain.archive.push_candidate(link2).expect("candidate 2");
    chain.archive.associate(link2, &block2).expect("associate 2");
    assert!(matches!(
        chain.archive.block_confirmable(link2),
        Err(bn_archive::ArchiveError::Validation(_))
    ));
}

#[test]
fn populate_resolves_archived_and_in_block_prevouts() {
    let chain = setup();

    let fund = coinbase(1, 50);
    let fund_txid = fund.txid();
    let block1 = make_block(chain.genesis.hash(), 1_600_000_600, chain.bits, vec![fund]);
    let link1 = chain.archive.put_header(&block1.header).expect("header 1");
    chain.archive.push_candidate(link1).expect("candidate 1");
    chain.archive.associate(link1, &block1).expect("associate 1");

    // Block 2: spend the archived output, then spend that spend in-block.
    let spend_a = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: fund_txid,
                index: 0,
            },
            script_sig: vec![0x01],
            sequence: SEQUENCE_FINAL,
            witness: Witness::default(),
        }],
        vout: vec![TxOut {
            value: 40,
            script_pubkey: vec![0x54],
        }],
        lock_time: 0,
    };
    let spend_b = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: spend_a.txid(),
                index: 0,
            },
            script_sig: vec![0x02],
            sequence: SEQUENCE_FINAL,
            witness: Witness::default(),
        }],
        vout: vec![TxOut {
            value: 40,
            script_pubkey: vec![0x55],
        }],
        lock_time: 0,
    };
    let block2 = make_block(block1.hash(), 1_600_001_200, chain.bits, vec![
        coinbase(2, 0),
        spend_a,
        spend_b,
    ]);

    let prevouts = chain
        .archive
        .populate_with_metadata(&block2)
        .expect("populate");
    assert_eq!(prevouts.len(), 3);
    assert!(prevouts[0].is_empty());
    assert_eq!(prevouts[1][0].value, 50);
    assert_eq!(prevouts[1][0].height, 1);
    assert!(prevouts[1][0].coinbase);
    assert_eq!(prevouts[2][0].value, 40);

    // An unknown prevout is a validation error, not a fault.
    let mut orphan_spend = block2.clone();
    orphan_spend.transactions[1].vin[0].prevout.hash = [0x99; 32];
    assert!(matches!(
        chain.archive.populate_with_metadata(&orphan_spend),
        Err(bn_archive::ArchiveError::Validation(
            bn_archive::ValidationError::MissingPreviousOutput
        ))
    ));
}

#[test]
fn strong_requires_strictly_more_work() {
    let chain = setup();
    let blocks = extend(&chain, chain.genesis.hash(), 1..=3);

    // Confirm the three candidate blocks.
    for block in &blocks {
        let link = chain
            .archive
            .to_link(&block.hash())
            .expect("link")
            .expect("interned");
        chain.archive.associate(link, block).expect("associate");
        chain.archive.push_confirmed(link, true).expect("push");
    }

    let fork = chain.archive.get_candidate_fork(3).expect("fork");
    assert!(fork.is_empty(), "candidate equals confirmed");

    // Equal work does not overtake.
    let work = chain
        .archive
        .get_work(&[chain
            .archive
            .to_confirmed(3)
            .expect("confirmed")
            .expect("present")])
        .expect("work");
    assert!(!chain.archive.get_strong(work, 2).expect("strong"));
    // Strictly more work does.
    assert!(chain
        .archive
        .get_strong(work * 2, 2)
        .expect("strong"));
}

#[test]
fn filter_heads_chain_from_genesis() {
    let chain = setup();
    let blocks = extend(&chain, chain.genesis.hash(), 1..=2);
    let links: Vec<HeaderLink> = blocks
        .iter()
        .map(|block| {
            chain
                .archive
                .to_link(&block.hash())
                .expect("link")
                .expect("interned")
        })
        .collect();
    for (link, block) in links.iter().zip(&blocks) {
        chain.archive.set_filter_body(*link, block).expect("body");
        chain.archive.set_filter_head(*link).expect("head");
        assert!(chain.archive.is_filtered(*link).expect("filtered"));
    }
}
