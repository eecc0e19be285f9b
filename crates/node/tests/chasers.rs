use std::sync::Arc;
use std::time::{Duration, Instant};

use bn_archive::{genesis_block, Archive, BlockState};
use bn_consensus::money::COIN;
use bn_consensus::params::{chain_params, Network};
use bn_node::config::Config;
use bn_node::events::{Chase, ChaseEvent};
use bn_node::node::FullNode;
use bn_pow::validation::validate_pow_header;
use bn_primitives::block::{Block, BlockHeader};
use bn_primitives::outpoint::OutPoint;
use bn_primitives::transaction::{Transaction, TxIn, TxOut, Witness, SEQUENCE_FINAL};
use bn_storage::memory::MemoryStore;
use crossbeam_channel::Receiver;

const BASE_TIME: u32 = 1_600_000_000;
const PEER: u64 = 7;

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

/// Build and grind a block until its header meets the regtest target.
fn mine_block(
    prev_block: [u8; 32],
    height: u32,
    time_offset: u32,
    transactions: Vec<Transaction>,
) -> Block {
    let params = chain_params(Network::Regtest).consensus;
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block,
            merkle_root: [0u8; 32],
            time: BASE_TIME + height * 600 + time_offset,
            bits: params.genesis_bits,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.merkle_root();
    while validate_pow_header(&block.header, &params).is_err() {
        block.header.nonce += 1;
    }
    block
}

fn mine_chain(prev: [u8; 32], heights: std::ops::RangeInclusive<u32>, offset: u32) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut prev_hash = prev;
    for height in heights {
        let block = mine_block(prev_hash, height, offset, vec![coinbase(height, 50 * COIN)]);
        prev_hash = block.hash();
        blocks.push(block);
    }
    blocks
}

struct Harness {
    node: FullNode<MemoryStore>,
    archive: Arc<Archive<MemoryStore>>,
    events: Receiver<ChaseEvent>,
    genesis: Block,
}

fn start_node() -> Harness {
    let mut config = Config::default();
    config.bitcoin.network = "regtest".to_string();
    config.node.threads = 2;
    config.node.maximum_concurrency = 8;

    let params = chain_params(Network::Regtest).consensus;
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(Archive::new(store, params, false));
    let genesis = genesis_block(archive.params());
    archive.initialize(&genesis).expect("initialize");

    let mut node = FullNode::new(Arc::clone(&archive), config);
    let (_, events) = node.inner().bus.subscribe();
    node.start().expect("start");
    Harness {
        node,
        archive,
        events,
        genesis,
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn drain(events: &Receiver<ChaseEvent>) -> Vec<ChaseEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Accumulate events until the predicate holds or the deadline passes.
fn collect_until(
    events: &Receiver<ChaseEvent>,
    what: &str,
    mut done: impl FnMut(&[ChaseEvent]) -> bool,
) -> Vec<ChaseEvent> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        seen.extend(drain(events));
        if done(&seen) {
            return seen;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out collecting {what}");
}

fn heights_of(events: &[ChaseEvent], chase: Chase) -> Vec<u64> {
    events
        .iter()
        .filter(|event| event.chase == chase)
        .map(|event| event.value)
        .collect()
}

#[test]
fn fresh_sync_three_blocks() {
    let mut harness = start_node();
    let blocks = mine_chain(harness.genesis.hash(), 1..=3, 0);

    harness
        .node
        .organize_headers(blocks.iter().map(|block| block.header).collect(), PEER);
    wait_until("candidate at 3", || {
        harness.archive.get_top_candidate().expect("top") == 3
    });

    for block in &blocks {
        harness.node.submit_block(block.clone(), PEER);
    }
    wait_until("confirmed at 3", || {
        harness.archive.get_top_confirmed().expect("top") == 3
    });

    let events = collect_until(&harness.events, "pipeline events", |seen| {
        heights_of(seen, Chase::Organized).len() == 6
            && heights_of(seen, Chase::Confirmable).len() == 3
    });
    assert_eq!(heights_of(&events, Chase::Checked), vec![1, 2, 3]);
    for height in 1..=3u64 {
        assert!(heights_of(&events, Chase::Valid).contains(&height));
        assert!(heights_of(&events, Chase::Confirmable).contains(&height));
    }
    assert!(heights_of(&events, Chase::Disorganized).is_empty());

    for height in 1..=3u32 {
        let link = harness
            .archive
            .to_confirmed(height)
            .expect("confirmed")
            .expect("present");
        assert_eq!(
            harness.archive.get_block_state(link).expect("state"),
            BlockState::BlockConfirmable
        );
    }

    harness.node.stop();
    assert!(harness.node.close().is_none());
}

#[test]
fn out_of_order_bodies_settle_identically() {
    let mut harness = start_node();
    let blocks = mine_chain(harness.genesis.hash(), 1..=3, 0);

    harness
        .node
        .organize_headers(blocks.iter().map(|block| block.header).collect(), PEER);
    wait_until("candidate at 3", || {
        harness.archive.get_top_candidate().expect("top") == 3
    });

    // Bodies arrive C, A, B.
    for index in [2usize, 0, 1] {
        harness.node.submit_block(blocks[index].clone(), PEER);
    }
    wait_until("confirmed at 3", || {
        harness.archive.get_top_confirmed().expect("top") == 3
    });

    let events = collect_until(&harness.events, "confirmables", |seen| {
        heights_of(seen, Chase::Confirmable).len() == 3
    });
    // Checked fires per receipt: C's height leads.
    assert_eq!(heights_of(&events, Chase::Checked), vec![3, 1, 2]);
    // Confirmation is gated sequentially regardless of completion order.
    assert_eq!(heights_of(&events, Chase::Confirmable), vec![1, 2, 3]);

    harness.node.stop();
    assert!(harness.node.close().is_none());
}

#[test]
fn reorg_at_height_two() {
    let mut harness = start_node();
    let blocks = mine_chain(harness.genesis.hash(), 1..=3, 0);
    harness
        .node
        .organize_headers(blocks.iter().map(|block| block.header).collect(), PEER);
    wait_until("candidate at 3", || {
        harness.archive.get_top_candidate().expect("top") == 3
    });
    for block in &blocks {
        harness.node.submit_block(block.clone(), PEER);
    }
    wait_until("confirmed at 3", || {
        harness.archive.get_top_confirmed().expect("top") == 3
    });
    let _ = drain(&harness.events);

    // A stronger branch from height 2: B', C', D'.
    let branch = mine_chain(blocks[0].hash(), 2..=4, 7);
    harness
        .node
        .organize_headers(branch.iter().map(|block| block.header).collect(), PEER);
    wait_until("candidate at 4", || {
        harness.archive.get_top_candidate().expect("top") == 4
            && harness
                .archive
                .to_candidate(2)
                .expect("candidate")
                .map(|link| harness.archive.get_header(link).expect("entry").hash)
                == Some(branch[0].hash())
    });

    for block in &branch {
        harness.node.submit_block(block.clone(), PEER);
    }
    wait_until("confirmed at 4", || {
        harness.archive.get_top_confirmed().expect("top") == 4
    });

    let events = collect_until(&harness.events, "reorg events", |seen| {
        heights_of(seen, Chase::Reorganized).len() == 2
    });
    assert_eq!(heights_of(&events, Chase::Disorganized), vec![1]);

    // The old branch is retained in the archive, off the candidate chain.
    for old in &blocks[1..] {
        let link = harness
            .archive
            .to_link(&old.hash())
            .expect("link")
            .expect("retained");
        let entry = harness.archive.get_header(link).expect("entry");
        assert_ne!(
            harness.archive.to_candidate(entry.height).expect("candidate"),
            Some(link)
        );
    }

    harness.node.stop();
    assert!(harness.node.close().is_none());
}

#[test]
fn invalid_block_mid_branch() {
    let mut harness = start_node();
    let block_a = mine_block(
        harness.genesis.hash(),
        1,
        0,
        vec![coinbase(1, 50 * COIN)],
    );
    // B claims more than the subsidy.
    let block_b = mine_block(block_a.hash(), 2, 0, vec![coinbase(2, 50 * COIN + 1)]);
    let block_c = mine_block(block_b.hash(), 3, 0, vec![coinbase(3, 50 * COIN)]);

    harness.node.organize_headers(
        vec![block_a.header, block_b.header, block_c.header],
        PEER,
    );
    wait_until("candidate at 3", || {
        harness.archive.get_top_candidate().expect("top") == 3
    });

    harness.node.submit_block(block_a.clone(), PEER);
    harness.node.submit_block(block_b.clone(), PEER);

    let link_b = || {
        harness
            .archive
            .to_link(&block_b.hash())
            .expect("link")
            .expect("interned")
    };
    wait_until("B unconfirmable", || {
        matches!(
            harness.archive.get_block_state(link_b()).expect("state"),
            BlockState::BlockUnconfirmable
        )
    });
    wait_until("A confirmed", || {
        harness.archive.get_top_confirmed().expect("top") == 1
    });

    let events = collect_until(&harness.events, "unvalid event", |seen| {
        !heights_of(seen, Chase::Unvalid).is_empty()
    });
    assert!(heights_of(&events, Chase::Unvalid).contains(&u64::from(link_b().0)));

    // C is stranded behind the invalid block, never validated.
    harness.node.submit_block(block_c.clone(), PEER);
    let link_c = || {
        harness
            .archive
            .to_link(&block_c.hash())
            .expect("link")
            .expect("interned")
    };
    wait_until("C associated", || {
        harness.archive.is_associated(link_c()).expect("associated")
    });
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        harness.archive.get_block_state(link_c()).expect("state"),
        BlockState::Unvalidated
    );
    assert_eq!(harness.archive.get_top_confirmed().expect("top"), 1);

    harness.node.stop();
    assert!(harness.node.close().is_none());
}

#[test]
fn equal_work_tie_retains_first_branch() {
    let mut harness = start_node();
    let blocks = mine_chain(harness.genesis.hash(), 1..=3, 0);
    harness
        .node
        .organize_headers(blocks.iter().map(|block| block.header).collect(), PEER);
    wait_until("candidate at 3", || {
        harness.archive.get_top_candidate().expect("top") == 3
    });
    let _ = drain(&harness.events);

    // An equal-work branch from height 2.
    let branch = mine_chain(blocks[0].hash(), 2..=3, 7);
    harness
        .node
        .organize_headers(branch.iter().map(|block| block.header).collect(), PEER);

    // The rival branch lands in the archive without a candidate switch.
    wait_until("branch archived", || {
        harness
            .archive
            .to_link(&branch[1].hash())
            .expect("link")
            .is_some()
    });

    let events = drain(&harness.events);
    assert!(heights_of(&events, Chase::Disorganized).is_empty());
    let candidate_two = harness
        .archive
        .to_candidate(2)
        .expect("candidate")
        .map(|link| harness.archive.get_header(link).expect("entry").hash);
    assert_eq!(candidate_two, Some(blocks[1].hash()));

    harness.node.stop();
    assert!(harness.node.close().is_none());
}

#[test]
fn shutdown_mid_validation_leaves_contiguous_prefix() {
    let mut harness = start_node();
    let blocks = mine_chain(harness.genesis.hash(), 1..=24, 0);
    harness
        .node
        .organize_headers(blocks.iter().map(|block| block.header).collect(), PEER);
    wait_until("candidate at 24", || {
        harness.archive.get_top_candidate().expect("top") == 24
    });
    for block in &blocks {
        harness.node.submit_block(block.clone(), PEER);
    }

    // Stop while validation is in flight; in-flight tasks run out.
    harness.node.stop();
    harness.node.stop();
    assert!(harness.node.close().is_none());

    let top_confirmed = harness.archive.get_top_confirmed().expect("top");
    let top_candidate = harness.archive.get_top_candidate().expect("top");
    assert!(top_confirmed <= top_candidate);
    for height in 1..=top_confirmed {
        let link = harness
            .archive
            .to_confirmed(height)
            .expect("confirmed")
            .expect("present");
        assert_eq!(
            harness.archive.get_block_state(link).expect("state"),
            BlockState::BlockConfirmable
        );
    }
}
