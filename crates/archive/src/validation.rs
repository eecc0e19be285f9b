//! Block validation rules.
//!
//! `check_block` is context-free and runs at association time. `accept_block`
//! and `connect_block` are contextual and run on the validate pool against a
//! populated block.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use bn_consensus::constants::{MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};
use bn_consensus::money::{money_range, Amount};
use bn_consensus::{block_subsidy, ConsensusParams};
use bn_primitives::block::Block;
use bn_script::verify::{ScriptError, ScriptFlags};
use bn_script::{sigop_count, verify_input};

use crate::context::BlockContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBlock(&'static str),
    InvalidTransaction(&'static str),
    MerkleMismatch,
    DuplicateTransaction,
    DuplicateInput,
    ValueOutOfRange,
    MissingPreviousOutput,
    ImmatureCoinbaseSpend,
    NonFinalTransaction,
    TimestampTooOld,
    TimestampTooNew,
    VersionTooLow,
    IncorrectWork,
    ExcessSigops,
    ExcessSubsidy,
    Script(ScriptError),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidBlock(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::DuplicateInput => write!(f, "duplicate input"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::MissingPreviousOutput => write!(f, "missing previous output"),
            ValidationError::ImmatureCoinbaseSpend => write!(f, "immature coinbase spend"),
            ValidationError::NonFinalTransaction => write!(f, "non-final transaction"),
            ValidationError::TimestampTooOld => write!(f, "timestamp before median time past"),
            ValidationError::TimestampTooNew => write!(f, "timestamp too far in the future"),
            ValidationError::VersionTooLow => write!(f, "block version below minimum"),
            ValidationError::IncorrectWork => write!(f, "incorrect proof of work target"),
            ValidationError::ExcessSigops => write!(f, "too many signature operations"),
            ValidationError::ExcessSubsidy => write!(f, "coinbase claims excess subsidy"),
            ValidationError::Script(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ScriptError> for ValidationError {
    fn from(err: ScriptError) -> Self {
        ValidationError::Script(err)
    }
}

/// A resolved previous output attached to an input during population.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrevOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub coinbase: bool,
}

/// Previous outputs per transaction, per input. The coinbase entry is empty.
pub type BlockPrevouts = Vec<Vec<PrevOut>>;

/// Context-free block checks: structure, merkle commitment, duplicates,
/// size and sigop ceilings.
pub fn check_block(block: &Block) -> Result<(), ValidationError> {
    if block.transactions.is_empty() {
        return Err(ValidationError::InvalidBlock("block has no transactions"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::InvalidBlock("first transaction not coinbase"));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ValidationError::InvalidBlock("multiple coinbase transactions"));
    }
    if block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::InvalidBlock("block exceeds maximum size"));
    }

    let mut txids = HashSet::with_capacity(block.transactions.len());
    let mut spent = HashSet::new();
    let mut sigops = 0usize;
    for tx in &block.transactions {
        if tx.vin.is_empty() || tx.vout.is_empty() {
            return Err(ValidationError::InvalidTransaction("empty inputs or outputs"));
        }
        let mut value_out: Amount = 0;
        for output in &tx.vout {
            if !money_range(output.value) {
                return Err(ValidationError::ValueOutOfRange);
            }
            value_out = value_out.saturating_add(output.value);
            sigops += sigop_count(&output.script_pubkey);
        }
        if !money_range(value_out) {
            return Err(ValidationError::ValueOutOfRange);
        }
        if !tx.is_coinbase() {
            for input in &tx.vin {
                if input.prevout.is_null() {
                    return Err(ValidationError::InvalidTransaction("null prevout"));
                }
                if !spent.insert(input.prevout) {
                    return Err(ValidationError::DuplicateInput);
                }
                sigops += sigop_count(&input.script_sig);
            }
        }
        if !txids.insert(tx.txid()) {
            return Err(ValidationError::DuplicateTransaction);
        }
    }
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::ExcessSigops);
    }

    if block.merkle_root() != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch);
    }

    Ok(())
}

/// Contextual acceptance: position-dependent rules evaluated against the
/// block's derived context and populated prevouts.
pub fn accept_block(
    block: &Block,
    ctx: &BlockContext,
    prevouts: &BlockPrevouts,
    params: &ConsensusParams,
) -> Result<u64, ValidationError> {
    let header = &block.header;
    if header.bits != ctx.work_required {
        return Err(ValidationError::IncorrectWork);
    }
    if header.time <= ctx.median_time_past && ctx.height > 0 {
        return Err(ValidationError::TimestampTooOld);
    }
    if header.version < ctx.minimum_version {
        return Err(ValidationError::VersionTooLow);
    }

    let maturity = bn_consensus::constants::COINBASE_MATURITY;
    let mut fees: Amount = 0;
    for (tx, tx_prevouts) in block.transactions.iter().zip(prevouts) {
        if !tx.is_final(ctx.height, ctx.median_time_past) {
            return Err(ValidationError::NonFinalTransaction);
        }
        if tx.is_coinbase() {
            continue;
        }
        let mut value_in: Amount = 0;
        for prevout in tx_prevouts {
            if prevout.coinbase && ctx.height < prevout.height.saturating_add(maturity) {
                return Err(ValidationError::ImmatureCoinbaseSpend);
            }
            if !money_range(prevout.value) {
                return Err(ValidationError::ValueOutOfRange);
            }
            value_in = value_in.saturating_add(prevout.value);
        }
        let value_out = tx.value_out();
        if value_out > value_in {
            return Err(ValidationError::ValueOutOfRange);
        }
        fees = fees.saturating_add(value_in - value_out);
        if !money_range(fees) {
            return Err(ValidationError::ValueOutOfRange);
        }
    }

    let subsidy = block_subsidy(ctx.height, params);
    let coinbase_out = block.transactions[0].value_out();
    if coinbase_out > subsidy.saturating_add(fees) {
        return Err(ValidationError::ExcessSubsidy);
    }

    Ok(fees as u64)
}

static CONNECT_INVOCATIONS: AtomicU64 = AtomicU64::new(0);

/// Total `connect_block` calls since process start. Lets tests pin down that
/// no block is validated twice outside the prevout-cache shortcut.
pub fn connect_invocations() -> u64 {
    CONNECT_INVOCATIONS.load(Ordering::Relaxed)
}

/// Script and witness verification of every input against its prevout.
pub fn connect_block(
    block: &Block,
    prevouts: &BlockPrevouts,
    flags: ScriptFlags,
) -> Result<(), ValidationError> {
    CONNECT_INVOCATIONS.fetch_add(1, Ordering::Relaxed);
    for (tx, tx_prevouts) in block.transactions.iter().zip(prevouts) {
        if tx.is_coinbase() {
            continue;
        }
        for (input_index, prevout) in tx_prevouts.iter().enumerate() {
            verify_input(tx, input_index, &prevout.script_pubkey, prevout.value, flags)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bn_consensus::deployments::Forks;
    use bn_consensus::{chain_params, Network};
    use bn_primitives::block::BlockHeader;
    use bn_primitives::outpoint::OutPoint;
    use bn_primitives::transaction::{Transaction, TxIn, TxOut, Witness, SEQUENCE_FINAL};

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

    fn block_with(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 1_296_688_700,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.merkle_root();
        block
    }

    fn regtest_ctx(height: u32) -> BlockContext {
        let params = chain_params(Network::Regtest).consensus;
        BlockContext {
            height,
            timestamp: 1_296_688_700,
            median_time_past: 1_296_688_000,
            work_required: 0x207f_ffff,
            forks: Forks::from_height(height, &params.deployments),
            minimum_version: 1,
        }
    }

    #[test]
    fn check_accepts_simple_block() {
        let block = block_with(vec![coinbase(1, 50)]);
        check_block(&block).expect("valid block");
    }

    #[test]
    fn check_rejects_missing_coinbase() {
        let mut tx = coinbase(1, 50);
        tx.vin[0].prevout = OutPoint {
            hash: [1u8; 32],
            index: 0,
        };
        let block = block_with(vec![tx]);
        assert!(matches!(
            check_block(&block),
            Err(ValidationError::InvalidBlock(_))
        ));
    }

    #[test]
    fn check_rejects_duplicate_transaction() {
        let tx = coinbase(1, 50);
        let mut spend = coinbase(2, 50);
        spend.vin[0].prevout = OutPoint {
            hash: [3u8; 32],
            index: 0,
        };
        let block = block_with(vec![tx, spend.clone(), spend]);
        assert!(matches!(
            check_block(&block),
            Err(ValidationError::DuplicateInput) | Err(ValidationError::DuplicateTransaction)
        ));
    }

    #[test]
    fn check_rejects_merkle_mismatch() {
        let mut block = block_with(vec![coinbase(1, 50)]);
        block.header.merkle_root = [0xff; 32];
        assert_eq!(check_block(&block), Err(ValidationError::MerkleMismatch));
    }

    #[test]
    fn accept_rejects_wrong_bits() {
        let params = chain_params(Network::Regtest).consensus;
        let block = block_with(vec![coinbase(1, 50)]);
        let mut ctx = regtest_ctx(1);
        ctx.work_required = 0x1d00_ffff;
        let prevouts = vec![Vec::new()];
        assert_eq!(
            accept_block(&block, &ctx, &prevouts, &params),
            Err(ValidationError::IncorrectWork)
        );
    }

    #[test]
    fn accept_rejects_excess_subsidy() {
        let params = chain_params(Network::Regtest).consensus;
        let block = block_with(vec![coinbase(1, params.initial_subsidy + 1)]);
        let ctx = regtest_ctx(1);
        let prevouts = vec![Vec::new()];
        assert_eq!(
            accept_block(&block, &ctx, &prevouts, &params),
            Err(ValidationError::ExcessSubsidy)
        );
    }

    #[test]
    fn accept_rejects_immature_coinbase_spend() {
        let params = chain_params(Network::Regtest).consensus;
        let mut spend = coinbase(0, 50);
        spend.vin[0].prevout = OutPoint {
            hash: [5u8; 32],
            index: 0,
        };
        let block = block_with(vec![coinbase(5, 50), spend]);
        let ctx = regtest_ctx(5);
        let prevouts = vec![
            Vec::new(),
            vec![PrevOut {
                value: 50,
                script_pubkey: vec![0x51],
                height: 4,
                coinbase: true,
            }],
        ];
        assert_eq!(
            accept_block(&block, &ctx, &prevouts, &params),
            Err(ValidationError::ImmatureCoinbaseSpend)
        );
    }

    #[test]
    fn accept_collects_fees() {
        let params = chain_params(Network::Regtest).consensus;
        let mut spend = coinbase(0, 40);
        spend.vin[0].prevout = OutPoint {
            hash: [5u8; 32],
            index: 0,
        };
        let block = block_with(vec![coinbase(5, 50), spend]);
        let ctx = regtest_ctx(5);
        let prevouts = vec![
            Vec::new(),
            vec![PrevOut {
                value: 50,
                script_pubkey: vec![0x51],
                height: 1,
                coinbase: false,
            }],
        ];
        let fees = accept_block(&block, &ctx, &prevouts, &params).expect("accept");
        assert_eq!(fees, 10);
    }

    #[test]
    fn connect_counts_invocations() {
        let block = block_with(vec![coinbase(1, 50)]);
        let before = connect_invocations();
        connect_block(&block, &vec![Vec::new()], 0).expect("connect");
        assert_eq!(connect_invocations(), before + 1);
    }
}
