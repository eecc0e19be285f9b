//! The archive proper: queries and commands over the chain tables.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bn_consensus::constants::MEDIAN_TIME_SPAN;
use bn_consensus::deployments::{minimum_block_version, Forks};
use bn_consensus::{ConsensusParams, Hash256};
use bn_pow::difficulty::{block_proof, get_next_work_required, HeaderInfo};
use bn_primitives::block::{Block, BlockHeader};
use bn_primitives::encoding::{Decodable, Decoder, Encodable, Encoder};
use bn_primitives::hash::sha256d;
use bn_primitives::outpoint::OutPoint;
use bn_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::context::{median_time_past, BlockContext};
use crate::index::{height_key, HeaderEntry, HeaderLink};
use crate::state::{BlockState, StateEntry};
use crate::undo::{outpoint_key, BlockUndo, UtxoEntry};
use crate::validation::{BlockPrevouts, PrevOut, ValidationError};
use crate::ArchiveError;

const META_TOP_CANDIDATE: &[u8] = b"top_candidate";
const META_TOP_CONFIRMED: &[u8] = b"top_confirmed";
const META_TOP_ASSOCIATED: &[u8] = b"top_associated";
const META_NEXT_LINK: &[u8] = b"next_link";

pub struct Archive<S> {
    store: Arc<S>,
    params: ConsensusParams,
    filter_enabled: bool,
}

impl<S: KeyValueStore> Archive<S> {
    pub fn new(store: Arc<S>, params: ConsensusParams, filter_enabled: bool) -> Self {
        Self {
            store,
            params,
            filter_enabled,
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter_enabled
    }

    /// True once the genesis block has been written.
    pub fn is_initialized(&self) -> Result<bool, ArchiveError> {
        Ok(self.store.get(Column::Meta, META_NEXT_LINK)?.is_some())
    }

    /// Write the genesis block: link zero on both chains, confirmable.
    pub fn initialize(&self, genesis: &Block) -> Result<(), ArchiveError> {
        if self.is_initialized()? {
            return Err(ArchiveError::Corrupt("archive already initialized"));
        }
        let entry = HeaderEntry {
            hash: genesis.hash(),
            parent: HeaderLink::TERMINAL,
            height: 0,
            version: genesis.header.version,
            merkle_root: genesis.header.merkle_root,
            time: genesis.header.time,
            bits: genesis.header.bits,
            nonce: genesis.header.nonce,
            work: work_bytes(
                block_proof(genesis.header.bits).map_err(|_| ArchiveError::Corrupt(
                    "genesis bits out of range",
                ))?,
            ),
        };
        let link = HeaderLink(0);
        let mut batch = WriteBatch::new();
        batch.put(Column::HeaderIndex, link.key(), entry.encode());
        batch.put(Column::HashLink, entry.hash, link.key());
        batch.put(Column::CandidateChain, height_key(0), link.key());
        batch.put(Column::ConfirmedChain, height_key(0), link.key());
        batch.put(
            Column::BlockBody,
            link.key(),
            genesis.consensus_encode(),
        );
        batch.put(
            Column::Meta,
            META_NEXT_LINK,
            1u32.to_be_bytes(),
        );
        batch.put(Column::Meta, META_TOP_CANDIDATE, height_key(0));
        batch.put(Column::Meta, META_TOP_CONFIRMED, height_key(0));
        batch.put(Column::Meta, META_TOP_ASSOCIATED, height_key(0));
        self.put_state(&mut batch, link, StateEntry::new(BlockState::BlockConfirmable));
        self.store.write_batch(&batch)?;
        Ok(())
    }

    // Header interning.
    // ------------------------------------------------------------------

    /// Intern a header whose parent is already archived. Returns the new
    /// link, or the existing one for a duplicate.
    pub fn put_header(&self, header: &BlockHeader) -> Result<HeaderLink, ArchiveError> {
        let hash = header.hash();
        if let Some(existing) = self.to_link(&hash)? {
            return Ok(existing);
        }
        let parent = self
            .to_link(&header.prev_block)?
            .ok_or(ArchiveError::MissingParent)?;
        let parent_entry = self.get_header(parent)?;
        let proof = block_proof(header.bits)
            .map_err(|_| ArchiveError::Validation(ValidationError::IncorrectWork))?;
        let work = parent_entry.work_value() + proof;

        let next = self.next_link()?;
        let entry = HeaderEntry {
            hash,
            parent,
            height: parent_entry.height + 1,
            version: header.version,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            work: work_bytes(work),
        };
        let mut batch = WriteBatch::new();
        batch.put(Column::HeaderIndex, next.key(), entry.encode());
        batch.put(Column::HashLink, hash, next.key());
        batch.put(
            Column::Meta,
            META_NEXT_LINK,
            (next.0 + 1).to_be_bytes(),
        );
        self.put_state(&mut batch, next, StateEntry::new(BlockState::Unassociated));
        self.store.write_batch(&batch)?;
        Ok(next)
    }

    fn next_link(&self) -> Result<HeaderLink, ArchiveError> {
        let bytes = self
            .store
            .get(Column::Meta, META_NEXT_LINK)?
            .ok_or(ArchiveError::Corrupt("archive not initialized"))?;
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ArchiveError::Corrupt("bad link counter"))?;
        Ok(HeaderLink(u32::from_be_bytes(bytes)))
    }

    pub fn to_link(&self, hash: &Hash256) -> Result<Option<HeaderLink>, ArchiveError> {
        let bytes = match self.store.get(Column::HashLink, hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        HeaderLink::from_key(&bytes)
            .map(Some)
            .ok_or(ArchiveError::Corrupt("bad hash-link entry"))
    }

    pub fn get_header(&self, link: HeaderLink) -> Result<HeaderEntry, ArchiveError> {
        let bytes = self
            .store
            .get(Column::HeaderIndex, &link.key())?
            .ok_or(ArchiveError::UnknownLink)?;
        Ok(HeaderEntry::decode(&bytes)?)
    }

    pub fn get_hash(&self, link: HeaderLink) -> Result<Hash256, ArchiveError> {
        Ok(self.get_header(link)?.hash)
    }

    /// Rebuild the wire header for a link.
    pub fn get_block_header(&self, link: HeaderLink) -> Result<BlockHeader, ArchiveError> {
        let entry = self.get_header(link)?;
        let prev_hash = if entry.parent.is_terminal() {
            [0u8; 32]
        } else {
            self.get_header(entry.parent)?.hash
        };
        Ok(entry.to_header(prev_hash))
    }

    // Chain tables.
    // ------------------------------------------------------------------

    pub fn to_candidate(&self, height: u32) -> Result<Option<HeaderLink>, ArchiveError> {
        self.chain_link(Column::CandidateChain, height)
    }

    pub fn to_confirmed(&self, height: u32) -> Result<Option<HeaderLink>, ArchiveError> {
        self.chain_link(Column::ConfirmedChain, height)
    }

    fn chain_link(&self, column: Column, height: u32) -> Result<Option<HeaderLink>, ArchiveError> {
        let bytes = match self.store.get(column, &height_key(height))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        HeaderLink::from_key(&bytes)
            .map(Some)
            .ok_or(ArchiveError::Corrupt("bad chain entry"))
    }

    pub fn get_top_candidate(&self) -> Result<u32, ArchiveError> {
        self.meta_height(META_TOP_CANDIDATE)
    }

    pub fn get_top_confirmed(&self) -> Result<u32, ArchiveError> {
        self.meta_height(META_TOP_CONFIRMED)
    }

    pub fn get_top_associated(&self) -> Result<u32, ArchiveError> {
        self.meta_height(META_TOP_ASSOCIATED)
    }

    fn meta_height(&self, key: &[u8]) -> Result<u32, ArchiveError> {
        let bytes = self
            .store
            .get(Column::Meta, key)?
            .ok_or(ArchiveError::Corrupt("archive not initialized"))?;
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ArchiveError::Corrupt("bad meta height"))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Greatest height at which candidate and confirmed agree.
    pub fn get_fork(&self) -> Result<u32, ArchiveError> {
        let mut height = self.get_top_candidate()?.min(self.get_top_confirmed()?);
        loop {
            let candidate = self.to_candidate(height)?;
            let confirmed = self.to_confirmed(height)?;
            if candidate.is_some() && candidate == confirmed {
                return Ok(height);
            }
            if height == 0 {
                return Err(ArchiveError::Corrupt("chains do not share genesis"));
            }
            height -= 1;
        }
    }

    /// Candidate links above the fork point up to and including `height`.
    /// Empty if `height` is not on the candidate chain.
    pub fn get_candidate_fork(&self, height: u32) -> Result<Vec<HeaderLink>, ArchiveError> {
        if height > self.get_top_candidate()? {
            return Ok(Vec::new());
        }
        let fork_point = self.get_fork()?;
        if height <= fork_point {
            return Ok(Vec::new());
        }
        let mut links = Vec::with_capacity((height - fork_point) as usize);
        for h in (fork_point + 1)..=height {
            let link = self
                .to_candidate(h)?
                .ok_or(ArchiveError::Corrupt("hole in candidate chain"))?;
            links.push(link);
        }
        Ok(links)
    }

    /// Cumulative proof of the given links.
    pub fn get_work(&self, links: &[HeaderLink]) -> Result<U256, ArchiveError> {
        let mut work = U256::zero();
        for link in links {
            let entry = self.get_header(*link)?;
            let proof = block_proof(entry.bits)
                .map_err(|_| ArchiveError::Corrupt("archived bits out of range"))?;
            work += proof;
        }
        Ok(work)
    }

    /// True iff `work` strictly exceeds the confirmed branch work above
    /// `fork_point`. Ties lose.
    pub fn get_strong(&self, work: U256, fork_point: u32) -> Result<bool, ArchiveError> {
        let top = self.get_top_confirmed()?;
        let mut confirmed_work = U256::zero();
        let mut height = fork_point + 1;
        while height <= top {
            let link = self
                .to_confirmed(height)?
                .ok_or(ArchiveError::Corrupt("hole in confirmed chain"))?;
            let entry = self.get_header(link)?;
            let proof = block_proof(entry.bits)
                .map_err(|_| ArchiveError::Corrupt("archived bits out of range"))?;
            confirmed_work += proof;
            height += 1;
        }
        Ok(work > confirmed_work)
    }

    /// Extend the candidate chain with an archived header.
    pub fn push_candidate(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        let entry = self.get_header(link)?;
        let top = self.get_top_candidate()?;
        if entry.height != top + 1 {
            return Err(ArchiveError::Corrupt("candidate push out of sequence"));
        }
        let mut batch = WriteBatch::new();
        batch.put(Column::CandidateChain, height_key(entry.height), link.key());
        batch.put(Column::Meta, META_TOP_CANDIDATE, height_key(entry.height));
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Remove the candidate top. The association watermark is clamped.
    pub fn pop_candidate(&self) -> Result<HeaderLink, ArchiveError> {
        let top = self.get_top_candidate()?;
        if top == 0 {
            return Err(ArchiveError::Corrupt("cannot pop candidate genesis"));
        }
        let link = self
            .to_candidate(top)?
            .ok_or(ArchiveError::Corrupt("hole in candidate chain"))?;
        let mut batch = WriteBatch::new();
        batch.delete(Column::CandidateChain, height_key(top));
        batch.put(Column::Meta, META_TOP_CANDIDATE, height_key(top - 1));
        let associated = self.get_top_associated()?;
        if associated >= top {
            batch.put(Column::Meta, META_TOP_ASSOCIATED, height_key(top - 1));
        }
        self.store.write_batch(&batch)?;
        Ok(link)
    }

    // Block states.
    // ------------------------------------------------------------------

    pub fn get_block_state(&self, link: HeaderLink) -> Result<BlockState, ArchiveError> {
        Ok(self.get_state_entry(link)?.state)
    }

    pub fn is_strong(&self, link: HeaderLink) -> Result<bool, ArchiveError> {
        Ok(self.get_state_entry(link)?.strong)
    }

    fn get_state_entry(&self, link: HeaderLink) -> Result<StateEntry, ArchiveError> {
        let bytes = self
            .store
            .get(Column::BlockState, &link.key())?
            .ok_or(ArchiveError::UnknownLink)?;
        Ok(StateEntry::decode(&bytes)?)
    }

    fn put_state(&self, batch: &mut WriteBatch, link: HeaderLink, entry: StateEntry) {
        batch.put(Column::BlockState, link.key(), entry.encode());
    }

    fn update_state(
        &self,
        link: HeaderLink,
        update: impl FnOnce(StateEntry) -> StateEntry,
    ) -> Result<(), ArchiveError> {
        let entry = self.get_state_entry(link)?;
        let mut batch = WriteBatch::new();
        self.put_state(&mut batch, link, update(entry));
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn set_block_valid(&self, link: HeaderLink, fees: u64) -> Result<(), ArchiveError> {
        self.update_state(link, |mut entry| {
            entry.state = BlockState::BlockValid { fees };
            entry
        })
    }

    pub fn set_block_confirmable(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        self.update_state(link, |mut entry| {
            entry.state = BlockState::BlockConfirmable;
            entry
        })
    }

    pub fn set_block_unconfirmable(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        self.update_state(link, |mut entry| {
            entry.state = BlockState::BlockUnconfirmable;
            entry
        })
    }

    pub fn set_strong(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        self.update_state(link, |mut entry| {
            entry.strong = true;
            entry
        })
    }

    pub fn set_unstrong(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        self.update_state(link, |mut entry| {
            entry.strong = false;
            entry
        })
    }

    // Association.
    // ------------------------------------------------------------------

    pub fn is_associated(&self, link: HeaderLink) -> Result<bool, ArchiveError> {
        Ok(self.store.get(Column::BlockBody, &link.key())?.is_some())
    }

    pub fn get_block(&self, link: HeaderLink) -> Result<Block, ArchiveError> {
        let bytes = self
            .store
            .get(Column::BlockBody, &link.key())?
            .ok_or(ArchiveError::MissingBody)?;
        Ok(Block::consensus_decode(&bytes)?)
    }

    /// Store a checked body against its link and index its outputs. Moves
    /// the state from unassociated to unvalidated and advances the
    /// association watermark.
    pub fn associate(&self, link: HeaderLink, block: &Block) -> Result<(), ArchiveError> {
        let entry = self.get_header(link)?;
        let mut batch = WriteBatch::new();
        batch.put(Column::BlockBody, link.key(), block.consensus_encode());
        for (index, tx) in block.transactions.iter().enumerate() {
            let mut encoder = Encoder::new();
            encoder.write_u32_le(link.0);
            encoder.write_u8((index == 0) as u8);
            encoder.write_varint(tx.vout.len() as u64);
            for output in &tx.vout {
                output.consensus_encode(&mut encoder);
            }
            batch.put(Column::OutputIndex, tx.txid(), encoder.into_inner());
        }
        let state = self.get_state_entry(link)?;
        if matches!(state.state, BlockState::Unassociated) {
            self.put_state(
                &mut batch,
                link,
                StateEntry {
                    state: BlockState::Unvalidated,
                    strong: state.strong,
                },
            );
        }
        self.store.write_batch(&batch)?;

        // Advance the contiguous association watermark.
        let mut top = self.get_top_associated()?;
        if entry.height == top + 1 {
            let candidate_top = self.get_top_candidate()?;
            while top < candidate_top {
                let next = match self.to_candidate(top + 1)? {
                    Some(next) => next,
                    None => break,
                };
                if !self.is_associated(next)? {
                    break;
                }
                top += 1;
            }
            let mut batch = WriteBatch::new();
            batch.put(Column::Meta, META_TOP_ASSOCIATED, height_key(top));
            self.store.write_batch(&batch)?;
        }
        Ok(())
    }

    /// Candidate heights above `start` lacking a body, with their hashes.
    pub fn get_unassociated_above(
        &self,
        start: u32,
        limit: usize,
    ) -> Result<Vec<(u32, Hash256, HeaderLink)>, ArchiveError> {
        let top = self.get_top_candidate()?;
        let mut out = Vec::new();
        let mut height = start + 1;
        while height <= top && out.len() < limit {
            let link = self
                .to_candidate(height)?
                .ok_or(ArchiveError::Corrupt("hole in candidate chain"))?;
            if !self.is_associated(link)? {
                let hash = self.get_header(link)?.hash;
                out.push((height, hash, link));
            }
            height += 1;
        }
        Ok(out)
    }

    // Prevout population.
    // ------------------------------------------------------------------

    /// Resolve every input's previous output. With metadata the result
    /// carries creation height and coinbase provenance for contextual
    /// checks; without, only value and script are guaranteed meaningful.
    pub fn populate_with_metadata(&self, block: &Block) -> Result<BlockPrevouts, ArchiveError> {
        self.populate(block, true)
    }

    pub fn populate_without_metadata(&self, block: &Block) -> Result<BlockPrevouts, ArchiveError> {
        self.populate(block, false)
    }

    fn populate(&self, block: &Block, metadata: bool) -> Result<BlockPrevouts, ArchiveError> {
        let mut in_block: HashMap<Hash256, usize> = HashMap::new();
        let mut prevouts = Vec::with_capacity(block.transactions.len());
        for (index, tx) in block.transactions.iter().enumerate() {
            let mut tx_prevouts = Vec::new();
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    let prevout = &input.prevout;
                    if let Some(creator) = in_block.get(&prevout.hash) {
                        // Spend of an output created earlier in this block.
                        let creator_tx = &block.transactions[*creator];
                        let output = creator_tx
                            .vout
                            .get(prevout.index as usize)
                            .ok_or(ArchiveError::Validation(
                                ValidationError::MissingPreviousOutput,
                            ))?;
                        tx_prevouts.push(PrevOut {
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            height: u32::MAX,
                            coinbase: false,
                        });
                        continue;
                    }
                    match self.lookup_output(prevout, metadata)? {
                        Some(resolved) => tx_prevouts.push(resolved),
                        None => {
                            return Err(ArchiveError::Validation(
                                ValidationError::MissingPreviousOutput,
                            ))
                        }
                    }
                }
            }
            prevouts.push(tx_prevouts);
            in_block.insert(tx.txid(), index);
        }
        Ok(prevouts)
    }

    fn lookup_output(
        &self,
        prevout: &OutPoint,
        metadata: bool,
    ) -> Result<Option<PrevOut>, ArchiveError> {
        let bytes = match self.store.get(Column::OutputIndex, &prevout.hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let mut decoder = Decoder::new(&bytes);
        let link = HeaderLink(decoder.read_u32_le()?);
        let coinbase = decoder.read_u8()? != 0;
        let count = decoder.read_varint()?;
        if u64::from(prevout.index) >= count {
            return Ok(None);
        }
        let mut output = None;
        for index in 0..count {
            let candidate = bn_primitives::transaction::TxOut::consensus_decode(&mut decoder)?;
            if index == u64::from(prevout.index) {
                output = Some(candidate);
                break;
            }
        }
        let output = output.ok_or(ArchiveError::Corrupt("bad output index entry"))?;
        let height = if metadata {
            self.get_header(link)?.height
        } else {
            u32::MAX
        };
        Ok(Some(PrevOut {
            value: output.value,
            script_pubkey: output.script_pubkey,
            height,
            coinbase,
        }))
    }

    /// Cache populated prevouts for the re-validation shortcut.
    pub fn set_prevouts(&self, link: HeaderLink, prevouts: &BlockPrevouts) -> Result<(), ArchiveError> {
        let mut encoder = Encoder::new();
        encoder.write_varint(prevouts.len() as u64);
        for tx_prevouts in prevouts {
            encoder.write_varint(tx_prevouts.len() as u64);
            for prevout in tx_prevouts {
                encoder.write_i64_le(prevout.value);
                encoder.write_var_bytes(&prevout.script_pubkey);
                encoder.write_u32_le(prevout.height);
                encoder.write_u8(prevout.coinbase as u8);
            }
        }
        self.store
            .put(Column::Prevouts, &link.key(), &encoder.into_inner())?;
        Ok(())
    }

    pub fn is_prevouts_cached(&self, link: HeaderLink) -> Result<bool, ArchiveError> {
        Ok(self.store.get(Column::Prevouts, &link.key())?.is_some())
    }

    pub fn get_prevouts(&self, link: HeaderLink) -> Result<Option<BlockPrevouts>, ArchiveError> {
        let bytes = match self.store.get(Column::Prevouts, &link.key())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let mut decoder = Decoder::new(&bytes);
        let tx_count = decoder.read_varint()?;
        let mut prevouts = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let input_count = decoder.read_varint()?;
            let mut tx_prevouts = Vec::with_capacity(input_count as usize);
            for _ in 0..input_count {
                let value = decoder.read_i64_le()?;
                let script_pubkey = decoder.read_var_bytes()?;
                let height = decoder.read_u32_le()?;
                let coinbase = decoder.read_u8()? != 0;
                tx_prevouts.push(PrevOut {
                    value,
                    script_pubkey,
                    height,
                    coinbase,
                });
            }
            prevouts.push(tx_prevouts);
        }
        Ok(Some(prevouts))
    }

    // Filters.
    // ------------------------------------------------------------------

    /// Commit the filter body digest for a link.
    pub fn set_filter_body(&self, link: HeaderLink, block: &Block) -> Result<(), ArchiveError> {
        let mut encoder = Encoder::new();
        for tx in &block.transactions {
            for input in &tx.vin {
                if !input.prevout.is_null() {
                    encoder.write_bytes(&outpoint_key(&input.prevout));
                }
            }
            for output in &tx.vout {
                encoder.write_var_bytes(&output.script_pubkey);
            }
        }
        let digest = sha256d(&encoder.into_inner());
        self.store.put(Column::FilterBody, &link.key(), &digest)?;
        Ok(())
    }

    /// Chain the filter head over the parent's head and this body.
    pub fn set_filter_head(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        let entry = self.get_header(link)?;
        let parent_head = if entry.parent.is_terminal() {
            [0u8; 32]
        } else {
            match self.store.get(Column::FilterHead, &entry.parent.key())? {
                Some(bytes) => bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ArchiveError::Corrupt("bad filter head"))?,
                None => [0u8; 32],
            }
        };
        let body: Hash256 = match self.store.get(Column::FilterBody, &link.key())? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| ArchiveError::Corrupt("bad filter body"))?,
            None => [0u8; 32],
        };
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&parent_head);
        concat[32..].copy_from_slice(&body);
        let head = sha256d(&concat);
        self.store.put(Column::FilterHead, &link.key(), &head)?;
        Ok(())
    }

    pub fn is_filtered(&self, link: HeaderLink) -> Result<bool, ArchiveError> {
        Ok(self.store.get(Column::FilterHead, &link.key())?.is_some())
    }

    // Checkpoints and milestones.
    // ------------------------------------------------------------------

    pub fn is_under_checkpoint(&self, height: u32) -> bool {
        height <= self.params.top_checkpoint() && !self.params.checkpoints.is_empty()
    }

    pub fn set_milestone(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        self.store.put(Column::Milestone, &link.key(), &[1u8])?;
        Ok(())
    }

    pub fn is_milestone(&self, link: HeaderLink) -> Result<bool, ArchiveError> {
        Ok(self.store.get(Column::Milestone, &link.key())?.is_some())
    }

    // Confirmation.
    // ------------------------------------------------------------------

    /// Final confirmation check: every input must spend an output that is
    /// unspent in the confirmed set (or created earlier in this block), and
    /// no txid may shadow an existing unspent one (BIP30).
    pub fn block_confirmable(&self, link: HeaderLink) -> Result<(), ArchiveError> {
        let block = self.get_block(link)?;
        let mut created: HashSet<OutPoint> = HashSet::new();
        let mut spent_here: HashSet<OutPoint> = HashSet::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            for index in 0..tx.vout.len() as u32 {
                let outpoint = OutPoint { hash: txid, index };
                if self.store.get(Column::Utxo, &outpoint_key(&outpoint))?.is_some() {
                    return Err(ArchiveError::Validation(
                        ValidationError::DuplicateTransaction,
                    ));
                }
                created.insert(outpoint);
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                let prevout = input.prevout;
                if !spent_here.insert(prevout) {
                    return Err(ArchiveError::Validation(ValidationError::DuplicateInput));
                }
                if created.contains(&prevout) {
                    continue;
                }
                if self
                    .store
                    .get(Column::Utxo, &outpoint_key(&prevout))?
                    .is_none()
                {
                    return Err(ArchiveError::Validation(
                        ValidationError::MissingPreviousOutput,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Append a block to the confirmed chain and apply its UTXO effects.
    pub fn push_confirmed(&self, link: HeaderLink, set_strong: bool) -> Result<(), ArchiveError> {
        let entry = self.get_header(link)?;
        let top = self.get_top_confirmed()?;
        if entry.height != top + 1 {
            return Err(ArchiveError::Corrupt("confirmed push out of sequence"));
        }
        let block = self.get_block(link)?;

        let mut undo = BlockUndo::default();
        let mut batch = WriteBatch::new();
        for (index, tx) in block.transactions.iter().enumerate() {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    let key = outpoint_key(&input.prevout);
                    let spent = match self.store.get(Column::Utxo, &key)? {
                        Some(bytes) => {
                            let mut decoder = Decoder::new(&bytes);
                            UtxoEntry::consensus_decode(&mut decoder)?
                        }
                        // Spend of an output created within this block.
                        None => continue,
                    };
                    undo.spent.push((input.prevout, spent));
                    batch.delete(Column::Utxo, key);
                }
            }
            let txid = tx.txid();
            for (out_index, output) in tx.vout.iter().enumerate() {
                let outpoint = OutPoint {
                    hash: txid,
                    index: out_index as u32,
                };
                let utxo = UtxoEntry {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height: entry.height,
                    coinbase: index == 0,
                };
                batch.put(
                    Column::Utxo,
                    outpoint_key(&outpoint),
                    bn_primitives::encoding::encode(&utxo),
                );
            }
        }

        batch.put(Column::Undo, link.key(), undo.encode());
        batch.put(Column::ConfirmedChain, height_key(entry.height), link.key());
        batch.put(Column::Meta, META_TOP_CONFIRMED, height_key(entry.height));
        self.store.write_batch(&batch)?;

        if set_strong {
            self.set_strong(link)?;
        }
        Ok(())
    }

    /// Remove the confirmed top, reversing its UTXO effects. Returns the
    /// popped link.
    pub fn pop_confirmed(&self) -> Result<HeaderLink, ArchiveError> {
        let top = self.get_top_confirmed()?;
        if top == 0 {
            return Err(ArchiveError::Corrupt("cannot pop confirmed genesis"));
        }
        let link = self
            .to_confirmed(top)?
            .ok_or(ArchiveError::Corrupt("hole in confirmed chain"))?;
        let block = self.get_block(link)?;
        let undo_bytes = self
            .store
            .get(Column::Undo, &link.key())?
            .ok_or(ArchiveError::Corrupt("missing undo record"))?;
        let undo = BlockUndo::decode(&undo_bytes)?;

        let mut batch = WriteBatch::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            for index in 0..tx.vout.len() as u32 {
                let outpoint = OutPoint { hash: txid, index };
                batch.delete(Column::Utxo, outpoint_key(&outpoint));
            }
        }
        for (outpoint, entry) in &undo.spent {
            batch.put(
                Column::Utxo,
                outpoint_key(outpoint),
                bn_primitives::encoding::encode(entry),
            );
        }
        batch.delete(Column::Undo, link.key());
        batch.delete(Column::ConfirmedChain, height_key(top));
        batch.put(Column::Meta, META_TOP_CONFIRMED, height_key(top - 1));
        self.store.write_batch(&batch)?;
        Ok(link)
    }

    // Context derivation.
    // ------------------------------------------------------------------

    pub fn get_context(&self, link: HeaderLink) -> Result<BlockContext, ArchiveError> {
        let entry = self.get_header(link)?;
        let height = entry.height;

        // Median of the eleven ancestors ending at the parent.
        let mut window = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = entry.parent;
        while !cursor.is_terminal() && window.len() < MEDIAN_TIME_SPAN {
            let ancestor = self.get_header(cursor)?;
            window.push(ancestor.time);
            cursor = ancestor.parent;
        }
        let mtp = median_time_past(&window);

        let work_required = self.work_required(&entry)?;
        let forks = Forks::from_height(height, &self.params.deployments);
        let minimum_version = minimum_block_version(height, &self.params.deployments);

        Ok(BlockContext {
            height,
            timestamp: entry.time,
            median_time_past: mtp,
            work_required,
            forks,
            minimum_version,
        })
    }

    fn work_required(&self, entry: &HeaderEntry) -> Result<u32, ArchiveError> {
        if entry.parent.is_terminal() {
            return Ok(entry.bits);
        }
        let parent = self.get_header(entry.parent)?;
        let interval = self.params.retarget_interval();
        let boundary = !self.params.pow_no_retargeting && entry.height % interval == 0;

        let mut chain = Vec::new();
        if boundary {
            // Collect the closing window, oldest first.
            let mut cursor_entry = parent.clone();
            let window_start = entry.height - interval;
            let mut reversed = vec![header_info(&cursor_entry)];
            while cursor_entry.height > window_start {
                let next = self.get_header(cursor_entry.parent)?;
                reversed.push(header_info(&next));
                cursor_entry = next;
            }
            reversed.reverse();
            chain = reversed;
        } else {
            chain.push(header_info(&parent));
        }

        get_next_work_required(&chain, Some(i64::from(entry.time)), &self.params)
            .map_err(|_| ArchiveError::Corrupt("retarget window incomplete"))
    }

    // Locators.
    // ------------------------------------------------------------------

    /// Block locator over the candidate chain: dense for ten, then doubling,
    /// genesis last.
    pub fn get_locator(&self) -> Result<Vec<Hash256>, ArchiveError> {
        let top = self.get_top_candidate()?;
        let mut hashes = Vec::new();
        let mut height = top;
        let mut step = 1u32;
        loop {
            let link = self
                .to_candidate(height)?
                .ok_or(ArchiveError::Corrupt("hole in candidate chain"))?;
            hashes.push(self.get_header(link)?.hash);
            if height == 0 {
                break;
            }
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step);
        }
        Ok(hashes)
    }

    /// Highest locator entry found on the confirmed chain, if any.
    pub fn find_locator_height(&self, locator: &[Hash256]) -> Result<Option<u32>, ArchiveError> {
        for hash in locator {
            let Some(link) = self.to_link(hash)? else {
                continue;
            };
            let entry = self.get_header(link)?;
            if self.to_confirmed(entry.height)? == Some(link) {
                return Ok(Some(entry.height));
            }
        }
        Ok(None)
    }

    /// Confirmed headers after the locator's fork, capped.
    pub fn get_locator_headers(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        cap: usize,
    ) -> Result<Vec<BlockHeader>, ArchiveError> {
        let start = self.find_locator_height(locator)?.unwrap_or(0);
        let top = self.get_top_confirmed()?;
        let mut headers = Vec::new();
        let mut height = start + 1;
        while height <= top && headers.len() < cap {
            let link = self
                .to_confirmed(height)?
                .ok_or(ArchiveError::Corrupt("hole in confirmed chain"))?;
            let header = self.get_block_header(link)?;
            let hash = header.hash();
            headers.push(header);
            if &hash == stop {
                break;
            }
            height += 1;
        }
        Ok(headers)
    }

    /// Confirmed block hashes after the locator's fork, capped.
    pub fn get_locator_hashes(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        cap: usize,
    ) -> Result<Vec<Hash256>, ArchiveError> {
        let start = self.find_locator_height(locator)?.unwrap_or(0);
        let top = self.get_top_confirmed()?;
        let mut hashes = Vec::new();
        let mut height = start + 1;
        while height <= top && hashes.len() < cap {
            let link = self
                .to_confirmed(height)?
                .ok_or(ArchiveError::Corrupt("hole in confirmed chain"))?;
            let hash = self.get_header(link)?.hash;
            hashes.push(hash);
            if &hash == stop {
                break;
            }
            height += 1;
        }
        Ok(hashes)
    }
}

fn header_info(entry: &HeaderEntry) -> HeaderInfo {
    HeaderInfo {
        height: entry.height,
        time: entry.time,
        bits: entry.bits,
    }
}

fn work_bytes(work: U256) -> [u8; 32] {
    work.to_big_endian()
}
