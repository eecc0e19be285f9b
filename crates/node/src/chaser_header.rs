//! Header chaser: organizes peer headers into the strongest candidate chain.
//!
//! Headers whose parent is unknown wait in a tree keyed by hash. Connected
//! branches are archived once their cumulative work strictly exceeds the
//! candidate chain's work above the common fork point; weaker branches stay
//! in the tree until their descendants are archived or pruned.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use bn_archive::{ArchiveError, HeaderLink};
use bn_consensus::constants::MAX_TIME_OFFSET;
use bn_consensus::Hash256;
use bn_pow::validation::validate_pow_header;
use bn_primitives::block::BlockHeader;
use bn_storage::KeyValueStore;
use crossbeam_channel::{select, unbounded, Sender};

use crate::events::{Chase, ChaseEvent, FaultCode};
use crate::node::NodeInner;

pub enum HeaderCommand {
    Organize {
        headers: Vec<BlockHeader>,
        peer: u64,
    },
}

struct PendingHeader {
    header: BlockHeader,
    peer: u64,
}

struct ChaserHeader<S> {
    node: Arc<NodeInner<S>>,
    tree: HashMap<Hash256, PendingHeader>,
}

pub fn spawn<S: KeyValueStore + Send + Sync + 'static>(
    node: Arc<NodeInner<S>>,
) -> Result<(Sender<HeaderCommand>, JoinHandle<()>), String> {
    let (command_tx, command_rx) = unbounded();
    let (_, events_rx) = node.bus.subscribe();
    let handle = std::thread::Builder::new()
        .name("chaser-header".to_string())
        .spawn(move || {
            let mut chaser = ChaserHeader {
                node,
                tree: HashMap::new(),
            };
            loop {
                select! {
                    recv(events_rx) -> event => {
                        match event {
                            Ok(event) if event.chase == Chase::Stop => break,
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                    recv(command_rx) -> command => {
                        match command {
                            Ok(HeaderCommand::Organize { headers, peer }) => {
                                if chaser.node.closed() {
                                    break;
                                }
                                if chaser.node.suspended() {
                                    continue;
                                }
                                chaser.organize(headers, peer);
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        })
        .map_err(|err| err.to_string())?;
    Ok((command_tx, handle))
}

impl<S: KeyValueStore> ChaserHeader<S> {
    fn organize(&mut self, headers: Vec<BlockHeader>, peer: u64) {
        for header in headers {
            if self.node.closed() {
                return;
            }
            self.do_organize(header, peer);
        }
    }

    fn do_organize(&mut self, header: BlockHeader, peer: u64) {
        let hash = header.hash();

        // Duplicates are a race between peers, not an offense.
        match self.node.archive.to_link(&hash) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        }
        if self.tree.contains_key(&hash) {
            return;
        }

        if let Err(err) = validate_pow_header(&header, self.node.archive.params()) {
            bn_log::log_remote!("invalid header pow from peer {peer}: {err}");
            self.node.request_disconnect(peer);
            return;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if u64::from(header.time) > now + u64::from(MAX_TIME_OFFSET) {
            bn_log::log_remote!("future-dated header from peer {peer}");
            self.node.request_disconnect(peer);
            return;
        }

        self.tree.insert(hash, PendingHeader { header, peer });

        // Walk back through the tree to an archived ancestor, if any.
        let Some((anchor, branch)) = self.find_branch(&hash) else {
            // Orphan: parent may arrive later.
            bn_log::log_protocol!("orphan header from peer {peer}");
            return;
        };

        match self.try_promote(anchor, &branch) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => self.node.fault(FaultCode::Archive),
            Err(_) => {
                // Context failure: drop the whole branch, penalize the peer.
                for branch_hash in &branch {
                    self.tree.remove(branch_hash);
                }
                self.node.request_disconnect(peer);
            }
        }
    }

    /// Follow `prev_block` pointers through the tree. Returns the archived
    /// anchor link and the branch hashes ordered oldest first.
    fn find_branch(&self, tip: &Hash256) -> Option<(HeaderLink, Vec<Hash256>)> {
        let mut branch = Vec::new();
        let mut cursor = *tip;
        loop {
            let pending = self.tree.get(&cursor)?;
            branch.push(cursor);
            let parent_hash = pending.header.prev_block;
            if let Ok(Some(anchor)) = self.node.archive.to_link(&parent_hash) {
                branch.reverse();
                return Some((anchor, branch));
            }
            if !self.tree.contains_key(&parent_hash) {
                return None;
            }
            cursor = parent_hash;
        }
    }

    /// Archive the branch, then reorganize the candidate chain if the
    /// branch is strictly stronger above the fork point.
    fn try_promote(
        &mut self,
        anchor: HeaderLink,
        branch: &[Hash256],
    ) -> Result<(), ArchiveError> {
        let archive = &self.node.archive;

        // The anchor may itself sit on an archived branch off the candidate
        // chain; walk down to the candidate ancestor to find the true fork
        // point, collecting the off-chain prefix.
        let mut store_branch = Vec::new();
        let mut cursor = anchor;
        let mut cursor_entry = archive.get_header(cursor)?;
        while archive.to_candidate(cursor_entry.height)? != Some(cursor) {
            store_branch.push(cursor);
            if cursor_entry.parent.is_terminal() {
                return Err(ArchiveError::Corrupt("branch does not reach genesis"));
            }
            cursor = cursor_entry.parent;
            cursor_entry = archive.get_header(cursor)?;
        }
        let fork_point = cursor_entry.height;
        store_branch.reverse();

        // Archive the new headers and verify their contexts before touching
        // the candidate chain.
        let mut links = store_branch;
        links.reserve(branch.len());
        for hash in branch {
            let pending = self.tree.get(hash).expect("branch from tree");
            let link = archive.put_header(&pending.header)?;
            let ctx = archive.get_context(link)?;
            let entry = archive.get_header(link)?;

            if entry.bits != ctx.work_required {
                self.unvalid(link);
                return Err(ArchiveError::Validation(
                    bn_archive::ValidationError::IncorrectWork,
                ));
            }
            if entry.time <= ctx.median_time_past && entry.height > 0 {
                self.unvalid(link);
                return Err(ArchiveError::Validation(
                    bn_archive::ValidationError::TimestampTooOld,
                ));
            }
            if entry.version < ctx.minimum_version {
                self.unvalid(link);
                return Err(ArchiveError::Validation(
                    bn_archive::ValidationError::VersionTooLow,
                ));
            }
            if let Some(checkpoint) = archive.params().checkpoint_at(entry.height) {
                if checkpoint.hash != entry.hash {
                    self.unvalid(link);
                    return Err(ArchiveError::Validation(
                        bn_archive::ValidationError::InvalidBlock("checkpoint mismatch"),
                    ));
                }
            }
            links.push(link);
        }
        for hash in branch {
            self.tree.remove(hash);
        }

        let branch_work = archive.get_work(&links)?;
        let top_candidate = archive.get_top_candidate()?;
        let mut candidate_links = Vec::new();
        for height in (fork_point + 1)..=top_candidate {
            match archive.to_candidate(height)? {
                Some(link) => candidate_links.push(link),
                None => return Err(ArchiveError::Corrupt("hole in candidate chain")),
            }
        }
        let candidate_work = archive.get_work(&candidate_links)?;

        // Ties retain the existing candidate; the branch stays archived
        // off-chain.
        if branch_work <= candidate_work {
            return Ok(());
        }

        // Pop the weaker candidate suffix, then push the branch.
        let pops = top_candidate - fork_point;
        for _ in 0..pops {
            archive.pop_candidate()?;
        }
        if pops > 0 {
            self.node
                .bus
                .publish(ChaseEvent::new(Chase::Disorganized, u64::from(fork_point)));
            bn_log::log_news!("candidate reorganization at height {fork_point}");
        }
        for link in &links {
            archive.push_candidate(*link)?;
            self.node
                .bus
                .publish(ChaseEvent::new(Chase::Organized, u64::from(link.0)));
        }

        let top = archive.get_top_candidate()?;
        if top % 1000 == 0 {
            bn_log::log_news!("candidate chain at height {top}");
        }
        Ok(())
    }

    fn unvalid(&self, link: HeaderLink) {
        self.node
            .bus
            .publish(ChaseEvent::new(Chase::Unvalid, u64::from(link.0)));
    }
}
