//! Check chaser: associates peer-delivered bodies with the candidate chain.
//!
//! Hands out download batches to sessions, drops bodies that are off the
//! candidate chain or fail context-free checks, and publishes `Checked`
//! for each association.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use bn_archive::validation::check_block;
use bn_consensus::Hash256;
use bn_primitives::block::Block;
use bn_storage::KeyValueStore;
use crossbeam_channel::{select, unbounded, Sender};
use tokio::sync::oneshot;

use crate::events::{Chase, ChaseEvent, FaultCode};
use crate::node::NodeInner;

pub enum CheckCommand {
    /// A peer delivered a block body.
    Submit { block: Block, peer: u64 },
    /// A session wants hashes to download.
    Batch {
        peer: u64,
        count: usize,
        reply: oneshot::Sender<Vec<Hash256>>,
    },
    /// A session went away; release its reservations.
    Release { peer: u64 },
}

struct ChaserCheck<S> {
    node: Arc<NodeInner<S>>,
    /// Hashes handed out for download, by reserving peer.
    inflight: HashMap<Hash256, u64>,
}

pub fn spawn<S: KeyValueStore + Send + Sync + 'static>(
    node: Arc<NodeInner<S>>,
) -> Result<(Sender<CheckCommand>, JoinHandle<()>), String> {
    let (command_tx, command_rx) = unbounded();
    let (_, events_rx) = node.bus.subscribe();
    let handle = std::thread::Builder::new()
        .name("chaser-check".to_string())
        .spawn(move || {
            let mut chaser = ChaserCheck {
                node,
                inflight: HashMap::new(),
            };
            loop {
                select! {
                    recv(events_rx) -> event => {
                        match event {
                            Ok(event) => {
                                if event.chase == Chase::Stop {
                                    break;
                                }
                                chaser.handle_event(&event);
                            }
                            Err(_) => break,
                        }
                    }
                    recv(command_rx) -> command => {
                        match command {
                            Ok(command) => chaser.handle_command(command),
                            Err(_) => break,
                        }
                    }
                }
            }
        })
        .map_err(|err| err.to_string())?;
    Ok((command_tx, handle))
}

impl<S: KeyValueStore> ChaserCheck<S> {
    fn handle_event(&mut self, event: &ChaseEvent) {
        match event.chase {
            // Candidate reorganization invalidates outstanding requests.
            Chase::Disorganized | Chase::Regressed => self.inflight.clear(),
            _ => {}
        }
    }

    fn handle_command(&mut self, command: CheckCommand) {
        if self.node.closed() {
            return;
        }
        match command {
            CheckCommand::Submit { block, peer } => {
                if !self.node.suspended() {
                    self.do_checked(block, peer);
                }
            }
            CheckCommand::Batch { peer, count, reply } => {
                let batch = if self.node.suspended() {
                    Vec::new()
                } else {
                    self.make_batch(peer, count)
                };
                let _ = reply.send(batch);
            }
            CheckCommand::Release { peer } => {
                self.inflight.retain(|_, reserved| *reserved != peer);
            }
        }
    }

    fn make_batch(&mut self, peer: u64, count: usize) -> Vec<Hash256> {
        let start = match self.node.archive.get_top_associated() {
            Ok(height) => height,
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return Vec::new();
            }
        };
        // Over-scan so reservations held by other peers do not starve us.
        let candidates = match self
            .node
            .archive
            .get_unassociated_above(start, count.saturating_mul(4))
        {
            Ok(candidates) => candidates,
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return Vec::new();
            }
        };
        let mut batch = Vec::with_capacity(count);
        for (_, hash, _) in candidates {
            if batch.len() == count {
                break;
            }
            if self.inflight.contains_key(&hash) {
                continue;
            }
            self.inflight.insert(hash, peer);
            batch.push(hash);
        }
        batch
    }

    fn do_checked(&mut self, block: Block, peer: u64) {
        let hash = block.hash();
        self.inflight.remove(&hash);

        let archive = &self.node.archive;
        let link = match archive.to_link(&hash) {
            Ok(Some(link)) => link,
            Ok(None) => {
                bn_log::log_protocol!("unsolicited block from peer {peer}");
                return;
            }
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        };
        let entry = match archive.get_header(link) {
            Ok(entry) => entry,
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        };
        // Only candidate-chain bodies advance the pipeline.
        match archive.to_candidate(entry.height) {
            Ok(Some(candidate)) if candidate == link => {}
            Ok(_) => return,
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        }
        match archive.is_associated(link) {
            Ok(true) => return,
            Ok(false) => {}
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        }

        if let Err(err) = check_block(&block) {
            bn_log::log_remote!(
                "invalid block at height {} from peer {peer}: {err}",
                entry.height
            );
            self.node
                .bus
                .publish(ChaseEvent::new(Chase::Unvalid, u64::from(link.0)));
            self.node.request_disconnect(peer);
            return;
        }

        if let Err(err) = archive.associate(link, &block) {
            bn_log::log_error!("association failed at height {}: {err}", entry.height);
            self.node.fault(FaultCode::Archive);
            return;
        }
        self.node.set_originator(link, peer);
        self.node
            .bus
            .publish(ChaseEvent::new(Chase::Checked, u64::from(entry.height)));
    }
}
