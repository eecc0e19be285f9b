//! Confirm chaser: advances the confirmed chain and unwinds it on forks.
//!
//! Fully stranded. Walks the candidate fork above the fork point once its
//! work strictly exceeds the confirmed branch, popping the weaker suffix
//! first and restoring it if a candidate block fails its confirmation
//! check. Every archive failure on this path is fatal.

use std::sync::Arc;
use std::thread::JoinHandle;

use bn_archive::{ArchiveError, BlockState, HeaderLink};
use bn_storage::KeyValueStore;
use crossbeam_channel::Sender;

use crate::events::{Chase, ChaseEvent, FaultCode};
use crate::node::NodeInner;

struct ChaserConfirm<S> {
    node: Arc<NodeInner<S>>,
    own: Sender<ChaseEvent>,
    position: u32,
}

pub fn spawn<S: KeyValueStore + Send + Sync + 'static>(
    node: Arc<NodeInner<S>>,
) -> Result<(JoinHandle<()>,), String> {
    let (own_tx, events_rx) = node.bus.subscribe();
    let handle = std::thread::Builder::new()
        .name("chaser-confirm".to_string())
        .spawn(move || {
            let position = match node.archive.get_fork() {
                Ok(height) => height,
                Err(_) => {
                    node.fault(FaultCode::Archive);
                    0
                }
            };
            let mut chaser = ChaserConfirm {
                node,
                own: own_tx,
                position,
            };
            while let Ok(event) = events_rx.recv() {
                if chaser.node.closed() && event.chase != Chase::Stop {
                    continue;
                }
                match event.chase {
                    Chase::Stop => break,
                    _ if chaser.node.suspended() => continue,
                    Chase::Start | Chase::Resume | Chase::Bump => chaser.do_bump(),
                    Chase::Valid => chaser.do_validated(event.value as u32),
                    Chase::Regressed | Chase::Disorganized => {
                        chaser.do_regressed(event.value as u32);
                    }
                    _ => {}
                }
            }
        })
        .map_err(|err| err.to_string())?;
    Ok((handle,))
}

impl<S: KeyValueStore> ChaserConfirm<S> {
    fn do_regressed(&mut self, branch_point: u32) {
        if branch_point < self.position {
            self.position = branch_point;
        }
    }

    /// Confirmation is strictly sequential on the candidate chain.
    fn do_validated(&mut self, height: u32) {
        if height == self.position + 1 {
            self.do_bumped(height);
        }
    }

    /// Bumping may start anywhere, so the next position must already be in
    /// a confirmable state.
    fn do_bump(&mut self) {
        let archive = &self.node.archive;
        let height = self.position + 1;
        let link = match archive.to_candidate(height) {
            Ok(Some(link)) => link,
            Ok(None) => return,
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        };
        let state = match archive.get_block_state(link) {
            Ok(state) => state,
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        };
        let ready = match state {
            BlockState::BlockValid { .. } | BlockState::BlockConfirmable => true,
            _ => {
                // Bypassed blocks carry no validated state of their own.
                let bypass = self.bypass(link, height);
                bypass
                    && (!archive.filter_enabled()
                        || archive.is_filtered(link).unwrap_or(false))
            }
        };
        if ready {
            self.do_bumped(height);
        }
    }

    fn bypass(&self, link: HeaderLink, height: u32) -> bool {
        self.node.archive.is_under_checkpoint(height)
            || self.node.archive.is_milestone(link).unwrap_or(false)
    }

    /// Compute relative work, then reorganize if the fork is strong.
    fn do_bumped(&mut self, height: u32) {
        if self.node.closed() {
            return;
        }
        let archive = &self.node.archive;

        // Empty means height is not on a candidate fork (reorganized away).
        let fork = match archive.get_candidate_fork(height) {
            Ok(fork) => fork,
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                return;
            }
        };
        if fork.is_empty() {
            return;
        }

        let work = match archive.get_work(&fork) {
            Ok(work) => work,
            Err(_) => {
                self.node.fault(FaultCode::Confirm(1));
                return;
            }
        };
        let fork_point = height - fork.len() as u32;
        let strong = match archive.get_strong(work, fork_point) {
            Ok(strong) => strong,
            Err(_) => {
                self.node.fault(FaultCode::Confirm(2));
                return;
            }
        };

        // Not strong: accumulate blocks until sufficient work, or a
        // regression resets the position.
        if !strong {
            self.position = height;
            return;
        }

        self.reorganize(&fork, fork_point);
        self.position = height;
    }

    /// Pop the confirmed chain down to the fork point, saving the popped
    /// links, then organize the fork.
    fn reorganize(&mut self, fork: &[HeaderLink], fork_point: u32) {
        let archive = &self.node.archive;
        let mut height = match archive.get_top_confirmed() {
            Ok(height) => height,
            Err(_) => {
                self.node.fault(FaultCode::Confirm(3));
                return;
            }
        };
        if height < fork_point {
            self.node.fault(FaultCode::Confirm(3));
            return;
        }

        let mut popped = Vec::new();
        while height > fork_point {
            let link = match archive.to_confirmed(height) {
                Ok(Some(link)) => link,
                _ => {
                    self.node.fault(FaultCode::Confirm(4));
                    return;
                }
            };
            popped.push(link);
            if !self.set_reorganized(link, height) {
                self.node.fault(FaultCode::Confirm(5));
                return;
            }
            height -= 1;
        }

        self.organize(fork, &popped, fork_point);
    }

    /// Push candidates above the fork point onto the confirmed chain,
    /// restoring the popped branch if any candidate fails to confirm.
    fn organize(&mut self, fork: &[HeaderLink], popped: &[HeaderLink], fork_point: u32) {
        let archive = self.node.archive.clone();
        let mut height = fork_point + 1;

        for link in fork {
            let state = match archive.get_block_state(*link) {
                Ok(state) => state,
                Err(_) => {
                    self.node.fault(FaultCode::Confirm(7));
                    return;
                }
            };
            if matches!(state, BlockState::Unassociated) {
                return;
            }

            let bypass = self.bypass(*link, height);
            if bypass {
                if archive.set_filter_head(*link).is_err() {
                    self.node.fault(FaultCode::Confirm(6));
                    return;
                }
                self.complete_confirmable(height);
            } else {
                match state {
                    BlockState::BlockValid { .. } => {
                        if !self.confirm_block(*link, height, popped, fork_point) {
                            return;
                        }
                    }
                    // Previously confirmable completes without re-checking.
                    BlockState::BlockConfirmable => self.complete_confirmable(height),
                    _ => {
                        self.node.fault(FaultCode::Confirm(7));
                        return;
                    }
                }
            }

            // After set_block_confirmable.
            if !self.set_organized(*link, height) {
                self.node.fault(FaultCode::Confirm(8));
                return;
            }
            height += 1;
        }

        // Prevent stall by posting an internal bump, avoiding recursion.
        let _ = self.own.send(ChaseEvent::new(Chase::Bump, 0));
    }

    fn confirm_block(
        &mut self,
        link: HeaderLink,
        height: u32,
        popped: &[HeaderLink],
        fork_point: u32,
    ) -> bool {
        let archive = &self.node.archive;
        match archive.block_confirmable(link) {
            Err(ArchiveError::Validation(reason)) => {
                if archive.set_unstrong(link).is_err() {
                    self.node.fault(FaultCode::Confirm(9));
                    return false;
                }
                if archive.set_block_unconfirmable(link).is_err() {
                    self.node.fault(FaultCode::Confirm(10));
                    return false;
                }
                if !self.roll_back(popped, fork_point, height - 1) {
                    self.node.fault(FaultCode::Confirm(11));
                    return false;
                }
                self.node
                    .bus
                    .publish(ChaseEvent::new(Chase::Unconfirmable, u64::from(link.0)));
                bn_log::log_remote!("unconfirmable block [{height}]: {reason}");
                false
            }
            Err(_) => {
                self.node.fault(FaultCode::Archive);
                false
            }
            Ok(()) => {
                if archive.set_filter_head(link).is_err() {
                    self.node.fault(FaultCode::Confirm(12));
                    return false;
                }
                if archive.set_block_confirmable(link).is_err() {
                    self.node.fault(FaultCode::Confirm(13));
                    return false;
                }
                self.complete_confirmable(height);
                true
            }
        }
    }

    fn complete_confirmable(&self, height: u32) {
        self.node
            .bus
            .publish(ChaseEvent::new(Chase::Confirmable, u64::from(height)));
        bn_log::log_trace!("block confirmable: {height}");
    }

    // Checkpointed blocks are set strong by the archiver and cannot be
    // reorganized.

    fn set_reorganized(&self, link: HeaderLink, confirmed_height: u32) -> bool {
        if self.node.archive.pop_confirmed().is_err() {
            return false;
        }
        self.node
            .bus
            .publish(ChaseEvent::new(Chase::Reorganized, u64::from(link.0)));
        bn_log::log_news!("block reorganized: {confirmed_height}");
        true
    }

    fn set_organized(&self, link: HeaderLink, confirmed_height: u32) -> bool {
        let set_strong = !self.node.archive.is_under_checkpoint(confirmed_height);
        if self
            .node
            .archive
            .push_confirmed(link, set_strong)
            .is_err()
        {
            return false;
        }
        self.node
            .bus
            .publish(ChaseEvent::new(Chase::Organized, u64::from(link.0)));
        bn_log::log_trace!("block organized: {confirmed_height}");
        true
    }

    /// Unwind any organize progress, then restore the popped branch.
    fn roll_back(&self, popped: &[HeaderLink], fork_point: u32, top: u32) -> bool {
        let archive = &self.node.archive;
        let mut height = top;
        while height > fork_point {
            let link = match archive.to_confirmed(height) {
                Ok(Some(link)) => link,
                _ => return false,
            };
            if !self.set_reorganized(link, height) {
                return false;
            }
            height -= 1;
        }

        let mut restore_height = fork_point;
        for link in popped.iter().rev() {
            restore_height += 1;
            if !self.set_organized(*link, restore_height) {
                return false;
            }
        }
        true
    }
}
